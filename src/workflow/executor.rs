use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ScreenshotWaits, WorkflowBudgets};
use crate::device::{needs_wide_input, DeviceSurface, Screenshot};
use crate::errors::{AgentError, AgentResult};
use crate::locator::{HybridLocator, LocateResult, LocateStrategy, TargetRef};
use crate::planner::{Replanner, StepTraceEntry};
use crate::workflow::strategy::{batch_indices, is_fire_and_forget, step_strategy, VerifyTier};
use crate::workflow::{NavStep, Params, ResolvedStep, ScreenSpec, ScreenState, StepAction, Workflow};

/// What the executor needs from the handler that owns it: asset lookup,
/// the screen table, and app metadata. The handler owns the executor; the
/// executor only borrows this interface.
pub trait HandlerContext: Send + Sync {
    /// Routing id, also the per-app screenshot-wait key.
    fn app_id(&self) -> &str;
    fn package_id(&self) -> Option<&str>;
    fn image_variants(&self, name: &str) -> Vec<PathBuf>;
    fn list_images(&self) -> Vec<String>;
    /// Detectable screens in detection priority order.
    fn screen_specs(&self) -> &[ScreenSpec];
    /// Indicator tapped to settle on the app's home screen.
    fn home_indicator(&self) -> &str;
    fn cancel_indicator(&self) -> &str;
    fn back_indicator(&self) -> &str;
    /// Child workflows reachable from `sub_workflow` steps.
    fn workflow(&self, name: &str) -> Option<&Workflow>;
    /// Search surface used by `find_or_search`.
    fn search_button(&self) -> Option<&str> {
        None
    }
}

/// Recovery phases for a failing step. Explicit budgets instead of nested
/// retry blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Run,
    RetryStep,
    RecoverHome,
    Replan,
    Abort,
}

/// Interprets declarative workflows against one device binding. Entry runs
/// the preset (app foreground + at home); exit always attempts the reset.
pub struct WorkflowExecutor<'a> {
    device: &'a dyn DeviceSurface,
    locator: &'a HybridLocator,
    replanner: Option<&'a Replanner>,
    handler: &'a dyn HandlerContext,
    budgets: &'a WorkflowBudgets,
    waits: &'a ScreenshotWaits,
    operation_delay_ms: u64,
    cancel: &'a std::sync::atomic::AtomicBool,
}

impl<'a> WorkflowExecutor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &'a dyn DeviceSurface,
        locator: &'a HybridLocator,
        replanner: Option<&'a Replanner>,
        handler: &'a dyn HandlerContext,
        budgets: &'a WorkflowBudgets,
        waits: &'a ScreenshotWaits,
        operation_delay_ms: u64,
        cancel: &'a std::sync::atomic::AtomicBool,
    ) -> Self {
        Self {
            device,
            locator,
            replanner,
            handler,
            budgets,
            waits,
            operation_delay_ms,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Run a workflow to completion. The reset (ensure-home) runs on every
    /// return path once execution has begun; reset failures are logged and
    /// never override the body result.
    pub async fn execute_workflow(
        &self,
        workflow: &Workflow,
        user_params: &Params,
        task: &str,
    ) -> AgentResult<Vec<StepTraceEntry>> {
        workflow.validate()?;
        let merged = workflow.merged_params(user_params)?;

        tracing::info!(
            workflow = workflow.name,
            params = ?merged.keys().collect::<Vec<_>>(),
            "executing workflow"
        );

        let mut trace: Vec<StepTraceEntry> = Vec::new();
        let body = self.run_body(workflow, &merged, task, &mut trace).await;

        // Mandatory reset: same ensure-home loop, errors logged only.
        if let Err(e) = self.ensure_at_home().await {
            tracing::warn!(error = %e, "reset: could not return to home");
        }

        match body {
            Ok(()) => {
                tracing::info!(workflow = workflow.name, steps = trace.len(), "workflow complete");
                Ok(trace)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_body(
        &self,
        workflow: &Workflow,
        merged: &Params,
        task: &str,
        trace: &mut Vec<StepTraceEntry>,
    ) -> AgentResult<()> {
        // Preset: app in foreground, then at home.
        self.ensure_app_foreground().await?;
        self.ensure_at_home().await?;

        // Verify we are on a valid start screen; prefer starting from home
        // whenever home is itself a valid start.
        let current = self.detect_screen().await?;
        let needs_nav = current == ScreenState::Unknown
            || !workflow.valid_start_screens.contains(&current)
            || (current != ScreenState::Home
                && workflow.valid_start_screens.contains(&ScreenState::Home));
        if needs_nav {
            tracing::debug!(current = current.as_str(), "not on preferred start screen");
            self.navigate_to_home_with_ai_fallback().await?;
        }

        self.run_steps(workflow.steps.clone(), merged, task, trace).await
    }

    /// Main step loop with the {Run, RetryStep, RecoverHome, Replan, Abort}
    /// phase machine and fire-and-forget batching.
    async fn run_steps(
        &self,
        mut steps: Vec<NavStep>,
        merged: &Params,
        task: &str,
        trace: &mut Vec<StepTraceEntry>,
    ) -> AgentResult<()> {
        let mut idx = 0usize;
        let mut replans_used = 0u32;

        while idx < steps.len() {
            if self.cancelled() {
                tracing::info!("cancellation requested, aborting before next step");
                return Err(AgentError::Cancelled);
            }
            // Batch consecutive deterministic steps: no captures in between.
            if is_fire_and_forget(steps[idx].action) {
                let actions: Vec<StepAction> = steps.iter().map(|s| s.action).collect();
                let base = idx;
                let batch = batch_indices(&actions[base..])
                    .into_iter()
                    .next()
                    .unwrap_or_default();
                tracing::debug!(len = batch.len(), "running fire-and-forget batch");
                for offset in batch {
                    let step = steps[base + offset].resolve(merged)?;
                    self.execute_action(&step).await?;
                    let strategy = step_strategy(&step);
                    tokio::time::sleep(Duration::from_millis(strategy.wait_after_ms)).await;
                    trace.push(StepTraceEntry {
                        description: step.description.clone(),
                        action: format!("{:?}", step.action),
                        ok: true,
                    });
                    idx = base + offset + 1;
                }
                continue;
            }

            let step = match steps[idx].resolve(merged) {
                Ok(step) => step,
                Err(e) => {
                    trace.push(StepTraceEntry {
                        description: steps[idx].description.clone(),
                        action: format!("{:?}", steps[idx].action),
                        ok: false,
                    });
                    return Err(AgentError::StepFailed(format!(
                        "step {} '{}': {e}",
                        idx + 1,
                        steps[idx].description
                    )));
                }
            };

            let mut phase = Phase::Run;
            let mut attempts = 0u32;
            let mut last_error = String::new();

            loop {
                match phase {
                    Phase::Run | Phase::RetryStep => {
                        if phase == Phase::RetryStep {
                            attempts += 1;
                            tracing::info!(
                                step = idx + 1,
                                attempt = attempts,
                                "retrying step after recovery"
                            );
                            tokio::time::sleep(Duration::from_millis(self.operation_delay_ms))
                                .await;
                            // Stale text from the failed attempt would corrupt
                            // the retried input.
                            if step.action == StepAction::InputText {
                                let _ = self.device.clear_text_field().await;
                            }
                        }
                        match self.run_single_step(&step).await {
                            Ok(()) => {
                                trace.push(StepTraceEntry {
                                    description: step.description.clone(),
                                    action: format!("{:?}", step.action),
                                    ok: true,
                                });
                                idx += 1;
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(step = idx + 1, error = %e, "step failed");
                                last_error = e.to_string();
                                phase = if attempts < self.budgets.max_step_retries {
                                    Phase::RetryStep
                                } else {
                                    Phase::RecoverHome
                                };
                            }
                        }
                    }
                    Phase::RecoverHome => {
                        tracing::info!(step = idx + 1, "step retries exhausted, recovering to home");
                        let _ = self.navigate_to_home(self.budgets.recover_nav_attempts).await;
                        let at_home = self.detect_screen().await.unwrap_or(ScreenState::Unknown)
                            == ScreenState::Home;
                        phase = if at_home && replans_used < self.budgets.max_replans {
                            Phase::Replan
                        } else {
                            Phase::Abort
                        };
                    }
                    Phase::Replan => {
                        let Some(replanner) = self.replanner else {
                            phase = Phase::Abort;
                            continue;
                        };
                        replans_used += 1;
                        let shot = match self.capture().await {
                            Ok(shot) => shot,
                            Err(_) => {
                                phase = Phase::Abort;
                                continue;
                            }
                        };
                        let refs = self.handler.list_images();
                        match replanner.replan(task, &shot.png, &step, trace, &refs).await {
                            Ok(new_steps) => {
                                tracing::info!(
                                    replan = replans_used,
                                    new_steps = new_steps.len(),
                                    "replacing remaining steps"
                                );
                                steps.splice(idx.., new_steps);
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "replan failed");
                                phase = Phase::Abort;
                            }
                        }
                    }
                    Phase::Abort => {
                        trace.push(StepTraceEntry {
                            description: step.description.clone(),
                            action: format!("{:?}", step.action),
                            ok: false,
                        });
                        return Err(AgentError::StepFailed(format!(
                            "step {} '{}' exhausted retries: {last_error}",
                            idx + 1,
                            step.description
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// One attempt at a non-batched step: action, post-wait, verification.
    /// `max_wait_ms` bounds the action itself; explicit wait steps carry
    /// their own duration and are exempt.
    async fn run_single_step(&self, step: &ResolvedStep) -> AgentResult<()> {
        let strategy = step_strategy(step);
        if step.action == StepAction::Wait || step.action == StepAction::SubWorkflow {
            self.execute_action(step).await?;
        } else {
            let budget = Duration::from_millis(step.max_wait_ms.max(500) * 10);
            match tokio::time::timeout(budget, self.execute_action(step)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(AgentError::StepFailed(format!(
                        "action timed out after {budget:?}: {}",
                        step.description
                    )))
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(strategy.wait_after_ms)).await;

        match strategy.verify {
            VerifyTier::Skip => {}
            VerifyTier::Lenient => {
                // Launch-class steps may legitimately leave the screen
                // unchanged; only a hard error from the action itself fails.
                tracing::trace!("lenient verification: action accepted");
            }
            VerifyTier::Standard | VerifyTier::Precise => {
                if let Some(verify_ref) = step.param_str("verify_ref") {
                    let shot = self.capture().await?;
                    let variants = self.handler.image_variants(&verify_ref);
                    let result = self
                        .locator
                        .locate_reference(&shot, &verify_ref, variants, LocateStrategy::OpencvFirst)
                        .await;
                    if !result.found {
                        return Err(AgentError::StepFailed(format!(
                            "verification reference '{verify_ref}' not on screen"
                        )));
                    }
                } else if let Some(condition) = step.param_str("success_condition") {
                    let shot = self.capture().await?;
                    let result = self.locator.locate_description(&shot, &condition).await;
                    if !result.found {
                        return Err(AgentError::StepFailed(format!(
                            "success condition not met: {condition}"
                        )));
                    }
                }
            }
        }

        // Expected-screen contract applies independently of the tier.
        if let Some(expected) = step.expect_screen {
            if step.action != StepAction::Check {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let actual = self.detect_screen().await?;
                if actual != expected {
                    return Err(AgentError::StepFailed(format!(
                        "expected screen {} but detected {}",
                        expected.as_str(),
                        actual.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn execute_action(&self, step: &ResolvedStep) -> AgentResult<()> {
        match step.action {
            StepAction::Tap => {
                let (x, y) = self.locate_step_target(step).await?;
                self.device.tap(x, y).await?;
            }
            StepAction::LongPress => {
                let (x, y) = self.locate_step_target(step).await?;
                let duration = step.param_u64("duration").unwrap_or(1000);
                self.device.long_press(x, y, duration).await?;
            }
            StepAction::Swipe => {
                let direction = step.param_str("direction").unwrap_or_else(|| "up".into());
                self.swipe_direction(&direction).await?;
            }
            StepAction::InputText => {
                let text = step
                    .param_str("text")
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| AgentError::StepFailed("input_text without text".into()))?;
                self.focus_and_type(step, &text).await?;
            }
            StepAction::InputUrl => {
                let raw = step
                    .param_str("url")
                    .or_else(|| step.param_str("text"))
                    .ok_or_else(|| AgentError::StepFailed("input_url without url".into()))?;
                let url = if raw.starts_with("http://") || raw.starts_with("https://") {
                    raw
                } else {
                    format!("https://{raw}")
                };
                self.focus_and_type(step, &url).await?;
            }
            StepAction::PressKey | StepAction::Keyevent => {
                let keycode = step.param_u64("keycode").unwrap_or(4) as u32;
                self.device.key_event(keycode).await?;
            }
            StepAction::Wait => {
                let duration = step.param_u64("duration").unwrap_or(1000);
                tokio::time::sleep(Duration::from_millis(duration)).await;
            }
            StepAction::Check => {
                let expected = step.expect_screen.ok_or_else(|| {
                    AgentError::Workflow("check step without expect_screen".into())
                })?;
                let actual = self.detect_screen().await?;
                if actual != expected {
                    return Err(AgentError::StepFailed(format!(
                        "check: expected {} but on {}",
                        expected.as_str(),
                        actual.as_str()
                    )));
                }
            }
            StepAction::FindOrSearch => {
                self.find_or_search(step).await?;
            }
            StepAction::Conditional => {
                self.run_conditional(step).await?;
            }
            StepAction::Screenshot => {
                let path = step
                    .param_str("save_as")
                    .or_else(|| step.param_str("save_path"))
                    .unwrap_or_else(|| {
                        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
                        std::env::temp_dir()
                            .join(format!("droidpilot_{stamp}.png"))
                            .to_string_lossy()
                            .into_owned()
                    });
                let png = self.device.screenshot_full().await?;
                tokio::fs::write(&path, &png).await?;
                tracing::info!(path = %path, "screenshot saved");
            }
            StepAction::NavToHome => {
                if !self.navigate_to_home(self.budgets.max_back_presses).await? {
                    return Err(AgentError::StepFailed("nav_to_home did not reach home".into()));
                }
            }
            StepAction::SubWorkflow => {
                let name = step
                    .param_str("workflow")
                    .ok_or_else(|| AgentError::Workflow("sub_workflow without name".into()))?;
                let child = self
                    .handler
                    .workflow(&name)
                    .ok_or_else(|| AgentError::Workflow(format!("unknown workflow '{name}'")))?
                    .clone();
                // Child params: every non-control param of this step.
                let child_params: Params = step
                    .params
                    .iter()
                    .filter(|(k, _)| k.as_str() != "workflow")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                // Recursion point: erase the future type to keep the outer
                // async state machine finite.
                let child_run: std::pin::Pin<
                    Box<dyn std::future::Future<Output = AgentResult<Vec<StepTraceEntry>>> + Send + '_>,
                > = Box::pin(self.execute_workflow(&child, &child_params, &step.description));
                child_run.await?;
            }
            StepAction::LaunchApp => {
                let package = step
                    .param_str("package")
                    .or_else(|| self.handler.package_id().map(String::from))
                    .ok_or_else(|| AgentError::StepFailed("launch_app without package".into()))?;
                let activity = step.param_str("activity");
                self.device.launch_app(&package, activity.as_deref()).await?;
            }
            StepAction::OpenUrl => {
                let url = step
                    .param_str("url")
                    .ok_or_else(|| AgentError::StepFailed("open_url without url".into()))?;
                self.device.open_url(&url).await?;
            }
            StepAction::Call => {
                let number = step
                    .param_str("number")
                    .ok_or_else(|| AgentError::StepFailed("call without number".into()))?;
                self.device.call(&number).await?;
            }
            StepAction::GoHome => {
                self.device.go_home().await?;
            }
        }
        Ok(())
    }

    /// Locate the step's target and translate into device coordinates.
    async fn locate_step_target(&self, step: &ResolvedStep) -> AgentResult<(u32, u32)> {
        let target = step
            .target
            .as_ref()
            .ok_or_else(|| AgentError::StepFailed("step has no target".into()))?;
        let shot = self.capture().await?;
        let result = self.locate_on(&shot, target).await;
        if !result.found {
            return Err(AgentError::LocateFailed(target.display_name().to_string()));
        }
        tracing::debug!(
            target = target.display_name(),
            stage = ?result.stage,
            confidence = result.confidence,
            "target located"
        );
        Ok(shot.to_device_coords(result.x, result.y))
    }

    async fn locate_on(&self, shot: &Screenshot, target: &TargetRef) -> LocateResult {
        let variants = match target {
            TargetRef::ByReference(name) => self.handler.image_variants(name),
            TargetRef::ByDescription(_) => Vec::new(),
        };
        self.locator
            .locate_target(shot, target, variants, self.locator.default_strategy)
            .await
    }

    async fn focus_and_type(&self, step: &ResolvedStep, text: &str) -> AgentResult<()> {
        if let Some(target) = &step.target {
            let shot = self.capture().await?;
            let result = self.locate_on(&shot, target).await;
            if result.found {
                let (x, y) = shot.to_device_coords(result.x, result.y);
                self.device.tap(x, y).await?;
                // Field activation and keyboard slide-in.
                tokio::time::sleep(Duration::from_millis(800)).await;
            } else {
                tracing::warn!(
                    target = target.display_name(),
                    "input field not located, typing into current focus"
                );
            }
        }
        self.device.clear_text_field().await?;

        if needs_wide_input(text) {
            self.device.input_text_wide(text).await?;
        } else {
            self.device.input_text(text).await?;
        }
        Ok(())
    }

    async fn swipe_direction(&self, direction: &str) -> AgentResult<()> {
        let (w, h) = self.device.screen_size().await?;
        let (x1, y1, x2, y2) = match direction {
            "down" => (w / 2, h / 4, w / 2, h * 3 / 4),
            "left" => (w * 3 / 4, h / 2, w / 4, h / 2),
            "right" => (w / 4, h / 2, w * 3 / 4, h / 2),
            _ => (w / 2, h * 3 / 4, w / 2, h / 4),
        };
        self.device.swipe(x1, y1, x2, y2, 300).await
    }

    /// Try the target directly; when absent, go through the app's search
    /// surface and pick the first result.
    async fn find_or_search(&self, step: &ResolvedStep) -> AgentResult<()> {
        let target = step
            .target
            .as_ref()
            .ok_or_else(|| AgentError::StepFailed("find_or_search without target".into()))?;

        let shot = self.capture().await?;
        if self.locate_on(&shot, target).await.found {
            tracing::debug!(target = target.display_name(), "target found directly");
            return Ok(());
        }

        let fallback = step
            .params
            .get("search_fallback")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !fallback {
            return Err(AgentError::LocateFailed(target.display_name().to_string()));
        }

        let search_button = self.handler.search_button().ok_or_else(|| {
            AgentError::StepFailed("handler declares no search surface".into())
        })?;
        tracing::debug!(target = target.display_name(), "falling back to search");

        let shot = self.capture().await?;
        let button = self
            .locate_on(&shot, &TargetRef::ByReference(search_button.to_string()))
            .await;
        if !button.found {
            return Err(AgentError::LocateFailed(search_button.to_string()));
        }
        let (x, y) = shot.to_device_coords(button.x, button.y);
        self.device.tap(x, y).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let query = target.display_name();
        if needs_wide_input(query) {
            self.device.input_text_wide(query).await?;
        } else {
            self.device.input_text(query).await?;
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let shot = self.capture().await?;
        let first = self
            .locate_on(
                &shot,
                &TargetRef::ByDescription(format!("搜索结果中的{query}")),
            )
            .await;
        if !first.found {
            return Err(AgentError::LocateFailed(format!("search result for {query}")));
        }
        let (x, y) = shot.to_device_coords(first.x, first.y);
        self.device.tap(x, y).await
    }

    /// `conditional` evaluates a predicate parameter; a truthy value runs
    /// the nested child workflow, otherwise the step is a no-op success.
    async fn run_conditional(&self, step: &ResolvedStep) -> AgentResult<()> {
        let predicate = step.param_str("condition").unwrap_or_default();
        let holds = step
            .params
            .get(&predicate)
            .map(|v| match v {
                serde_json::Value::Bool(b) => *b,
                serde_json::Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes"),
                serde_json::Value::Null => false,
                serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                _ => true,
            })
            .unwrap_or(false);
        if !holds {
            tracing::debug!(predicate = %predicate, "conditional predicate false, skipping branch");
            return Ok(());
        }
        if step.param_str("workflow").is_some() {
            let mut branch = step.clone();
            branch.action = StepAction::SubWorkflow;
            let branch_run: std::pin::Pin<
                Box<dyn std::future::Future<Output = AgentResult<()>> + Send + '_>,
            > = Box::pin(self.execute_action(&branch));
            branch_run.await?;
        }
        Ok(())
    }

    // ── Preset / reset machinery ─────────────────────────────────────────

    /// Launch the app when it is not already foreground. The foreground
    /// query is unsupported on some devices; screen detection is the
    /// fallback evidence.
    async fn ensure_app_foreground(&self) -> AgentResult<()> {
        let Some(package) = self.handler.package_id().map(String::from) else {
            return Ok(());
        };

        let foreground = self.device.foreground_app().await.unwrap_or(None);
        if foreground.as_deref() == Some(package.as_str()) {
            tracing::debug!(package = %package, "app already foreground");
            return Ok(());
        }

        tracing::info!(package = %package, "launching app");
        self.device.launch_app(&package, None).await?;
        tokio::time::sleep(Duration::from_millis(self.operation_delay_ms * 4)).await;

        match self.device.foreground_app().await {
            Ok(Some(current)) if current == package => Ok(()),
            Ok(Some(current)) => Err(AgentError::DeviceCommandFailed {
                command: format!("launch {package}"),
                stderr: format!("foreground is {current}"),
            }),
            _ => {
                // Query unsupported: fall back to screenshot detection.
                tokio::time::sleep(Duration::from_millis(self.operation_delay_ms * 2)).await;
                let screen = self.detect_screen().await?;
                if screen == ScreenState::Unknown {
                    Err(AgentError::DeviceCommandFailed {
                        command: format!("launch {package}"),
                        stderr: "app screens not detected after launch".into(),
                    })
                } else {
                    tracing::debug!(screen = screen.as_str(), "launch verified by screen detection");
                    Ok(())
                }
            }
        }
    }

    /// Ensure-home loop: parallel-locate {home, cancel, back} on a cropped
    /// screenshot, act on the first hit in that order, else device back key.
    pub async fn ensure_at_home(&self) -> AgentResult<()> {
        let attempts = self.budgets.home_max_attempts;
        for attempt in 0..attempts {
            let shot = self.capture().await?;

            let mut targets: HashMap<String, Vec<PathBuf>> = HashMap::new();
            for (key, name) in [
                ("home", self.handler.home_indicator()),
                ("cancel", self.handler.cancel_indicator()),
                ("back", self.handler.back_indicator()),
            ] {
                let variants = self.handler.image_variants(name);
                if !variants.is_empty() {
                    targets.insert(key.to_string(), variants);
                }
            }

            if targets.is_empty() {
                tracing::warn!("no preset indicators available, pressing back");
                self.device.press_back().await?;
                tokio::time::sleep(Duration::from_millis(self.operation_delay_ms * 2)).await;
                continue;
            }

            let results = self.locator.locate_many(&shot, targets).await;

            if let Some(home) = results.get("home").filter(|r| r.found) {
                let (x, y) = shot.to_device_coords(home.x, home.y);
                tracing::info!(attempt, x, y, "home indicator found, tapping");
                self.device.tap(x, y).await?;
                tokio::time::sleep(Duration::from_millis(self.operation_delay_ms * 2)).await;
                return Ok(());
            }
            if let Some(cancel) = results.get("cancel").filter(|r| r.found) {
                let (x, y) = shot.to_device_coords(cancel.x, cancel.y);
                tracing::debug!(attempt, "cancel button found, tapping");
                self.device.tap(x, y).await?;
            } else if let Some(back) = results.get("back").filter(|r| r.found) {
                let (x, y) = shot.to_device_coords(back.x, back.y);
                tracing::debug!(attempt, "back button found, tapping");
                self.device.tap(x, y).await?;
            } else {
                tracing::debug!(attempt, "no indicator found, pressing device back key");
                self.device.press_back().await?;
            }
            tokio::time::sleep(Duration::from_millis(self.operation_delay_ms * 2)).await;
        }
        Err(AgentError::UnableToReachHome(attempts))
    }

    /// Detect the current screen by walking the handler's indicator table
    /// in priority order; first hit wins.
    pub async fn detect_screen(&self) -> AgentResult<ScreenState> {
        let shot = self.capture().await?;
        self.detect_screen_on(&shot).await
    }

    async fn detect_screen_on(&self, shot: &Screenshot) -> AgentResult<ScreenState> {
        for spec in self.handler.screen_specs() {
            for name in std::iter::once(spec.primary).chain(spec.fallback) {
                let variants = self.handler.image_variants(name);
                if variants.is_empty() {
                    continue;
                }
                let result = self
                    .locator
                    .locate_reference(shot, name, variants, LocateStrategy::OpencvFirst)
                    .await;
                if result.found {
                    tracing::debug!(screen = spec.screen.as_str(), indicator = name, "screen detected");
                    return Ok(spec.screen);
                }
            }
        }
        Ok(ScreenState::Unknown)
    }

    /// Canonical navigate-to-home macro: prefer in-app controls (cancel,
    /// back) before the device back key.
    pub async fn navigate_to_home(&self, max_attempts: u32) -> AgentResult<bool> {
        for attempt in 0..max_attempts {
            let shot = self.capture().await?;
            if self.detect_screen_on(&shot).await? == ScreenState::Home {
                tracing::debug!(attempt, "reached home");
                return Ok(true);
            }

            let mut targets: HashMap<String, Vec<PathBuf>> = HashMap::new();
            for (key, name) in [
                ("cancel", self.handler.cancel_indicator()),
                ("back", self.handler.back_indicator()),
            ] {
                let variants = self.handler.image_variants(name);
                if !variants.is_empty() {
                    targets.insert(key.to_string(), variants);
                }
            }
            let results = self.locator.locate_many(&shot, targets).await;

            if let Some(hit) = ["cancel", "back"]
                .iter()
                .filter_map(|k| results.get(*k))
                .find(|r| r.found)
            {
                let (x, y) = shot.to_device_coords(hit.x, hit.y);
                self.device.tap(x, y).await?;
            } else {
                self.device.press_back().await?;
            }
            tokio::time::sleep(Duration::from_millis(self.budgets.back_press_interval_ms)).await;
        }
        Ok(self.detect_screen().await? == ScreenState::Home)
    }

    /// Navigate home with an AI-assisted fallback when the predefined
    /// controls fail: the model is asked where to tap to go back.
    pub async fn navigate_to_home_with_ai_fallback(&self) -> AgentResult<()> {
        if self.navigate_to_home(self.budgets.max_back_presses).await? {
            return Ok(());
        }

        tracing::info!("predefined navigation failed, trying AI-assisted navigation");
        for attempt in 0..self.budgets.ai_fallback_attempts {
            let shot = self.capture().await?;
            if self.detect_screen_on(&shot).await? == ScreenState::Home {
                return Ok(());
            }
            let hit = self
                .locator
                .locate_description(&shot, "返回按钮、关闭按钮或取消按钮")
                .await;
            if hit.found {
                let (x, y) = shot.to_device_coords(hit.x, hit.y);
                tracing::debug!(attempt, x, y, "AI suggested navigation tap");
                self.device.tap(x, y).await?;
            } else {
                self.device.press_back().await?;
            }
            tokio::time::sleep(Duration::from_millis(self.operation_delay_ms)).await;
        }

        if self.detect_screen().await? == ScreenState::Home {
            Ok(())
        } else {
            Err(AgentError::UnableToReachHome(self.budgets.ai_fallback_attempts))
        }
    }

    /// Screenshot with the per-app settle delay applied first.
    async fn capture(&self) -> AgentResult<Screenshot> {
        let wait = self.waits.wait_ms_for(Some(self.handler.app_id()));
        if wait > 0 {
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
        self.device.screenshot().await
    }
}
