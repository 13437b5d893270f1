use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::apps::system::SystemHandler;
use crate::apps::wechat::WeChatHandler;
use crate::apps::{AppHandler, ExecutorServices, HandlerOutcome};
use crate::classifier::{
    has_fixed_prefix, parse_fixed_form, strip_fixed_prefix, ParsedTask, TaskClassifier,
};
use crate::config::AppConfig;
use crate::device::DeviceSurface;
use crate::errors::AgentResult;
use crate::llm::LlmRouter;
use crate::locator::HybridLocator;
use crate::planner::{Replanner, StepTraceEntry};
use crate::registry::ModuleRegistry;

/// Final state of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
}

/// What the interactive shell should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDisposition {
    Done,
    /// Classification failed outright; re-offer the mode menu instead of
    /// guessing a route.
    ReselectMode,
}

#[derive(Debug)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub message: String,
    pub error_kind: Option<String>,
    pub elapsed: Duration,
    pub trace: Vec<StepTraceEntry>,
    pub disposition: RunDisposition,
}

impl TaskResult {
    fn success(message: String, trace: Vec<StepTraceEntry>, started: Instant) -> Self {
        Self {
            status: TaskStatus::Success,
            message,
            error_kind: None,
            elapsed: started.elapsed(),
            trace,
            disposition: RunDisposition::Done,
        }
    }

    fn failed(message: String, kind: Option<String>, started: Instant) -> Self {
        Self {
            status: TaskStatus::Failed,
            message,
            error_kind: kind,
            elapsed: started.elapsed(),
            trace: Vec::new(),
            disposition: RunDisposition::Done,
        }
    }
}

/// Top-level orchestration: classify, route, invoke the handler, report.
/// Owns the single device binding for the lifetime of a run; everything
/// else is read-only after startup.
pub struct TaskRunner {
    config: AppConfig,
    device: Arc<dyn DeviceSurface>,
    registry: ModuleRegistry,
    handlers: HashMap<String, Box<dyn AppHandler>>,
    classifier: TaskClassifier,
    locator: HybridLocator,
    replanner: Option<Replanner>,
    cancel: Arc<std::sync::atomic::AtomicBool>,
}

impl TaskRunner {
    pub fn new(config: AppConfig, device: Arc<dyn DeviceSurface>) -> AgentResult<Self> {
        let registry = ModuleRegistry::discover(&config.apps_dir)?;

        let router = if config.llm.is_usable() {
            Some(LlmRouter::from_config(&config)?)
        } else {
            tracing::warn!("no usable LLM endpoint configured; model stages disabled");
            None
        };

        let classifier = TaskClassifier::new(&config.classifier, router.clone());
        let locator = HybridLocator::new(&config, router.clone());
        let replanner = router.map(Replanner::new);

        let mut handlers: HashMap<String, Box<dyn AppHandler>> = HashMap::new();
        for record in registry.list() {
            let handler: Box<dyn AppHandler> = match record.id.as_str() {
                "wechat" => Box::new(WeChatHandler::new(record.clone())),
                _ => Box::new(SystemHandler::new(record.clone())),
            };
            handlers.insert(record.id.clone(), handler);
        }

        Ok(Self {
            config,
            device,
            registry,
            handlers,
            classifier,
            locator,
            replanner,
            cancel: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Flag observed at step boundaries; set from a signal handler to abort
    /// the in-flight task while still letting the reset phase run.
    pub fn cancel_handle(&self) -> Arc<std::sync::atomic::AtomicBool> {
        self.cancel.clone()
    }

    /// Handler responsible for a parsed task type. The decision depends on
    /// the type alone, never on the keyword table.
    fn handler_for_type(type_name: &str) -> Option<&'static str> {
        match type_name {
            "send_msg" | "post_moment_only_text" => Some("wechat"),
            _ => None,
        }
    }

    /// Run one utterance to completion.
    pub async fn run(&self, task: &str) -> TaskResult {
        let started = Instant::now();
        tracing::info!(task, "task started");

        // Fixed-form fast path.
        if has_fixed_prefix(task) {
            if let Some(form) = parse_fixed_form(task) {
                tracing::info!(type_name = form.parsed.type_name(), "fixed-form parse succeeded");
                return self
                    .dispatch_by_type(task, &form.parsed, started)
                    .await;
            }

            // Malformed tail: strip the prefix and reclassify with the model.
            let stripped = strip_fixed_prefix(task);
            tracing::info!(stripped = %stripped, "fixed-form parse failed, reclassifying");
            match self.classifier.classify_with_model(&stripped).await {
                Ok(ParsedTask::Invalid) => {
                    return self.invalid_result(started);
                }
                Ok(parsed @ (ParsedTask::SendMessage { .. } | ParsedTask::PostMomentsText { .. })) => {
                    return self.dispatch_by_type(&stripped, &parsed, started).await;
                }
                Ok(ParsedTask::Others) => {
                    return self.dispatch_by_keywords(&stripped, started).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "model classification failed");
                    let mut result = TaskResult::failed(
                        format!("分类失败: {e}"),
                        Some("classification_failed".into()),
                        started,
                    );
                    // Never fall through to keyword routing here: a misroute
                    // drives the wrong app. The shell re-prompts instead.
                    result.disposition = RunDisposition::ReselectMode;
                    return result;
                }
            }
        }

        // Natural language path: scored keyword routing.
        self.dispatch_by_keywords(task, started).await
    }

    async fn dispatch_by_type(
        &self,
        task: &str,
        parsed: &ParsedTask,
        started: Instant,
    ) -> TaskResult {
        if *parsed == ParsedTask::Invalid {
            return self.invalid_result(started);
        }
        let Some(handler_id) = Self::handler_for_type(parsed.type_name()) else {
            return self.dispatch_by_keywords(task, started).await;
        };
        let Some(handler) = self.handlers.get(handler_id) else {
            return TaskResult::failed(
                format!("处理模块 '{handler_id}' 未注册"),
                Some("config".into()),
                started,
            );
        };
        tracing::info!(handler = handler_id, type_name = parsed.type_name(), "type-routed");
        self.invoke(handler.as_ref(), task, Some(parsed), started).await
    }

    async fn dispatch_by_keywords(&self, task: &str, started: Instant) -> TaskResult {
        let Some((record, score)) = self.registry.route(task) else {
            return TaskResult::failed(
                "没有已注册的处理模块".into(),
                Some("invalid_input".into()),
                started,
            );
        };
        tracing::info!(handler = %record.id, score, "keyword-routed");
        let Some(handler) = self.handlers.get(&record.id) else {
            return TaskResult::failed(
                format!("处理模块 '{}' 未注册", record.id),
                Some("config".into()),
                started,
            );
        };
        self.invoke(handler.as_ref(), task, None, started).await
    }

    async fn invoke(
        &self,
        handler: &dyn AppHandler,
        task: &str,
        parsed: Option<&ParsedTask>,
        started: Instant,
    ) -> TaskResult {
        let services = ExecutorServices {
            device: self.device.as_ref(),
            locator: &self.locator,
            replanner: self.replanner.as_ref(),
            classifier: &self.classifier,
            budgets: &self.config.budgets,
            waits: &self.config.waits,
            operation_delay_ms: self.config.operation_delay_ms,
            cancel: &self.cancel,
        };

        match handler.execute_task(&services, task, parsed).await {
            Ok(outcome) => self.outcome_to_result(outcome, started),
            Err(e) => {
                tracing::error!(error = %e, "handler failed");
                TaskResult::failed(e.to_string(), Some(e.kind().to_string()), started)
            }
        }
    }

    fn outcome_to_result(&self, outcome: HandlerOutcome, started: Instant) -> TaskResult {
        if outcome.success {
            TaskResult::success(outcome.message, outcome.trace, started)
        } else {
            let mut result = TaskResult::failed(
                outcome.message,
                outcome.error_kind.map(String::from),
                started,
            );
            result.trace = outcome.trace;
            result
        }
    }

    fn invalid_result(&self, started: Instant) -> TaskResult {
        let outcome = HandlerOutcome::invalid_input();
        TaskResult::failed(outcome.message, Some("invalid_input".into()), started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_routing_is_a_pure_function_of_the_type() {
        assert_eq!(TaskRunner::handler_for_type("send_msg"), Some("wechat"));
        assert_eq!(
            TaskRunner::handler_for_type("post_moment_only_text"),
            Some("wechat")
        );
        assert_eq!(TaskRunner::handler_for_type("others"), None);
        assert_eq!(TaskRunner::handler_for_type("invalid"), None);
    }
}
