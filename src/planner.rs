use base64::Engine as _;
use serde::Deserialize;

use crate::errors::{AgentError, AgentResult};
use crate::llm::types::ChatMessage;
use crate::llm::{LlmRouter, Role};
use crate::locator::remote::extract_json_object;
use crate::workflow::{NavStep, Params, ResolvedStep, ScreenState, StepAction};

const REPLAN_SYSTEM_PROMPT: &str = "You are an Android automation planner. \
Given the original task, the current screenshot, the failed step and the executed \
step trace, produce the remaining steps to finish the task. Output only JSON: \
{\"steps\": [{\"action\": \"tap|long_press|swipe|input_text|press_key|wait|open_url|launch_app|call|go_home\", \
\"target\": \"reference name or dynamic:description\", \"text\": \"...\", \
\"duration\": ms, \"keycode\": int, \"direction\": \"up|down|left|right\", \
\"description\": \"...\"}]} . Use targets from the provided reference list \
when possible, dynamic: descriptions otherwise.";

const SELECT_SYSTEM_PROMPT: &str = "You are a task analysis assistant. Match the \
user task to one of the offered workflows and extract its parameters. Output only \
JSON: {\"workflow_name\": \"...\", \"params\": {\"name\": \"value\"}} or \
{\"workflow_name\": null, \"reason\": \"...\"}.";

/// One executed step in the trace shown to the replanner and returned in
/// the final task result.
#[derive(Debug, Clone)]
pub struct StepTraceEntry {
    pub description: String,
    pub action: String,
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
struct PlannedStep {
    action: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    keycode: Option<u32>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    expect_screen: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    #[serde(default)]
    steps: Vec<PlannedStep>,
}

#[derive(Debug, Deserialize)]
struct SelectResponse {
    workflow_name: Option<String>,
    #[serde(default)]
    params: Params,
    #[serde(default)]
    reason: Option<String>,
}

/// Remote-model planning: workflow selection for complex tasks and step
/// regeneration after a local failure.
pub struct Replanner {
    router: LlmRouter,
}

impl Replanner {
    pub fn new(router: LlmRouter) -> Self {
        Self { router }
    }

    /// Ask the model to replace the remaining steps after `failed_step`.
    pub async fn replan(
        &self,
        task: &str,
        screenshot_png: &[u8],
        failed_step: &ResolvedStep,
        trace: &[StepTraceEntry],
        available_refs: &[String],
    ) -> AgentResult<Vec<NavStep>> {
        let trace_lines: String = trace
            .iter()
            .map(|t| {
                format!(
                    "- [{}] {} ({})\n",
                    if t.ok { "ok" } else { "failed" },
                    t.description,
                    t.action
                )
            })
            .collect();
        let refs = available_refs.join(", ");
        let prompt = format!(
            "Task: {task}\n\nExecuted steps:\n{trace_lines}\nFailed step: {} ({:?})\n\n\
             Available reference images: {refs}\n\n\
             The screenshot shows the current screen. Produce the remaining steps.",
            failed_step.description, failed_step.action
        );

        let b64 = base64::engine::general_purpose::STANDARD.encode(screenshot_png);
        let messages = vec![
            ChatMessage::system(REPLAN_SYSTEM_PROMPT),
            ChatMessage::user_with_images(prompt, vec![b64]),
        ];

        let (provider, mut cfg) = self.router.for_role(Role::Main);
        cfg.json_mode = true;
        let response = provider
            .chat(messages, &cfg)
            .await
            .map_err(|e| AgentError::PlannerFailed(e.to_string()))?;

        let json_text = extract_json_object(&response)
            .ok_or_else(|| AgentError::PlannerFailed("replanner returned no JSON".into()))?;
        let plan: PlanResponse = serde_json::from_str(json_text)
            .map_err(|e| AgentError::PlannerFailed(format!("bad replan JSON: {e}")))?;

        let steps: Vec<NavStep> = plan.steps.iter().filter_map(planned_to_step).collect();
        if steps.is_empty() {
            return Err(AgentError::PlannerFailed("replanner produced no usable steps".into()));
        }
        tracing::info!(count = steps.len(), "replan produced replacement steps");
        Ok(steps)
    }

    /// Ask the model to choose among a handler's declared workflows.
    pub async fn choose_workflow(
        &self,
        task: &str,
        workflow_descriptions: &str,
    ) -> AgentResult<(String, Params)> {
        let prompt = format!(
            "User task:\n{task}\n\nOffered workflows:\n{workflow_descriptions}\n\n\
             Pick the best matching workflow and extract every required parameter \
             from the task text."
        );
        let messages = vec![ChatMessage::system(SELECT_SYSTEM_PROMPT), ChatMessage::user(prompt)];

        let (provider, mut cfg) = self.router.for_role(Role::Main);
        cfg.json_mode = true;
        let response = provider
            .chat(messages, &cfg)
            .await
            .map_err(|e| AgentError::PlannerFailed(e.to_string()))?;

        let json_text = extract_json_object(&response)
            .ok_or_else(|| AgentError::PlannerFailed("selector returned no JSON".into()))?;
        let select: SelectResponse = serde_json::from_str(json_text)
            .map_err(|e| AgentError::PlannerFailed(format!("bad selector JSON: {e}")))?;

        match select.workflow_name {
            Some(name) if !name.is_empty() => Ok((name, select.params)),
            _ => Err(AgentError::PlannerFailed(format!(
                "no workflow selected: {}",
                select.reason.unwrap_or_else(|| "unspecified".into())
            ))),
        }
    }
}

/// Convert one model-planned step into the internal step shape. Unknown
/// actions are dropped with a log rather than failing the whole plan.
fn planned_to_step(planned: &PlannedStep) -> Option<NavStep> {
    let action: StepAction =
        serde_json::from_value(serde_json::Value::String(planned.action.to_lowercase())).ok()?;

    let mut step = NavStep::new(action, &planned.description);
    if let Some(target) = &planned.target {
        if !target.is_empty() {
            step = step.with_target(target);
        }
    }
    if let Some(text) = &planned.text {
        step = step.with_param("text", serde_json::json!(text));
    }
    if let Some(duration) = planned.duration {
        step = step.with_param("duration", serde_json::json!(duration));
    }
    if let Some(keycode) = planned.keycode {
        step = step.with_param("keycode", serde_json::json!(keycode));
    }
    if let Some(direction) = &planned.direction {
        step = step.with_param("direction", serde_json::json!(direction));
    }
    if let Some(url) = &planned.url {
        step = step.with_param("url", serde_json::json!(url));
    }
    if let Some(package) = &planned.package {
        step = step.with_param("package", serde_json::json!(package));
    }
    if let Some(number) = &planned.number {
        step = step.with_param("number", serde_json::json!(number));
    }
    if let Some(expect) = &planned.expect_screen {
        if let Ok(screen) = serde_json::from_value::<ScreenState>(serde_json::Value::String(
            expect.to_lowercase(),
        )) {
            step = step.expecting(screen);
        }
    }
    Some(step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planned_step_conversion_keeps_params() {
        let planned = PlannedStep {
            action: "input_text".into(),
            target: Some("wechat_chat_input".into()),
            text: Some("你好".into()),
            duration: None,
            keycode: None,
            direction: None,
            url: None,
            package: None,
            number: None,
            description: "输入消息".into(),
            expect_screen: Some("chat".into()),
        };
        let step = planned_to_step(&planned).unwrap();
        assert_eq!(step.action, StepAction::InputText);
        assert_eq!(step.target.as_deref(), Some("wechat_chat_input"));
        assert_eq!(step.params["text"], serde_json::json!("你好"));
        assert_eq!(step.expect_screen, Some(ScreenState::Chat));
    }

    #[test]
    fn unknown_action_is_dropped() {
        let planned = PlannedStep {
            action: "teleport".into(),
            target: None,
            text: None,
            duration: None,
            keycode: None,
            direction: None,
            url: None,
            package: None,
            number: None,
            description: "?".into(),
            expect_screen: None,
        };
        assert!(planned_to_step(&planned).is_none());
    }
}
