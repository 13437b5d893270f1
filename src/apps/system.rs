use async_trait::async_trait;

use crate::apps::{AppHandler, ExecutorServices, HandlerOutcome};
use crate::classifier::{ParsedTask, TaskClass};
use crate::registry::ModuleRecord;

/// Fallback handler for modules without a dedicated implementation, and
/// the routing default when no handler scores above the floor. It declares
/// no workflows, so anything it cannot answer directly fails closed with
/// guidance instead of driving the device blindly.
pub struct SystemHandler {
    record: ModuleRecord,
}

impl SystemHandler {
    pub fn new(record: ModuleRecord) -> Self {
        Self { record }
    }
}

#[async_trait]
impl AppHandler for SystemHandler {
    fn record(&self) -> &ModuleRecord {
        &self.record
    }

    async fn execute_task(
        &self,
        services: &ExecutorServices<'_>,
        task: &str,
        parsed: Option<&ParsedTask>,
    ) -> crate::errors::AgentResult<HandlerOutcome> {
        if matches!(parsed, Some(ParsedTask::Invalid)) {
            return Ok(HandlerOutcome::invalid_input());
        }

        let (class, _) = services.classifier.classify_local(task).await;
        if class == TaskClass::Invalid {
            return Ok(HandlerOutcome::invalid_input());
        }

        tracing::info!(module = %self.record.id, task, "no workflow available in fallback handler");
        Ok(HandlerOutcome::failed(
            format!(
                "模块「{}」没有可执行该任务的工作流: {task}",
                self.record.info.name
            ),
            "invalid_input",
        ))
    }
}
