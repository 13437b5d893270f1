pub mod system;
pub mod wechat;

use async_trait::async_trait;

use crate::classifier::{ParsedTask, TaskClassifier};
use crate::config::{ScreenshotWaits, WorkflowBudgets};
use crate::device::DeviceSurface;
use crate::errors::AgentResult;
use crate::locator::HybridLocator;
use crate::planner::{Replanner, StepTraceEntry};
use crate::registry::ModuleRecord;

/// Long-lived services a handler borrows for the duration of one task.
/// The device binding stays owned by the task runner.
pub struct ExecutorServices<'a> {
    pub device: &'a dyn DeviceSurface,
    pub locator: &'a HybridLocator,
    pub replanner: Option<&'a Replanner>,
    pub classifier: &'a TaskClassifier,
    pub budgets: &'a WorkflowBudgets,
    pub waits: &'a ScreenshotWaits,
    pub operation_delay_ms: u64,
    /// Cooperative cancellation: checked at step boundaries; the reset
    /// phase still runs after a cancelled body.
    pub cancel: &'a std::sync::atomic::AtomicBool,
}

/// Result of a handler invocation, surfaced to the user by the runner.
#[derive(Debug)]
pub struct HandlerOutcome {
    pub success: bool,
    pub message: String,
    pub error_kind: Option<&'static str>,
    pub missing_params: Vec<String>,
    pub trace: Vec<StepTraceEntry>,
}

impl HandlerOutcome {
    pub fn ok(message: impl Into<String>, trace: Vec<StepTraceEntry>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_kind: None,
            missing_params: Vec::new(),
            trace,
        }
    }

    pub fn failed(message: impl Into<String>, error_kind: &'static str) -> Self {
        Self {
            success: false,
            message: message.into(),
            error_kind: Some(error_kind),
            missing_params: Vec::new(),
            trace: Vec::new(),
        }
    }

    pub fn missing(params: Vec<String>) -> Self {
        Self {
            success: false,
            message: format!("无法从任务中解析出必需参数: {params:?}"),
            error_kind: Some("params_missing"),
            missing_params: params,
            trace: Vec::new(),
        }
    }

    /// Invalid-input guidance with three example utterances, including the
    /// fixed-form template.
    pub fn invalid_input() -> Self {
        Self {
            success: false,
            message: "无效的输入指令。请输入有效的任务描述，例如：\n\
                      - 给张三发消息说你好\n\
                      - 发朋友圈今天天气真好\n\
                      - 快速模式：ss:张三:你好"
                .into(),
            error_kind: Some("invalid_input"),
            missing_params: Vec::new(),
            trace: Vec::new(),
        }
    }
}

/// An app-specific handler. Maps a classified task onto one of its declared
/// workflows with parameters, then delegates to the workflow executor.
#[async_trait]
pub trait AppHandler: Send + Sync {
    fn record(&self) -> &ModuleRecord;

    async fn execute_task(
        &self,
        services: &ExecutorServices<'_>,
        task: &str,
        parsed: Option<&ParsedTask>,
    ) -> AgentResult<HandlerOutcome>;
}
