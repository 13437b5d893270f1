use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Classification failed: {0}")]
    ClassificationFailed(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device command failed: {command}: {stderr}")]
    DeviceCommandFailed { command: String, stderr: String },

    #[error("Locate failed for target '{0}': all stages exhausted")]
    LocateFailed(String),

    #[error("Step failed: {0}")]
    StepFailed(String),

    #[error("Unable to reach home screen after {0} attempts")]
    UnableToReachHome(u32),

    #[error("Missing required parameters: {0:?}")]
    ParamsMissing(Vec<String>),

    #[error("Planner failed: {0}")]
    PlannerFailed(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("Locator error: {0}")]
    Locator(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl AgentError {
    /// Stable machine-readable kind, used in user-facing failure lines
    /// and by the shell to pick a retry path.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::InvalidInput(_) => "invalid_input",
            AgentError::ClassificationFailed(_) => "classification_failed",
            AgentError::DeviceUnavailable(_) => "device_unavailable",
            AgentError::DeviceCommandFailed { .. } => "device_command_failed",
            AgentError::LocateFailed(_) => "locate_failed",
            AgentError::StepFailed(_) => "step_failed",
            AgentError::UnableToReachHome(_) => "unable_to_reach_home",
            AgentError::ParamsMissing(_) => "params_missing",
            AgentError::PlannerFailed(_) => "planner_failed",
            AgentError::LlmProvider(_) => "llm_provider",
            AgentError::Locator(_) => "locator",
            AgentError::Workflow(_) => "workflow",
            AgentError::Cancelled => "cancelled",
            AgentError::Io(_) => "io",
            AgentError::Json(_) => "json",
            AgentError::Yaml(_) => "yaml",
            AgentError::Http(_) => "http",
            AgentError::Image(_) => "image",
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
