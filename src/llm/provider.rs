use async_trait::async_trait;

use crate::errors::AgentResult;
use crate::llm::types::{CallConfig, ChatMessage};

/// Unified model endpoint trait. New providers implement this trait and are
/// wired up by the router from configuration.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (matches the configured provider name).
    fn name(&self) -> &str;

    /// Execute one chat call and return the assistant message content.
    async fn chat(&self, messages: Vec<ChatMessage>, cfg: &CallConfig) -> AgentResult<String>;
}
