use std::time::Duration;

use async_trait::async_trait;

use crate::config::LlmSettings;
use crate::errors::{AgentError, AgentResult};
use crate::llm::provider::LlmProvider;
use crate::llm::types::{CallConfig, ChatMessage};

/// OpenAI-compatible chat client. Covers the `openai` and `custom` provider
/// families and any Anthropic-compatible gateway exposing the same surface.
pub struct OpenAiCompatibleProvider {
    id: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(settings: &LlmSettings) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            id: settings.provider.clone(),
            endpoint: chat_endpoint(&settings.base_url),
            api_key: settings.api_key.clone(),
            client,
        })
    }
}

/// Base URLs are configured without the route suffix; append it once.
fn chat_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn chat(&self, messages: Vec<ChatMessage>, cfg: &CallConfig) -> AgentResult<String> {
        let mut body = serde_json::json!({
            "model": cfg.model,
            "messages": &messages,
            "stream": false,
            "temperature": cfg.temperature,
            "max_tokens": cfg.max_tokens,
        });
        if cfg.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        tracing::debug!(
            provider = %self.id,
            model = %cfg.model,
            json_mode = cfg.json_mode,
            body = %sanitized_body(&body),
            "sending LLM request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(AgentError::LlmProvider(format!("{status}: {err_body}")));
        }

        let json: serde_json::Value = response.json().await?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        tracing::debug!(provider = %self.id, content_len = content.len(), "LLM response received");
        Ok(content)
    }
}

/// Clone of the request body with base64 image payloads replaced, so debug
/// logs stay readable while the actual request keeps the real images.
fn sanitized_body(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            if let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) {
                for part in parts {
                    if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                        if let Some(url) = part
                            .get_mut("image_url")
                            .and_then(|iu| iu.get_mut("url"))
                        {
                            *url = serde_json::Value::String("<omitted_base64_image>".into());
                        }
                    }
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_suffix_is_appended_once() {
        assert_eq!(
            chat_endpoint("https://api.example.com/v1"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn sanitizer_strips_image_payloads() {
        let body = serde_json::json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
                    {"type": "text", "text": "find the button"}
                ]
            }]
        });
        let logged = sanitized_body(&body);
        assert!(!logged.contains("AAAA"));
        assert!(logged.contains("<omitted_base64_image>"));
        assert!(logged.contains("find the button"));
    }
}
