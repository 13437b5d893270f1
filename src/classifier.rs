use serde::Deserialize;

use crate::config::{ClassifierConfig, ClassifierMode};
use crate::errors::{AgentError, AgentResult};
use crate::llm::types::ChatMessage;
use crate::llm::{LlmRouter, Role};
use crate::locator::remote::extract_json_object;

/// Synonyms accepted in the fixed-form type field.
const MSG_TYPE_TOKENS: [&str; 5] = ["消息", "发消息", "xx", "msg", "message"];
const MOMENT_TYPE_TOKENS: [&str; 2] = ["朋友圈", "pyq"];

/// Connectives that mark a multi-step task in the degraded regex classifier.
const COMPLEX_INDICATORS: [&str; 11] = [
    "然后", "再", "接着", "之后", "完成后", "并且", "同时", "顺便", "截图", "保存", "并",
];
const ACTION_WORDS: [&str; 8] = [
    "发消息", "发朋友圈", "搜索", "加好友", "打开", "点击", "输入", "截图",
];

const CLASSIFIER_SYSTEM_PROMPT: &str = "output only JSON. fields: \
type ∈ {send_msg, post_moment_only_text, others, invalid}, recipient, content. \
send_msg: send a message to a contact. \
post_moment_only_text: publish a text-only moments post. \
others: any multi-step or unrecognized task. \
invalid: blank, meaningless or accidental input.";

/// Coarse task class derived from the parsed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    Simple,
    Complex,
    Invalid,
}

/// Parsed utterance as a tagged variant: field presence is a property of
/// the variant, not of runtime nulls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTask {
    SendMessage { recipient: String, content: String },
    PostMomentsText { content: String },
    Others,
    Invalid,
}

impl ParsedTask {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParsedTask::SendMessage { .. } => "send_msg",
            ParsedTask::PostMomentsText { .. } => "post_moment_only_text",
            ParsedTask::Others => "others",
            ParsedTask::Invalid => "invalid",
        }
    }

    pub fn task_class(&self) -> TaskClass {
        match self {
            ParsedTask::SendMessage { .. } | ParsedTask::PostMomentsText { .. } => {
                TaskClass::Simple
            }
            ParsedTask::Others => TaskClass::Complex,
            ParsedTask::Invalid => TaskClass::Invalid,
        }
    }

    fn from_fields(ty: &str, recipient: String, content: String) -> Self {
        match ty {
            "send_msg" => ParsedTask::SendMessage { recipient, content },
            "post_moment_only_text" => ParsedTask::PostMomentsText { content },
            "invalid" => ParsedTask::Invalid,
            _ => ParsedTask::Others,
        }
    }
}

/// A successfully parsed fixed-form utterance. Keeps the matched type token
/// so rendering round-trips the canonical input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedForm {
    pub parsed: ParsedTask,
    type_token: Option<String>,
}

impl FixedForm {
    /// Re-render as the canonical fixed-form utterance.
    pub fn render(&self) -> String {
        match (&self.parsed, &self.type_token) {
            (ParsedTask::SendMessage { recipient, content }, Some(token)) => {
                format!("ss:{token}:{recipient}:{content}")
            }
            (ParsedTask::SendMessage { recipient, content }, None) => {
                format!("ss:{recipient}:{content}")
            }
            (ParsedTask::PostMomentsText { content }, Some(token)) => {
                format!("ss:{token}:{content}")
            }
            (ParsedTask::PostMomentsText { content }, None) => format!("ss:朋友圈:{content}"),
            _ => String::new(),
        }
    }
}

/// Trim, fold full-width colons, trim every field, lowercase the prefix.
pub fn canonicalize(utterance: &str) -> String {
    let normalized = utterance.trim().replace('：', ":");
    let mut fields: Vec<String> = normalized.split(':').map(|f| f.trim().to_string()).collect();
    if let Some(first) = fields.first_mut() {
        *first = first.to_lowercase();
    }
    fields.join(":")
}

/// Whether the utterance enters the fixed-form path at all. A bare `ss`
/// without a colon is natural language.
pub fn has_fixed_prefix(utterance: &str) -> bool {
    let normalized = utterance.trim().replace('：', ":");
    let lower = normalized.to_lowercase();
    lower.starts_with("ss:")
}

/// Strip the fixed prefix for re-classification after a failed parse.
pub fn strip_fixed_prefix(utterance: &str) -> String {
    let normalized = utterance.trim().replace('：', ":");
    match normalized.char_indices().nth(3) {
        Some((idx, _)) if has_fixed_prefix(&normalized) => normalized[idx..].trim().to_string(),
        _ => normalized,
    }
}

/// Zero-cost parser for the fixed prefix grammar:
/// `ss:<type>:<fields>` with a recognized type token, or the default form
/// `ss:<recipient>:<content>`. Excess colons stay inside the content.
pub fn parse_fixed_form(utterance: &str) -> Option<FixedForm> {
    if !has_fixed_prefix(utterance) {
        return None;
    }
    let canonical = canonicalize(utterance);
    let parts: Vec<&str> = canonical.split(':').collect();
    if parts.len() < 3 {
        return None;
    }

    let type_field = parts[1];
    let type_lower = type_field.to_lowercase();

    if MOMENT_TYPE_TOKENS.iter().any(|t| *t == type_lower) {
        let content = parts[2..].join(":");
        if content.is_empty() {
            return None;
        }
        return Some(FixedForm {
            parsed: ParsedTask::PostMomentsText { content },
            type_token: Some(type_field.to_string()),
        });
    }

    if MSG_TYPE_TOKENS.iter().any(|t| *t == type_lower) {
        if parts.len() < 4 {
            return None;
        }
        let recipient = parts[2].to_string();
        let content = parts[3..].join(":");
        if recipient.is_empty() || content.is_empty() {
            return None;
        }
        return Some(FixedForm {
            parsed: ParsedTask::SendMessage { recipient, content },
            type_token: Some(type_field.to_string()),
        });
    }

    // Default form: the first field is the recipient.
    let recipient = type_field.to_string();
    let content = parts[2..].join(":");
    if recipient.is_empty() || content.is_empty() {
        return None;
    }
    Some(FixedForm {
        parsed: ParsedTask::SendMessage { recipient, content },
        type_token: None,
    })
}

/// Blank input, or one-to-two characters of pure whitespace/punctuation,
/// is rejected before any model call.
pub fn precheck_invalid(utterance: &str) -> bool {
    let trimmed = utterance.trim();
    if trimmed.is_empty() {
        return true;
    }
    let count = trimmed.chars().count();
    count <= 2
        && trimmed
            .chars()
            .all(|c| c.is_whitespace() || c.is_ascii_punctuation() || is_cjk_punct(c))
}

fn is_cjk_punct(c: char) -> bool {
    matches!(c, '\u{3000}'..='\u{303F}' | '\u{FF00}'..='\u{FF0F}' | '\u{FF1A}'..='\u{FF20}' | '\u{FF5B}'..='\u{FF65}')
}

#[derive(Debug, Deserialize)]
struct ClassifierRecord {
    #[serde(rename = "type")]
    ty: Option<String>,
    #[serde(default)]
    recipient: String,
    #[serde(default)]
    content: String,
}

/// Classifies an utterance into {simple, complex, invalid} and, when
/// possible, a parsed record. The model path goes to the cheaper endpoint
/// when one is configured; the regex path needs no network at all.
pub struct TaskClassifier {
    mode: ClassifierMode,
    router: Option<LlmRouter>,
}

impl TaskClassifier {
    pub fn new(config: &ClassifierConfig, router: Option<LlmRouter>) -> Self {
        Self {
            mode: config.mode,
            router,
        }
    }

    /// Strict model classification. A transport error, non-JSON response or
    /// a record without a `type` field is a classification failure.
    pub async fn classify_with_model(&self, utterance: &str) -> AgentResult<ParsedTask> {
        if precheck_invalid(utterance) {
            return Ok(ParsedTask::Invalid);
        }
        let router = self.router.as_ref().ok_or_else(|| {
            AgentError::ClassificationFailed("no model endpoint configured".into())
        })?;

        let (provider, mut cfg) = router.for_role(Role::Classifier);
        cfg.json_mode = true;
        cfg.temperature = 0.0;
        let messages = vec![
            ChatMessage::system(CLASSIFIER_SYSTEM_PROMPT),
            ChatMessage::user(utterance),
        ];
        let response = provider
            .chat(messages, &cfg)
            .await
            .map_err(|e| AgentError::ClassificationFailed(e.to_string()))?;

        let json_text = extract_json_object(&response).ok_or_else(|| {
            AgentError::ClassificationFailed(format!("non-JSON classifier response: {response}"))
        })?;
        let record: ClassifierRecord = serde_json::from_str(json_text)
            .map_err(|e| AgentError::ClassificationFailed(format!("bad classifier JSON: {e}")))?;
        let ty = record.ty.ok_or_else(|| {
            AgentError::ClassificationFailed("classifier response missing type field".into())
        })?;

        let parsed = ParsedTask::from_fields(&ty, record.recipient, record.content);
        tracing::debug!(utterance, type_name = parsed.type_name(), "model classification");
        Ok(parsed)
    }

    /// Mode-aware local classification used by handlers: the llm mode
    /// degrades to the regex rules on model failure.
    pub async fn classify_local(&self, utterance: &str) -> (TaskClass, Option<ParsedTask>) {
        if precheck_invalid(utterance) {
            return (TaskClass::Invalid, Some(ParsedTask::Invalid));
        }
        if self.mode == ClassifierMode::Llm {
            match self.classify_with_model(utterance).await {
                Ok(parsed) => return (parsed.task_class(), Some(parsed)),
                Err(e) => {
                    tracing::warn!(error = %e, "model classification failed, degrading to regex");
                }
            }
        }
        (classify_regex(utterance), None)
    }
}

/// Degraded classifier: complex when a connective appears or two or more
/// action words do; simple otherwise.
pub fn classify_regex(utterance: &str) -> TaskClass {
    if COMPLEX_INDICATORS.iter().any(|w| utterance.contains(w)) {
        return TaskClass::Complex;
    }
    let action_count = ACTION_WORDS.iter().filter(|w| utterance.contains(*w)).count();
    if action_count >= 2 {
        TaskClass::Complex
    } else {
        TaskClass::Simple
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_form_parses_recipient_and_content() {
        let form = parse_fixed_form("ss:张三:你好").unwrap();
        assert_eq!(
            form.parsed,
            ParsedTask::SendMessage {
                recipient: "张三".into(),
                content: "你好".into()
            }
        );
        assert_eq!(form.parsed.task_class(), TaskClass::Simple);
    }

    #[test]
    fn typed_message_form_requires_four_fields() {
        let form = parse_fixed_form("ss:消息:李四:早上好").unwrap();
        assert_eq!(
            form.parsed,
            ParsedTask::SendMessage {
                recipient: "李四".into(),
                content: "早上好".into()
            }
        );
        assert!(parse_fixed_form("ss:消息:李四").is_none());
    }

    #[test]
    fn moments_form_parses_content() {
        let form = parse_fixed_form("ss:朋友圈:今天天气真好").unwrap();
        assert_eq!(
            form.parsed,
            ParsedTask::PostMomentsText {
                content: "今天天气真好".into()
            }
        );
    }

    #[test]
    fn excess_colons_stay_in_content() {
        let form = parse_fixed_form("ss:张三:开会时间:下午3点").unwrap();
        assert_eq!(
            form.parsed,
            ParsedTask::SendMessage {
                recipient: "张三".into(),
                content: "开会时间:下午3点".into()
            }
        );
    }

    #[test]
    fn full_width_colons_and_case_are_normalized() {
        let form = parse_fixed_form("SS：张三：你好").unwrap();
        assert_eq!(
            form.parsed,
            ParsedTask::SendMessage {
                recipient: "张三".into(),
                content: "你好".into()
            }
        );
    }

    #[test]
    fn short_tail_fails_fast_form() {
        assert!(parse_fixed_form("ss:李四").is_none());
        assert!(parse_fixed_form("ss:").is_none());
    }

    #[test]
    fn bare_ss_is_natural_language() {
        assert!(!has_fixed_prefix("ss"));
        assert!(parse_fixed_form("ss").is_none());
        // `ssx:...` is not the prefix either.
        assert!(!has_fixed_prefix("ssx:foo"));
    }

    #[test]
    fn render_round_trips_canonical_form() {
        for input in [
            "ss:张三:你好",
            "ss:消息:张三:你好",
            " SS：朋友圈： 今天天气真好 ",
            "ss:msg:bob:see you at 5:30",
        ] {
            let form = parse_fixed_form(input).unwrap();
            assert_eq!(form.render(), canonicalize(input), "input: {input}");
        }
    }

    #[test]
    fn strip_prefix_leaves_tail() {
        assert_eq!(strip_fixed_prefix("ss:李四"), "李四");
        assert_eq!(strip_fixed_prefix("给张三发消息"), "给张三发消息");
    }

    #[test]
    fn precheck_rejects_blank_and_punct() {
        assert!(precheck_invalid(""));
        assert!(precheck_invalid("  "));
        assert!(precheck_invalid("。"));
        assert!(precheck_invalid("!?"));
        assert!(!precheck_invalid("aaa"));
        assert!(!precheck_invalid("发朋友圈"));
    }

    #[test]
    fn regex_classifier_flags_connectives_and_multi_action() {
        assert_eq!(classify_regex("给张三发消息然后发朋友圈"), TaskClass::Complex);
        assert_eq!(classify_regex("发消息给张三再截图"), TaskClass::Complex);
        assert_eq!(classify_regex("发消息并且搜索李四"), TaskClass::Complex);
        assert_eq!(classify_regex("给张三发消息"), TaskClass::Simple);
    }

    #[test]
    fn type_mapping_to_class() {
        assert_eq!(ParsedTask::Others.task_class(), TaskClass::Complex);
        assert_eq!(ParsedTask::Invalid.task_class(), TaskClass::Invalid);
        assert_eq!(
            ParsedTask::from_fields("send_msg", "a".into(), "b".into()).task_class(),
            TaskClass::Simple
        );
    }
}
