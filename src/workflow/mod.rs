pub mod executor;
pub mod strategy;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{AgentError, AgentResult};
use crate::locator::TargetRef;

pub type Params = HashMap<String, serde_json::Value>;

/// App-local screen states. `Home`, `Unknown` and `Other` are common to
/// every app; the rest belong to the reference messaging app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenState {
    Home,
    Contacts,
    Discover,
    Me,
    Chat,
    Moments,
    MomentsPost,
    Search,
    AddFriend,
    Profile,
    Other,
    Unknown,
}

impl ScreenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreenState::Home => "home",
            ScreenState::Contacts => "contacts",
            ScreenState::Discover => "discover",
            ScreenState::Me => "me",
            ScreenState::Chat => "chat",
            ScreenState::Moments => "moments",
            ScreenState::MomentsPost => "moments_post",
            ScreenState::Search => "search",
            ScreenState::AddFriend => "add_friend",
            ScreenState::Profile => "profile",
            ScreenState::Other => "other",
            ScreenState::Unknown => "unknown",
        }
    }
}

/// Visual indicator for one detectable screen, in detection priority order
/// within the handler's table.
#[derive(Debug, Clone)]
pub struct ScreenSpec {
    pub screen: ScreenState,
    pub primary: &'static str,
    pub fallback: Option<&'static str>,
}

/// Step vocabulary. The last four appear only in model-replanned steps, not
/// in authored workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Tap,
    LongPress,
    Swipe,
    InputText,
    InputUrl,
    PressKey,
    #[serde(alias = "key_event")]
    Keyevent,
    Wait,
    Check,
    FindOrSearch,
    Conditional,
    Screenshot,
    NavToHome,
    SubWorkflow,
    LaunchApp,
    OpenUrl,
    Call,
    GoHome,
}

/// One declarative workflow step. `target` keeps the authoring syntax
/// (reference name, `dynamic:` description, or `{param}` placeholder).
#[derive(Debug, Clone)]
pub struct NavStep {
    pub action: StepAction,
    pub target: Option<String>,
    pub params: Params,
    pub description: String,
    pub expect_screen: Option<ScreenState>,
    pub max_wait_ms: u64,
}

impl NavStep {
    pub fn new(action: StepAction, description: &str) -> Self {
        Self {
            action,
            target: None,
            params: Params::new(),
            description: description.to_string(),
            expect_screen: None,
            max_wait_ms: 2000,
        }
    }

    pub fn tap(target: &str, description: &str) -> Self {
        Self::new(StepAction::Tap, description).with_target(target)
    }

    pub fn long_press(target: &str, description: &str) -> Self {
        Self::new(StepAction::LongPress, description).with_target(target)
    }

    pub fn input_text(target: &str, text: &str, description: &str) -> Self {
        Self::new(StepAction::InputText, description)
            .with_target(target)
            .with_param("text", serde_json::json!(text))
    }

    pub fn wait(duration_ms: u64, description: &str) -> Self {
        Self::new(StepAction::Wait, description)
            .with_param("duration", serde_json::json!(duration_ms))
    }

    pub fn press_key(keycode: u32, description: &str) -> Self {
        Self::new(StepAction::PressKey, description)
            .with_param("keycode", serde_json::json!(keycode))
    }

    pub fn check(description: &str, expect: ScreenState) -> Self {
        Self::new(StepAction::Check, description).expecting(expect)
    }

    pub fn find_or_search(target: &str, description: &str) -> Self {
        Self::new(StepAction::FindOrSearch, description)
            .with_target(target)
            .with_param("search_fallback", serde_json::json!(true))
    }

    pub fn sub_workflow(name: &str, description: &str) -> Self {
        Self::new(StepAction::SubWorkflow, description)
            .with_param("workflow", serde_json::json!(name))
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn expecting(mut self, screen: ScreenState) -> Self {
        self.expect_screen = Some(screen);
        self
    }

    /// Substitute `{name}` placeholders and split the target into its
    /// reference/description form. Placeholders left unresolved fail the
    /// step before anything touches the device.
    pub fn resolve(&self, params: &Params) -> AgentResult<ResolvedStep> {
        let target = match &self.target {
            Some(raw) => Some(TargetRef::parse(&substitute(raw, params)?)),
            None => None,
        };
        let mut resolved_params = Params::new();
        for (key, value) in &self.params {
            let value = match value {
                serde_json::Value::String(s) => serde_json::Value::String(substitute(s, params)?),
                other => other.clone(),
            };
            resolved_params.insert(key.clone(), value);
        }
        Ok(ResolvedStep {
            action: self.action,
            target,
            params: resolved_params,
            description: substitute(&self.description, params).unwrap_or_else(|_| self.description.clone()),
            expect_screen: self.expect_screen,
            max_wait_ms: self.max_wait_ms,
        })
    }
}

/// A step after parameter substitution, ready for execution.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub action: StepAction,
    pub target: Option<TargetRef>,
    pub params: Params,
    pub description: String,
    pub expect_screen: Option<ScreenState>,
    pub max_wait_ms: u64,
}

impl ResolvedStep {
    pub fn param_str(&self, key: &str) -> Option<String> {
        self.params.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        match self.params.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Declarative workflow: ordered steps plus pre/postconditions. Pure data;
/// the executor interprets it.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: &'static str,
    pub description: &'static str,
    pub valid_start_screens: Vec<ScreenState>,
    pub nav_to_start: Vec<NavStep>,
    pub steps: Vec<NavStep>,
    pub end_screen: ScreenState,
    pub required_params: Vec<&'static str>,
    pub optional_params: Params,
}

impl Workflow {
    /// Author contract checks: non-empty valid starts, placeholders closed
    /// over declared parameters.
    pub fn validate(&self) -> AgentResult<()> {
        if self.valid_start_screens.is_empty() {
            return Err(AgentError::Workflow(format!(
                "workflow '{}' declares no valid start screens",
                self.name
            )));
        }
        let declared: Vec<&str> = self
            .required_params
            .iter()
            .copied()
            .chain(self.optional_params.keys().map(String::as_str))
            .collect();
        for step in &self.steps {
            for text in step
                .target
                .iter()
                .chain(step.params.values().filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s),
                    _ => None,
                }))
            {
                for name in placeholders(text) {
                    if !declared.contains(&name.as_str()) {
                        return Err(AgentError::Workflow(format!(
                            "workflow '{}' uses undeclared placeholder {{{name}}}",
                            self.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Overlay user params on the optional defaults and check required ones.
    pub fn merged_params(&self, user: &Params) -> AgentResult<Params> {
        let missing: Vec<String> = self
            .required_params
            .iter()
            .filter(|p| {
                user.get(**p)
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.is_empty(),
                        serde_json::Value::Null => true,
                        _ => false,
                    })
                    .unwrap_or(true)
            })
            .map(|p| p.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(AgentError::ParamsMissing(missing));
        }

        let mut merged = self.optional_params.clone();
        for (k, v) in user {
            merged.insert(k.clone(), v.clone());
        }
        Ok(merged)
    }
}

/// Purely textual `{name}` substitution. Unknown placeholders are an error
/// listing everything unresolved.
pub fn substitute(template: &str, params: &Params) -> AgentResult<String> {
    let mut result = template.to_string();
    for (key, value) in params {
        let needle = format!("{{{key}}}");
        if result.contains(&needle) {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            result = result.replace(&needle, &rendered);
        }
    }

    let unresolved = placeholders(&result);
    if unresolved.is_empty() {
        Ok(result)
    } else {
        Err(AgentError::ParamsMissing(unresolved))
    }
}

/// `{name}` placeholders present in the text.
fn placeholders(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let tail = &rest[open + 1..];
        match tail.find('}') {
            Some(close) => {
                let name = &tail[..close];
                if !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '_')
                {
                    out.push(name.to_string());
                }
                rest = &tail[close + 1..];
            }
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect()
    }

    #[test]
    fn substitution_is_textual() {
        let p = params(&[("contact", "张三"), ("message", "你好")]);
        assert_eq!(substitute("查找联系人 {contact}", &p).unwrap(), "查找联系人 张三");
        assert_eq!(substitute("{contact}:{message}", &p).unwrap(), "张三:你好");
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let p = params(&[("contact", "张三")]);
        match substitute("say {message} to {contact}", &p) {
            Err(AgentError::ParamsMissing(missing)) => assert_eq!(missing, vec!["message"]),
            other => panic!("expected ParamsMissing, got {other:?}"),
        }
    }

    #[test]
    fn literal_braces_without_names_are_kept() {
        let p = Params::new();
        assert_eq!(substitute("json {} body", &p).unwrap(), "json {} body");
    }

    #[test]
    fn resolve_splits_dynamic_targets() {
        let p = params(&[("keyword", "李四")]);
        let step = NavStep::tap("dynamic:搜索结果中的{keyword}", "点击搜索结果");
        let resolved = step.resolve(&p).unwrap();
        assert_eq!(
            resolved.target,
            Some(TargetRef::ByDescription("搜索结果中的李四".into()))
        );
    }

    #[test]
    fn merged_params_overlay_defaults() {
        let wf = Workflow {
            name: "post_moments",
            description: "",
            valid_start_screens: vec![ScreenState::Home],
            nav_to_start: Vec::new(),
            steps: Vec::new(),
            end_screen: ScreenState::Moments,
            required_params: vec!["content"],
            optional_params: params(&[("post_action", "long_press")]),
        };
        let merged = wf.merged_params(&params(&[("content", "nice weather")])).unwrap();
        assert_eq!(merged["post_action"], serde_json::json!("long_press"));
        assert_eq!(merged["content"], serde_json::json!("nice weather"));

        match wf.merged_params(&Params::new()) {
            Err(AgentError::ParamsMissing(missing)) => assert_eq!(missing, vec!["content"]),
            other => panic!("expected ParamsMissing, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_empty_starts_and_unknown_placeholders() {
        let mut wf = Workflow {
            name: "broken",
            description: "",
            valid_start_screens: Vec::new(),
            nav_to_start: Vec::new(),
            steps: vec![NavStep::tap("{ghost}", "tap ghost")],
            end_screen: ScreenState::Home,
            required_params: Vec::new(),
            optional_params: Params::new(),
        };
        assert!(wf.validate().is_err());
        wf.valid_start_screens.push(ScreenState::Home);
        assert!(wf.validate().is_err());
        wf.required_params.push("ghost");
        assert!(wf.validate().is_ok());
    }
}
