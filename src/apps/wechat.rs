use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use regex::Regex;

use crate::apps::{AppHandler, ExecutorServices, HandlerOutcome};
use crate::assets::AssetStore;
use crate::classifier::{ParsedTask, TaskClass};
use crate::errors::{AgentError, AgentResult};
use crate::registry::ModuleRecord;
use crate::workflow::executor::{HandlerContext, WorkflowExecutor};
use crate::workflow::{NavStep, Params, ScreenSpec, ScreenState, StepAction, Workflow};

const HOME_INDICATOR: &str = "wechat_home_button";
const CANCEL_INDICATOR: &str = "wechat_cancel_button";
const BACK_INDICATOR: &str = "wechat_back";
const SEARCH_BUTTON: &str = "wechat_search_button";

/// Reference handler for the messaging app: wires the asset store, the
/// screen table and the workflow definitions into the executor.
pub struct WeChatHandler {
    record: ModuleRecord,
    assets: AssetStore,
    workflows: HashMap<&'static str, Workflow>,
    screens: Vec<ScreenSpec>,
}

impl WeChatHandler {
    pub fn new(record: ModuleRecord) -> Self {
        let assets = AssetStore::open(&record.dir);
        Self {
            record,
            assets,
            workflows: build_workflows(),
            screens: screen_table(),
        }
    }

    /// Per-handler table: parsed type → workflow name.
    fn workflow_for_type(&self, type_name: &str) -> Option<&'static str> {
        match type_name {
            "send_msg" => Some("send_message"),
            "post_moment_only_text" => Some("post_moments"),
            "search_contact" => Some("search_contact"),
            "add_friend" => Some("add_friend"),
            _ => None,
        }
    }

    /// Parsed record → workflow parameters.
    fn params_for(&self, parsed: &ParsedTask, workflow: &str) -> Params {
        let mut params = Params::new();
        match (parsed, workflow) {
            (ParsedTask::SendMessage { recipient, content }, "send_message") => {
                params.insert("contact".into(), serde_json::json!(recipient));
                params.insert("message".into(), serde_json::json!(content));
            }
            (ParsedTask::PostMomentsText { content }, "post_moments") => {
                params.insert("content".into(), serde_json::json!(content));
                params.insert("post_action".into(), serde_json::json!("long_press"));
            }
            _ => {}
        }
        params
    }

    fn workflow_descriptions(&self) -> String {
        let mut lines = Vec::new();
        for wf in self.workflows.values() {
            lines.push(format!("- {}: {}", wf.name, wf.description));
            lines.push(format!("  required params: {}", wf.required_params.join(", ")));
            if !wf.optional_params.is_empty() {
                let opts: Vec<String> = wf
                    .optional_params
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                lines.push(format!("  optional params: {}", opts.join(", ")));
            }
        }
        lines.join("\n")
    }

    async fn run_workflow(
        &self,
        services: &ExecutorServices<'_>,
        name: &str,
        params: &Params,
        task: &str,
    ) -> AgentResult<HandlerOutcome> {
        let workflow = self
            .workflows
            .get(name)
            .ok_or_else(|| AgentError::Workflow(format!("unknown workflow '{name}'")))?;

        // Required parameters are validated before the executor touches
        // the device at all.
        if let Err(AgentError::ParamsMissing(missing)) = workflow.merged_params(params) {
            return Ok(HandlerOutcome::missing(missing));
        }

        let executor = WorkflowExecutor::new(
            services.device,
            services.locator,
            services.replanner,
            self,
            services.budgets,
            services.waits,
            services.operation_delay_ms,
            services.cancel,
        );
        match executor.execute_workflow(workflow, params, task).await {
            Ok(trace) => Ok(HandlerOutcome::ok(
                format!("workflow '{name}' completed"),
                trace,
            )),
            Err(e) => {
                let mut outcome = HandlerOutcome::failed(e.to_string(), e.kind());
                outcome.message = format!("workflow '{name}' failed: {e}");
                Ok(outcome)
            }
        }
    }
}

#[async_trait]
impl AppHandler for WeChatHandler {
    fn record(&self) -> &ModuleRecord {
        &self.record
    }

    async fn execute_task(
        &self,
        services: &ExecutorServices<'_>,
        task: &str,
        parsed: Option<&ParsedTask>,
    ) -> AgentResult<HandlerOutcome> {
        // 1. A parsed record with a routable type picks the workflow
        //    directly; the keyword table never participates.
        if let Some(parsed) = parsed {
            match parsed {
                ParsedTask::Invalid => return Ok(HandlerOutcome::invalid_input()),
                ParsedTask::Others => {}
                _ => {
                    if let Some(name) = self.workflow_for_type(parsed.type_name()) {
                        let params = self.params_for(parsed, name);
                        tracing::info!(workflow = name, "type-routed workflow");
                        return self.run_workflow(services, name, &params, task).await;
                    }
                }
            }
        }

        // 2. No usable parsed record: classify locally.
        let (class, local_parsed) = match parsed {
            Some(ParsedTask::Others) => (TaskClass::Complex, None),
            _ => services.classifier.classify_local(task).await,
        };

        match class {
            TaskClass::Invalid => Ok(HandlerOutcome::invalid_input()),
            TaskClass::Complex => {
                let Some(replanner) = services.replanner else {
                    return Ok(HandlerOutcome::failed(
                        "复杂任务需要模型规划，但未配置模型",
                        "planner_failed",
                    ));
                };
                match replanner
                    .choose_workflow(task, &self.workflow_descriptions())
                    .await
                {
                    Ok((name, params)) => {
                        tracing::info!(workflow = %name, "model-selected workflow");
                        self.run_workflow(services, &name, &params, task).await
                    }
                    Err(e) => Ok(HandlerOutcome::failed(e.to_string(), "planner_failed")),
                }
            }
            TaskClass::Simple => {
                // Prefer the locally parsed record, fall back to the regex
                // pattern table.
                if let Some(parsed) = &local_parsed {
                    if let Some(name) = self.workflow_for_type(parsed.type_name()) {
                        let params = self.params_for(parsed, name);
                        return self.run_workflow(services, name, &params, task).await;
                    }
                    if *parsed == ParsedTask::Invalid {
                        return Ok(HandlerOutcome::invalid_input());
                    }
                }
                match match_simple_pattern(task) {
                    Some((name, params)) => self.run_workflow(services, name, &params, task).await,
                    None => Ok(HandlerOutcome::failed(
                        format!("未匹配到工作流: {task}"),
                        "invalid_input",
                    )),
                }
            }
        }
    }
}

impl HandlerContext for WeChatHandler {
    fn app_id(&self) -> &str {
        &self.record.id
    }

    fn package_id(&self) -> Option<&str> {
        self.record.info.package_id.as_deref()
    }

    fn image_variants(&self, name: &str) -> Vec<PathBuf> {
        self.assets.image_variants(name)
    }

    fn list_images(&self) -> Vec<String> {
        self.assets.list_images()
    }

    fn screen_specs(&self) -> &[ScreenSpec] {
        &self.screens
    }

    fn home_indicator(&self) -> &str {
        HOME_INDICATOR
    }

    fn cancel_indicator(&self) -> &str {
        CANCEL_INDICATOR
    }

    fn back_indicator(&self) -> &str {
        BACK_INDICATOR
    }

    fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }

    fn search_button(&self) -> Option<&str> {
        Some(SEARCH_BUTTON)
    }
}

/// Screen detection table in priority order: the home screen first, tab
/// pages next, feature screens by their characteristic widgets last.
fn screen_table() -> Vec<ScreenSpec> {
    vec![
        ScreenSpec {
            screen: ScreenState::Home,
            primary: "wechat_home",
            fallback: Some("system/wechat_home_page"),
        },
        ScreenSpec {
            screen: ScreenState::Contacts,
            primary: "system/wechat_contacts_page",
            fallback: None,
        },
        ScreenSpec {
            screen: ScreenState::Discover,
            primary: "system/wechat_discover_page",
            fallback: None,
        },
        ScreenSpec {
            screen: ScreenState::Me,
            primary: "system/wechat_me_page",
            fallback: None,
        },
        ScreenSpec {
            screen: ScreenState::Chat,
            primary: "wechat_chat_input",
            fallback: None,
        },
        ScreenSpec {
            screen: ScreenState::MomentsPost,
            primary: "wechat_moments_input_box",
            fallback: None,
        },
        ScreenSpec {
            screen: ScreenState::Moments,
            primary: "wechat_moments_camera",
            fallback: None,
        },
        ScreenSpec {
            screen: ScreenState::Search,
            primary: "wechat_search_input",
            fallback: None,
        },
        ScreenSpec {
            screen: ScreenState::AddFriend,
            primary: "wechat_add_search_input",
            fallback: None,
        },
    ]
}

fn build_workflows() -> HashMap<&'static str, Workflow> {
    let mut map = HashMap::new();

    map.insert(
        "send_message",
        Workflow {
            name: "send_message",
            description: "给联系人发送消息",
            valid_start_screens: vec![ScreenState::Home, ScreenState::Chat],
            nav_to_start: Vec::new(),
            steps: vec![
                NavStep::find_or_search("{contact}", "查找联系人 {contact}"),
                NavStep::tap("{contact}", "点击联系人进入聊天").expecting(ScreenState::Chat),
                NavStep::input_text("wechat_chat_input", "{message}", "输入消息内容"),
                NavStep::tap("wechat_chat_send", "点击发送按钮"),
                NavStep::wait(500, "等待消息发送"),
            ],
            end_screen: ScreenState::Chat,
            required_params: vec!["contact", "message"],
            optional_params: Params::new(),
        },
    );

    map.insert(
        "post_moments",
        Workflow {
            name: "post_moments",
            description: "发布朋友圈",
            valid_start_screens: vec![
                ScreenState::Home,
                ScreenState::Discover,
                ScreenState::Moments,
            ],
            nav_to_start: Vec::new(),
            steps: vec![
                NavStep::tap("wechat_tab_discover_button", "点击发现Tab")
                    .expecting(ScreenState::Discover),
                NavStep::tap("wechat_moments_entry", "点击朋友圈").expecting(ScreenState::Moments),
                NavStep::long_press("wechat_moments_camera", "长按相机图标发纯文字")
                    .expecting(ScreenState::MomentsPost),
                NavStep::new(StepAction::Conditional, "如果有图片则选择")
                    .with_param("condition", serde_json::json!("has_image"))
                    .with_param("has_image", serde_json::json!("{has_image}")),
                NavStep::input_text("wechat_moments_input_box", "{content}", "输入朋友圈内容"),
                NavStep::tap("wechat_moments_publish", "点击发表按钮"),
                NavStep::wait(1000, "等待发布完成"),
            ],
            end_screen: ScreenState::Moments,
            required_params: vec!["content"],
            optional_params: Params::from([
                ("post_action".to_string(), serde_json::json!("long_press")),
                ("image_path".to_string(), serde_json::Value::Null),
                ("has_image".to_string(), serde_json::json!(false)),
            ]),
        },
    );

    map.insert(
        "search_contact",
        Workflow {
            name: "search_contact",
            description: "搜索联系人",
            valid_start_screens: vec![ScreenState::Home],
            nav_to_start: Vec::new(),
            steps: vec![
                NavStep::tap("wechat_search_button", "点击搜索按钮").expecting(ScreenState::Search),
                NavStep::input_text("wechat_search_input", "{keyword}", "输入搜索关键词"),
                NavStep::wait(1000, "等待搜索结果"),
                NavStep::tap("dynamic:搜索结果中的{keyword}", "点击搜索结果"),
            ],
            end_screen: ScreenState::Chat,
            required_params: vec!["keyword"],
            optional_params: Params::new(),
        },
    );

    map.insert(
        "add_friend",
        Workflow {
            name: "add_friend",
            description: "添加新好友",
            valid_start_screens: vec![ScreenState::Home],
            nav_to_start: Vec::new(),
            steps: vec![
                NavStep::tap("wechat_add_button", "点击+号按钮"),
                NavStep::tap("wechat_menu_add_friend", "点击添加朋友")
                    .expecting(ScreenState::AddFriend),
                NavStep::input_text("wechat_add_search_input", "{wechat_id}", "输入微信号"),
                NavStep::tap("dynamic:搜索按钮", "点击搜索"),
                NavStep::wait(1500, "等待搜索结果"),
                NavStep::tap("wechat_add_contact_button", "点击添加到通讯录"),
                NavStep::tap("wechat_add_send_button", "点击发送申请"),
            ],
            end_screen: ScreenState::AddFriend,
            required_params: vec!["wechat_id"],
            optional_params: Params::from([(
                "verify_message".to_string(),
                serde_json::json!(""),
            )]),
        },
    );

    map.insert(
        "message_and_moments",
        Workflow {
            name: "message_and_moments",
            description: "发消息后截图发朋友圈",
            valid_start_screens: vec![ScreenState::Home],
            nav_to_start: Vec::new(),
            steps: vec![
                NavStep::sub_workflow("send_message", "执行发消息子流程")
                    .with_param("contact", serde_json::json!("{contact}"))
                    .with_param("message", serde_json::json!("{message}")),
                NavStep::new(StepAction::Screenshot, "截取聊天截图")
                    .with_param("save_as", serde_json::json!("{screenshot_path}")),
                NavStep::new(StepAction::NavToHome, "返回首页"),
                NavStep::sub_workflow("post_moments", "执行发朋友圈子流程")
                    .with_param("content", serde_json::json!("{moments_content}")),
            ],
            end_screen: ScreenState::Moments,
            required_params: vec!["contact", "message", "moments_content"],
            optional_params: Params::from([(
                "screenshot_path".to_string(),
                serde_json::json!(
                    std::env::temp_dir()
                        .join("droidpilot_chat.png")
                        .to_string_lossy()
                        .into_owned()
                ),
            )]),
        },
    );

    map
}

/// Regex fallback for simple tasks when no parsed record is available.
/// Returns the workflow name and extracted parameters.
pub fn match_simple_pattern(task: &str) -> Option<(&'static str, Params)> {
    let excluded = ["然后", "再", "接着", "截图"].iter().any(|w| task.contains(w));

    // Send a message: 给<contact>发消息/发微信/说<content>.
    if !excluded
        && (task.contains("发消息") || task.contains("发微信") || task.contains("发信息"))
        && task.contains('给')
        && !task.contains("朋友圈")
    {
        let mut params = Params::new();
        if let Some(caps) = Regex::new(r"给\s*([^\s:：，。\d]+?)(?:[：:]|发|说|$)")
            .ok()?
            .captures(task)
        {
            params.insert("contact".into(), serde_json::json!(&caps[1]));
        }
        if let Some(content) = extract_message_content(task) {
            params.insert("message".into(), serde_json::json!(content));
        }
        return Some(("send_message", params));
    }

    // Post to moments: 发朋友圈<content>.
    if task.contains("发朋友圈") && !task.contains('给') {
        let mut params = Params::new();
        if let Some(caps) = Regex::new(r"发朋友圈[:：]?\s*(.+)").ok()?.captures(task) {
            params.insert("content".into(), serde_json::json!(caps[1].trim()));
        }
        return Some(("post_moments", params));
    }

    // Search for a contact: 搜索<keyword>.
    if task.contains("搜索") || task.contains("找联系人") {
        let mut params = Params::new();
        if let Some(caps) = Regex::new(r"(?:搜索|找联系人)\s*(.+)").ok()?.captures(task) {
            params.insert("keyword".into(), serde_json::json!(caps[1].trim()));
        }
        return Some(("search_contact", params));
    }

    // Add a friend: 加好友/添加好友 <id>.
    if task.contains("加好友") || task.contains("添加好友") || task.contains("加微信") {
        let mut params = Params::new();
        if let Some(caps) = Regex::new(r"(?:加|添加)[^\d a-zA-Z]*([0-9a-zA-Z][\w-]*)")
            .ok()?
            .captures(task)
        {
            params.insert("wechat_id".into(), serde_json::json!(&caps[1]));
        }
        return Some(("add_friend", params));
    }

    None
}

fn extract_message_content(task: &str) -> Option<String> {
    // Colon tail first, then quoted text, then a 说… clause.
    if let Some(caps) = Regex::new(r"[:：]\s*(.+)").ok()?.captures(task) {
        return Some(caps[1].trim().to_string());
    }
    if let Some(caps) = Regex::new("[\"“「']([^\"”」']+)[\"”」']").ok()?.captures(task) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = Regex::new(r"说\s*([^，。]+)").ok()?.captures(task) {
        return Some(caps[1].trim().to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflows_validate_against_author_contract() {
        for wf in build_workflows().values() {
            wf.validate().unwrap_or_else(|e| panic!("{}: {e}", wf.name));
            assert!(
                !wf.valid_start_screens.is_empty(),
                "{} has no start screens",
                wf.name
            );
        }
    }

    #[test]
    fn type_map_covers_declared_types() {
        let record = ModuleRecord {
            id: "wechat".into(),
            info: crate::registry::ModuleInfo {
                name: "微信".into(),
                package_id: Some("com.tencent.mm".into()),
                keywords: vec![],
                description: String::new(),
            },
            dir: std::path::PathBuf::from("apps/wechat"),
            templates: vec![],
        };
        let handler = WeChatHandler::new(record);
        assert_eq!(handler.workflow_for_type("send_msg"), Some("send_message"));
        assert_eq!(
            handler.workflow_for_type("post_moment_only_text"),
            Some("post_moments")
        );
        assert_eq!(handler.workflow_for_type("others"), None);
    }

    #[test]
    fn parsed_record_maps_to_workflow_params() {
        let record = ModuleRecord {
            id: "wechat".into(),
            info: crate::registry::ModuleInfo {
                name: "微信".into(),
                package_id: None,
                keywords: vec![],
                description: String::new(),
            },
            dir: std::path::PathBuf::from("apps/wechat"),
            templates: vec![],
        };
        let handler = WeChatHandler::new(record);

        let parsed = ParsedTask::SendMessage {
            recipient: "张三".into(),
            content: "你好".into(),
        };
        let params = handler.params_for(&parsed, "send_message");
        assert_eq!(params["contact"], serde_json::json!("张三"));
        assert_eq!(params["message"], serde_json::json!("你好"));

        let parsed = ParsedTask::PostMomentsText {
            content: "今天天气真好".into(),
        };
        let params = handler.params_for(&parsed, "post_moments");
        assert_eq!(params["content"], serde_json::json!("今天天气真好"));
        assert_eq!(params["post_action"], serde_json::json!("long_press"));
    }

    #[test]
    fn regex_fallback_extracts_send_message() {
        let (name, params) = match_simple_pattern("给张三发消息说你好").unwrap();
        assert_eq!(name, "send_message");
        assert_eq!(params["contact"], serde_json::json!("张三"));
        assert_eq!(params["message"], serde_json::json!("你好"));
    }

    #[test]
    fn regex_fallback_extracts_moments() {
        let (name, params) = match_simple_pattern("发朋友圈今天天气真好").unwrap();
        assert_eq!(name, "post_moments");
        assert_eq!(params["content"], serde_json::json!("今天天气真好"));
    }

    #[test]
    fn regex_fallback_fails_closed_on_unknown() {
        assert!(match_simple_pattern("打开设置页面").is_none());
    }
}
