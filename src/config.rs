use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::{AgentError, AgentResult};

/// Environment variable prefix for per-app screenshot waits,
/// e.g. `SCREENSHOT_WAIT_CHROME=1.0`.
const SCREENSHOT_WAIT_PREFIX: &str = "SCREENSHOT_WAIT_";

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Connection settings for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl LlmSettings {
    /// Build from the environment for a named provider. Recognized providers
    /// mirror the `LLM_PROVIDER` convention: `claude`, `openai`, `custom`.
    pub fn from_env(provider: &str) -> AgentResult<Self> {
        let (api_key, base_url, model) = match provider {
            "claude" => (
                env_str("ANTHROPIC_API_KEY", ""),
                env_str("ANTHROPIC_BASE_URL", "https://api.anthropic.com/v1"),
                env_str("CLAUDE_MODEL", "claude-sonnet-4-20250514"),
            ),
            "openai" => (
                env_str("OPENAI_API_KEY", ""),
                env_str("OPENAI_BASE_URL", "https://api.openai.com/v1"),
                env_str("OPENAI_MODEL", "gpt-4o"),
            ),
            "custom" => (
                env_str("CUSTOM_LLM_API_KEY", ""),
                env_str("CUSTOM_LLM_BASE_URL", ""),
                env_str("CUSTOM_LLM_MODEL", ""),
            ),
            other => {
                return Err(AgentError::Config(format!(
                    "unsupported LLM provider '{other}' (expected claude, openai or custom)"
                )))
            }
        };

        Ok(Self {
            provider: provider.to_string(),
            api_key,
            base_url,
            model,
            max_tokens: env_parse("LLM_MAX_TOKENS", 1024),
            temperature: env_parse("LLM_TEMPERATURE", 0.0),
            timeout_secs: env_parse("LLM_TIMEOUT", 60),
        })
    }

    pub fn is_usable(&self) -> bool {
        !self.base_url.is_empty() && !self.model.is_empty()
    }
}

/// How the task classifier decides simple vs. complex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierMode {
    Regex,
    Llm,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub mode: ClassifierMode,
    /// Optional cheaper endpoint dedicated to classification. When absent
    /// the main provider is used.
    pub secondary: Option<LlmSettings>,
}

impl ClassifierConfig {
    fn from_env(main: &LlmSettings) -> Self {
        let mode = match env_str("TASK_CLASSIFIER_MODE", "llm").to_lowercase().as_str() {
            "regex" => ClassifierMode::Regex,
            _ => ClassifierMode::Llm,
        };

        let secondary = if let Some(provider) = env_opt("TASK_CLASSIFIER_LLM_PROVIDER") {
            LlmSettings::from_env(&provider).ok()
        } else if let (Some(base_url), Some(model)) = (
            env_opt("TASK_CLASSIFIER_LLM_BASE_URL"),
            env_opt("TASK_CLASSIFIER_LLM_MODEL"),
        ) {
            Some(LlmSettings {
                provider: "custom".into(),
                api_key: env_opt("TASK_CLASSIFIER_LLM_API_KEY")
                    .unwrap_or_else(|| main.api_key.clone()),
                base_url,
                model,
                // Classification needs only a short JSON record.
                max_tokens: 512,
                temperature: 0.0,
                timeout_secs: main.timeout_secs,
            })
        } else {
            None
        };

        Self { mode, secondary }
    }
}

/// Device binding settings, including the mock backend switch.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub adb_path: String,
    pub default_device: String,
    pub debug_mode: bool,
    pub debug_device_name: String,
    pub debug_screen_width: u32,
    pub debug_screen_height: u32,
    /// Timeout for a single adb invocation.
    pub command_timeout_secs: u64,
    /// Timeout for a screenshot capture + pull.
    pub screenshot_timeout_secs: u64,
}

impl DeviceConfig {
    fn from_env() -> Self {
        Self {
            adb_path: env_str("ADB_PATH", "adb"),
            default_device: env_str("DEFAULT_DEVICE", ""),
            debug_mode: env_bool("DEBUG_MODE", false),
            debug_device_name: env_str("DEBUG_DEVICE_NAME", "mock-device"),
            debug_screen_width: env_parse("DEBUG_SCREEN_WIDTH", 1080),
            debug_screen_height: env_parse("DEBUG_SCREEN_HEIGHT", 2400),
            command_timeout_secs: env_parse("DEVICE_COMMAND_TIMEOUT", 30),
            screenshot_timeout_secs: env_parse("SCREENSHOT_TIMEOUT", 8),
        }
    }
}

/// Per-app waits applied before screenshot capture (screen settle time).
#[derive(Debug, Clone)]
pub struct ScreenshotWaits {
    pub default_ms: u64,
    per_app: HashMap<String, u64>,
}

impl ScreenshotWaits {
    /// Fixed default with no per-app overrides.
    pub fn fixed(default_ms: u64) -> Self {
        Self {
            default_ms,
            per_app: HashMap::new(),
        }
    }

    fn from_env() -> Self {
        let default_ms = (env_parse("SCREENSHOT_WAIT_DEFAULT", 0.3f64) * 1000.0) as u64;
        let mut per_app = HashMap::new();
        for (key, value) in std::env::vars() {
            if key == "SCREENSHOT_WAIT_DEFAULT" {
                continue;
            }
            if let Some(app) = key.strip_prefix(SCREENSHOT_WAIT_PREFIX) {
                if let Ok(secs) = value.parse::<f64>() {
                    per_app.insert(app.to_lowercase(), (secs * 1000.0) as u64);
                }
            }
        }
        Self { default_ms, per_app }
    }

    pub fn wait_ms_for(&self, app: Option<&str>) -> u64 {
        app.and_then(|a| self.per_app.get(&a.to_lowercase()).copied())
            .unwrap_or(self.default_ms)
    }
}

/// Retry and attempt budgets for the workflow executor.
#[derive(Debug, Clone)]
pub struct WorkflowBudgets {
    pub max_step_retries: u32,
    pub max_back_presses: u32,
    pub back_press_interval_ms: u64,
    pub home_max_attempts: u32,
    pub ai_fallback_attempts: u32,
    pub recover_nav_attempts: u32,
    pub max_replans: u32,
}

impl Default for WorkflowBudgets {
    fn default() -> Self {
        Self {
            max_step_retries: 3,
            max_back_presses: 5,
            back_press_interval_ms: 500,
            home_max_attempts: 5,
            ai_fallback_attempts: 3,
            recover_nav_attempts: 3,
            max_replans: 3,
        }
    }
}

impl WorkflowBudgets {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_step_retries: env_parse("WORKFLOW_MAX_STEP_RETRIES", d.max_step_retries),
            max_back_presses: env_parse("WORKFLOW_MAX_BACK_PRESSES", d.max_back_presses),
            back_press_interval_ms: env_parse(
                "WORKFLOW_BACK_PRESS_INTERVAL",
                d.back_press_interval_ms,
            ),
            home_max_attempts: env_parse("WORKFLOW_HOME_MAX_ATTEMPTS", d.home_max_attempts),
            ai_fallback_attempts: env_parse(
                "WORKFLOW_AI_FALLBACK_ATTEMPTS",
                d.ai_fallback_attempts,
            ),
            recover_nav_attempts: env_parse(
                "WORKFLOW_RECOVER_NAV_ATTEMPTS",
                d.recover_nav_attempts,
            ),
            max_replans: env_parse("WORKFLOW_MAX_REPLANS", d.max_replans),
        }
    }
}

/// Process-wide configuration, loaded once at startup and threaded through
/// an explicit context. Nothing here mutates after load.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub llm: LlmSettings,
    pub classifier: ClassifierConfig,
    pub waits: ScreenshotWaits,
    pub budgets: WorkflowBudgets,
    /// Base delay inserted after raw device inputs.
    pub operation_delay_ms: u64,
    /// Root of the on-disk handler modules (`apps/<name>/manifest.yaml`).
    pub apps_dir: PathBuf,
    /// Optional ONNX model for the on-device element detector stage.
    pub detector_model_path: Option<String>,
}

impl AppConfig {
    /// Load `.env` (if present) and build the full configuration.
    pub fn load() -> AgentResult<Self> {
        let _ = dotenvy::dotenv();

        let provider = env_str("LLM_PROVIDER", "custom");
        let llm = LlmSettings::from_env(&provider)?;
        let classifier = ClassifierConfig::from_env(&llm);

        let config = Self {
            device: DeviceConfig::from_env(),
            classifier,
            waits: ScreenshotWaits::from_env(),
            budgets: WorkflowBudgets::from_env(),
            operation_delay_ms: (env_parse("OPERATION_DELAY", 0.5f64) * 1000.0) as u64,
            apps_dir: PathBuf::from(env_str("APPS_DIR", "apps")),
            detector_model_path: env_opt("DETECTOR_MODEL_PATH"),
            llm,
        };

        tracing::info!(
            provider = %config.llm.provider,
            model = %config.llm.model,
            debug_mode = config.device.debug_mode,
            apps_dir = %config.apps_dir.display(),
            "config loaded"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screenshot_wait_falls_back_to_default() {
        let waits = ScreenshotWaits {
            default_ms: 300,
            per_app: HashMap::from([("chrome".to_string(), 1000u64)]),
        };
        assert_eq!(waits.wait_ms_for(Some("chrome")), 1000);
        assert_eq!(waits.wait_ms_for(Some("Chrome")), 1000);
        assert_eq!(waits.wait_ms_for(Some("wechat")), 300);
        assert_eq!(waits.wait_ms_for(None), 300);
    }

    #[test]
    fn budgets_have_spec_defaults() {
        let b = WorkflowBudgets::default();
        assert_eq!(b.max_step_retries, 3);
        assert_eq!(b.max_back_presses, 5);
        assert_eq!(b.back_press_interval_ms, 500);
        assert_eq!(b.home_max_attempts, 5);
        assert_eq!(b.ai_fallback_attempts, 3);
        assert_eq!(b.recover_nav_attempts, 3);
    }
}
