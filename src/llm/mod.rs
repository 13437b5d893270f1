pub mod openai;
pub mod provider;
pub mod types;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::errors::AgentResult;
use crate::llm::openai::OpenAiCompatibleProvider;
use crate::llm::provider::LlmProvider;
use crate::llm::types::CallConfig;

/// Which model a call should go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Vision location, verification, planning, workflow selection.
    Main,
    /// Utterance classification; routed to the cheaper endpoint when one is
    /// configured, otherwise falls back to the main provider.
    Classifier,
}

/// Long-lived model clients plus role-to-call-config resolution. The inner
/// reqwest pools are the only shared mutable state and are thread-safe.
#[derive(Clone)]
pub struct LlmRouter {
    main: Arc<dyn LlmProvider>,
    main_cfg: CallConfig,
    classifier: Option<Arc<dyn LlmProvider>>,
    classifier_cfg: Option<CallConfig>,
}

impl LlmRouter {
    pub fn from_config(config: &AppConfig) -> AgentResult<Self> {
        let main = Arc::new(OpenAiCompatibleProvider::new(&config.llm)?);
        let main_cfg = CallConfig {
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            json_mode: false,
        };

        let (classifier, classifier_cfg) = match &config.classifier.secondary {
            Some(settings) if settings.is_usable() => {
                let provider: Arc<dyn LlmProvider> =
                    Arc::new(OpenAiCompatibleProvider::new(settings)?);
                let cfg = CallConfig {
                    model: settings.model.clone(),
                    temperature: settings.temperature,
                    max_tokens: settings.max_tokens,
                    json_mode: false,
                };
                (Some(provider), Some(cfg))
            }
            _ => (None, None),
        };

        Ok(Self {
            main,
            main_cfg,
            classifier,
            classifier_cfg,
        })
    }

    /// Resolve the provider and call configuration for a role.
    pub fn for_role(&self, role: Role) -> (Arc<dyn LlmProvider>, CallConfig) {
        match role {
            Role::Main => (self.main.clone(), self.main_cfg.clone()),
            Role::Classifier => match (&self.classifier, &self.classifier_cfg) {
                (Some(provider), Some(cfg)) => (provider.clone(), cfg.clone()),
                _ => {
                    tracing::debug!("no dedicated classifier model, using main provider");
                    (self.main.clone(), self.main_cfg.clone())
                }
            },
        }
    }
}
