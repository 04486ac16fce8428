//! Provider-agnostic text generation.
//!
//! [`LlmService`] wraps one concrete backend chosen from
//! [`LlmModelConfig::provider`]. Construct it once, wrap it in `Arc`, and
//! share it between tasks; the inner HTTP clients are reused.
//!
//! ```no_run
//! use ai_llm_service::{config::default_config::config_from_env, llm_service::LlmService};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let svc = LlmService::from_config(config_from_env()?)?;
//! let reply = svc.generate("Explain this diff", Some("You are a reviewer")).await?;
//! # Ok(()) }
//! ```

use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    config::{llm_model_config::LlmModelConfig, llm_provider::LlmProvider},
    error_handler::{AiLlmError, Result},
    services::{ollama_service::OllamaService, open_ai_service::OpenAiService},
};

#[derive(Debug)]
pub enum LlmService {
    Ollama(OllamaService),
    OpenAI(OpenAiService),
}

impl LlmService {
    /// Validates `cfg` and builds the matching backend client.
    pub fn from_config(cfg: LlmModelConfig) -> Result<Self> {
        cfg.validate()?;
        debug!(provider = %cfg.provider, model = %cfg.model, "building LLM service");

        Ok(match cfg.provider {
            LlmProvider::Ollama => Self::Ollama(OllamaService::new(cfg)?),
            LlmProvider::OpenAI => Self::OpenAI(OpenAiService::new(cfg)?),
        })
    }

    pub fn config(&self) -> &LlmModelConfig {
        match self {
            Self::Ollama(s) => s.config(),
            Self::OpenAI(s) => s.config(),
        }
    }

    pub fn provider(&self) -> LlmProvider {
        self.config().provider
    }

    pub fn model(&self) -> &str {
        &self.config().model
    }

    /// Single non-streaming generation with an optional system instruction.
    ///
    /// The request is additionally bounded by `timeout_secs` from the config,
    /// so a stalled connection surfaces as [`AiLlmError::Timeout`] instead of
    /// a transport error with no context.
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let fut = async {
            match self {
                Self::Ollama(s) => s.generate(prompt, system).await,
                Self::OpenAI(s) => s.generate(prompt, system).await,
            }
        };

        match self.config().timeout_secs {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                tokio::time::timeout(limit, fut).await.map_err(|_| {
                    warn!(provider = %self.provider(), timeout_secs = secs, "generation timed out");
                    AiLlmError::Timeout(limit)
                })?
            }
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handler::ConfigError;

    fn cfg(provider: LlmProvider) -> LlmModelConfig {
        LlmModelConfig {
            provider,
            model: "m".into(),
            endpoint: "http://localhost:11434".into(),
            api_key: Some("k".into()),
            max_tokens: None,
            temperature: None,
            top_p: None,
            timeout_secs: Some(10),
        }
    }

    #[test]
    fn dispatches_on_provider() {
        let svc = LlmService::from_config(cfg(LlmProvider::Ollama)).unwrap();
        assert!(matches!(svc, LlmService::Ollama(_)));
        assert_eq!(svc.model(), "m");

        let svc = LlmService::from_config(cfg(LlmProvider::OpenAI)).unwrap();
        assert_eq!(svc.provider(), LlmProvider::OpenAI);
    }

    #[test]
    fn invalid_config_is_rejected_before_building() {
        let mut c = cfg(LlmProvider::Ollama);
        c.model.clear();
        assert!(matches!(
            LlmService::from_config(c),
            Err(AiLlmError::Config(ConfigError::EmptyModel))
        ));
    }
}
