//! Construction seams of the review service.
//!
//! The service never builds clients itself: a [`ProviderFactory`] turns
//! provider settings into a [`ReviewProvider`], an [`AiProviderFactory`] turns
//! AI settings into an [`AiReviewer`]. Tests plug in-memory doubles in here.

use std::sync::Arc;

use ai_llm_service::{LlmModelConfig, LlmProvider, LlmService};
use async_trait::async_trait;
use git_context_engine::git_providers::{
    FileChange, ProviderClient, ProviderConfig, ProviderKind, ReviewProvider,
};
use tracing::debug;

use crate::{
    errors::{ConfigError, MrResult},
    review::{
        batch::{BatchProcessor, DiffBatch, aggregate},
        llm::LlmReviewer,
        types::{AiSettings, BatchOutput, ProviderSettings},
    },
};

const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";
const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com";

/// Summary used when no file survived batching.
const NOTHING_TO_REVIEW: &str = "No reviewable text changes were found in this merge request.";

/// Model-backed reviewer of diff batches.
#[async_trait]
pub trait AiReviewer: Send + Sync {
    /// One model round-trip for one batch. No retries here.
    async fn review_batch(&self, batch: &DiffBatch) -> MrResult<BatchOutput>;

    /// Reviews a whole diff set: plan batches, run them with retries,
    /// aggregate. Makes no model call when nothing is reviewable.
    async fn review_with_batching(
        &self,
        files: &[FileChange],
        processor: &BatchProcessor,
    ) -> MrResult<BatchOutput> {
        let batches = processor.plan(files);
        if batches.is_empty() {
            return Ok(BatchOutput {
                summary: NOTHING_TO_REVIEW.to_string(),
                comments: Vec::new(),
            });
        }
        let outputs = processor.run(self, &batches).await?;
        Ok(aggregate(outputs))
    }
}

pub trait ProviderFactory: Send + Sync {
    fn create_provider(&self, settings: &ProviderSettings) -> MrResult<Arc<dyn ReviewProvider>>;
}

pub trait AiProviderFactory: Send + Sync {
    fn create_reviewer(&self, settings: &AiSettings) -> MrResult<Arc<dyn AiReviewer>>;
}

/// Builds REST provider clients over one shared connection pool.
#[derive(Debug, Clone)]
pub struct DefaultProviderFactory {
    http: reqwest::Client,
}

impl DefaultProviderFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn create_provider(&self, settings: &ProviderSettings) -> MrResult<Arc<dyn ReviewProvider>> {
        let kind = ProviderKind::from_type_str(&settings.provider_type)
            .map_err(|_| ConfigError::UnsupportedProvider(settings.provider_type.clone()))?;

        let base = settings.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(settings.base_url.clone()).into());
        }
        if settings.token.trim().is_empty() {
            return Err(ConfigError::Missing("provider token").into());
        }

        debug!(provider = kind.as_str(), base_url = base, "creating provider client");
        let cfg = ProviderConfig::for_instance(kind, base, settings.token.trim());
        Ok(Arc::new(ProviderClient::with_http(self.http.clone(), cfg)))
    }
}

/// Builds [`LlmReviewer`]s on top of `ai-llm-service`.
#[derive(Debug, Clone, Default)]
pub struct LlmAiFactory;

impl LlmAiFactory {
    pub fn model_config(settings: &AiSettings) -> MrResult<LlmModelConfig> {
        let provider = settings
            .ai_type
            .parse::<LlmProvider>()
            .map_err(|_| ConfigError::UnsupportedAi(settings.ai_type.clone()))?;

        let endpoint = settings
            .endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| match provider {
                LlmProvider::Ollama => DEFAULT_OLLAMA_ENDPOINT.to_string(),
                LlmProvider::OpenAI => DEFAULT_OPENAI_ENDPOINT.to_string(),
            });

        Ok(LlmModelConfig {
            provider,
            model: settings.model.clone(),
            endpoint,
            api_key: settings.api_key.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            top_p: None,
            timeout_secs: None,
        })
    }
}

impl AiProviderFactory for LlmAiFactory {
    fn create_reviewer(&self, settings: &AiSettings) -> MrResult<Arc<dyn AiReviewer>> {
        let service = LlmService::from_config(Self::model_config(settings)?)?;
        debug!(provider = %service.provider(), model = service.model(), "creating AI reviewer");
        Ok(Arc::new(LlmReviewer::new(service)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_settings(kind: &str, base: &str) -> ProviderSettings {
        ProviderSettings {
            provider_type: kind.into(),
            base_url: base.into(),
            token: "glpat-x".into(),
        }
    }

    #[test]
    fn provider_factory_validates_settings() {
        let f = DefaultProviderFactory::new(reqwest::Client::new());

        let p = f
            .create_provider(&provider_settings("gitlab-self-hosted", "https://git.acme.io"))
            .unwrap();
        assert_eq!(p.kind(), ProviderKind::GitLab);

        assert!(f.create_provider(&provider_settings("gitea", "https://g.io")).is_err());
        assert!(f.create_provider(&provider_settings("github", "github.com")).is_err());
    }

    #[test]
    fn ai_factory_fills_default_endpoint() {
        let cfg = LlmAiFactory::model_config(&AiSettings {
            ai_type: "ollama".into(),
            model: "qwen2.5-coder:14b".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.endpoint, DEFAULT_OLLAMA_ENDPOINT);

        let err = LlmAiFactory.create_reviewer(&AiSettings {
            ai_type: "gemini".into(),
            model: "x".into(),
            ..Default::default()
        });
        assert!(err.is_err());
    }
}
