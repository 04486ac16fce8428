use std::sync::Arc;

use ai_llm_service::{
    LlmModelConfig, LlmService, config::default_config::config_from_env, error_handler::must_env,
};
use git_context_engine::{
    credentials::TokenStore, git_providers::build_http_client, webhooks::WebhookRegistry,
};
use mr_reviewer::{
    AiSettings, DefaultProviderFactory, LlmAiFactory, Responder, ReviewConfig, ReviewService,
};
use tracing::info;

use crate::{
    core::{credentials::token_store_from_env, diagnostics::WebhookDiagnostics},
    error_handler::{AppError, AppResult},
};

/// Shared state for all HTTP handlers.
pub struct AppState {
    /// Listen address, e.g. `0.0.0.0:8080`.
    pub api_address: String,
    /// Shared secret protecting the manual review trigger.
    pub trigger_secret: String,
    pub tokens: Arc<dyn TokenStore>,
    pub registry: WebhookRegistry,
    pub reviews: Arc<ReviewService>,
    pub responder: Arc<Responder>,
    /// AI backend used when a trigger request does not name one.
    pub default_ai: AiSettings,
    pub diagnostics: WebhookDiagnostics,
}

impl AppState {
    /// Load shared state from environment variables.
    pub fn from_env() -> AppResult<Self> {
        let api_address = must_env("API_ADDRESS").map_err(|_| AppError::MissingEnv("API_ADDRESS"))?;
        let trigger_secret = std::env::var("TRIGGER_SECRET").unwrap_or_default();

        let http = build_http_client()?;
        let tokens: Arc<dyn TokenStore> = Arc::new(token_store_from_env()?);

        let llm_cfg = config_from_env()?;
        let default_ai = ai_settings(&llm_cfg);
        let generator = Arc::new(LlmService::from_config(llm_cfg)?);

        let review_cfg = ReviewConfig::from_env()?;
        info!(
            timeout_secs = review_cfg.timeout.as_secs(),
            max_batch_tokens = review_cfg.max_batch_tokens,
            max_retries = review_cfg.max_retries,
            ai = %default_ai.ai_type,
            model = %default_ai.model,
            "review service configured"
        );
        let reviews = Arc::new(ReviewService::new(
            Arc::new(DefaultProviderFactory::new(http.clone())),
            Arc::new(LlmAiFactory),
            review_cfg,
        ));

        let responder = Arc::new(Responder::new(
            generator,
            reviews.clone(),
            tokens.clone(),
            default_ai.clone(),
        ));

        Ok(Self {
            api_address,
            trigger_secret,
            registry: WebhookRegistry::with_default_adapters(http, tokens.clone()),
            tokens,
            reviews,
            responder,
            default_ai,
            diagnostics: WebhookDiagnostics::default(),
        })
    }
}

fn ai_settings(cfg: &LlmModelConfig) -> AiSettings {
    AiSettings {
        ai_type: cfg.provider.as_str().to_string(),
        api_key: cfg.api_key.clone(),
        model: cfg.model.clone(),
        temperature: cfg.temperature,
        endpoint: Some(cfg.endpoint.clone()),
        max_tokens: cfg.max_tokens,
    }
}

#[cfg(test)]
impl AppState {
    /// State over local-only clients; nothing is contacted until a handler
    /// actually processes an event.
    pub fn for_tests(registry: WebhookRegistry, trigger_secret: &str) -> Self {
        use ai_llm_service::LlmProvider;
        use git_context_engine::credentials::StaticTokenStore;

        let llm_cfg = LlmModelConfig {
            provider: LlmProvider::Ollama,
            model: "test-model".into(),
            endpoint: "http://localhost:11434".into(),
            api_key: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            timeout_secs: Some(5),
        };
        let default_ai = ai_settings(&llm_cfg);
        let generator = Arc::new(LlmService::from_config(llm_cfg).expect("valid test config"));
        let tokens: Arc<dyn TokenStore> = Arc::new(StaticTokenStore::default());
        let reviews = Arc::new(ReviewService::new(
            Arc::new(DefaultProviderFactory::new(build_http_client().expect("http client"))),
            Arc::new(LlmAiFactory),
            ReviewConfig::default(),
        ));
        let responder = Arc::new(Responder::new(generator, reviews.clone(), tokens.clone(), default_ai.clone()));

        Self {
            api_address: "127.0.0.1:0".into(),
            trigger_secret: trigger_secret.into(),
            tokens,
            registry,
            reviews,
            responder,
            default_ai,
            diagnostics: WebhookDiagnostics::default(),
        }
    }
}
