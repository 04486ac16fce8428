use std::fmt;
use std::time::Duration;

use git_context_engine::git_providers::ReviewComment;
use serde::{Deserialize, Serialize};

/// Git provider connection used for one review.
#[derive(Clone, Deserialize)]
pub struct ProviderSettings {
    /// `gitlab`, `github`, `bitbucket` (prefix match, e.g. `gitlab-self-hosted`).
    pub provider_type: String,
    /// Instance URL such as `https://gitlab.example.com`.
    pub base_url: String,
    pub token: String,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("provider_type", &self.provider_type)
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .finish()
    }
}

/// Model backend used for one review.
#[derive(Clone, Default, Deserialize)]
pub struct AiSettings {
    /// `ollama` or `openai`.
    pub ai_type: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Backend URL; the backend default when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl fmt::Debug for AiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiSettings")
            .field("ai_type", &self.ai_type)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("endpoint", &self.endpoint)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub review_id: String,
    /// Canonical merge request / pull request web URL.
    pub url: String,
    pub provider: ProviderSettings,
    pub ai: AiSettings,
    /// Overrides the service-wide deadline.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewResult {
    pub review_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub summary: String,
    pub comments: Vec<ReviewComment>,
    pub comments_count: usize,
    pub duration_ms: u128,
}

impl ReviewResult {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms.min(u64::MAX as u128) as u64)
    }
}

/// What the model produced for one batch, or the aggregate of all batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutput {
    pub summary: String,
    pub comments: Vec<ReviewComment>,
}
