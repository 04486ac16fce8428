//! OpenAI backend: non-streaming `POST {endpoint}/v1/chat/completions`.
//!
//! The system instruction goes first as a `system` message, the prompt as a
//! single `user` message. The first choice carrying content wins.

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    config::{llm_model_config::LlmModelConfig, llm_provider::LlmProvider},
    error_handler::{AiLlmError, ProviderError, ProviderErrorKind},
    services::http::{build_client, checked_base, post_json, timeout_of},
};

#[derive(Debug)]
pub struct OpenAiService {
    client: reqwest::Client,
    cfg: LlmModelConfig,
    url_chat: String,
}

impl OpenAiService {
    /// Requires an OpenAI config with an API key and an http(s) endpoint.
    pub fn new(cfg: LlmModelConfig) -> Result<Self, AiLlmError> {
        let base = checked_base(&cfg, LlmProvider::OpenAI)?;
        let key = cfg
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::new(LlmProvider::OpenAI, ProviderErrorKind::MissingApiKey))?;

        let mut auth = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
            ProviderError::new(
                LlmProvider::OpenAI,
                ProviderErrorKind::Decode(format!("API key is not a valid header value: {e}")),
            )
        })?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = build_client(&cfg, headers)?;

        info!(
            model = %cfg.model,
            endpoint = %base,
            timeout_secs = timeout_of(&cfg).as_secs(),
            "OpenAI backend ready"
        );

        Ok(Self {
            client,
            url_chat: format!("{base}/v1/chat/completions"),
            cfg,
        })
    }

    pub fn config(&self) -> &LlmModelConfig {
        &self.cfg
    }

    #[instrument(skip_all, fields(model = %self.cfg.model, prompt_len = prompt.len()))]
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, AiLlmError> {
        let body = ChatRequest::from_cfg(&self.cfg, prompt, system);
        let out: ChatResponse = post_json(
            &self.client,
            LlmProvider::OpenAI,
            &self.url_chat,
            &body,
            "`choices[].message.content`",
        )
        .await?;

        let content = out
            .first_content()
            .ok_or_else(|| ProviderError::new(LlmProvider::OpenAI, ProviderErrorKind::EmptyChoices))?;

        info!(response_len = content.len(), "OpenAI chat completion done");
        Ok(content)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

impl<'a> ChatRequest<'a> {
    fn from_cfg(cfg: &'a LlmModelConfig, prompt: &'a str, system: Option<&'a str>) -> Self {
        let messages = system
            .map(|content| ChatMessage { role: "system", content })
            .into_iter()
            .chain(std::iter::once(ChatMessage { role: "user", content: prompt }))
            .collect();

        Self {
            model: &cfg.model,
            messages,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            max_tokens: cfg.max_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

impl ChatResponse {
    fn first_content(self) -> Option<String> {
        self.choices
            .into_iter()
            .find_map(|c| c.message.content.filter(|s| !s.trim().is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}
