//! Ollama backend: `POST {endpoint}/api/generate` with `stream = false`.

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    config::{llm_model_config::LlmModelConfig, llm_provider::LlmProvider},
    error_handler::AiLlmError,
    services::http::{build_client, checked_base, post_json, timeout_of},
};

#[derive(Debug)]
pub struct OllamaService {
    client: reqwest::Client,
    cfg: LlmModelConfig,
    url_generate: String,
}

impl OllamaService {
    /// Fails when `cfg` targets another backend or has no http(s) endpoint.
    pub fn new(cfg: LlmModelConfig) -> Result<Self, AiLlmError> {
        let base = checked_base(&cfg, LlmProvider::Ollama)?;
        let client = build_client(&cfg, HeaderMap::new())?;

        info!(
            model = %cfg.model,
            endpoint = %base,
            timeout_secs = timeout_of(&cfg).as_secs(),
            "Ollama backend ready"
        );

        Ok(Self {
            client,
            url_generate: format!("{base}/api/generate"),
            cfg,
        })
    }

    pub fn config(&self) -> &LlmModelConfig {
        &self.cfg
    }

    /// One completion. `max_tokens` maps to Ollama's `num_predict`.
    #[instrument(skip_all, fields(model = %self.cfg.model, prompt_len = prompt.len()))]
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, AiLlmError> {
        let body = GenerateRequest::from_cfg(&self.cfg, prompt, system);
        let out: GenerateResponse = post_json(
            &self.client,
            LlmProvider::Ollama,
            &self.url_generate,
            &body,
            "`response` string (stream=false)",
        )
        .await?;

        info!(response_len = out.response.len(), "Ollama generation done");
        Ok(out.response)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

impl<'a> GenerateRequest<'a> {
    fn from_cfg(cfg: &'a LlmModelConfig, prompt: &'a str, system: Option<&'a str>) -> Self {
        Self {
            model: &cfg.model,
            prompt,
            system,
            stream: false,
            options: GenerateOptions {
                temperature: cfg.temperature,
                top_p: cfg.top_p,
                num_predict: cfg.max_tokens,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handler::{ProviderError, ProviderErrorKind};

    fn cfg() -> LlmModelConfig {
        LlmModelConfig {
            provider: LlmProvider::Ollama,
            model: "qwen2.5-coder:14b".into(),
            endpoint: "http://localhost:11434/".into(),
            api_key: None,
            max_tokens: Some(512),
            temperature: Some(0.2),
            top_p: None,
            timeout_secs: Some(5),
        }
    }

    #[test]
    fn rejects_foreign_provider() {
        let mut c = cfg();
        c.provider = LlmProvider::OpenAI;
        assert!(matches!(
            OllamaService::new(c),
            Err(AiLlmError::Provider(ProviderError {
                kind: ProviderErrorKind::InvalidProvider,
                ..
            }))
        ));
    }

    #[test]
    fn request_maps_review_settings() {
        let c = cfg();
        let json = serde_json::to_value(GenerateRequest::from_cfg(&c, "diff", Some("be terse"))).unwrap();
        assert_eq!(json["system"], "be terse");
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 512);
        assert!(json["options"].get("top_p").is_none());

        let json = serde_json::to_value(GenerateRequest::from_cfg(&c, "diff", None)).unwrap();
        assert!(json.get("system").is_none());
    }

    #[test]
    fn generate_url_has_no_double_slash() {
        let svc = OllamaService::new(cfg()).unwrap();
        assert_eq!(svc.url_generate, "http://localhost:11434/api/generate");
    }
}
