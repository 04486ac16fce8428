//! Default LLM configs loaded strictly from environment variables.
//!
//! # Environment variables
//!
//! Common:
//! - `LLM_KIND`        = provider kind (`ollama` or `openai`), default `ollama`
//! - `LLM_MAX_TOKENS`  = optional max tokens (u32)
//! - `LLM_TEMPERATURE` = optional sampling temperature (f32, `0.0..=2.0`)
//! - `LLM_TIMEOUT_SECS`= optional per-request timeout (u32)
//!
//! Ollama-specific:
//! - `OLLAMA_URL` or `OLLAMA_PORT` = endpoint (mandatory)
//! - `OLLAMA_MODEL`                = model (mandatory)
//!
//! OpenAI-specific:
//! - `OPENAI_API_KEY` = API key (mandatory)
//! - `OPENAI_MODEL`   = model (mandatory)
//! - `OPENAI_URL`     = endpoint, default `https://api.openai.com`

use crate::{
    config::{llm_model_config::LlmModelConfig, llm_provider::LlmProvider},
    error_handler::{
        AiLlmError, ConfigError, env_opt_u32, must_env, validate_http_endpoint, validate_range_f32,
    },
};

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Resolves the Ollama endpoint strictly from environment.
///
/// Precedence:
/// 1. `OLLAMA_URL` if present and non-empty
/// 2. `OLLAMA_PORT` → `http://localhost:{port}`
fn ollama_endpoint() -> Result<String, AiLlmError> {
    if let Ok(url) = std::env::var("OLLAMA_URL") {
        if !url.trim().is_empty() {
            validate_http_endpoint("OLLAMA_URL", url.trim())?;
            return Ok(url);
        }
    }
    if let Ok(port) = std::env::var("OLLAMA_PORT") {
        if !port.trim().is_empty() {
            let _ = port
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: "OLLAMA_PORT",
                    reason: "expected u16 (1..=65535)",
                })?;
            return Ok(format!("http://localhost:{}", port.trim()));
        }
    }
    Err(AiLlmError::Config(ConfigError::MissingVar(
        "OLLAMA_URL or OLLAMA_PORT",
    )))
}

fn env_temperature() -> Result<f32, AiLlmError> {
    match std::env::var("LLM_TEMPERATURE") {
        Ok(v) if !v.trim().is_empty() => {
            let t = v.trim().parse::<f32>().map_err(|_| ConfigError::InvalidNumber {
                var: "LLM_TEMPERATURE",
                reason: "expected f32",
            })?;
            validate_range_f32("temperature", t, 0.0, 2.0)?;
            Ok(t)
        }
        _ => Ok(DEFAULT_TEMPERATURE),
    }
}

fn env_timeout_secs() -> Result<u64, AiLlmError> {
    Ok(env_opt_u32("LLM_TIMEOUT_SECS")?
        .map(u64::from)
        .unwrap_or(DEFAULT_TIMEOUT_SECS))
}

/// Config for the Ollama backend.
///
/// # Env
/// - `OLLAMA_URL`/`OLLAMA_PORT`, `OLLAMA_MODEL` (required)
/// - `LLM_MAX_TOKENS`, `LLM_TEMPERATURE`, `LLM_TIMEOUT_SECS` (optional)
pub fn config_ollama() -> Result<LlmModelConfig, AiLlmError> {
    let endpoint = ollama_endpoint()?;
    let model = must_env("OLLAMA_MODEL")?;

    Ok(LlmModelConfig {
        provider: LlmProvider::Ollama,
        model,
        endpoint,
        api_key: None,
        max_tokens: env_opt_u32("LLM_MAX_TOKENS")?,
        temperature: Some(env_temperature()?),
        top_p: None,
        timeout_secs: Some(env_timeout_secs()?),
    })
}

/// Config for the OpenAI backend.
///
/// # Env
/// - `OPENAI_API_KEY`, `OPENAI_MODEL` (required)
/// - `OPENAI_URL`, `LLM_MAX_TOKENS`, `LLM_TEMPERATURE`, `LLM_TIMEOUT_SECS` (optional)
pub fn config_openai() -> Result<LlmModelConfig, AiLlmError> {
    let api_key = must_env("OPENAI_API_KEY")?;
    let model = must_env("OPENAI_MODEL")?;
    let endpoint = std::env::var("OPENAI_URL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
    validate_http_endpoint("OPENAI_URL", endpoint.trim())?;

    Ok(LlmModelConfig {
        provider: LlmProvider::OpenAI,
        model,
        endpoint,
        api_key: Some(api_key),
        max_tokens: env_opt_u32("LLM_MAX_TOKENS")?,
        temperature: Some(env_temperature()?),
        top_p: None,
        timeout_secs: Some(env_timeout_secs()?),
    })
}

/// Config for the provider selected by `LLM_KIND` (default `ollama`).
pub fn config_from_env() -> Result<LlmModelConfig, AiLlmError> {
    let kind = std::env::var("LLM_KIND")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| LlmProvider::Ollama.as_str().to_string());

    match kind.parse::<LlmProvider>()? {
        LlmProvider::Ollama => config_ollama(),
        LlmProvider::OpenAI => config_openai(),
    }
}
