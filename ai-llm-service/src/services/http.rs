//! HTTP plumbing shared by the backends: client construction with endpoint
//! checks, and one JSON round-trip with status and decode error mapping.

use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error};

use crate::{
    config::{llm_model_config::LlmModelConfig, llm_provider::LlmProvider},
    error_handler::{AiLlmError, HttpError, ProviderError, ProviderErrorKind, make_snippet},
};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Checks that `cfg` targets `expected` and has an http(s) endpoint, then
/// returns the endpoint without trailing slashes.
pub(crate) fn checked_base(cfg: &LlmModelConfig, expected: LlmProvider) -> Result<String, AiLlmError> {
    if cfg.provider != expected {
        return Err(ProviderError::new(expected, ProviderErrorKind::InvalidProvider).into());
    }

    let endpoint = cfg.endpoint.trim();
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(ProviderError::new(
            expected,
            ProviderErrorKind::InvalidEndpoint(cfg.endpoint.clone()),
        )
        .into());
    }
    Ok(endpoint.trim_end_matches('/').to_string())
}

pub(crate) fn timeout_of(cfg: &LlmModelConfig) -> Duration {
    cfg.timeout_secs.map(Duration::from_secs).unwrap_or(DEFAULT_TIMEOUT)
}

pub(crate) fn build_client(cfg: &LlmModelConfig, headers: HeaderMap) -> Result<reqwest::Client, AiLlmError> {
    Ok(reqwest::Client::builder()
        .timeout(timeout_of(cfg))
        .default_headers(headers)
        .gzip(true)
        .brotli(true)
        .build()?)
}

/// POSTs `body` as JSON and decodes the success body into `R`.
///
/// Non-2xx answers become [`ProviderErrorKind::HttpStatus`] carrying a short
/// body snippet; undecodable bodies become [`ProviderErrorKind::Decode`] with
/// `expected` describing the awaited shape.
pub(crate) async fn post_json<B, R>(
    client: &reqwest::Client,
    provider: LlmProvider,
    url: &str,
    body: &B,
    expected: &'static str,
) -> Result<R, AiLlmError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let started = Instant::now();
    debug!(%provider, url, "POST");

    let resp = client.post(url).json(body).send().await?;
    let status = resp.status();

    if !status.is_success() {
        let snippet = make_snippet(&resp.text().await.unwrap_or_default());
        error!(
            %provider,
            %status,
            url,
            %snippet,
            latency_ms = started.elapsed().as_millis() as u64,
            "backend returned non-success status"
        );
        return Err(ProviderError::new(
            provider,
            ProviderErrorKind::HttpStatus(HttpError {
                status,
                url: url.to_string(),
                snippet,
            }),
        )
        .into());
    }

    resp.json::<R>().await.map_err(|e| {
        error!(
            %provider,
            url,
            error = %e,
            latency_ms = started.elapsed().as_millis() as u64,
            "backend response could not be decoded"
        );
        ProviderError::new(provider, ProviderErrorKind::Decode(format!("{e}; expected {expected}"))).into()
    })
}
