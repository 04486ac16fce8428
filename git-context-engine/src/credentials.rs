//! Access-token lookup per provider instance.
//!
//! The pipeline only needs `(provider, instance url) -> token`. Storage lives
//! elsewhere; [`StaticTokenStore`] serves tokens loaded from configuration.

use async_trait::async_trait;
use tracing::debug;

use crate::errors::{GitContextEngineConfigError, GitContextEngineResult};
use crate::git_providers::ProviderKind;

/// Resolves the access token used against a provider instance.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Returns the token for `instance_url`, or
    /// [`GitContextEngineConfigError::MissingToken`] when none is registered.
    async fn lookup_token(
        &self,
        provider: ProviderKind,
        instance_url: &str,
    ) -> GitContextEngineResult<String>;
}

#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub provider: ProviderKind,
    /// Scheme + host, e.g. `https://gitlab.example.com`.
    pub instance_url: String,
    pub token: String,
}

/// In-memory token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenStore {
    entries: Vec<TokenEntry>,
}

impl StaticTokenStore {
    pub fn new(entries: Vec<TokenEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl TokenStore for StaticTokenStore {
    async fn lookup_token(
        &self,
        provider: ProviderKind,
        instance_url: &str,
    ) -> GitContextEngineResult<String> {
        let wanted = normalize_instance_url(instance_url);

        // Exact match first, then trailing-slash tolerant match.
        let found = self
            .entries
            .iter()
            .find(|e| e.provider == provider && e.instance_url == instance_url)
            .or_else(|| {
                self.entries.iter().find(|e| {
                    e.provider == provider && normalize_instance_url(&e.instance_url) == wanted
                })
            });

        match found {
            Some(entry) => {
                debug!(?provider, instance = %wanted, "access token resolved");
                Ok(entry.token.clone())
            }
            None => Err(GitContextEngineConfigError::MissingToken {
                provider,
                instance_url: instance_url.to_string(),
            }
            .into()),
        }
    }
}

/// Trims whitespace and trailing slashes for comparison.
pub fn normalize_instance_url(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

/// Extracts `scheme://host` from a project or merge request web URL.
///
/// Non-http inputs are returned unchanged.
pub fn extract_instance_url(web_url: &str) -> String {
    let web_url = web_url.trim();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = web_url.strip_prefix(scheme) {
            let host = rest.split('/').next().unwrap_or_default();
            return format!("{scheme}{host}");
        }
    }
    web_url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GitContextEngineError;

    fn store() -> StaticTokenStore {
        StaticTokenStore::new(vec![
            TokenEntry {
                provider: ProviderKind::GitLab,
                instance_url: "https://gitlab.example.com/".into(),
                token: "glpat-1".into(),
            },
            TokenEntry {
                provider: ProviderKind::GitHub,
                instance_url: "https://github.com".into(),
                token: "ghp-1".into(),
            },
        ])
    }

    #[tokio::test]
    async fn matches_with_or_without_trailing_slash() {
        let s = store();
        assert_eq!(
            s.lookup_token(ProviderKind::GitLab, "https://gitlab.example.com")
                .await
                .unwrap(),
            "glpat-1"
        );
        assert_eq!(
            s.lookup_token(ProviderKind::GitHub, "https://github.com/")
                .await
                .unwrap(),
            "ghp-1"
        );
    }

    #[tokio::test]
    async fn missing_token_is_a_config_error() {
        let err = store()
            .lookup_token(ProviderKind::GitLab, "https://other.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, GitContextEngineError::Config(_)));
    }

    #[test]
    fn instance_url_is_scheme_and_host() {
        assert_eq!(
            extract_instance_url("https://gitlab.example.com/group/sub/project"),
            "https://gitlab.example.com"
        );
        assert_eq!(extract_instance_url("http://localhost:8080/a/b"), "http://localhost:8080");
        assert_eq!(extract_instance_url("gitlab.local"), "gitlab.local");
    }
}
