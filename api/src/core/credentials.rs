//! Provider credential table loaded from the environment.
//!
//! One entry per provider whose `*_TOKEN` variable is set:
//! - `GITLAB_BASE_URL` / `GITLAB_TOKEN`       (default base `https://gitlab.com`)
//! - `GITHUB_BASE_URL` / `GITHUB_TOKEN`       (default base `https://github.com`)
//! - `BITBUCKET_BASE_URL` / `BITBUCKET_TOKEN` (default base `https://bitbucket.org`)

use ai_llm_service::error_handler::validate_http_endpoint;
use git_context_engine::{
    credentials::{StaticTokenStore, TokenEntry, normalize_instance_url},
    git_providers::ProviderKind,
};
use tracing::{info, warn};

use crate::error_handler::AppResult;

struct ProviderVars {
    kind: ProviderKind,
    base_var: &'static str,
    token_var: &'static str,
    default_base: &'static str,
}

const PROVIDERS: &[ProviderVars] = &[
    ProviderVars {
        kind: ProviderKind::GitLab,
        base_var: "GITLAB_BASE_URL",
        token_var: "GITLAB_TOKEN",
        default_base: "https://gitlab.com",
    },
    ProviderVars {
        kind: ProviderKind::GitHub,
        base_var: "GITHUB_BASE_URL",
        token_var: "GITHUB_TOKEN",
        default_base: "https://github.com",
    },
    ProviderVars {
        kind: ProviderKind::Bitbucket,
        base_var: "BITBUCKET_BASE_URL",
        token_var: "BITBUCKET_TOKEN",
        default_base: "https://bitbucket.org",
    },
];

/// Builds the token store from process environment.
pub fn token_store_from_env() -> AppResult<StaticTokenStore> {
    token_store_from(|name| std::env::var(name).ok())
}

/// Same as [`token_store_from_env`] over an arbitrary variable lookup.
pub fn token_store_from(lookup: impl Fn(&str) -> Option<String>) -> AppResult<StaticTokenStore> {
    let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let mut entries = Vec::new();

    for p in PROVIDERS {
        let Some(token) = var(p.token_var) else {
            continue;
        };
        let base = var(p.base_var).unwrap_or_else(|| p.default_base.to_string());
        validate_http_endpoint(p.base_var, &base)?;

        info!(provider = p.kind.as_str(), instance = %base, "provider credentials configured");
        entries.push(TokenEntry {
            provider: p.kind,
            instance_url: normalize_instance_url(&base).to_string(),
            token,
        });
    }

    if entries.is_empty() {
        warn!("no provider tokens configured, webhook replies and reviews will fail");
    }
    Ok(StaticTokenStore::new(entries))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use git_context_engine::credentials::TokenStore;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[tokio::test]
    async fn only_providers_with_tokens_are_registered() {
        let store = token_store_from(lookup(&[
            ("GITLAB_BASE_URL", "https://git.acme.io/"),
            ("GITLAB_TOKEN", "glpat-1"),
            ("GITHUB_TOKEN", "  "),
            ("BITBUCKET_TOKEN", "bb-1"),
        ]))
        .unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(
            store
                .lookup_token(ProviderKind::GitLab, "https://git.acme.io")
                .await
                .unwrap(),
            "glpat-1"
        );
        assert_eq!(
            store
                .lookup_token(ProviderKind::Bitbucket, "https://bitbucket.org/")
                .await
                .unwrap(),
            "bb-1"
        );
        assert!(
            store
                .lookup_token(ProviderKind::GitHub, "https://github.com")
                .await
                .is_err()
        );
    }

    #[test]
    fn base_url_must_be_http() {
        let res = token_store_from(lookup(&[
            ("GITLAB_BASE_URL", "git.acme.io"),
            ("GITLAB_TOKEN", "glpat-1"),
        ]));
        assert!(res.is_err());
    }
}
