//! Webhook ingestion: provider payloads in, [`UnifiedWebhookEvent`]s out.
//!
//! Each provider implements [`WebhookAdapter`]. Besides conversion, an adapter
//! owns every provider round-trip the response pipeline needs (history
//! lookups, identity, write-back), resolving access tokens per instance via
//! the shared [`TokenStore`].

pub mod bitbucket;
pub mod github;
pub mod gitlab;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Serialize;

use crate::credentials::TokenStore;
use crate::errors::{GitContextEngineError, GitContextEngineResult};
use crate::unified::{
    BotIdentity, UnifiedComment, UnifiedCommit, UnifiedDiscussion, UnifiedMergeRequest,
    UnifiedRepository, UnifiedWebhookEvent,
};

pub use bitbucket::BitbucketWebhookAdapter;
pub use github::GitHubWebhookAdapter;
pub use gitlab::GitLabWebhookAdapter;

/// Which conversion a delivery should go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookKind {
    Comment,
    ReviewerChange,
    Unsupported,
}

#[async_trait]
pub trait WebhookAdapter: Send + Sync {
    /// Stable provider id (`gitlab`, `github`, `bitbucket`).
    fn provider_name(&self) -> &'static str;

    /// Header check first, then a structural probe of the body. Never fails.
    fn can_handle(&self, headers: &HeaderMap, body: &[u8]) -> bool;

    /// Canonical event type used for logs and diagnostics.
    fn event_type(&self, headers: &HeaderMap, body: &[u8]) -> String;

    fn classify(&self, headers: &HeaderMap, body: &[u8]) -> WebhookKind;

    fn convert_comment_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> GitContextEngineResult<UnifiedWebhookEvent>;

    fn convert_reviewer_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> GitContextEngineResult<UnifiedWebhookEvent>;

    async fn fetch_merge_request_commits(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedCommit>>;

    async fn fetch_merge_request_discussions(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedDiscussion>>;

    /// Notes outside threaded discussions. Providers that list every note
    /// inside a discussion may return overlapping entries; the timeline
    /// builder drops the duplicates.
    async fn fetch_merge_request_notes(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedComment>>;

    async fn fetch_discussion(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
        discussion_id: &str,
    ) -> GitContextEngineResult<UnifiedDiscussion>;

    /// Identity of the account owning the instance token. Never cached.
    async fn fetch_bot_identity(&self, repo: &UnifiedRepository) -> GitContextEngineResult<BotIdentity>;

    /// Replies in the comment's thread, or as a top-level note when the
    /// comment has none.
    async fn post_comment_reply(&self, event: &UnifiedWebhookEvent, body: &str) -> GitContextEngineResult<()>;

    async fn post_emoji_reaction(&self, event: &UnifiedWebhookEvent, emoji: &str) -> GitContextEngineResult<()>;

    /// Posts an overall review as a top-level merge request note.
    async fn post_full_review(&self, event: &UnifiedWebhookEvent, body: &str) -> GitContextEngineResult<()>;
}

/// Ordered set of adapters; the first one whose `can_handle` accepts a
/// delivery wins.
#[derive(Clone, Default)]
pub struct WebhookRegistry {
    adapters: Vec<Arc<dyn WebhookAdapter>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// GitLab, GitHub and Bitbucket adapters sharing one HTTP pool and token store.
    pub fn with_default_adapters(http: reqwest::Client, tokens: Arc<dyn TokenStore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GitLabWebhookAdapter::new(http.clone(), tokens.clone())));
        registry.register(Arc::new(GitHubWebhookAdapter::new(http.clone(), tokens.clone())));
        registry.register(Arc::new(BitbucketWebhookAdapter::new(http, tokens)));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn WebhookAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn detect(&self, headers: &HeaderMap, body: &[u8]) -> Option<Arc<dyn WebhookAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.can_handle(headers, body))
            .cloned()
    }

    pub fn by_name(&self, provider: &str) -> Option<Arc<dyn WebhookAdapter>> {
        let provider = provider.to_ascii_lowercase();
        self.adapters
            .iter()
            .find(|a| provider.starts_with(a.provider_name()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Header names whose values must never be recorded.
const SECRET_HEADERS: &[&str] = &["authorization", "x-gitlab-token", "cookie"];

/// Copies headers for diagnostics, dropping credentials and signatures.
pub fn sanitize_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !SECRET_HEADERS.contains(&name) && !name.starts_with("x-hub-signature")
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Parses a JSON body, mapping failures to a malformed-payload error.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(
    provider: &'static str,
    body: &[u8],
) -> GitContextEngineResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| crate::errors::GitContextEngineWebhookError::malformed(provider, e).into())
}

pub(crate) fn require_merge_request<'a>(
    event: &'a UnifiedWebhookEvent,
) -> GitContextEngineResult<&'a UnifiedMergeRequest> {
    event.merge_request.as_ref().ok_or_else(|| {
        GitContextEngineError::Validation("event carries no merge request".to_string())
    })
}

pub(crate) fn require_comment(event: &UnifiedWebhookEvent) -> GitContextEngineResult<&UnifiedComment> {
    event
        .comment()
        .ok_or_else(|| GitContextEngineError::Validation("event carries no comment".to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

    use crate::credentials::{StaticTokenStore, TokenEntry};
    use crate::git_providers::ProviderKind;

    pub fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    pub fn tokens() -> std::sync::Arc<StaticTokenStore> {
        std::sync::Arc::new(StaticTokenStore::new(vec![TokenEntry {
            provider: ProviderKind::GitLab,
            instance_url: "https://gitlab.example.com".into(),
            token: "t".into(),
        }]))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::headers;
    use super::*;

    #[test]
    fn sanitize_drops_secrets_and_signatures() {
        let h = headers(&[
            ("Authorization", "Bearer x"),
            ("X-Gitlab-Token", "secret"),
            ("X-Hub-Signature-256", "sha256=abc"),
            ("X-Gitlab-Event", "Note Hook"),
            ("Content-Type", "application/json"),
        ]);

        let clean = sanitize_headers(&h);

        assert_eq!(clean.len(), 2);
        assert_eq!(clean.get("x-gitlab-event").map(String::as_str), Some("Note Hook"));
        assert!(clean.keys().all(|k| !k.contains("token") && !k.contains("signature")));
    }

    #[test]
    fn registry_detects_by_headers() {
        let registry = WebhookRegistry::with_default_adapters(
            reqwest::Client::new(),
            super::test_support::tokens(),
        );
        assert_eq!(registry.len(), 3);

        let gh = headers(&[("X-GitHub-Event", "issue_comment")]);
        assert_eq!(registry.detect(&gh, b"{}").map(|a| a.provider_name()), Some("github"));

        let bb = headers(&[("X-Event-Key", "pullrequest:comment_created")]);
        assert_eq!(registry.detect(&bb, b"{}").map(|a| a.provider_name()), Some("bitbucket"));

        assert!(registry.detect(&HeaderMap::new(), b"not json").is_none());
        assert_eq!(
            registry.by_name("gitlab-self-hosted").map(|a| a.provider_name()),
            Some("gitlab")
        );
    }
}
