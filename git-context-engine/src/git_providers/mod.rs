//! Provider facade.
//!
//! `ProviderClient` wraps the concrete REST client of each Git provider behind
//! enum dispatch. The review pipeline depends on the [`ReviewProvider`] trait
//! instead, so tests can substitute an in-memory provider.

pub mod types;
pub use types::*;

pub mod bitbucket;
pub mod github;
pub mod gitlab;

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::GitContextEngineResult;

const USER_AGENT: &str = "mr-review-backend/0.1";

/// Upper bound for one provider request, body included.
pub const PROVIDER_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const PROVIDER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration for any provider client.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// API base, e.g. "https://gitlab.com/api/v4" or "https://api.github.com".
    pub base_api: String,
    /// Access token for the provider (PAT or app token).
    pub token: String,
}

impl ProviderConfig {
    /// Builds a config from an instance URL (`https://gitlab.example.com`)
    /// rather than an API base.
    pub fn for_instance(kind: ProviderKind, instance_url: &str, token: impl Into<String>) -> Self {
        Self {
            kind,
            base_api: api_base_for(kind, instance_url),
            token: token.into(),
        }
    }
}

/// REST API root for a provider instance. Values that already point at an
/// API root are returned unchanged.
pub fn api_base_for(kind: ProviderKind, instance_url: &str) -> String {
    let base = instance_url.trim().trim_end_matches('/');
    match kind {
        ProviderKind::GitLab if base.ends_with("/api/v4") => base.to_string(),
        ProviderKind::GitLab => format!("{base}/api/v4"),
        ProviderKind::GitHub
            if base.is_empty() || base.ends_with("://github.com") || base.ends_with("://www.github.com") =>
        {
            "https://api.github.com".to_string()
        }
        ProviderKind::GitHub if base.contains("api.github.com") || base.ends_with("/api/v3") => {
            base.to_string()
        }
        ProviderKind::GitHub => format!("{base}/api/v3"),
        ProviderKind::Bitbucket if base.ends_with("/2.0") => base.to_string(),
        ProviderKind::Bitbucket => "https://api.bitbucket.org/2.0".to_string(),
    }
}

/// Operations the review orchestration needs from a Git provider.
#[async_trait]
pub trait ReviewProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Resolves a canonical MR/PR web URL into the provider's composite id.
    fn parse_change_request_url(&self, url: &str) -> GitContextEngineResult<ChangeRequestId>;

    async fn merge_request_details(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeRequest>;

    async fn merge_request_changes(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeSet>;

    async fn post_comment(
        &self,
        meta: &ChangeRequest,
        comment: &ReviewComment,
    ) -> GitContextEngineResult<()>;

    /// Posts comments in order, stopping at the first failure.
    async fn post_comments(
        &self,
        meta: &ChangeRequest,
        comments: &[ReviewComment],
    ) -> GitContextEngineResult<()> {
        for comment in comments {
            self.post_comment(meta, comment).await?;
        }
        Ok(())
    }
}

/// Concrete provider client with enum dispatch.
#[derive(Debug, Clone)]
pub enum ProviderClient {
    GitLab(gitlab::GitLabClient),
    GitHub(github::GitHubClient),
    Bitbucket(bitbucket::BitbucketClient),
}

impl ProviderClient {
    /// Constructs a concrete provider client from generic configuration.
    pub fn from_config(cfg: ProviderConfig) -> GitContextEngineResult<Self> {
        let client = build_http_client()?;
        Ok(Self::with_http(client, cfg))
    }

    /// Same as [`ProviderClient::from_config`] but reuses an existing
    /// connection pool.
    pub fn with_http(http: reqwest::Client, cfg: ProviderConfig) -> Self {
        debug!(
            "Initializing provider client: kind={:?}, base_api={}",
            cfg.kind, cfg.base_api
        );

        match cfg.kind {
            ProviderKind::GitLab => {
                ProviderClient::GitLab(gitlab::GitLabClient::new(http, cfg.base_api, cfg.token))
            }
            ProviderKind::GitHub => {
                ProviderClient::GitHub(github::GitHubClient::new(http, cfg.base_api, cfg.token))
            }
            ProviderKind::Bitbucket => ProviderClient::Bitbucket(bitbucket::BitbucketClient::new(
                http,
                cfg.base_api,
                cfg.token,
            )),
        }
    }
}

/// Shared HTTP client with a stable user agent so that providers can
/// identify the integration.
pub fn build_http_client() -> GitContextEngineResult<reqwest::Client> {
    build_http_client_with_timeout(PROVIDER_REQUEST_TIMEOUT)
}

pub fn build_http_client_with_timeout(timeout: Duration) -> GitContextEngineResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(PROVIDER_CONNECT_TIMEOUT.min(timeout))
        .timeout(timeout)
        .build()?)
}

#[async_trait]
impl ReviewProvider for ProviderClient {
    fn kind(&self) -> ProviderKind {
        match self {
            Self::GitLab(_) => ProviderKind::GitLab,
            Self::GitHub(_) => ProviderKind::GitHub,
            Self::Bitbucket(_) => ProviderKind::Bitbucket,
        }
    }

    fn parse_change_request_url(&self, url: &str) -> GitContextEngineResult<ChangeRequestId> {
        match self {
            Self::GitLab(_) => gitlab::parse_merge_request_url(url),
            Self::GitHub(_) => github::parse_pull_request_url(url),
            Self::Bitbucket(_) => bitbucket::parse_pull_request_url(url),
        }
    }

    async fn merge_request_details(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeRequest> {
        debug!("Fetching change request: project={}, iid={}", id.project, id.iid);
        match self {
            Self::GitLab(c) => c.get_meta(id).await,
            Self::GitHub(c) => c.get_meta(id).await,
            Self::Bitbucket(c) => c.get_meta(id).await,
        }
    }

    async fn merge_request_changes(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeSet> {
        debug!("Fetching changes: project={}, iid={}", id.project, id.iid);
        match self {
            Self::GitLab(c) => c.get_changeset(id).await,
            Self::GitHub(c) => c.get_changeset(id).await,
            Self::Bitbucket(c) => c.get_changeset(id).await,
        }
    }

    async fn post_comment(
        &self,
        meta: &ChangeRequest,
        comment: &ReviewComment,
    ) -> GitContextEngineResult<()> {
        match self {
            Self::GitLab(c) => c.post_comment(meta, comment).await,
            Self::GitHub(c) => c.post_comment(meta, comment).await,
            Self::Bitbucket(c) => c.post_comment(meta, comment).await,
        }
    }
}
