//! Bitbucket Cloud webhook adapter (`pullrequest:*` event keys).

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use crate::credentials::{TokenStore, extract_instance_url};
use crate::errors::{GitContextEngineResult, GitContextEngineWebhookError};
use crate::git_providers::bitbucket::{
    BitbucketClient, BitbucketComment, BitbucketLinks, BitbucketUser,
};
use crate::git_providers::{ProviderKind, api_base_for};
use crate::unified::{
    BotIdentity, EventPayload, UnifiedComment, UnifiedCommit, UnifiedDiscussion,
    UnifiedMergeRequest, UnifiedRepository, UnifiedReviewerChange, UnifiedUser,
    UnifiedWebhookEvent,
};

use super::{WebhookAdapter, WebhookKind, header_str, parse_body, require_comment, require_merge_request};

const PROVIDER: &str = "bitbucket";

const BITBUCKET_EVENT_KEYS: &[&str] = &[
    "pullrequest:comment_created",
    "pullrequest:comment_updated",
    "pullrequest:approved",
    "pullrequest:unapproved",
    "pullrequest:rejected",
    "pullrequest:created",
    "pullrequest:updated",
    "pullrequest:fulfilled",
    "repo:push",
    "repo:commit_comment_created",
];

/// `pullrequest:comment_created` -> `pullrequest_comment_created`.
pub fn canonical_event_type(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "unknown".to_string();
    }
    raw.to_lowercase().replace([':', '-', ' '], "_")
}

#[derive(Clone)]
pub struct BitbucketWebhookAdapter {
    http: reqwest::Client,
    tokens: Arc<dyn TokenStore>,
}

impl BitbucketWebhookAdapter {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenStore>) -> Self {
        Self { http, tokens }
    }

    async fn client_for(&self, repo: &UnifiedRepository) -> GitContextEngineResult<BitbucketClient> {
        let instance = extract_instance_url(&repo.web_url);
        let token = self.tokens.lookup_token(ProviderKind::Bitbucket, &instance).await?;
        Ok(BitbucketClient::new(
            self.http.clone(),
            api_base_for(ProviderKind::Bitbucket, &instance),
            token,
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
struct Probe {
    #[serde(default)]
    comment: Option<serde_json::Value>,
    #[serde(default)]
    pullrequest: Option<serde_json::Value>,
    #[serde(default)]
    changes: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketRepository {
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    owner: BitbucketUser,
    #[serde(default)]
    links: Option<BitbucketLinks>,
}

fn html_href(links: &Option<BitbucketLinks>) -> String {
    links
        .as_ref()
        .and_then(|l| l.html.as_ref())
        .map(|h| h.href.clone())
        .unwrap_or_default()
}

impl BitbucketRepository {
    fn to_unified(&self) -> UnifiedRepository {
        UnifiedRepository {
            id: self.uuid.clone(),
            name: self.name.clone(),
            full_name: self.full_name.clone(),
            owner: self.owner.to_unified(),
            web_url: html_href(&self.links),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketBranchSide {
    #[serde(default)]
    branch: BitbucketBranchName,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketBranchName {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketPullRequest {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    source: BitbucketBranchSide,
    #[serde(default)]
    destination: BitbucketBranchSide,
    #[serde(default)]
    author: BitbucketUser,
    #[serde(default)]
    reviewers: Vec<BitbucketUser>,
    #[serde(default)]
    links: Option<BitbucketLinks>,
    #[serde(default)]
    created_on: String,
    #[serde(default)]
    updated_on: String,
}

impl BitbucketPullRequest {
    fn to_unified(&self) -> UnifiedMergeRequest {
        UnifiedMergeRequest {
            id: self.id.to_string(),
            number: self.id,
            title: self.title.clone(),
            description: self.description.clone().unwrap_or_default(),
            state: self.state.clone(),
            source_branch: self.source.branch.name.clone(),
            target_branch: self.destination.branch.name.clone(),
            author: self.author.to_unified(),
            web_url: html_href(&self.links),
            created_at: self.created_on.clone(),
            updated_at: self.updated_on.clone(),
            reviewers: self.reviewers.iter().map(BitbucketUser::to_unified).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketChanges {
    #[serde(default)]
    reviewers: Option<ReviewerDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct ReviewerDelta {
    #[serde(default)]
    added: Vec<BitbucketUser>,
    #[serde(default)]
    removed: Vec<BitbucketUser>,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    actor: BitbucketUser,
    #[serde(default)]
    repository: BitbucketRepository,
    #[serde(default)]
    pullrequest: Option<BitbucketPullRequest>,
    comment: BitbucketComment,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    actor: BitbucketUser,
    #[serde(default)]
    repository: BitbucketRepository,
    pullrequest: BitbucketPullRequest,
    #[serde(default)]
    changes: BitbucketChanges,
}

#[async_trait]
impl WebhookAdapter for BitbucketWebhookAdapter {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn can_handle(&self, headers: &HeaderMap, _body: &[u8]) -> bool {
        if let Some(key) = header_str(headers, "x-event-key") {
            if BITBUCKET_EVENT_KEYS.iter().any(|k| key.contains(k)) {
                return true;
            }
        }
        if header_str(headers, "user-agent").is_some_and(|ua| ua.to_lowercase().contains("bitbucket")) {
            return true;
        }
        headers.contains_key("x-request-uuid") || headers.contains_key("x-hook-uuid")
    }

    fn event_type(&self, headers: &HeaderMap, _body: &[u8]) -> String {
        canonical_event_type(header_str(headers, "x-event-key").unwrap_or_default())
    }

    fn classify(&self, headers: &HeaderMap, body: &[u8]) -> WebhookKind {
        let probe: Probe = serde_json::from_slice(body).unwrap_or_default();
        let event = self.event_type(headers, body);

        match event.as_str() {
            "pullrequest_comment_created" => WebhookKind::Comment,
            "pullrequest_created" => WebhookKind::ReviewerChange,
            "pullrequest_updated"
                if probe
                    .changes
                    .as_ref()
                    .is_some_and(|c| c.get("reviewers").is_some()) =>
            {
                WebhookKind::ReviewerChange
            }
            "unknown" if probe.comment.is_some() && probe.pullrequest.is_some() => WebhookKind::Comment,
            _ => WebhookKind::Unsupported,
        }
    }

    fn convert_comment_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> GitContextEngineResult<UnifiedWebhookEvent> {
        let payload: CommentPayload = parse_body(PROVIDER, body)?;

        if payload.comment.deleted {
            return Err(GitContextEngineWebhookError::Ignored {
                provider: PROVIDER,
                reason: format!("comment {} is deleted", payload.comment.id),
            }
            .into());
        }

        let mut comment = payload.comment.into_unified();
        let mr = payload.pullrequest.as_ref().map(BitbucketPullRequest::to_unified);
        if let Some(mr) = mr.as_ref() {
            comment
                .metadata
                .insert("pr_number".to_string(), mr.number.into());
        }

        debug!(
            event_type = %self.event_type(headers, body),
            comment_id = %comment.id,
            "converted Bitbucket comment event"
        );

        let timestamp = payload
            .date
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| comment.created_at.clone());

        Ok(UnifiedWebhookEvent {
            provider: PROVIDER.to_string(),
            timestamp,
            actor: payload.actor.to_unified(),
            repository: payload.repository.to_unified(),
            merge_request: mr,
            payload: EventPayload::Comment(comment),
        })
    }

    fn convert_reviewer_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> GitContextEngineResult<UnifiedWebhookEvent> {
        let payload: PullRequestPayload = parse_body(PROVIDER, body)?;
        let event = self.event_type(headers, body);
        let mr = payload.pullrequest.to_unified();

        // `added` plays the role of the current list and `removed` of the
        // previous one, so added_reviewers() yields exactly the added users.
        let (action, previous, current): (&str, Vec<UnifiedUser>, Vec<UnifiedUser>) =
            match (&payload.changes.reviewers, event.as_str()) {
                (Some(delta), _) => (
                    "modified",
                    delta.removed.iter().map(BitbucketUser::to_unified).collect(),
                    delta.added.iter().map(BitbucketUser::to_unified).collect(),
                ),
                (None, "pullrequest_created") => ("added", Vec::new(), mr.reviewers.clone()),
                (None, _) => {
                    return Err(GitContextEngineWebhookError::Ignored {
                        provider: PROVIDER,
                        reason: "pull request update without reviewer changes".to_string(),
                    }
                    .into());
                }
            };

        let actor = payload.actor.to_unified();
        let timestamp = payload
            .date
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| mr.updated_at.clone());

        Ok(UnifiedWebhookEvent {
            provider: PROVIDER.to_string(),
            timestamp,
            actor: actor.clone(),
            repository: payload.repository.to_unified(),
            merge_request: Some(mr),
            payload: EventPayload::ReviewerChange(UnifiedReviewerChange {
                action: action.to_string(),
                previous_reviewers: previous,
                current_reviewers: current,
                changed_by: actor,
            }),
        })
    }

    async fn fetch_merge_request_commits(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedCommit>> {
        self.client_for(repo)
            .await?
            .list_commits(&repo.full_name, mr.number)
            .await
    }

    async fn fetch_merge_request_discussions(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedDiscussion>> {
        self.client_for(repo)
            .await?
            .list_threads(&repo.full_name, mr.number)
            .await
    }

    /// Every Bitbucket comment already belongs to a thread.
    async fn fetch_merge_request_notes(
        &self,
        _repo: &UnifiedRepository,
        _mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedComment>> {
        Ok(Vec::new())
    }

    async fn fetch_discussion(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
        discussion_id: &str,
    ) -> GitContextEngineResult<UnifiedDiscussion> {
        self.client_for(repo)
            .await?
            .get_thread(&repo.full_name, mr.number, discussion_id)
            .await
    }

    async fn fetch_bot_identity(&self, repo: &UnifiedRepository) -> GitContextEngineResult<BotIdentity> {
        self.client_for(repo).await?.current_user().await
    }

    async fn post_comment_reply(&self, event: &UnifiedWebhookEvent, body: &str) -> GitContextEngineResult<()> {
        let comment = require_comment(event)?;
        let mr = require_merge_request(event)?;
        self.client_for(&event.repository)
            .await?
            .reply_to_comment(&event.repository.full_name, mr.number, &comment.id, body)
            .await
    }

    /// Bitbucket has no comment reactions; the emoji goes out as a reply.
    async fn post_emoji_reaction(&self, event: &UnifiedWebhookEvent, emoji: &str) -> GitContextEngineResult<()> {
        let text = format!(":{}:", emoji.trim_matches(':'));
        self.post_comment_reply(event, &text).await
    }

    async fn post_full_review(&self, event: &UnifiedWebhookEvent, body: &str) -> GitContextEngineResult<()> {
        let mr = require_merge_request(event)?;
        self.client_for(&event.repository)
            .await?
            .create_pr_comment(&event.repository.full_name, mr.number, body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GitContextEngineError;
    use crate::webhooks::test_support::{headers, tokens};

    fn adapter() -> BitbucketWebhookAdapter {
        BitbucketWebhookAdapter::new(reqwest::Client::new(), tokens())
    }

    const REPO: &str = r#"{"uuid": "{r-1}", "name": "api", "full_name": "acme/api",
        "owner": {"display_name": "Acme", "username": "acme"},
        "links": {"html": {"href": "https://bitbucket.org/acme/api"}}}"#;

    const PR: &str = r#"{"id": 12, "title": "Add cache", "state": "OPEN",
        "source": {"branch": {"name": "feat"}}, "destination": {"branch": {"name": "main"}},
        "author": {"display_name": "Bob", "account_id": "b-1"},
        "links": {"html": {"href": "https://bitbucket.org/acme/api/pull-requests/12"}}}"#;

    #[test]
    fn event_key_is_canonicalized() {
        assert_eq!(canonical_event_type("pullrequest:comment_created"), "pullrequest_comment_created");
        assert_eq!(canonical_event_type("  "), "unknown");
    }

    #[test]
    fn can_handle_by_event_key_or_agent() {
        let a = adapter();
        assert!(a.can_handle(&headers(&[("X-Event-Key", "pullrequest:approved")]), b""));
        assert!(a.can_handle(&headers(&[("User-Agent", "Bitbucket-Webhooks/2.0")]), b""));
        assert!(a.can_handle(&headers(&[("X-Hook-UUID", "abc")]), b""));
        assert!(!a.can_handle(&headers(&[("X-Event-Key", "issue:created")]), b""));
    }

    #[test]
    fn converts_reply_comment() {
        let body = format!(
            r#"{{"actor": {{"display_name": "Bob", "account_id": "b-1"}},
                "repository": {REPO}, "pullrequest": {PR},
                "comment": {{"id": 501, "content": {{"raw": "@livereviewbot is this right?"}},
                             "user": {{"display_name": "Bob", "account_id": "b-1"}},
                             "created_on": "2024-05-01T10:00:00+00:00",
                             "parent": {{"id": 500}},
                             "inline": {{"path": "src/lib.rs", "from": null, "to": 33}}}}}}"#
        );
        let a = adapter();
        let h = headers(&[("X-Event-Key", "pullrequest:comment_created")]);
        assert_eq!(a.classify(&h, body.as_bytes()), WebhookKind::Comment);

        let event = a.convert_comment_event(&h, body.as_bytes()).unwrap();
        let comment = event.comment().unwrap();
        assert_eq!(comment.discussion_id.as_deref(), Some("500"));
        assert_eq!(comment.in_reply_to_id.as_deref(), Some("500"));
        assert_eq!(comment.position.as_ref().unwrap().line_number, 33);
        assert_eq!(event.timestamp, "2024-05-01T10:00:00+00:00");
        assert_eq!(event.merge_request.as_ref().unwrap().source_branch, "feat");
        assert_eq!(event.repository.web_url, "https://bitbucket.org/acme/api");
    }

    #[test]
    fn deleted_comments_are_ignored() {
        let body = r#"{"comment": {"id": 1, "deleted": true}}"#;
        let err = adapter()
            .convert_comment_event(&HeaderMap::new(), body.as_bytes())
            .unwrap_err();
        assert!(matches!(
            err,
            GitContextEngineError::Webhook(GitContextEngineWebhookError::Ignored { .. })
        ));
    }

    #[test]
    fn reviewer_delta_maps_added_to_current() {
        let body = format!(
            r#"{{"actor": {{"display_name": "Bob", "account_id": "b-1"}},
                "repository": {REPO}, "pullrequest": {PR},
                "changes": {{"reviewers": {{"added": [{{"display_name": "Review Bot", "nickname": "livereviewbot", "account_id": "bot-1"}}], "removed": []}}}}}}"#
        );
        let a = adapter();
        let h = headers(&[("X-Event-Key", "pullrequest:updated")]);
        assert_eq!(a.classify(&h, body.as_bytes()), WebhookKind::ReviewerChange);

        let event = a.convert_reviewer_event(&h, body.as_bytes()).unwrap();
        let change = event.reviewer_change().unwrap();
        let added: Vec<_> = change.added_reviewers().map(|u| u.username.as_str()).collect();
        assert_eq!(added, vec!["livereviewbot"]);
    }
}
