//! GitHub webhook adapter: `issue_comment`, `pull_request_review_comment`,
//! `pull_request_review` and reviewer requests on `pull_request`.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use crate::credentials::{TokenStore, extract_instance_url};
use crate::errors::{GitContextEngineProviderError, GitContextEngineResult, GitContextEngineWebhookError};
use crate::git_providers::github::{GitHubClient, GitHubComment, GitHubRef, GitHubUser};
use crate::git_providers::{ProviderKind, api_base_for};
use crate::unified::{
    BotIdentity, EventPayload, UnifiedComment, UnifiedCommit, UnifiedDiscussion,
    UnifiedMergeRequest, UnifiedRepository, UnifiedReviewerChange, UnifiedUser,
    UnifiedWebhookEvent,
};

use super::{WebhookAdapter, WebhookKind, header_str, parse_body, require_comment, require_merge_request};

const PROVIDER: &str = "github";

const ISSUE_COMMENT: &str = "issue_comment";
const REVIEW_COMMENT: &str = "pull_request_review_comment";
const REVIEW: &str = "pull_request_review";
const PULL_REQUEST: &str = "pull_request";

/// Lowercased `X-GitHub-Event`, `unknown` when absent.
pub fn canonical_event_type(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        "unknown".to_string()
    } else {
        raw.to_lowercase()
    }
}

#[derive(Clone)]
pub struct GitHubWebhookAdapter {
    http: reqwest::Client,
    tokens: Arc<dyn TokenStore>,
}

impl GitHubWebhookAdapter {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenStore>) -> Self {
        Self { http, tokens }
    }

    async fn client_for(&self, repo: &UnifiedRepository) -> GitContextEngineResult<GitHubClient> {
        let instance = extract_instance_url(&repo.web_url);
        let token = self.tokens.lookup_token(ProviderKind::GitHub, &instance).await?;
        Ok(GitHubClient::new(
            self.http.clone(),
            api_base_for(ProviderKind::GitHub, &instance),
            token,
        ))
    }
}

/// Loose shape used to infer the event when the header is missing.
#[derive(Debug, Default, Deserialize)]
struct Probe {
    #[serde(default)]
    action: String,
    #[serde(default)]
    sender: Option<GitHubUser>,
    #[serde(default)]
    comment: Option<serde_json::Value>,
    #[serde(default)]
    issue: Option<serde_json::Value>,
    #[serde(default)]
    review: Option<serde_json::Value>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

/// Event name from the header, falling back to the payload shape.
fn resolve_event(headers: &HeaderMap, body: &[u8]) -> (String, Probe) {
    let probe: Probe = serde_json::from_slice(body).unwrap_or_default();
    if let Some(name) = header_str(headers, "x-github-event") {
        return (canonical_event_type(name), probe);
    }

    let inferred = match (&probe.comment, &probe.issue, &probe.review, &probe.pull_request) {
        (Some(_), Some(_), _, _) => ISSUE_COMMENT,
        (Some(_), None, _, Some(_)) => REVIEW_COMMENT,
        (None, _, Some(_), Some(_)) => REVIEW,
        (None, _, None, Some(_)) => PULL_REQUEST,
        _ => "unknown",
    };
    (inferred.to_string(), probe)
}

#[derive(Debug, Default, Deserialize)]
struct GitHubRepository {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    owner: GitHubUser,
}

impl GitHubRepository {
    fn to_unified(&self) -> UnifiedRepository {
        UnifiedRepository {
            id: self.id.to_string(),
            name: self.name.clone(),
            full_name: self.full_name.clone(),
            owner: self.owner.to_unified(),
            web_url: self.html_url.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GitHubPullRequest {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    user: GitHubUser,
    #[serde(default)]
    base: GitHubRef,
    #[serde(default)]
    head: GitHubRef,
    #[serde(default)]
    requested_reviewers: Vec<GitHubUser>,
}

impl GitHubPullRequest {
    fn to_unified(&self) -> UnifiedMergeRequest {
        UnifiedMergeRequest {
            id: self.id.to_string(),
            number: self.number,
            title: self.title.clone(),
            description: self.body.clone().unwrap_or_default(),
            state: self.state.clone(),
            source_branch: self.head.r#ref.clone(),
            target_branch: self.base.r#ref.clone(),
            author: self.user.to_unified(),
            web_url: self.html_url.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            reviewers: self.requested_reviewers.iter().map(GitHubUser::to_unified).collect(),
        }
    }
}

/// Issue as embedded in `issue_comment`; `pull_request` is set only for PRs.
#[derive(Debug, Default, Deserialize)]
struct GitHubIssue {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    user: GitHubUser,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

impl GitHubIssue {
    fn to_unified(&self) -> UnifiedMergeRequest {
        UnifiedMergeRequest {
            id: self.id.to_string(),
            number: self.number,
            title: self.title.clone(),
            description: self.body.clone().unwrap_or_default(),
            state: self.state.clone(),
            author: self.user.to_unified(),
            web_url: self.html_url.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssueCommentPayload {
    #[serde(default)]
    action: String,
    #[serde(default)]
    issue: GitHubIssue,
    comment: GitHubComment,
    #[serde(default)]
    repository: GitHubRepository,
    #[serde(default)]
    sender: GitHubUser,
}

#[derive(Debug, Deserialize)]
struct ReviewCommentPayload {
    #[serde(default)]
    action: String,
    comment: GitHubComment,
    #[serde(default)]
    pull_request: GitHubPullRequest,
    #[serde(default)]
    repository: GitHubRepository,
    #[serde(default)]
    sender: GitHubUser,
}

#[derive(Debug, Default, Deserialize)]
struct GitHubReview {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    user: GitHubUser,
    #[serde(default)]
    submitted_at: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewPayload {
    #[serde(default)]
    action: String,
    review: GitHubReview,
    #[serde(default)]
    pull_request: GitHubPullRequest,
    #[serde(default)]
    repository: GitHubRepository,
    #[serde(default)]
    sender: GitHubUser,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    #[serde(default)]
    action: String,
    pull_request: GitHubPullRequest,
    #[serde(default)]
    requested_reviewer: Option<GitHubUser>,
    #[serde(default)]
    repository: GitHubRepository,
    #[serde(default)]
    sender: GitHubUser,
}

fn ignored(reason: String) -> GitContextEngineWebhookError {
    GitContextEngineWebhookError::Ignored {
        provider: PROVIDER,
        reason,
    }
}

fn convert_issue_comment(body: &[u8]) -> GitContextEngineResult<UnifiedWebhookEvent> {
    let payload: IssueCommentPayload = parse_body(PROVIDER, body)?;
    if payload.action != "created" {
        return Err(ignored(format!("issue_comment action '{}'", payload.action)).into());
    }
    if payload.issue.pull_request.is_none() {
        return Err(ignored("comment on a plain issue".to_string()).into());
    }

    let comment = payload.comment.into_unified("issue_comment");
    Ok(UnifiedWebhookEvent {
        provider: PROVIDER.to_string(),
        timestamp: comment.created_at.clone(),
        actor: payload.sender.to_unified(),
        repository: payload.repository.to_unified(),
        merge_request: Some(payload.issue.to_unified()),
        payload: EventPayload::Comment(comment),
    })
}

fn convert_review_comment(body: &[u8]) -> GitContextEngineResult<UnifiedWebhookEvent> {
    let payload: ReviewCommentPayload = parse_body(PROVIDER, body)?;
    if payload.action != "created" {
        return Err(ignored(format!("review comment action '{}'", payload.action)).into());
    }

    let comment = payload.comment.into_unified("review_comment");
    Ok(UnifiedWebhookEvent {
        provider: PROVIDER.to_string(),
        timestamp: comment.created_at.clone(),
        actor: payload.sender.to_unified(),
        repository: payload.repository.to_unified(),
        merge_request: Some(payload.pull_request.to_unified()),
        payload: EventPayload::Comment(comment),
    })
}

/// A submitted review with a summary body behaves like a top-level comment.
fn convert_review(body: &[u8]) -> GitContextEngineResult<UnifiedWebhookEvent> {
    let payload: ReviewPayload = parse_body(PROVIDER, body)?;
    let text = payload.review.body.clone().unwrap_or_default();
    if payload.action != "submitted" || text.trim().is_empty() {
        return Err(ignored(format!(
            "pull_request_review action '{}' without body",
            payload.action
        ))
        .into());
    }

    let mr = payload.pull_request.to_unified();
    let timestamp = payload
        .review
        .submitted_at
        .clone()
        .unwrap_or_else(|| mr.updated_at.clone());

    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert("comment_type".to_string(), "review".into());

    let comment = UnifiedComment {
        id: payload.review.id.to_string(),
        body: text,
        created_at: timestamp.clone(),
        updated_at: timestamp.clone(),
        author: payload.review.user.to_unified(),
        position: None,
        discussion_id: None,
        in_reply_to_id: None,
        system: false,
        web_url: payload.review.html_url.clone().or_else(|| Some(mr.web_url.clone())),
        metadata,
    };

    Ok(UnifiedWebhookEvent {
        provider: PROVIDER.to_string(),
        timestamp,
        actor: payload.sender.to_unified(),
        repository: payload.repository.to_unified(),
        merge_request: Some(mr),
        payload: EventPayload::Comment(comment),
    })
}

fn comment_type(comment: &UnifiedComment) -> &str {
    comment
        .metadata
        .get("comment_type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("issue_comment")
}

#[async_trait]
impl WebhookAdapter for GitHubWebhookAdapter {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn can_handle(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        if headers.contains_key("x-github-event") || headers.contains_key("x-github-delivery") {
            return true;
        }
        serde_json::from_slice::<Probe>(body)
            .ok()
            .and_then(|p| p.sender)
            .is_some_and(|s| !s.login.is_empty() && s.html_url.is_some_and(|u| !u.is_empty()))
    }

    fn event_type(&self, headers: &HeaderMap, body: &[u8]) -> String {
        resolve_event(headers, body).0
    }

    fn classify(&self, headers: &HeaderMap, body: &[u8]) -> WebhookKind {
        let (event, probe) = resolve_event(headers, body);
        match event.as_str() {
            ISSUE_COMMENT | REVIEW_COMMENT | REVIEW => WebhookKind::Comment,
            PULL_REQUEST
                if probe.action == "review_requested" || probe.action == "review_request_removed" =>
            {
                WebhookKind::ReviewerChange
            }
            _ => WebhookKind::Unsupported,
        }
    }

    fn convert_comment_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> GitContextEngineResult<UnifiedWebhookEvent> {
        let (event, _) = resolve_event(headers, body);
        debug!(event_type = %event, "converting GitHub comment event");

        match event.as_str() {
            ISSUE_COMMENT => convert_issue_comment(body),
            REVIEW_COMMENT => convert_review_comment(body),
            REVIEW => convert_review(body),
            other => Err(GitContextEngineWebhookError::UnsupportedEvent {
                provider: PROVIDER,
                event_type: other.to_string(),
            }
            .into()),
        }
    }

    fn convert_reviewer_event(
        &self,
        _headers: &HeaderMap,
        body: &[u8],
    ) -> GitContextEngineResult<UnifiedWebhookEvent> {
        let payload: PullRequestPayload = parse_body(PROVIDER, body)?;

        let action = match payload.action.as_str() {
            "review_requested" => "added",
            "review_request_removed" => "removed",
            other => {
                return Err(GitContextEngineWebhookError::UnsupportedEvent {
                    provider: PROVIDER,
                    event_type: format!("pull_request.{other}"),
                }
                .into());
            }
        };

        let current: Vec<UnifiedUser> = payload
            .pull_request
            .requested_reviewers
            .iter()
            .map(GitHubUser::to_unified)
            .collect();

        // The payload carries only the post-change list; rebuild the previous
        // one from the single reviewer the action concerns.
        let previous: Vec<UnifiedUser> = match (&payload.requested_reviewer, action) {
            (Some(r), "added") => current
                .iter()
                .filter(|u| u.username != r.login)
                .cloned()
                .collect(),
            (Some(r), _) => {
                let mut prev = current.clone();
                if !prev.iter().any(|u| u.username == r.login) {
                    prev.push(r.to_unified());
                }
                prev
            }
            (None, _) => current.clone(),
        };

        let actor = payload.sender.to_unified();
        let mr = payload.pull_request.to_unified();

        Ok(UnifiedWebhookEvent {
            provider: PROVIDER.to_string(),
            timestamp: mr.updated_at.clone(),
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
            .list_review_threads(&repo.full_name, mr.number)
            .await
    }

    async fn fetch_merge_request_notes(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedComment>> {
        self.client_for(repo)
            .await?
            .list_issue_comments(&repo.full_name, mr.number)
            .await
    }

    async fn fetch_discussion(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
        discussion_id: &str,
    ) -> GitContextEngineResult<UnifiedDiscussion> {
        self.client_for(repo)
            .await?
            .get_review_thread(&repo.full_name, mr.number, discussion_id)
            .await
    }

    async fn fetch_bot_identity(&self, repo: &UnifiedRepository) -> GitContextEngineResult<BotIdentity> {
        self.client_for(repo).await?.current_user().await
    }

    async fn post_comment_reply(&self, event: &UnifiedWebhookEvent, body: &str) -> GitContextEngineResult<()> {
        let comment = require_comment(event)?;
        let mr = require_merge_request(event)?;
        let client = self.client_for(&event.repository).await?;
        let full_name = &event.repository.full_name;

        if comment_type(comment) == "review_comment" {
            // Replies must target the thread root.
            let root = comment.in_reply_to_id.as_deref().unwrap_or(&comment.id);
            client
                .reply_to_review_comment(full_name, mr.number, root, body)
                .await
        } else {
            client.create_issue_comment(full_name, mr.number, body).await
        }
    }

    async fn post_emoji_reaction(&self, event: &UnifiedWebhookEvent, emoji: &str) -> GitContextEngineResult<()> {
        let comment = require_comment(event)?;
        let review_comment = match comment_type(comment) {
            "review_comment" => true,
            "issue_comment" => false,
            _ => {
                return Err(GitContextEngineProviderError::Unsupported(
                    "reactions on pull request reviews",
                )
                .into());
            }
        };

        self.client_for(&event.repository)
            .await?
            .add_reaction(&event.repository.full_name, &comment.id, review_comment, emoji)
            .await
    }

    async fn post_full_review(&self, event: &UnifiedWebhookEvent, body: &str) -> GitContextEngineResult<()> {
        let mr = require_merge_request(event)?;
        self.client_for(&event.repository)
            .await?
            .create_issue_comment(&event.repository.full_name, mr.number, body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GitContextEngineError;
    use crate::webhooks::test_support::{headers, tokens};

    fn adapter() -> GitHubWebhookAdapter {
        GitHubWebhookAdapter::new(reqwest::Client::new(), tokens())
    }

    const REPO: &str = r#"{"id": 1, "name": "api", "full_name": "acme/api", "html_url": "https://github.com/acme/api", "owner": {"id": 2, "login": "acme"}}"#;

    #[test]
    fn can_handle_by_header_or_sender_shape() {
        let a = adapter();
        assert!(a.can_handle(&headers(&[("X-GitHub-Delivery", "abc")]), b""));
        assert!(a.can_handle(
            &HeaderMap::new(),
            br#"{"sender": {"login": "octo", "html_url": "https://github.com/octo"}}"#
        ));
        assert!(!a.can_handle(&HeaderMap::new(), br#"{"sender": {"login": "octo"}}"#));
    }

    #[test]
    fn converts_issue_comment_on_pull_request() {
        let body = format!(
            r#"{{"action": "created",
                "issue": {{"id": 10, "number": 4, "title": "Fix", "state": "open",
                           "html_url": "https://github.com/acme/api/pull/4",
                           "user": {{"id": 3, "login": "bob"}}, "pull_request": {{"url": "x"}}}},
                "comment": {{"id": 55, "body": "@livereviewbot thoughts?", "user": {{"id": 3, "login": "bob"}},
                             "created_at": "2024-05-01T10:00:00Z", "updated_at": "2024-05-01T10:00:00Z"}},
                "repository": {REPO},
                "sender": {{"id": 3, "login": "bob"}}}}"#
        );
        let a = adapter();
        let h = headers(&[("X-GitHub-Event", "issue_comment")]);
        assert_eq!(a.classify(&h, body.as_bytes()), WebhookKind::Comment);

        let event = a.convert_comment_event(&h, body.as_bytes()).unwrap();
        let comment = event.comment().unwrap();
        assert_eq!(comment.id, "55");
        assert_eq!(comment_type(comment), "issue_comment");
        assert_eq!(event.merge_request.as_ref().unwrap().number, 4);
        assert_eq!(event.repository.owner.username, "acme");
    }

    #[test]
    fn edited_comments_are_ignored() {
        let body = r#"{"action": "edited", "issue": {"pull_request": {}}, "comment": {"id": 1}}"#;
        let err = adapter()
            .convert_comment_event(&headers(&[("X-GitHub-Event", "issue_comment")]), body.as_bytes())
            .unwrap_err();
        assert!(matches!(
            err,
            GitContextEngineError::Webhook(GitContextEngineWebhookError::Ignored { .. })
        ));
    }

    #[test]
    fn converts_review_comment_with_thread() {
        let body = format!(
            r#"{{"action": "created",
                "comment": {{"id": 77, "body": "nit", "user": {{"id": 3, "login": "bob"}},
                             "path": "src/main.rs", "line": 9, "side": "RIGHT",
                             "in_reply_to_id": 70, "pull_request_review_id": 5,
                             "diff_hunk": "@@ -1 +1 @@", "created_at": "2024-05-01T10:00:00Z"}},
                "pull_request": {{"id": 11, "number": 4, "head": {{"ref": "feat", "sha": "abc"}}, "base": {{"ref": "main", "sha": "def"}}}},
                "repository": {REPO},
                "sender": {{"id": 3, "login": "bob"}}}}"#
        );
        let event = adapter()
            .convert_comment_event(
                &headers(&[("X-GitHub-Event", "pull_request_review_comment")]),
                body.as_bytes(),
            )
            .unwrap();

        let comment = event.comment().unwrap();
        assert_eq!(comment.discussion_id.as_deref(), Some("70"));
        assert_eq!(comment.position.as_ref().unwrap().line_number, 9);
        assert_eq!(event.merge_request.as_ref().unwrap().source_branch, "feat");
    }

    #[test]
    fn reviewer_request_rebuilds_previous_list() {
        let body = format!(
            r#"{{"action": "review_requested",
                "pull_request": {{"id": 11, "number": 4, "updated_at": "2024-05-01T10:00:00Z",
                                  "requested_reviewers": [{{"id": 8, "login": "carol"}}, {{"id": 9, "login": "livereviewbot"}}]}},
                "requested_reviewer": {{"id": 9, "login": "livereviewbot"}},
                "repository": {REPO},
                "sender": {{"id": 3, "login": "bob"}}}}"#
        );
        let a = adapter();
        let h = headers(&[("X-GitHub-Event", "pull_request")]);
        assert_eq!(a.classify(&h, body.as_bytes()), WebhookKind::ReviewerChange);

        let event = a.convert_reviewer_event(&h, body.as_bytes()).unwrap();
        let change = event.reviewer_change().unwrap();
        assert_eq!(change.action, "added");
        let added: Vec<_> = change.added_reviewers().map(|u| u.username.as_str()).collect();
        assert_eq!(added, vec!["livereviewbot"]);
        assert_eq!(event.timestamp, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn infers_event_without_header() {
        let body = br#"{"action": "created", "comment": {"id": 1}, "issue": {"number": 2}}"#;
        assert_eq!(adapter().event_type(&HeaderMap::new(), body), "issue_comment");
    }
}
