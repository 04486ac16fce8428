//! GitLab webhook adapter (Note Hook and Merge Request Hook deliveries).

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::credentials::{TokenStore, extract_instance_url};
use crate::errors::{GitContextEngineResult, GitContextEngineWebhookError};
use crate::git_providers::gitlab::{GitLabClient, GitLabNotePosition, GitLabUser};
use crate::git_providers::{ProviderKind, api_base_for};
use crate::unified::{
    BotIdentity, EventPayload, UnifiedComment, UnifiedCommit, UnifiedDiscussion,
    UnifiedMergeRequest, UnifiedRepository, UnifiedReviewerChange, UnifiedUser,
    UnifiedWebhookEvent,
};

use super::{WebhookAdapter, WebhookKind, header_str, parse_body, require_comment, require_merge_request};

const PROVIDER: &str = "gitlab";

const GITLAB_OBJECT_KINDS: &[&str] = &["merge_request", "note", "push", "tag_push", "issue", "wiki_page"];

/// Canonical form of `X-Gitlab-Event` / `object_kind`: lower snake case
/// without the `_hook` suffix (`Note Hook` -> `note`).
pub fn canonical_event_type(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "unknown".to_string();
    }
    let canonical = raw.to_lowercase().replace([' ', '-'], "_");
    canonical
        .strip_suffix("_hook")
        .map(str::to_string)
        .unwrap_or(canonical)
}

#[derive(Clone)]
pub struct GitLabWebhookAdapter {
    http: reqwest::Client,
    tokens: Arc<dyn TokenStore>,
}

impl GitLabWebhookAdapter {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenStore>) -> Self {
        Self { http, tokens }
    }

    /// API client for the instance hosting `repo`, authenticated with the
    /// instance token.
    async fn client_for(&self, repo: &UnifiedRepository) -> GitContextEngineResult<GitLabClient> {
        let instance = extract_instance_url(&repo.web_url);
        let token = self.tokens.lookup_token(ProviderKind::GitLab, &instance).await?;
        Ok(GitLabClient::new(
            self.http.clone(),
            api_base_for(ProviderKind::GitLab, &instance),
            token,
        ))
    }
}

/// Numeric project id when known, the namespaced path otherwise.
fn project_ref(repo: &UnifiedRepository) -> &str {
    if repo.id.is_empty() || repo.id == "0" {
        &repo.full_name
    } else {
        &repo.id
    }
}

#[derive(Debug, Deserialize)]
struct ObjectKindProbe {
    #[serde(default)]
    object_kind: String,
    #[serde(default)]
    changes: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct GitLabProject {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    path_with_namespace: String,
    #[serde(default)]
    web_url: String,
}

impl GitLabProject {
    fn to_unified(&self) -> UnifiedRepository {
        let owner = self
            .path_with_namespace
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        UnifiedRepository {
            id: if self.id == 0 {
                String::new()
            } else {
                self.id.to_string()
            },
            name: self.name.clone(),
            full_name: self.path_with_namespace.clone(),
            owner: UnifiedUser {
                username: owner,
                ..Default::default()
            },
            web_url: self.web_url.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct NoteHookPayload {
    #[serde(default)]
    user: GitLabUser,
    #[serde(default)]
    project: GitLabProject,
    object_attributes: NoteAttributes,
    #[serde(default)]
    merge_request: Option<MergeRequestAttributes>,
}

#[derive(Debug, Default, Deserialize)]
struct NoteAttributes {
    id: u64,
    #[serde(default)]
    note: String,
    #[serde(default)]
    noteable_type: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    discussion_id: Option<String>,
    #[serde(default)]
    position: Option<GitLabNotePosition>,
    #[serde(default)]
    system: bool,
    #[serde(default, rename = "type")]
    note_type: Option<String>,
}

/// Merge request as embedded in note and merge request hooks.
#[derive(Debug, Default, Deserialize)]
struct MergeRequestAttributes {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    iid: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    source_branch: String,
    #[serde(default)]
    target_branch: String,
    #[serde(default)]
    author_id: u64,
    #[serde(default)]
    url: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: String,
}

impl MergeRequestAttributes {
    fn to_unified(&self, author: UnifiedUser, reviewers: Vec<UnifiedUser>) -> UnifiedMergeRequest {
        UnifiedMergeRequest {
            id: self.id.to_string(),
            number: self.iid,
            title: self.title.clone(),
            description: self.description.clone().unwrap_or_default(),
            state: self.state.clone(),
            source_branch: self.source_branch.clone(),
            target_branch: self.target_branch.clone(),
            author,
            web_url: self.url.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            reviewers,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct MergeRequestHookPayload {
    #[serde(default)]
    object_kind: String,
    #[serde(default)]
    user: GitLabUser,
    #[serde(default)]
    project: GitLabProject,
    #[serde(default)]
    object_attributes: MergeRequestAttributes,
    #[serde(default)]
    changes: MergeRequestChanges,
    #[serde(default)]
    reviewers: Vec<GitLabUser>,
}

#[derive(Debug, Default, Deserialize)]
struct MergeRequestChanges {
    #[serde(default)]
    reviewer_ids: Option<IdChange>,
    #[serde(default)]
    reviewers: Option<UserChange>,
}

#[derive(Debug, Default, Deserialize)]
struct IdChange {
    #[serde(default)]
    previous: Option<Vec<u64>>,
    #[serde(default)]
    current: Option<Vec<u64>>,
}

#[derive(Debug, Default, Deserialize)]
struct UserChange {
    #[serde(default)]
    previous: Option<Vec<GitLabUser>>,
    #[serde(default)]
    current: Option<Vec<GitLabUser>>,
}

/// Resolves reviewer ids against the user objects present in the payload;
/// unknown ids keep only the id.
fn reviewers_from_ids(ids: &[u64], known: &[&GitLabUser]) -> Vec<UnifiedUser> {
    ids.iter()
        .map(|id| {
            known
                .iter()
                .find(|u| u.id == *id)
                .map(|u| u.to_unified())
                .unwrap_or_else(|| UnifiedUser {
                    id: id.to_string(),
                    ..Default::default()
                })
        })
        .collect()
}

fn reviewer_action(previous: &[UnifiedUser], current: &[UnifiedUser]) -> &'static str {
    if current.len() > previous.len() {
        "added"
    } else if current.len() < previous.len() {
        "removed"
    } else {
        "updated"
    }
}

#[async_trait]
impl WebhookAdapter for GitLabWebhookAdapter {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn can_handle(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        if headers.contains_key("x-gitlab-event") || headers.contains_key("x-gitlab-token") {
            return true;
        }
        serde_json::from_slice::<ObjectKindProbe>(body)
            .map(|p| GITLAB_OBJECT_KINDS.contains(&p.object_kind.as_str()))
            .unwrap_or(false)
    }

    fn event_type(&self, headers: &HeaderMap, body: &[u8]) -> String {
        let from_header = canonical_event_type(header_str(headers, "x-gitlab-event").unwrap_or_default());
        if from_header != "unknown" {
            return from_header;
        }
        serde_json::from_slice::<ObjectKindProbe>(body)
            .map(|p| canonical_event_type(&p.object_kind))
            .unwrap_or(from_header)
    }

    fn classify(&self, headers: &HeaderMap, body: &[u8]) -> WebhookKind {
        let Ok(probe) = serde_json::from_slice::<ObjectKindProbe>(body) else {
            return WebhookKind::Unsupported;
        };
        let kind = if probe.object_kind.is_empty() {
            self.event_type(headers, body)
        } else {
            probe.object_kind.clone()
        };

        match kind.as_str() {
            "note" => WebhookKind::Comment,
            "merge_request" => {
                let reviewers_changed = probe
                    .changes
                    .as_ref()
                    .is_some_and(|c| c.get("reviewer_ids").is_some() || c.get("reviewers").is_some());
                if reviewers_changed {
                    WebhookKind::ReviewerChange
                } else {
                    WebhookKind::Unsupported
                }
            }
            _ => WebhookKind::Unsupported,
        }
    }

    fn convert_comment_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> GitContextEngineResult<UnifiedWebhookEvent> {
        let payload: NoteHookPayload = parse_body(PROVIDER, body)?;
        let attrs = &payload.object_attributes;

        if !attrs.noteable_type.is_empty() && attrs.noteable_type != "MergeRequest" {
            return Err(GitContextEngineWebhookError::UnsupportedEvent {
                provider: PROVIDER,
                event_type: format!("note on {}", attrs.noteable_type),
            }
            .into());
        }

        let Some(mr) = payload.merge_request.as_ref() else {
            return Err(GitContextEngineWebhookError::malformed(
                PROVIDER,
                "note hook without merge_request",
            )
            .into());
        };

        let actor = payload.user.to_unified();
        let author = UnifiedUser {
            id: if mr.author_id == 0 {
                String::new()
            } else {
                mr.author_id.to_string()
            },
            ..Default::default()
        };

        let mut metadata = std::collections::BTreeMap::new();
        if let Some(note_type) = attrs.note_type.as_ref().filter(|t| !t.is_empty()) {
            metadata.insert("note_type".to_string(), serde_json::Value::from(note_type.clone()));
        }

        let comment = UnifiedComment {
            id: attrs.id.to_string(),
            body: attrs.note.clone(),
            created_at: attrs.created_at.clone(),
            updated_at: attrs.updated_at.clone(),
            author: actor.clone(),
            position: attrs.position.as_ref().and_then(GitLabNotePosition::to_unified),
            discussion_id: attrs.discussion_id.clone().filter(|d| !d.is_empty()),
            in_reply_to_id: None,
            system: attrs.system,
            web_url: attrs.url.clone().filter(|u| !u.is_empty()),
            metadata,
        };

        debug!(
            event_type = %self.event_type(headers, body),
            note_id = %comment.id,
            mr_iid = mr.iid,
            "converted GitLab note hook"
        );

        Ok(UnifiedWebhookEvent {
            provider: PROVIDER.to_string(),
            timestamp: attrs.created_at.clone(),
            actor,
            repository: payload.project.to_unified(),
            merge_request: Some(mr.to_unified(author, Vec::new())),
            payload: EventPayload::Comment(comment),
        })
    }

    fn convert_reviewer_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> GitContextEngineResult<UnifiedWebhookEvent> {
        let payload: MergeRequestHookPayload = parse_body(PROVIDER, body)?;

        if payload.object_kind != "merge_request" {
            return Err(GitContextEngineWebhookError::UnsupportedEvent {
                provider: PROVIDER,
                event_type: canonical_event_type(&payload.object_kind),
            }
            .into());
        }

        let mut known: Vec<&GitLabUser> = payload.reviewers.iter().collect();
        if let Some(users) = payload.changes.reviewers.as_ref() {
            known.extend(users.previous.iter().flatten());
            known.extend(users.current.iter().flatten());
        }

        let (previous, current) = match (&payload.changes.reviewer_ids, &payload.changes.reviewers) {
            (Some(ids), _) => (
                reviewers_from_ids(ids.previous.as_deref().unwrap_or_default(), &known),
                reviewers_from_ids(ids.current.as_deref().unwrap_or_default(), &known),
            ),
            (None, Some(users)) => (
                users.previous.iter().flatten().map(GitLabUser::to_unified).collect(),
                users.current.iter().flatten().map(GitLabUser::to_unified).collect(),
            ),
            (None, None) => {
                return Err(GitContextEngineWebhookError::Ignored {
                    provider: PROVIDER,
                    reason: "merge request update without reviewer changes".to_string(),
                }
                .into());
            }
        };

        let actor = payload.user.to_unified();
        let attrs = &payload.object_attributes;
        let mr_author = UnifiedUser {
            id: if attrs.author_id == 0 {
                String::new()
            } else {
                attrs.author_id.to_string()
            },
            ..Default::default()
        };

        debug!(
            event_type = %self.event_type(headers, body),
            mr_iid = attrs.iid,
            previous = previous.len(),
            current = current.len(),
            "converted GitLab reviewer change"
        );

        let change = UnifiedReviewerChange {
            action: reviewer_action(&previous, &current).to_string(),
            previous_reviewers: previous,
            current_reviewers: current.clone(),
            changed_by: actor.clone(),
        };

        Ok(UnifiedWebhookEvent {
            provider: PROVIDER.to_string(),
            timestamp: attrs.updated_at.clone(),
            actor,
            repository: payload.project.to_unified(),
            merge_request: Some(attrs.to_unified(mr_author, current)),
            payload: EventPayload::ReviewerChange(change),
        })
    }

    async fn fetch_merge_request_commits(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedCommit>> {
        self.client_for(repo)
            .await?
            .list_commits(project_ref(repo), mr.number)
            .await
    }

    async fn fetch_merge_request_discussions(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedDiscussion>> {
        self.client_for(repo)
            .await?
            .list_discussions(project_ref(repo), mr.number)
            .await
    }

    async fn fetch_merge_request_notes(
        &self,
        repo: &UnifiedRepository,
        mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedComment>> {
        self.client_for(repo)
            .await?
            .list_notes(project_ref(repo), mr.number)
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
            .get_discussion(project_ref(repo), mr.number, discussion_id)
            .await
    }

    async fn fetch_bot_identity(&self, repo: &UnifiedRepository) -> GitContextEngineResult<BotIdentity> {
        self.client_for(repo).await?.current_user().await
    }

    async fn post_comment_reply(&self, event: &UnifiedWebhookEvent, body: &str) -> GitContextEngineResult<()> {
        let comment = require_comment(event)?;
        let mr = require_merge_request(event)?;
        let client = self.client_for(&event.repository).await?;
        let project = project_ref(&event.repository);

        match comment.discussion_id.as_deref() {
            Some(discussion_id) => {
                client
                    .reply_to_discussion(project, mr.number, discussion_id, body)
                    .await
            }
            None => {
                warn!(note_id = %comment.id, "note has no discussion id, posting top-level note");
                client.create_note(project, mr.number, body).await
            }
        }
    }

    async fn post_emoji_reaction(&self, event: &UnifiedWebhookEvent, emoji: &str) -> GitContextEngineResult<()> {
        let comment = require_comment(event)?;
        let mr = require_merge_request(event)?;
        self.client_for(&event.repository)
            .await?
            .award_emoji(project_ref(&event.repository), mr.number, &comment.id, emoji)
            .await
    }

    async fn post_full_review(&self, event: &UnifiedWebhookEvent, body: &str) -> GitContextEngineResult<()> {
        let mr = require_merge_request(event)?;
        self.client_for(&event.repository)
            .await?
            .create_note(project_ref(&event.repository), mr.number, body)
            .await
    }
}
