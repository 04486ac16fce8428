//! Provider-agnostic event model.
//!
//! Every webhook adapter converts its provider's payload into these types, and
//! everything downstream (warrant engine, timeline, context, reply path) only
//! ever sees this model. Timestamps are kept as the provider sent them; the
//! timeline builder normalizes them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of a unified event. Derived from the payload, never stored apart from it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CommentCreated,
    ReviewerAssigned,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CommentCreated => "comment_created",
            EventType::ReviewerAssigned => "reviewer_assigned",
        }
    }
}

/// A webhook notification in canonical form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedWebhookEvent {
    /// Provider id: `gitlab`, `github` or `bitbucket`.
    pub provider: String,
    /// Raw event timestamp as reported by the provider.
    pub timestamp: String,
    /// User whose action produced the delivery.
    pub actor: UnifiedUser,
    pub repository: UnifiedRepository,
    /// Merge request the event belongs to, when the payload carries one.
    pub merge_request: Option<UnifiedMergeRequest>,
    pub payload: EventPayload,
}

/// The single populated payload of an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Comment(UnifiedComment),
    ReviewerChange(UnifiedReviewerChange),
}

impl UnifiedWebhookEvent {
    pub fn event_type(&self) -> EventType {
        match self.payload {
            EventPayload::Comment(_) => EventType::CommentCreated,
            EventPayload::ReviewerChange(_) => EventType::ReviewerAssigned,
        }
    }

    pub fn comment(&self) -> Option<&UnifiedComment> {
        match &self.payload {
            EventPayload::Comment(c) => Some(c),
            _ => None,
        }
    }

    pub fn reviewer_change(&self) -> Option<&UnifiedReviewerChange> {
        match &self.payload {
            EventPayload::ReviewerChange(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnifiedUser {
    pub id: String,
    pub username: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl UnifiedUser {
    /// Name suitable for display: full name, falling back to the handle.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.username
        } else {
            &self.name
        }
    }
}

/// Code anchor of an inline comment. Line numbers refer to the new side of
/// the diff whenever the provider reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnifiedPosition {
    pub file_path: String,
    pub line_number: u32,
    /// `new` or `old`, the diff side the line number was taken from.
    pub line_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedComment {
    /// Unique within provider + merge request.
    pub id: String,
    pub body: String,
    pub created_at: String,
    pub updated_at: String,
    pub author: UnifiedUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<UnifiedPosition>,
    /// Thread key; every comment sharing it belongs to one ordered thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discussion_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to_id: Option<String>,
    /// Provider-generated note (status changes etc.).
    #[serde(default)]
    pub system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedMergeRequest {
    pub id: String,
    /// Display number (GitLab IID, GitHub/Bitbucket PR number).
    pub number: u64,
    pub title: String,
    pub description: String,
    pub state: String,
    pub source_branch: String,
    pub target_branch: String,
    pub author: UnifiedUser,
    pub web_url: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviewers: Vec<UnifiedUser>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedRepository {
    pub id: String,
    pub name: String,
    /// `group/project`, `owner/repo` or `workspace/repo_slug`.
    pub full_name: String,
    pub owner: UnifiedUser,
    pub web_url: String,
}

/// Reviewer assignment delta carried by a merge request update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedReviewerChange {
    /// `added`, `removed` or `updated`.
    pub action: String,
    pub previous_reviewers: Vec<UnifiedUser>,
    pub current_reviewers: Vec<UnifiedUser>,
    pub changed_by: UnifiedUser,
}

impl UnifiedReviewerChange {
    /// Reviewers present now that were not present before.
    pub fn added_reviewers(&self) -> impl Iterator<Item = &UnifiedUser> {
        self.current_reviewers.iter().filter(|cur| {
            !self
                .previous_reviewers
                .iter()
                .any(|prev| same_user(prev, cur))
        })
    }
}

fn same_user(a: &UnifiedUser, b: &UnifiedUser) -> bool {
    if !a.id.is_empty() && !b.id.is_empty() {
        return a.id == b.id;
    }
    !a.username.is_empty() && a.username == b.username
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnifiedCommitAuthor {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnifiedCommit {
    pub sha: String,
    pub message: String,
    pub author: UnifiedCommitAuthor,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
}

impl UnifiedCommit {
    /// First line of the commit message.
    pub fn title(&self) -> &str {
        self.message.lines().next().unwrap_or("").trim()
    }

    pub fn short_sha(&self) -> &str {
        match self.sha.char_indices().nth(8) {
            Some((idx, _)) => &self.sha[..idx],
            None => &self.sha,
        }
    }
}

/// A provider thread: an id plus its notes in provider order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedDiscussion {
    pub id: String,
    pub notes: Vec<UnifiedComment>,
}

/// Identity of the account the pipeline posts as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: String,
    pub username: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, username: &str) -> UnifiedUser {
        UnifiedUser {
            id: id.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    #[test]
    fn added_reviewers_compares_by_id_then_username() {
        let change = UnifiedReviewerChange {
            action: "updated".into(),
            previous_reviewers: vec![user("1", "alice")],
            current_reviewers: vec![user("1", "alice"), user("", "reviewbot")],
            changed_by: user("1", "alice"),
        };

        let added: Vec<_> = change.added_reviewers().map(|u| u.username.as_str()).collect();
        assert_eq!(added, vec!["reviewbot"]);
    }

    #[test]
    fn short_sha_handles_short_ids() {
        let mut commit = UnifiedCommit {
            sha: "abc".into(),
            message: "fix: thing\n\nbody".into(),
            author: UnifiedCommitAuthor::default(),
            timestamp: String::new(),
            web_url: None,
        };
        assert_eq!(commit.short_sha(), "abc");
        commit.sha = "0123456789abcdef".into();
        assert_eq!(commit.short_sha(), "01234567");
        assert_eq!(commit.title(), "fix: thing");
    }
}
