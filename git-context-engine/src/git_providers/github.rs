//! GitHub provider (REST v3): PR metadata, diffs, conversation history and
//! write-back.
//!
//! Endpoints used:
//!   * GET  /repos/{owner}/{repo}/pulls/{number}
//!   * GET  /repos/{owner}/{repo}/pulls/{number}/files
//!   * GET  /repos/{owner}/{repo}/pulls/{number}/commits
//!   * GET  /repos/{owner}/{repo}/pulls/{number}/comments
//!   * GET  /repos/{owner}/{repo}/issues/{number}/comments
//!   * GET  /user
//!   * POST /repos/{owner}/{repo}/pulls/{number}/comments[/{id}/replies]
//!   * POST /repos/{owner}/{repo}/issues/{number}/comments
//!   * POST /repos/{owner}/{repo}/{pulls|issues}/comments/{id}/reactions

use std::collections::BTreeMap;

use crate::errors::{GitContextEngineError, GitContextEngineResult};
use crate::git_providers::types::*;
use crate::parser::{looks_like_binary_patch, parse_unified_diff_advanced};
use crate::unified::{
    BotIdentity, UnifiedComment, UnifiedCommit, UnifiedCommitAuthor, UnifiedDiscussion,
    UnifiedPosition, UnifiedUser,
};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

const MAX_PAGES: usize = 20;

/// GitHub HTTP client wrapper.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: Client,
    base_api: String, // "https://api.github.com"
    auth: String,     // "Bearer <token>"
}

impl GitHubClient {
    /// Constructs a GitHub client. A bare token is sent as a bearer token.
    pub fn new(http: Client, base_api: String, token: String) -> Self {
        debug!("Creating GitHubClient with base_api={}", base_api);
        let auth = if token.starts_with("Bearer ") || token.starts_with("token ") {
            token
        } else {
            format!("Bearer {token}")
        };
        Self {
            http,
            base_api: base_api.trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn get(&self, url: &str) -> RequestBuilder {
        self.http
            .get(url)
            .header("Authorization", &self.auth)
            .header("Accept", "application/vnd.github+json")
    }

    fn post(&self, url: &str) -> RequestBuilder {
        self.http
            .post(url)
            .header("Authorization", &self.auth)
            .header("Accept", "application/vnd.github+json")
    }

    fn repo_url(&self, full_name: &str) -> GitContextEngineResult<String> {
        let (owner, repo) = split_owner_repo(full_name)?;
        Ok(format!("{}/repos/{}/{}", self.base_api, owner, repo))
    }

    /// Pages through a list endpoint, 100 items per page.
    async fn get_list<T: DeserializeOwned>(&self, url: &str) -> GitContextEngineResult<Vec<T>> {
        let mut out = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut items: Vec<T> = self
                .get(url)
                .query(&[("per_page", "100"), ("page", &page.to_string())])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let done = items.len() < 100;
            out.append(&mut items);
            if done {
                break;
            }
        }
        Ok(out)
    }

    /// Fetches PR metadata including diff refs and author info.
    pub async fn get_meta(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeRequest> {
        let url = format!("{}/pulls/{}", self.repo_url(&id.project)?, id.iid);
        debug!("GitHub get_meta: {}", url);

        let resp: GitHubPr = self
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let diff_refs = DiffRefs {
            base_sha: resp.base.sha,
            start_sha: None,
            head_sha: resp.head.sha,
        };

        let author = AuthorInfo {
            id: resp.user.id.to_string(),
            username: Some(resp.user.login.clone()),
            name: resp.user.name.or(Some(resp.user.login)),
        };

        Ok(ChangeRequest {
            provider: ProviderKind::GitHub,
            id: id.clone(),
            title: resp.title,
            description: resp.body,
            author,
            state: resp.state,
            web_url: resp.html_url,
            created_at: resp.created_at,
            updated_at: resp.updated_at,
            source_branch: Some(resp.head.r#ref),
            target_branch: Some(resp.base.r#ref),
            diff_refs,
        })
    }

    /// Fetches file-level diffs and parses them into hunks/lines.
    pub async fn get_changeset(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeSet> {
        let url = format!("{}/pulls/{}/files", self.repo_url(&id.project)?, id.iid);
        debug!("GitHub get_changeset: {}", url);

        let files: Vec<GitHubPrFile> = self.get_list(&url).await?;

        let changes = files
            .into_iter()
            .map(|f| {
                let is_binary = f.patch.as_deref().is_none_or(looks_like_binary_patch);
                let hunks = match &f.patch {
                    Some(p) if !is_binary => parse_unified_diff_advanced(p),
                    _ => Vec::new(),
                };

                let (old_path, new_path, is_new, is_deleted, is_renamed) = match f.status.as_str() {
                    "added" => (None, Some(f.filename), true, false, false),
                    "removed" => (Some(f.filename), None, false, true, false),
                    "renamed" => (f.previous_filename, Some(f.filename), false, false, true),
                    _ => (Some(f.filename.clone()), Some(f.filename), false, false, false),
                };

                FileChange {
                    old_path,
                    new_path,
                    is_new,
                    is_deleted,
                    is_renamed,
                    is_binary,
                    hunks,
                }
            })
            .collect();

        Ok(ChangeSet {
            files: changes,
            is_truncated: false,
        })
    }

    /// Posts one review comment: inline comments go through the review
    /// comments API on the head commit, general ones onto the PR conversation.
    pub async fn post_comment(
        &self,
        meta: &ChangeRequest,
        comment: &ReviewComment,
    ) -> GitContextEngineResult<()> {
        let Some(loc) = &comment.location else {
            return self
                .create_issue_comment(&meta.id.project, meta.id.iid, &comment.body)
                .await;
        };

        let url = format!("{}/pulls/{}/comments", self.repo_url(&meta.id.project)?, meta.id.iid);
        let side = match loc.side {
            CommentSide::Right => "RIGHT",
            CommentSide::Left => "LEFT",
        };

        let payload = GitHubReviewCommentCreate {
            body: &comment.body,
            commit_id: &meta.diff_refs.head_sha,
            path: &loc.file_path,
            line: loc.line,
            side,
        };

        debug!(
            "Posting GitHub review comment: path={}, line={}, side={}",
            loc.file_path, loc.line, side
        );

        self.post(&url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn list_commits(
        &self,
        full_name: &str,
        number: u64,
    ) -> GitContextEngineResult<Vec<UnifiedCommit>> {
        let url = format!("{}/pulls/{}/commits", self.repo_url(full_name)?, number);
        debug!("GitHub list_commits: {}", url);

        let raw: Vec<GitHubPrCommit> = self.get_list(&url).await?;
        Ok(raw
            .into_iter()
            .map(|c| {
                let (author, timestamp) = match c.commit.author {
                    Some(a) => (
                        UnifiedCommitAuthor {
                            name: a.name,
                            email: a.email.unwrap_or_default(),
                        },
                        a.date,
                    ),
                    None => (UnifiedCommitAuthor::default(), String::new()),
                };
                UnifiedCommit {
                    sha: c.sha,
                    message: c.commit.message,
                    author,
                    timestamp,
                    web_url: Some(c.html_url),
                }
            })
            .collect())
    }

    /// Conversation-tab comments (no code anchor).
    pub async fn list_issue_comments(
        &self,
        full_name: &str,
        number: u64,
    ) -> GitContextEngineResult<Vec<UnifiedComment>> {
        let url = format!("{}/issues/{}/comments", self.repo_url(full_name)?, number);
        debug!("GitHub list_issue_comments: {}", url);

        let raw: Vec<GitHubComment> = self.get_list(&url).await?;
        Ok(raw.into_iter().map(|c| c.into_unified("issue_comment")).collect())
    }

    /// Review comments grouped into threads keyed by their root comment id.
    pub async fn list_review_threads(
        &self,
        full_name: &str,
        number: u64,
    ) -> GitContextEngineResult<Vec<UnifiedDiscussion>> {
        let url = format!("{}/pulls/{}/comments", self.repo_url(full_name)?, number);
        debug!("GitHub list_review_threads: {}", url);

        let raw: Vec<GitHubComment> = self.get_list(&url).await?;
        Ok(group_review_threads(raw))
    }

    /// Thread lookup by the id produced at webhook conversion time: the root
    /// comment id, or `review-<review id>` for top-level review comments.
    pub async fn get_review_thread(
        &self,
        full_name: &str,
        number: u64,
        discussion_id: &str,
    ) -> GitContextEngineResult<UnifiedDiscussion> {
        let url = format!("{}/pulls/{}/comments", self.repo_url(full_name)?, number);
        let raw: Vec<GitHubComment> = self.get_list(&url).await?;

        let notes: Vec<UnifiedComment> = raw
            .into_iter()
            .filter(|c| {
                c.thread_root().to_string() == discussion_id
                    || c
                        .pull_request_review_id
                        .is_some_and(|r| format!("review-{r}") == discussion_id)
            })
            .map(|c| c.into_unified("review_comment"))
            .collect();

        if notes.is_empty() {
            return Err(GitContextEngineError::Validation(format!(
                "review thread '{discussion_id}' not found"
            )));
        }

        Ok(UnifiedDiscussion {
            id: discussion_id.to_string(),
            notes,
        })
    }

    pub async fn current_user(&self) -> GitContextEngineResult<BotIdentity> {
        let url = format!("{}/user", self.base_api);
        let user: GitHubUser = self
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(BotIdentity {
            id: user.id.to_string(),
            name: user.name.unwrap_or_else(|| user.login.clone()),
            username: user.login,
        })
    }

    pub async fn reply_to_review_comment(
        &self,
        full_name: &str,
        number: u64,
        comment_id: &str,
        body: &str,
    ) -> GitContextEngineResult<()> {
        let url = format!(
            "{}/pulls/{}/comments/{}/replies",
            self.repo_url(full_name)?,
            number,
            comment_id
        );
        debug!("GitHub reply_to_review_comment: {}", url);

        self.post(&url)
            .json(&GitHubBody { body })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn create_issue_comment(
        &self,
        full_name: &str,
        number: u64,
        body: &str,
    ) -> GitContextEngineResult<()> {
        let url = format!("{}/issues/{}/comments", self.repo_url(full_name)?, number);
        debug!("GitHub create_issue_comment: {}", url);

        self.post(&url)
            .json(&GitHubBody { body })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Adds a reaction; `review_comment` selects the pulls endpoint.
    pub async fn add_reaction(
        &self,
        full_name: &str,
        comment_id: &str,
        review_comment: bool,
        emoji: &str,
    ) -> GitContextEngineResult<()> {
        let kind = if review_comment { "pulls" } else { "issues" };
        let url = format!(
            "{}/{}/comments/{}/reactions",
            self.repo_url(full_name)?,
            kind,
            comment_id
        );
        let content = reaction_content(emoji);
        debug!("GitHub add_reaction: {} content={}", url, content);

        self.post(&url)
            .json(&GitHubReaction { content })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Maps common emoji names to GitHub's reaction vocabulary.
fn reaction_content(emoji: &str) -> &str {
    match emoji {
        "thumbsup" | "+1" | "thumbs_up" => "+1",
        "thumbsdown" | "-1" => "-1",
        "tada" | "hooray" => "hooray",
        "smile" | "laugh" => "laugh",
        "heart" | "confused" | "rocket" | "eyes" => emoji,
        _ => "eyes",
    }
}

fn group_review_threads(raw: Vec<GitHubComment>) -> Vec<UnifiedDiscussion> {
    let mut threads: Vec<UnifiedDiscussion> = Vec::new();
    for c in raw {
        let root = c.thread_root().to_string();
        let mut note = c.into_unified("review_comment");
        note.discussion_id = Some(root.clone());
        match threads.iter_mut().find(|t| t.id == root) {
            Some(t) => t.notes.push(note),
            None => threads.push(UnifiedDiscussion {
                id: root,
                notes: vec![note],
            }),
        }
    }
    threads
}

/// Parses `https://github.com/owner/repo/pull/12`.
pub fn parse_pull_request_url(url: &str) -> GitContextEngineResult<ChangeRequestId> {
    let invalid = || {
        GitContextEngineError::Validation(format!(
            "invalid GitHub pull request url '{url}', expected '<owner>/<repo>/pull/<number>'"
        ))
    };

    let without_scheme = url
        .trim()
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url.trim());
    let segments: Vec<&str> = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let pos = segments.iter().position(|s| *s == "pull" || *s == "pulls").ok_or_else(invalid)?;
    if pos < 3 {
        return Err(invalid());
    }
    let number = segments
        .get(pos + 1)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(invalid)?;

    Ok(ChangeRequestId {
        project: format!("{}/{}", segments[pos - 2], segments[pos - 1]),
        iid: number,
    })
}

/// Splits "owner/repo" into components or returns a validation error.
fn split_owner_repo(project: &str) -> GitContextEngineResult<(String, String)> {
    let mut parts = project.split('/');
    let owner = parts.next().unwrap_or("").trim();
    let repo = parts.next().unwrap_or("").trim();

    if owner.is_empty() || repo.is_empty() || parts.next().is_some() {
        return Err(GitContextEngineError::Validation(format!(
            "invalid GitHub project id '{}', expected 'owner/repo'",
            project
        )));
    }

    Ok((owner.to_string(), repo.to_string()))
}

/// GitHub PR response (subset).
#[derive(Debug, Deserialize)]
struct GitHubPr {
    title: String,
    body: Option<String>,
    state: String,
    html_url: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    user: GitHubUser,
    base: GitHubRef,
    head: GitHubRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GitHubUser {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl GitHubUser {
    pub(crate) fn to_unified(&self) -> UnifiedUser {
        UnifiedUser {
            id: if self.id == 0 {
                String::new()
            } else {
                self.id.to_string()
            },
            username: self.login.clone(),
            name: self.name.clone().unwrap_or_else(|| self.login.clone()),
            web_url: self.html_url.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GitHubRef {
    #[serde(default, rename = "ref")]
    pub r#ref: String,
    #[serde(default)]
    pub sha: String,
}

/// Issue comment or review comment, as returned by the API and embedded in
/// webhook payloads.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GitHubComment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub user: GitHubUser,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub original_line: Option<u32>,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub in_reply_to_id: Option<u64>,
    #[serde(default)]
    pub pull_request_review_id: Option<u64>,
    #[serde(default)]
    pub diff_hunk: Option<String>,
}

impl GitHubComment {
    pub(crate) fn thread_root(&self) -> u64 {
        self.in_reply_to_id.unwrap_or(self.id)
    }

    pub(crate) fn position(&self) -> Option<UnifiedPosition> {
        let path = self.path.clone().filter(|p| !p.is_empty())?;
        let line_type = match self.side.as_deref() {
            Some("LEFT") => "old",
            _ => "new",
        };
        Some(UnifiedPosition {
            file_path: path,
            line_number: self.line.or(self.original_line).unwrap_or(0),
            line_type: line_type.to_string(),
            start_line: self.start_line.filter(|s| *s != 0),
        })
    }

    pub(crate) fn into_unified(self, comment_type: &str) -> UnifiedComment {
        let mut metadata = BTreeMap::new();
        metadata.insert("comment_type".to_string(), comment_type.into());
        if let Some(hunk) = self.diff_hunk.as_ref().filter(|h| !h.is_empty()) {
            metadata.insert("diff_hunk".to_string(), hunk.clone().into());
        }
        if let Some(review_id) = self.pull_request_review_id {
            metadata.insert("pull_request_review_id".to_string(), review_id.into());
        }

        let discussion_id = match (self.in_reply_to_id, self.pull_request_review_id) {
            (Some(parent), _) => Some(parent.to_string()),
            (None, Some(review)) if comment_type == "review_comment" => Some(format!("review-{review}")),
            _ => None,
        };

        UnifiedComment {
            id: self.id.to_string(),
            position: self.position(),
            author: self.user.to_unified(),
            body: self.body,
            created_at: self.created_at,
            updated_at: self.updated_at,
            discussion_id,
            in_reply_to_id: self.in_reply_to_id.map(|v| v.to_string()),
            system: false,
            web_url: self.html_url,
            metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubPrCommit {
    sha: String,
    html_url: String,
    commit: GitHubCommitInner,
}

#[derive(Debug, Deserialize)]
struct GitHubCommitInner {
    message: String,
    author: Option<GitHubCommitAuthor>,
}

#[derive(Debug, Deserialize)]
struct GitHubCommitAuthor {
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    date: String,
}

#[derive(Debug, Deserialize)]
struct GitHubPrFile {
    filename: String,
    #[serde(default)]
    previous_filename: Option<String>,
    status: String,
    #[serde(default)]
    patch: Option<String>,
}

#[derive(Debug, Serialize)]
struct GitHubReviewCommentCreate<'a> {
    body: &'a str,
    commit_id: &'a str,
    path: &'a str,
    line: u32,
    side: &'a str,
}

#[derive(Debug, Serialize)]
struct GitHubBody<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct GitHubReaction<'a> {
    content: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review_comment(id: u64, reply_to: Option<u64>, review: Option<u64>) -> GitHubComment {
        GitHubComment {
            id,
            body: format!("c{id}"),
            user: GitHubUser {
                id: 1,
                login: "octo".into(),
                ..Default::default()
            },
            path: Some("src/lib.rs".into()),
            line: Some(10),
            in_reply_to_id: reply_to,
            pull_request_review_id: review,
            ..Default::default()
        }
    }

    #[test]
    fn parses_pull_request_url() {
        let id = parse_pull_request_url("https://github.com/acme/widgets/pull/31/files").unwrap();
        assert_eq!(id.project, "acme/widgets");
        assert_eq!(id.iid, 31);
        assert!(parse_pull_request_url("https://github.com/acme/widgets/issues/2").is_err());
    }

    #[test]
    fn replies_share_the_root_thread() {
        let threads = group_review_threads(vec![
            review_comment(100, None, Some(7)),
            review_comment(101, Some(100), Some(8)),
            review_comment(200, None, Some(9)),
        ]);

        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].id, "100");
        assert_eq!(threads[0].notes.len(), 2);
        assert!(threads[0].notes.iter().all(|n| n.discussion_id.as_deref() == Some("100")));
    }

    #[test]
    fn review_comment_conversion_keeps_anchor_and_hunk() {
        let mut c = review_comment(5, None, Some(77));
        c.diff_hunk = Some("@@ -1,2 +1,3 @@".into());
        c.start_line = Some(8);

        let unified = c.into_unified("review_comment");
        assert_eq!(unified.discussion_id.as_deref(), Some("review-77"));
        let pos = unified.position.unwrap();
        assert_eq!((pos.line_number, pos.start_line), (10, Some(8)));
        assert!(unified.metadata.contains_key("diff_hunk"));
    }

    #[test]
    fn unknown_reactions_fall_back_to_eyes() {
        assert_eq!(reaction_content("thumbsup"), "+1");
        assert_eq!(reaction_content("rocket"), "rocket");
        assert_eq!(reaction_content("sparkles"), "eyes");
    }
}
