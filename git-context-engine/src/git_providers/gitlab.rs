//! GitLab provider (REST v4): MR metadata, diffs, conversation history and
//! write-back.
//!
//! Endpoints used:
//!   * GET  /projects/:id/merge_requests/:iid
//!   * GET  /projects/:id/merge_requests/:iid/diffs
//!   * GET  /projects/:id/merge_requests/:iid/commits
//!   * GET  /projects/:id/merge_requests/:iid/discussions[/:discussion_id]
//!   * GET  /projects/:id/merge_requests/:iid/notes
//!   * GET  /user
//!   * POST /projects/:id/merge_requests/:iid/discussions[/:discussion_id/notes]
//!   * POST /projects/:id/merge_requests/:iid/notes[/:note_id/award_emoji]

use crate::errors::{GitContextEngineError, GitContextEngineResult};
use crate::git_providers::types::*;
use crate::parser::{looks_like_binary_patch, parse_unified_diff_advanced};
use crate::unified::{
    BotIdentity, UnifiedComment, UnifiedCommit, UnifiedCommitAuthor, UnifiedDiscussion,
    UnifiedPosition, UnifiedUser,
};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const PER_PAGE: &str = "100";

/// GitLab HTTP client wrapper.
#[derive(Debug, Clone)]
pub struct GitLabClient {
    http: Client,
    base_api: String, // e.g. "https://gitlab.com/api/v4"
    token: String,    // "PRIVATE-TOKEN"
}

impl GitLabClient {
    /// Constructs a GitLab client with a shared HTTP instance and auth token.
    pub fn new(http: Client, base_api: String, token: String) -> Self {
        debug!("Creating GitLabClient with base_api={}", base_api);
        Self {
            http,
            base_api: base_api.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn mr_url(&self, project: &str, iid: u64) -> String {
        format!(
            "{}/projects/{}/merge_requests/{}",
            self.base_api,
            urlencoding::encode(project),
            iid
        )
    }

    fn get(&self, url: &str) -> RequestBuilder {
        self.http.get(url).header("PRIVATE-TOKEN", &self.token)
    }

    fn post(&self, url: &str) -> RequestBuilder {
        self.http.post(url).header("PRIVATE-TOKEN", &self.token)
    }

    /// Follows `X-Next-Page` until GitLab stops returning one.
    async fn get_all_pages<T: DeserializeOwned>(&self, url: &str) -> GitContextEngineResult<Vec<T>> {
        let mut out = Vec::new();
        let mut page = String::from("1");

        loop {
            let resp = self
                .get(url)
                .query(&[("per_page", PER_PAGE), ("page", page.as_str())])
                .send()
                .await?
                .error_for_status()?;

            let next = resp
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string);

            let mut items: Vec<T> = resp.json().await?;
            out.append(&mut items);

            match next {
                Some(n) => page = n,
                None => break,
            }
        }

        Ok(out)
    }

    /// Fetches merge request metadata including diff refs and author info.
    pub async fn get_meta(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeRequest> {
        let url = self.mr_url(&id.project, id.iid);
        debug!("GitLab get_meta: {}", url);

        let resp: GitLabMr = self
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let diff_refs = resp
            .diff_refs
            .map(|r| DiffRefs {
                base_sha: r.base_sha,
                start_sha: Some(r.start_sha),
                head_sha: r.head_sha,
            })
            .unwrap_or_default();

        let author = AuthorInfo {
            id: resp.author.id.to_string(),
            username: Some(resp.author.username),
            name: Some(resp.author.name),
        };

        Ok(ChangeRequest {
            provider: ProviderKind::GitLab,
            id: id.clone(),
            title: resp.title,
            description: resp.description,
            author,
            state: resp.state,
            web_url: resp.web_url,
            created_at: resp.created_at,
            updated_at: resp.updated_at,
            source_branch: Some(resp.source_branch),
            target_branch: Some(resp.target_branch),
            diff_refs,
        })
    }

    /// Fetches file-level diffs and parses them into hunks/lines.
    ///
    /// Also detects binary patches and provider "truncation" flags.
    pub async fn get_changeset(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeSet> {
        let url = format!("{}/diffs", self.mr_url(&id.project, id.iid));
        debug!("GitLab get_changeset: {}", url);

        let files: Vec<GitLabMrDiffFile> = self.get_all_pages(&url).await?;

        let is_truncated = files
            .iter()
            .any(|f| f.too_large.unwrap_or(false) || f.generated_file.unwrap_or(false));
        if is_truncated {
            warn!(project = %id.project, iid = id.iid, "GitLab reported truncated diffs");
        }

        let changes = files
            .into_iter()
            .map(|f| {
                let is_binary = f.diff.as_deref().is_none_or(looks_like_binary_patch);
                let hunks = match &f.diff {
                    Some(d) if !is_binary => parse_unified_diff_advanced(d),
                    _ => Vec::new(),
                };
                FileChange {
                    old_path: (!f.new_file).then_some(f.old_path),
                    new_path: (!f.deleted_file).then_some(f.new_path),
                    is_new: f.new_file,
                    is_deleted: f.deleted_file,
                    is_renamed: f.renamed_file,
                    is_binary,
                    hunks,
                }
            })
            .collect();

        Ok(ChangeSet {
            files: changes,
            is_truncated,
        })
    }

    /// Posts one review comment: inline comments become positioned
    /// discussions, the rest plain MR notes.
    pub async fn post_comment(
        &self,
        meta: &ChangeRequest,
        comment: &ReviewComment,
    ) -> GitContextEngineResult<()> {
        let Some(loc) = &comment.location else {
            self.create_note(&meta.id.project, meta.id.iid, &comment.body)
                .await?;
            return Ok(());
        };

        let url = format!("{}/discussions", self.mr_url(&meta.id.project, meta.id.iid));
        let start_sha = meta
            .diff_refs
            .start_sha
            .as_deref()
            .unwrap_or(&meta.diff_refs.base_sha);

        let (new_line, old_line) = match loc.side {
            CommentSide::Right => (Some(loc.line), None),
            CommentSide::Left => (None, Some(loc.line)),
        };

        let payload = GitLabDiscussionCreate {
            body: &comment.body,
            position: GitLabPosition {
                base_sha: &meta.diff_refs.base_sha,
                start_sha,
                head_sha: &meta.diff_refs.head_sha,
                position_type: "text",
                new_path: Some(&loc.file_path),
                new_line,
                old_path: Some(&loc.file_path),
                old_line,
            },
        };

        debug!(
            "Posting GitLab inline discussion: path={}, line={}",
            loc.file_path, loc.line
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
        project: &str,
        iid: u64,
    ) -> GitContextEngineResult<Vec<UnifiedCommit>> {
        let url = format!("{}/commits", self.mr_url(project, iid));
        debug!("GitLab list_commits: {}", url);

        let raw: Vec<GitLabMrCommit> = self.get_all_pages(&url).await?;
        Ok(raw.into_iter().map(GitLabMrCommit::into_unified).collect())
    }

    pub async fn list_discussions(
        &self,
        project: &str,
        iid: u64,
    ) -> GitContextEngineResult<Vec<UnifiedDiscussion>> {
        let url = format!("{}/discussions", self.mr_url(project, iid));
        debug!("GitLab list_discussions: {}", url);

        let raw: Vec<GitLabDiscussion> = self.get_all_pages(&url).await?;
        Ok(raw.into_iter().map(GitLabDiscussion::into_unified).collect())
    }

    pub async fn list_notes(
        &self,
        project: &str,
        iid: u64,
    ) -> GitContextEngineResult<Vec<UnifiedComment>> {
        let url = format!("{}/notes", self.mr_url(project, iid));
        debug!("GitLab list_notes: {}", url);

        let raw: Vec<GitLabNote> = self.get_all_pages(&url).await?;
        Ok(raw.into_iter().map(|n| n.into_unified(None)).collect())
    }

    pub async fn get_discussion(
        &self,
        project: &str,
        iid: u64,
        discussion_id: &str,
    ) -> GitContextEngineResult<UnifiedDiscussion> {
        let url = format!(
            "{}/discussions/{}",
            self.mr_url(project, iid),
            urlencoding::encode(discussion_id)
        );
        debug!("GitLab get_discussion: {}", url);

        let raw: GitLabDiscussion = self
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(raw.into_unified())
    }

    /// Identity of the token owner.
    pub async fn current_user(&self) -> GitContextEngineResult<BotIdentity> {
        let url = format!("{}/user", self.base_api);
        let user: GitLabUser = self
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(BotIdentity {
            id: user.id.to_string(),
            username: user.username,
            name: user.name,
        })
    }

    pub async fn reply_to_discussion(
        &self,
        project: &str,
        iid: u64,
        discussion_id: &str,
        body: &str,
    ) -> GitContextEngineResult<()> {
        let url = format!(
            "{}/discussions/{}/notes",
            self.mr_url(project, iid),
            urlencoding::encode(discussion_id)
        );
        debug!("GitLab reply_to_discussion: {}", url);

        self.post(&url)
            .json(&GitLabNoteCreate { body })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn create_note(&self, project: &str, iid: u64, body: &str) -> GitContextEngineResult<()> {
        let url = format!("{}/notes", self.mr_url(project, iid));
        debug!("GitLab create_note: {}", url);

        self.post(&url)
            .json(&GitLabNoteCreate { body })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn award_emoji(
        &self,
        project: &str,
        iid: u64,
        note_id: &str,
        name: &str,
    ) -> GitContextEngineResult<()> {
        let url = format!(
            "{}/notes/{}/award_emoji",
            self.mr_url(project, iid),
            urlencoding::encode(note_id)
        );
        debug!("GitLab award_emoji: {} name={}", url, name);

        self.post(&url)
            .json(&GitLabAwardEmoji { name })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Parses `https://host/group/sub/project/-/merge_requests/12` (the `/-/`
/// segment is optional on older instances).
pub fn parse_merge_request_url(url: &str) -> GitContextEngineResult<ChangeRequestId> {
    let invalid = || {
        GitContextEngineError::Validation(format!(
            "invalid GitLab merge request url '{url}', expected '<project>/-/merge_requests/<iid>'"
        ))
    };

    let without_scheme = url
        .trim()
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url.trim());
    let path = without_scheme.split_once('/').map(|(_, p)| p).ok_or_else(invalid)?;
    let path = path.split(['?', '#']).next().unwrap_or_default();

    let (project, tail) = path.split_once("/merge_requests/").ok_or_else(invalid)?;
    let project = project.trim_end_matches("/-").trim_matches('/');
    let iid = tail
        .split('/')
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(invalid)?;

    if project.is_empty() {
        return Err(invalid());
    }

    Ok(ChangeRequestId {
        project: project.to_string(),
        iid,
    })
}

/// GitLab MR response (subset).
#[derive(Debug, Deserialize)]
struct GitLabMr {
    title: String,
    description: Option<String>,
    web_url: String,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    source_branch: String,
    target_branch: String,
    #[serde(default)]
    diff_refs: Option<GitLabDiffRefs>,
    author: GitLabUser,
}

#[derive(Debug, Deserialize)]
struct GitLabDiffRefs {
    base_sha: String,
    head_sha: String,
    start_sha: String,
}

/// User object as embedded in API responses and webhook payloads.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GitLabUser {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl GitLabUser {
    pub(crate) fn to_unified(&self) -> UnifiedUser {
        UnifiedUser {
            id: if self.id == 0 {
                String::new()
            } else {
                self.id.to_string()
            },
            username: self.username.clone(),
            name: self.name.clone(),
            web_url: self.web_url.clone().filter(|s| !s.is_empty()),
            avatar_url: self.avatar_url.clone().filter(|s| !s.is_empty()),
        }
    }
}

/// Diff anchor of a note.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GitLabNotePosition {
    #[serde(default)]
    pub old_path: Option<String>,
    #[serde(default)]
    pub new_path: Option<String>,
    #[serde(default)]
    pub old_line: Option<u32>,
    #[serde(default)]
    pub new_line: Option<u32>,
    #[serde(default)]
    pub line_range: Option<GitLabLineRange>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GitLabLineRange {
    pub start: GitLabLineRangeEnd,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GitLabLineRangeEnd {
    #[serde(default)]
    pub old_line: Option<u32>,
    #[serde(default)]
    pub new_line: Option<u32>,
}

impl GitLabNotePosition {
    /// New side wins over old side for both path and line.
    pub(crate) fn to_unified(&self) -> Option<UnifiedPosition> {
        let file_path = self
            .new_path
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| self.old_path.clone().filter(|p| !p.is_empty()))?;

        let (line_number, line_type) = match (self.new_line, self.old_line) {
            (Some(n), _) => (n, "new"),
            (None, Some(o)) => (o, "old"),
            (None, None) => (0, "new"),
        };

        let start_line = self
            .line_range
            .as_ref()
            .and_then(|r| r.start.new_line.or(r.start.old_line))
            .filter(|s| *s != line_number);

        Some(UnifiedPosition {
            file_path,
            line_number,
            line_type: line_type.to_string(),
            start_line,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GitLabMrCommit {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    author_name: String,
    #[serde(default)]
    author_email: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    web_url: Option<String>,
}

impl GitLabMrCommit {
    fn into_unified(self) -> UnifiedCommit {
        UnifiedCommit {
            sha: self.id,
            message: if self.message.is_empty() {
                self.title
            } else {
                self.message
            },
            author: UnifiedCommitAuthor {
                name: self.author_name,
                email: self.author_email,
            },
            timestamp: self.created_at,
            web_url: self.web_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitLabDiscussion {
    id: String,
    #[serde(default)]
    notes: Vec<GitLabNote>,
}

impl GitLabDiscussion {
    fn into_unified(self) -> UnifiedDiscussion {
        let id = self.id;
        let notes = self
            .notes
            .into_iter()
            .map(|n| n.into_unified(Some(&id)))
            .collect();
        UnifiedDiscussion { id, notes }
    }
}

#[derive(Debug, Deserialize)]
struct GitLabNote {
    id: u64,
    #[serde(default)]
    body: String,
    #[serde(default)]
    author: GitLabUser,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    system: bool,
    #[serde(default)]
    position: Option<GitLabNotePosition>,
    #[serde(default, rename = "type")]
    note_type: Option<String>,
}

impl GitLabNote {
    fn into_unified(self, discussion_id: Option<&str>) -> UnifiedComment {
        let mut metadata = std::collections::BTreeMap::new();
        if let Some(t) = self.note_type {
            metadata.insert("note_type".to_string(), serde_json::Value::String(t));
        }
        UnifiedComment {
            id: self.id.to_string(),
            body: self.body,
            created_at: self.created_at,
            updated_at: self.updated_at,
            author: self.author.to_unified(),
            position: self.position.as_ref().and_then(GitLabNotePosition::to_unified),
            discussion_id: discussion_id.map(str::to_string),
            in_reply_to_id: None,
            system: self.system,
            web_url: None,
            metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitLabMrDiffFile {
    old_path: String,
    new_path: String,
    new_file: bool,
    renamed_file: bool,
    deleted_file: bool,
    #[serde(default)]
    too_large: Option<bool>,
    #[serde(default)]
    generated_file: Option<bool>,
    #[serde(default)]
    diff: Option<String>, // unified diff; None for binary/too large
}

#[derive(Debug, Serialize)]
struct GitLabPosition<'a> {
    base_sha: &'a str,
    start_sha: &'a str,
    head_sha: &'a str,
    position_type: &'static str, // always "text" here
    #[serde(skip_serializing_if = "Option::is_none")]
    new_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_line: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GitLabDiscussionCreate<'a> {
    body: &'a str,
    position: GitLabPosition<'a>,
}

#[derive(Debug, Serialize)]
struct GitLabNoteCreate<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct GitLabAwardEmoji<'a> {
    name: &'a str,
}
