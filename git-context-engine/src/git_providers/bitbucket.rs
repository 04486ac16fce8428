//! Bitbucket Cloud provider (REST v2): PR metadata, diffs, conversation
//! history and write-back.
//!
//! Endpoints used:
//!   * GET  /repositories/{workspace}/{repo_slug}/pullrequests/{id}
//!   * GET  /repositories/{workspace}/{repo_slug}/pullrequests/{id}/diff
//!   * GET  /repositories/{workspace}/{repo_slug}/pullrequests/{id}/commits
//!   * GET  /repositories/{workspace}/{repo_slug}/pullrequests/{id}/comments
//!   * GET  /user
//!   * POST /repositories/{workspace}/{repo_slug}/pullrequests/{id}/comments

use std::collections::{BTreeMap, HashMap};

use crate::errors::{GitContextEngineError, GitContextEngineResult};
use crate::git_providers::types::*;
use crate::parser::split_git_diff;
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

/// Bitbucket Cloud HTTP client wrapper.
#[derive(Debug, Clone)]
pub struct BitbucketClient {
    http: Client,
    base_api: String, // "https://api.bitbucket.org/2.0"
    auth: String,     // "Bearer <token>" or "Basic <...>"
}

impl BitbucketClient {
    /// Constructs a Bitbucket client. A bare token is sent as a bearer token.
    pub fn new(http: Client, base_api: String, token: String) -> Self {
        debug!("Creating BitbucketClient with base_api={}", base_api);
        let auth = if token.starts_with("Bearer ") || token.starts_with("Basic ") {
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
        self.http.get(url).header("Authorization", &self.auth)
    }

    fn post(&self, url: &str) -> RequestBuilder {
        self.http
            .post(url)
            .header("Authorization", &self.auth)
            .header("Content-Type", "application/json")
    }

    fn pr_url(&self, full_name: &str, id: u64) -> GitContextEngineResult<String> {
        let (workspace, repo_slug) = split_workspace_repo(full_name)?;
        Ok(format!(
            "{}/repositories/{}/{}/pullrequests/{}",
            self.base_api, workspace, repo_slug, id
        ))
    }

    /// Follows the `next` links of a paginated collection.
    async fn get_paged<T: DeserializeOwned>(&self, first: String) -> GitContextEngineResult<Vec<T>> {
        let mut out = Vec::new();
        let mut url = Some(first);

        while let Some(u) = url {
            debug!("Bitbucket page: {}", u);
            let page: BitbucketPage<T> = self
                .get(&u)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            out.extend(page.values);
            url = page.next;
        }

        Ok(out)
    }

    /// Fetches PR metadata including diff refs and author info.
    pub async fn get_meta(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeRequest> {
        let url = self.pr_url(&id.project, id.iid)?;
        debug!("Bitbucket get_meta: {}", url);

        let resp: BitbucketPr = self
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let diff_refs = DiffRefs {
            base_sha: resp.destination.commit.hash.clone(),
            start_sha: None,
            head_sha: resp.source.commit.hash.clone(),
        };

        let author = AuthorInfo {
            id: resp
                .author
                .account_id
                .clone()
                .or(resp.author.uuid.clone())
                .unwrap_or_else(|| resp.author.display_name.clone()),
            username: resp.author.nickname.clone(),
            name: Some(resp.author.display_name.clone()),
        };

        Ok(ChangeRequest {
            provider: ProviderKind::Bitbucket,
            id: id.clone(),
            title: resp.title,
            description: resp.description,
            author,
            state: resp.state,
            web_url: resp.links.html.map(|l| l.href).unwrap_or_default(),
            created_at: resp.created_on,
            updated_at: resp.updated_on.unwrap_or(resp.created_on),
            source_branch: Some(resp.source.branch.name),
            target_branch: Some(resp.destination.branch.name),
            diff_refs,
        })
    }

    /// Bitbucket returns a single unified diff text for the whole PR; it is
    /// split into per-file changes on `diff --git` markers.
    pub async fn get_changeset(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeSet> {
        let url = format!("{}/diff", self.pr_url(&id.project, id.iid)?);
        debug!("Bitbucket get_changeset: {}", url);

        let raw = self
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        Ok(ChangeSet {
            files: split_git_diff(&raw),
            is_truncated: false,
        })
    }

    /// Posts one review comment. Inline anchors use `to` for the new side and
    /// `from` for the old side.
    pub async fn post_comment(
        &self,
        meta: &ChangeRequest,
        comment: &ReviewComment,
    ) -> GitContextEngineResult<()> {
        let inline = comment.location.as_ref().map(|loc| match loc.side {
            CommentSide::Right => BitbucketInline {
                path: &loc.file_path,
                to: Some(loc.line),
                from: None,
            },
            CommentSide::Left => BitbucketInline {
                path: &loc.file_path,
                to: None,
                from: Some(loc.line),
            },
        });

        self.create_comment(&meta.id.project, meta.id.iid, &comment.body, inline, None)
            .await
    }

    async fn create_comment(
        &self,
        full_name: &str,
        id: u64,
        body: &str,
        inline: Option<BitbucketInline<'_>>,
        parent: Option<u64>,
    ) -> GitContextEngineResult<()> {
        let url = format!("{}/comments", self.pr_url(full_name, id)?);
        debug!("Bitbucket create_comment: {} parent={:?}", url, parent);

        let payload = BitbucketCommentCreate {
            content: BitbucketContent { raw: body },
            inline,
            parent: parent.map(|id| BitbucketParent { id }),
        };

        self.post(&url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn create_pr_comment(
        &self,
        full_name: &str,
        id: u64,
        body: &str,
    ) -> GitContextEngineResult<()> {
        self.create_comment(full_name, id, body, None, None).await
    }

    pub async fn reply_to_comment(
        &self,
        full_name: &str,
        id: u64,
        parent_id: &str,
        body: &str,
    ) -> GitContextEngineResult<()> {
        let parent = parent_id.parse::<u64>().map_err(|_| {
            GitContextEngineError::Validation(format!("invalid Bitbucket comment id '{parent_id}'"))
        })?;
        self.create_comment(full_name, id, body, None, Some(parent)).await
    }

    pub async fn list_commits(
        &self,
        full_name: &str,
        id: u64,
    ) -> GitContextEngineResult<Vec<UnifiedCommit>> {
        let url = format!("{}/commits", self.pr_url(full_name, id)?);
        let raw: Vec<BitbucketCommit> = self.get_paged(url).await?;

        Ok(raw
            .into_iter()
            .map(|c| UnifiedCommit {
                sha: c.hash,
                message: c.message.unwrap_or(c.summary.map(|s| s.raw).unwrap_or_default()),
                author: UnifiedCommitAuthor {
                    name: c
                        .author
                        .as_ref()
                        .and_then(|a| a.user.as_ref().map(|u| u.display_name.clone()))
                        .or_else(|| c.author.as_ref().map(|a| a.raw.clone()))
                        .unwrap_or_default(),
                    email: String::new(),
                },
                timestamp: c.date,
                web_url: c.links.and_then(|l| l.html).map(|h| h.href),
            })
            .collect())
    }

    /// All PR comments grouped into threads keyed by their root comment id.
    pub async fn list_threads(
        &self,
        full_name: &str,
        id: u64,
    ) -> GitContextEngineResult<Vec<UnifiedDiscussion>> {
        let url = format!("{}/comments", self.pr_url(full_name, id)?);
        let raw: Vec<BitbucketComment> = self.get_paged(url).await?;
        Ok(group_threads(raw))
    }

    /// Thread containing `discussion_id`. Webhooks key replies by their direct
    /// parent, which may itself be a nested reply, so any member id matches.
    pub async fn get_thread(
        &self,
        full_name: &str,
        id: u64,
        discussion_id: &str,
    ) -> GitContextEngineResult<UnifiedDiscussion> {
        self.list_threads(full_name, id)
            .await?
            .into_iter()
            .find(|t| t.id == discussion_id || t.notes.iter().any(|n| n.id == discussion_id))
            .ok_or_else(|| {
                GitContextEngineError::Validation(format!(
                    "comment thread '{discussion_id}' not found"
                ))
            })
    }

    pub async fn current_user(&self) -> GitContextEngineResult<BotIdentity> {
        let url = format!("{}/user", self.base_api);
        let user: BitbucketUser = self
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let unified = user.to_unified();
        Ok(BotIdentity {
            id: unified.id,
            username: unified.username,
            name: unified.name,
        })
    }
}

fn group_threads(raw: Vec<BitbucketComment>) -> Vec<UnifiedDiscussion> {
    let parents: HashMap<u64, Option<u64>> = raw
        .iter()
        .map(|c| (c.id, c.parent.as_ref().map(|p| p.id)))
        .collect();

    let root_of = |mut id: u64| {
        // Bounded walk; a malformed parent cycle stops at the depth limit.
        for _ in 0..64 {
            match parents.get(&id).copied().flatten() {
                Some(parent) => id = parent,
                None => break,
            }
        }
        id
    };

    let mut threads: Vec<UnifiedDiscussion> = Vec::new();
    for c in raw.into_iter().filter(|c| !c.deleted) {
        let root = root_of(c.id).to_string();
        let mut note = c.into_unified();
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

/// Parses `https://bitbucket.org/workspace/repo/pull-requests/12`.
pub fn parse_pull_request_url(url: &str) -> GitContextEngineResult<ChangeRequestId> {
    let invalid = || {
        GitContextEngineError::Validation(format!(
            "invalid Bitbucket pull request url '{url}', expected '<workspace>/<repo>/pull-requests/<id>'"
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

    let pos = segments
        .iter()
        .position(|s| *s == "pull-requests" || *s == "pullrequests")
        .ok_or_else(invalid)?;
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

/// Splits "workspace/repo_slug" into components or returns a validation error.
fn split_workspace_repo(project: &str) -> GitContextEngineResult<(String, String)> {
    let mut parts = project.split('/');
    let workspace = parts.next().unwrap_or("").trim();
    let repo = parts.next().unwrap_or("").trim();

    if workspace.is_empty() || repo.is_empty() || parts.next().is_some() {
        return Err(GitContextEngineError::Validation(format!(
            "invalid Bitbucket project id '{}', expected 'workspace/repo_slug'",
            project
        )));
    }

    Ok((workspace.to_string(), repo.to_string()))
}

#[derive(Debug, Deserialize)]
struct BitbucketPage<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

/// Bitbucket PR response (subset).
#[derive(Debug, Deserialize)]
struct BitbucketPr {
    title: String,
    description: Option<String>,
    state: String,
    created_on: DateTime<Utc>,
    updated_on: Option<DateTime<Utc>>,
    author: BitbucketUser,
    source: BitbucketPrBranch,
    destination: BitbucketPrBranch,
    links: BitbucketLinks,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct BitbucketUser {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub links: Option<BitbucketLinks>,
}

impl BitbucketUser {
    pub(crate) fn to_unified(&self) -> UnifiedUser {
        UnifiedUser {
            id: self
                .account_id
                .clone()
                .or_else(|| self.uuid.clone())
                .unwrap_or_default(),
            username: self
                .username
                .clone()
                .or_else(|| self.nickname.clone())
                .unwrap_or_default(),
            name: self.display_name.clone(),
            web_url: self
                .links
                .as_ref()
                .and_then(|l| l.html.as_ref())
                .map(|h| h.href.clone()),
            avatar_url: self
                .links
                .as_ref()
                .and_then(|l| l.avatar.as_ref())
                .map(|h| h.href.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct BitbucketLinks {
    #[serde(default)]
    pub html: Option<BitbucketLink>,
    #[serde(default)]
    pub avatar: Option<BitbucketLink>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct BitbucketLink {
    #[serde(default)]
    pub href: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketPrBranch {
    branch: BitbucketBranch,
    commit: BitbucketCommitRef,
}

#[derive(Debug, Deserialize)]
struct BitbucketBranch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketCommitRef {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketCommit {
    hash: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    summary: Option<BitbucketRendered>,
    #[serde(default)]
    date: String,
    #[serde(default)]
    author: Option<BitbucketCommitAuthor>,
    #[serde(default)]
    links: Option<BitbucketLinks>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct BitbucketRendered {
    #[serde(default)]
    pub raw: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketCommitAuthor {
    #[serde(default)]
    raw: String,
    #[serde(default)]
    user: Option<BitbucketUser>,
}

/// PR comment as returned by the API and embedded in webhook payloads.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct BitbucketComment {
    pub id: u64,
    #[serde(default)]
    pub content: BitbucketRendered,
    #[serde(default)]
    pub user: BitbucketUser,
    #[serde(default)]
    pub created_on: String,
    #[serde(default)]
    pub updated_on: String,
    #[serde(default)]
    pub parent: Option<BitbucketCommentRef>,
    #[serde(default)]
    pub inline: Option<BitbucketInlineInfo>,
    #[serde(default)]
    pub links: Option<BitbucketLinks>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BitbucketCommentRef {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BitbucketInlineInfo {
    pub path: String,
    #[serde(default)]
    pub from: Option<u32>,
    #[serde(default)]
    pub to: Option<u32>,
}

impl BitbucketComment {
    /// Thread key: parent id for replies, own id for thread roots.
    pub(crate) fn thread_id(&self) -> String {
        self.parent
            .as_ref()
            .map(|p| p.id)
            .unwrap_or(self.id)
            .to_string()
    }

    pub(crate) fn into_unified(self) -> UnifiedComment {
        let position = self.inline.as_ref().map(|i| match (i.to, i.from) {
            (Some(to), _) => UnifiedPosition {
                file_path: i.path.clone(),
                line_number: to,
                line_type: "new".to_string(),
                start_line: None,
            },
            (None, from) => UnifiedPosition {
                file_path: i.path.clone(),
                line_number: from.unwrap_or(0),
                line_type: "old".to_string(),
                start_line: None,
            },
        });

        let mut metadata = BTreeMap::new();
        metadata.insert("provider".to_string(), "bitbucket".into());

        UnifiedComment {
            id: self.id.to_string(),
            discussion_id: Some(self.thread_id()),
            in_reply_to_id: self.parent.as_ref().map(|p| p.id.to_string()),
            author: self.user.to_unified(),
            body: self.content.raw,
            created_at: self.created_on,
            updated_at: self.updated_on,
            position,
            system: false,
            web_url: self.links.and_then(|l| l.html).map(|h| h.href),
            metadata,
        }
    }
}

/// Comment creation payload.
#[derive(Debug, Serialize)]
struct BitbucketCommentCreate<'a> {
    content: BitbucketContent<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline: Option<BitbucketInline<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<BitbucketParent>,
}

#[derive(Debug, Serialize)]
struct BitbucketContent<'a> {
    raw: &'a str,
}

#[derive(Debug, Serialize)]
struct BitbucketParent {
    id: u64,
}

#[derive(Debug, Serialize)]
struct BitbucketInline<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: u64, parent: Option<u64>) -> BitbucketComment {
        BitbucketComment {
            id,
            content: BitbucketRendered {
                raw: format!("c{id}"),
            },
            parent: parent.map(|id| BitbucketCommentRef { id }),
            ..Default::default()
        }
    }

    #[test]
    fn parses_pull_request_url() {
        let id = parse_pull_request_url("https://bitbucket.org/team/api/pull-requests/9/overview")
            .unwrap();
        assert_eq!(id.project, "team/api");
        assert_eq!(id.iid, 9);
        assert!(parse_pull_request_url("https://bitbucket.org/team/api/src/main").is_err());
    }

    #[test]
    fn nested_replies_collapse_into_root_thread() {
        let mut deleted = comment(4, None);
        deleted.deleted = true;

        let threads = group_threads(vec![
            comment(1, None),
            comment(2, Some(1)),
            comment(3, Some(2)),
            deleted,
        ]);

        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, "1");
        let ids: Vec<_> = threads[0].notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn inline_anchor_prefers_destination_line() {
        let mut c = comment(7, None);
        c.inline = Some(BitbucketInlineInfo {
            path: "app.py".into(),
            from: Some(3),
            to: Some(5),
        });
        let pos = c.into_unified().position.unwrap();
        assert_eq!((pos.line_number, pos.line_type.as_str()), (5, "new"));
    }
}
