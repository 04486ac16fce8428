//! Provider-agnostic data model for change requests (MRs / PRs) and diffs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{GitContextEngineConfigError, GitContextEngineResult};

/// Supported Git providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    GitLab,
    GitHub,
    Bitbucket,
}

impl ProviderKind {
    /// Parses a provider type string. Any value starting with `gitlab`,
    /// `github` or `bitbucket` (case-insensitive) is accepted, so connector
    /// flavours like `gitlab-self-hosted` resolve to their family.
    pub fn from_type_str(s: &str) -> GitContextEngineResult<Self> {
        let lower = s.trim().to_ascii_lowercase();
        if lower.starts_with("gitlab") {
            Ok(ProviderKind::GitLab)
        } else if lower.starts_with("github") {
            Ok(ProviderKind::GitHub)
        } else if lower.starts_with("bitbucket") {
            Ok(ProviderKind::Bitbucket)
        } else {
            Err(GitContextEngineConfigError::UnsupportedProvider(s.to_string()).into())
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GitLab => "gitlab",
            ProviderKind::GitHub => "github",
            ProviderKind::Bitbucket => "bitbucket",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `project` is `group/project`, `owner/repo` or `workspace/repo_slug`;
/// `iid` is the MR IID or PR number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRequestId {
    pub project: String,
    pub iid: u64,
}

/// SHAs inline comments are anchored to. Only GitLab reports `start_sha`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffRefs {
    pub base_sha: String,
    pub start_sha: Option<String>,
    pub head_sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorInfo {
    pub id: String,
    pub username: Option<String>,
    pub name: Option<String>,
}

/// Merge request / pull request metadata as returned by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub provider: ProviderKind,
    pub id: ChangeRequestId,
    pub title: String,
    pub description: Option<String>,
    pub author: AuthorInfo,
    pub state: String,
    pub web_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub diff_refs: DiffRefs,
}

/// One changed line inside a diff hunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiffLine {
    Added { new_line: u32, content: String },
    Removed { old_line: u32, content: String },
    Context { old_line: u32, new_line: u32, content: String },
}

impl DiffLine {
    /// Renders the line with its unified-diff prefix.
    pub fn render(&self) -> String {
        match self {
            DiffLine::Added { content, .. } => format!("+{content}"),
            DiffLine::Removed { content, .. } => format!("-{content}"),
            DiffLine::Context { content, .. } => format!(" {content}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    pub fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_lines, self.new_start, self.new_lines
        )
    }

    /// Header plus prefixed lines, newline separated.
    pub fn render(&self) -> String {
        let mut out = self.header();
        for line in &self.lines {
            out.push('\n');
            out.push_str(&line.render());
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub is_new: bool,
    pub is_deleted: bool,
    pub is_renamed: bool,
    pub is_binary: bool,
    pub hunks: Vec<DiffHunk>,
}

impl FileChange {
    /// Path used for display and anchoring: new path unless the file was deleted.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub files: Vec<FileChange>,
    /// Provider cut the diff short; the review still covers what was returned.
    pub is_truncated: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommentSide {
    Left,
    #[default]
    Right,
}

/// Provider-agnostic location of an inline comment within a change request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentLocation {
    /// Path of the file in the repository (new path if renamed).
    pub file_path: String,
    /// 1-based line number in the version selected by `side`.
    pub line: u32,
    #[serde(default)]
    pub side: CommentSide,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Ordering weight: critical > warning > info.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Info => 1,
            Severity::Warning => 2,
            Severity::Critical => 3,
        }
    }
}

/// A review comment ready to be posted. Without a location it is posted as a
/// general merge request note.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewComment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<CommentLocation>,
    pub body: String,
    #[serde(default)]
    pub severity: Severity,
    /// Free-form category (`summary`, `bug`, `style`, ...).
    #[serde(default)]
    pub category: String,
}

impl ReviewComment {
    pub fn general(body: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            location: None,
            body: body.into(),
            severity: Severity::Info,
            category: category.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_type_matches_by_prefix() {
        assert_eq!(ProviderKind::from_type_str("gitlab").unwrap(), ProviderKind::GitLab);
        assert_eq!(
            ProviderKind::from_type_str("GitHub-Enterprise").unwrap(),
            ProviderKind::GitHub
        );
        assert_eq!(
            ProviderKind::from_type_str("bitbucket-cloud").unwrap(),
            ProviderKind::Bitbucket
        );
        assert!(ProviderKind::from_type_str("gitea").is_err());
    }

    #[test]
    fn hunk_renders_as_unified_diff() {
        let hunk = DiffHunk {
            old_start: 3,
            old_lines: 2,
            new_start: 3,
            new_lines: 2,
            lines: vec![
                DiffLine::Context { old_line: 3, new_line: 3, content: "a".into() },
                DiffLine::Removed { old_line: 4, content: "b".into() },
                DiffLine::Added { new_line: 4, content: "c".into() },
            ],
        };
        assert_eq!(hunk.render(), "@@ -3,2 +3,2 @@\n a\n-b\n+c");
    }
}
