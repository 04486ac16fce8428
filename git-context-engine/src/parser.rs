//! Utilities for parsing unified diffs.

use crate::errors::{GitContextEngineDiffParseError, GitContextEngineResult};
use crate::git_providers::types::{DiffHunk, DiffLine, FileChange};

/// Heuristic to detect whether a unified diff text represents a binary patch.
///
/// This checks for common markers like `GIT binary patch`, `Binary files differ`
/// and the presence of NUL bytes.
pub fn looks_like_binary_patch(diff: &str) -> bool {
    if diff.contains("GIT binary patch") {
        return true;
    }
    if diff.contains("Binary files") || diff.contains("Files ") && diff.contains(" differ") {
        return true;
    }
    diff.bytes().any(|b| b == 0)
}

/// Parses a unified diff text into a list of hunks.
///
/// Understands `@@ -<old_start>,<old_lines> +<new_start>,<new_lines> @@`
/// headers and classifies following lines as added/removed/context. Header
/// counters are used as starting positions only, not validated. Lines that
/// are neither (`diff --git`, `index`, ...) close the current hunk.
pub fn parse_unified_diff_advanced(diff: &str) -> Vec<DiffHunk> {
    let mut hunks: Vec<DiffHunk> = Vec::new();
    let mut current: Option<DiffHunk> = None;
    let mut old_no = 0u32;
    let mut new_no = 0u32;

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("@@") {
            if let Some(h) = current.take() {
                hunks.push(h);
            }

            // Skip invalid headers instead of failing the whole diff.
            let Ok(header) = parse_hunk_header(rest) else {
                continue;
            };

            old_no = header.old_start;
            new_no = header.new_start;
            current = Some(DiffHunk {
                old_start: header.old_start,
                old_lines: header.old_lines,
                new_start: header.new_start,
                new_lines: header.new_lines,
                lines: Vec::new(),
            });
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            continue;
        };

        if line.starts_with("\\") {
            // "\ No newline at end of file"
            continue;
        }

        if let Some(content) = line.strip_prefix('+') {
            hunk.lines.push(DiffLine::Added {
                new_line: new_no,
                content: content.to_string(),
            });
            new_no += 1;
        } else if let Some(content) = line.strip_prefix('-') {
            hunk.lines.push(DiffLine::Removed {
                old_line: old_no,
                content: content.to_string(),
            });
            old_no += 1;
        } else if line.is_empty() || line.starts_with(' ') {
            hunk.lines.push(DiffLine::Context {
                old_line: old_no,
                new_line: new_no,
                content: line.get(1..).unwrap_or_default().to_string(),
            });
            old_no += 1;
            new_no += 1;
        } else if let Some(h) = current.take() {
            hunks.push(h);
        }
    }

    if let Some(h) = current {
        hunks.push(h);
    }

    hunks
}

/// Splits a multi-file `git diff` text into file changes.
///
/// Paths come from the `---`/`+++` lines, falling back to the `diff --git`
/// header; `/dev/null` marks added or deleted files.
pub fn split_git_diff(raw: &str) -> Vec<FileChange> {
    let mut files = Vec::new();

    for part in raw.split("diff --git ").filter(|p| !p.trim().is_empty()) {
        let mut old_path = part
            .lines()
            .find_map(|l| l.strip_prefix("--- "))
            .map(strip_diff_prefix);
        let mut new_path = part
            .lines()
            .find_map(|l| l.strip_prefix("+++ "))
            .map(strip_diff_prefix);

        if old_path.is_none() && new_path.is_none() {
            // Binary or mode-only changes carry paths in the header only.
            let header = part.lines().next().unwrap_or_default();
            if let Some((a, b)) = header.split_once(" b/") {
                old_path = Some(strip_diff_prefix(a));
                new_path = Some(b.trim().to_string());
            }
        }

        let is_new = old_path.as_deref() == Some("/dev/null") || part.contains("\nnew file mode");
        let is_deleted =
            new_path.as_deref() == Some("/dev/null") || part.contains("\ndeleted file mode");
        let old_path = old_path.filter(|p| p != "/dev/null");
        let new_path = new_path.filter(|p| p != "/dev/null");
        let is_renamed = !is_new && !is_deleted && old_path.is_some() && old_path != new_path;

        let is_binary = looks_like_binary_patch(part);
        let hunks = if is_binary {
            Vec::new()
        } else {
            parse_unified_diff_advanced(part)
        };

        files.push(FileChange {
            old_path,
            new_path,
            is_new,
            is_deleted,
            is_renamed,
            is_binary,
            hunks,
        });
    }

    files
}

fn strip_diff_prefix(path: &str) -> String {
    let path = path.trim();
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
        .to_string()
}

struct HunkHeader {
    old_start: u32,
    old_lines: u32,
    new_start: u32,
    new_lines: u32,
}

fn parse_hunk_header(rest: &str) -> GitContextEngineResult<HunkHeader> {
    // rest looks like: " -1,5 +1,7 @@ optional text"
    let s = rest.trim();
    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(GitContextEngineDiffParseError::InvalidHunkHeader(s.to_string()).into());
    }

    let old_part = parts[0]
        .strip_prefix('-')
        .ok_or_else(|| GitContextEngineDiffParseError::InvalidHunkHeader(s.to_string()))?;
    let new_part = parts[1]
        .strip_prefix('+')
        .ok_or_else(|| GitContextEngineDiffParseError::InvalidHunkHeader(s.to_string()))?;

    let (old_start, old_lines) = split_range(old_part)?;
    let (new_start, new_lines) = split_range(new_part)?;

    Ok(HunkHeader {
        old_start,
        old_lines,
        new_start,
        new_lines,
    })
}

fn split_range(s: &str) -> GitContextEngineResult<(u32, u32)> {
    let mut it = s.split(',');
    let start = it
        .next()
        .ok_or_else(|| GitContextEngineDiffParseError::InvalidHunkHeader(s.to_string()))?;
    // An omitted length means a single line.
    let len = it.next().unwrap_or("1");

    let start: u32 = start
        .parse()
        .map_err(|_| GitContextEngineDiffParseError::InvalidHunkHeader(s.to_string()))?;
    let len: u32 = len
        .parse()
        .map_err(|_| GitContextEngineDiffParseError::InvalidHunkHeader(s.to_string()))?;

    Ok((start, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "@@ -10,3 +10,4 @@ fn main() {\n let a = 1;\n-let b = 2;\n+let b = 3;\n+let c = 4;\n }\n";

    #[test]
    fn numbers_lines_from_hunk_header() {
        let hunks = parse_unified_diff_advanced(DIFF);
        assert_eq!(hunks.len(), 1);
        let h = &hunks[0];
        assert_eq!((h.old_start, h.old_lines, h.new_start, h.new_lines), (10, 3, 10, 4));
        assert_eq!(
            h.lines,
            vec![
                DiffLine::Context { old_line: 10, new_line: 10, content: "let a = 1;".into() },
                DiffLine::Removed { old_line: 11, content: "let b = 2;".into() },
                DiffLine::Added { new_line: 11, content: "let b = 3;".into() },
                DiffLine::Added { new_line: 12, content: "let c = 4;".into() },
                DiffLine::Context { old_line: 12, new_line: 13, content: "}".into() },
            ]
        );
    }

    #[test]
    fn invalid_header_is_skipped() {
        let hunks = parse_unified_diff_advanced("@@ garbage @@\n+x\n@@ -1 +1 @@\n-y\n+z\n");
        assert_eq!(hunks.len(), 1);
        assert_eq!((hunks[0].old_lines, hunks[0].new_lines), (1, 1));
    }

    #[test]
    fn splits_multi_file_diff() {
        let raw = "diff --git a/src/a.rs b/src/a.rs\nindex 1..2 100644\n--- a/src/a.rs\n+++ b/src/a.rs\n@@ -1,1 +1,1 @@\n-old\n+new\n\
diff --git a/new.txt b/new.txt\nnew file mode 100644\n--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,1 @@\n+hello\n\
diff --git a/logo.png b/logo.png\nBinary files a/logo.png and b/logo.png differ\n";

        let files = split_git_diff(raw);
        assert_eq!(files.len(), 3);

        assert_eq!(files[0].new_path.as_deref(), Some("src/a.rs"));
        assert_eq!(files[0].hunks.len(), 1);

        assert!(files[1].is_new);
        assert_eq!(files[1].old_path, None);
        assert_eq!(files[1].new_path.as_deref(), Some("new.txt"));

        assert!(files[2].is_binary);
        assert_eq!(files[2].new_path.as_deref(), Some("logo.png"));
        assert!(files[2].hunks.is_empty());
    }
}
