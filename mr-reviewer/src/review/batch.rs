//! Token-budgeted batching of diffs and the retrying batch runner.
//!
//! Flow:
//!   1) drop binary files (extension list, NUL byte, non-printable ratio);
//!   2) split hunks that exceed the budget line-wise, each piece with a fresh
//!      `@@ -a,b +c,d @@` header;
//!   3) pack files and pieces greedily into batches whose estimated size never
//!      exceeds `max_batch_tokens`;
//!   4) run batches one after another, each with `max_retries + 1` attempts and
//!      a fixed delay between them;
//!   5) merge the per-batch outputs, deduplicating comments by `file:line`.
//!
//! Token counts are estimates (words plus punctuation) of the exact text
//! [`render_file`] puts into the prompt, computed per line so that the
//! estimate of a rendered batch is the sum of its parts.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use git_context_engine::git_providers::{DiffHunk, DiffLine, FileChange, ReviewComment};
use tracing::{debug, info, warn};

use crate::{
    errors::{Error, MrResult},
    review::{config::ReviewConfig, factories::AiReviewer, types::BatchOutput},
};

/// Characters counted as one extra token each.
const SPECIAL_CHARS: &str = ".,!?;:(){}[]<>+-*/=@#$%^&|~";

/// Estimate of `@@ -a,b +c,d @@`: four words plus eight special characters,
/// independent of the numbers.
pub const HUNK_HEADER_TOKENS: usize = 12;

/// Estimate of a rendered diff line with empty content (`L<n> +`).
const MIN_LINE_TOKENS: usize = 3;

/// Closes every file section of a prompt.
const FILE_SEPARATOR: &str = "\n---\n\n";

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "tif", "tiff", "webp", "svg", "exe", "dll", "so",
    "dylib", "a", "lib", "zip", "tar", "gz", "bz2", "xz", "7z", "rar", "jar", "war", "ear",
    "class", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "bin", "dat", "o", "mp3", "mp4",
    "avi", "mov", "wmv", "flv", "webm", "ttf", "woff", "woff2", "eot", "pyc", "pyd", "pyo",
];

const SAMPLE_HUNKS: usize = 3;
const SAMPLE_CHARS_PER_HUNK: usize = 256;
const SAMPLE_CHARS: usize = 512;
const NON_PRINTABLE_RATIO: f64 = 0.3;

/// Summary used when every batch came back without one.
const EMPTY_SUMMARY: &str = "No issues found in the reviewed changes.";

/// Files sent to the model in one call.
#[derive(Debug, Clone)]
pub struct DiffBatch {
    /// 1-based position among the batches of one review.
    pub index: usize,
    pub files: Vec<FileChange>,
    pub estimated_tokens: usize,
}

/// Words plus special characters.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    let specials = text.chars().filter(|c| SPECIAL_CHARS.contains(*c)).count();
    words + specials
}

/// A diff line as the model sees it: `L<n> ` followed by the prefixed line.
/// Removed lines carry their old number, the others their new one.
pub fn render_numbered_line(line: &DiffLine) -> String {
    let number = match line {
        DiffLine::Added { new_line, .. } | DiffLine::Context { new_line, .. } => *new_line,
        DiffLine::Removed { old_line, .. } => *old_line,
    };
    format!("L{number} {}", line.render())
}

/// `FILE <path>` and the status marker, if any.
fn render_file_preamble(file: &FileChange) -> String {
    let mut s = format!("FILE {}\n", file.path());
    if file.is_new {
        s.push_str("[NEW FILE]\n");
    } else if file.is_deleted {
        s.push_str("[DELETED FILE]\n");
    } else if file.is_renamed {
        if let Some(old) = &file.old_path {
            s.push_str(&format!("[RENAMED FROM: {old}]\n"));
        }
    }
    s
}

/// The prompt section of one file: preamble, hunks with numbered lines and
/// the closing separator.
pub fn render_file(file: &FileChange) -> String {
    let mut s = render_file_preamble(file);
    for hunk in &file.hunks {
        s.push_str(&hunk.header());
        s.push('\n');
        for line in &hunk.lines {
            s.push_str(&render_numbered_line(line));
            s.push('\n');
        }
    }
    s.push_str(FILE_SEPARATOR);
    s
}

pub fn line_tokens(line: &DiffLine) -> usize {
    estimate_tokens(&render_numbered_line(line))
}

pub fn hunk_tokens(hunk: &DiffHunk) -> usize {
    HUNK_HEADER_TOKENS + hunk.lines.iter().map(line_tokens).sum::<usize>()
}

/// Tokens every file pays regardless of its hunks: preamble and separator.
pub fn file_header_tokens(file: &FileChange) -> usize {
    estimate_tokens(&render_file_preamble(file)) + estimate_tokens(FILE_SEPARATOR)
}

pub fn file_tokens(file: &FileChange) -> usize {
    file_header_tokens(file) + file.hunks.iter().map(hunk_tokens).sum::<usize>()
}

pub fn batch_tokens(files: &[FileChange]) -> usize {
    files.iter().map(file_tokens).sum()
}

/// True for files that should never reach the model.
pub fn is_binary_change(file: &FileChange) -> bool {
    if file.is_binary {
        return true;
    }

    let ext = Path::new(file.path())
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if ext.is_some_and(|e| BINARY_EXTENSIONS.contains(&e.as_str())) {
        return true;
    }

    let sample: String = file
        .hunks
        .iter()
        .take(SAMPLE_HUNKS)
        .flat_map(|h| h.render().chars().take(SAMPLE_CHARS_PER_HUNK).collect::<Vec<_>>())
        .collect();
    looks_binary(&sample)
}

/// NUL byte anywhere, or more than 30% non-printable characters in the
/// first 512 characters.
pub fn looks_binary(sample: &str) -> bool {
    if sample.is_empty() {
        return false;
    }
    if sample.contains('\0') {
        return true;
    }

    let mut total = 0usize;
    let mut non_printable = 0usize;
    for c in sample.chars().take(SAMPLE_CHARS) {
        total += 1;
        let code = c as u32;
        if (code < 32 && !matches!(c, '\t' | '\n' | '\r')) || code >= 127 {
            non_printable += 1;
        }
    }
    non_printable as f64 / total as f64 > NON_PRINTABLE_RATIO
}

/// Splits `hunk` into consecutive pieces of at most `limit` tokens each
/// (header included). Line numbers of every piece are recomputed from the
/// lines it keeps. A single line larger than the limit is truncated.
pub fn split_hunk(hunk: &DiffHunk, limit: usize) -> Vec<DiffHunk> {
    if hunk_tokens(hunk) <= limit {
        return vec![hunk.clone()];
    }
    let line_limit = limit.saturating_sub(HUNK_HEADER_TOKENS);
    if line_limit < MIN_LINE_TOKENS {
        warn!(limit, "hunk budget smaller than a hunk header, dropping hunk");
        return Vec::new();
    }

    let mut pieces = Vec::new();
    let mut current = PieceBuilder::new(hunk.old_start, hunk.new_start);

    for line in &hunk.lines {
        let line = fit_line(line, line_limit);
        let tokens = line_tokens(&line);

        if current.tokens + tokens > line_limit && !current.lines.is_empty() {
            let (old_next, new_next) = current.next_starts();
            pieces.push(current.finish());
            current = PieceBuilder::new(old_next, new_next);
        }
        current.push(line, tokens);
    }
    if !current.lines.is_empty() {
        pieces.push(current.finish());
    }

    debug!(
        header = %hunk.header(),
        pieces = pieces.len(),
        "oversized hunk split"
    );
    pieces
}

struct PieceBuilder {
    old_start: u32,
    new_start: u32,
    old_count: u32,
    new_count: u32,
    tokens: usize,
    lines: Vec<DiffLine>,
}

impl PieceBuilder {
    fn new(old_start: u32, new_start: u32) -> Self {
        Self {
            old_start,
            new_start,
            old_count: 0,
            new_count: 0,
            tokens: 0,
            lines: Vec::new(),
        }
    }

    fn push(&mut self, line: DiffLine, tokens: usize) {
        match &line {
            DiffLine::Added { .. } => self.new_count += 1,
            DiffLine::Removed { .. } => self.old_count += 1,
            DiffLine::Context { .. } => {
                self.old_count += 1;
                self.new_count += 1;
            }
        }
        self.tokens += tokens;
        self.lines.push(line);
    }

    fn next_starts(&self) -> (u32, u32) {
        (self.old_start + self.old_count, self.new_start + self.new_count)
    }

    fn finish(self) -> DiffHunk {
        DiffHunk {
            old_start: self.old_start,
            old_lines: self.old_count,
            new_start: self.new_start,
            new_lines: self.new_count,
            lines: self.lines,
        }
    }
}

/// Truncates the content of `line` until its estimate fits `limit`.
fn fit_line(line: &DiffLine, limit: usize) -> DiffLine {
    if line_tokens(line) <= limit {
        return line.clone();
    }

    let content = match line {
        DiffLine::Added { content, .. }
        | DiffLine::Removed { content, .. }
        | DiffLine::Context { content, .. } => content,
    };
    let chars: Vec<char> = content.chars().collect();

    // largest prefix whose estimate fits; the estimate grows with the prefix
    let (mut lo, mut hi) = (0usize, chars.len());
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        let candidate = with_content(line, chars[..mid].iter().collect());
        if line_tokens(&candidate) <= limit {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    warn!(
        original_chars = chars.len(),
        kept_chars = lo,
        "diff line exceeds batch budget, truncated"
    );
    with_content(line, chars[..lo].iter().collect())
}

fn with_content(line: &DiffLine, content: String) -> DiffLine {
    match line {
        DiffLine::Added { new_line, .. } => DiffLine::Added {
            new_line: *new_line,
            content,
        },
        DiffLine::Removed { old_line, .. } => DiffLine::Removed {
            old_line: *old_line,
            content,
        },
        DiffLine::Context {
            old_line, new_line, ..
        } => DiffLine::Context {
            old_line: *old_line,
            new_line: *new_line,
            content,
        },
    }
}

/// Splits a file into pieces of at most `budget` tokens, each carrying the
/// file metadata and a subset of the hunks.
fn split_file(file: &FileChange, budget: usize) -> Vec<FileChange> {
    let header = file_header_tokens(file);
    let hunk_budget = budget.saturating_sub(header);
    if hunk_budget < HUNK_HEADER_TOKENS + MIN_LINE_TOKENS {
        warn!(path = file.path(), budget, "file header alone exceeds batch budget, skipping file");
        return Vec::new();
    }

    let mut pieces = Vec::new();
    let mut hunks: Vec<DiffHunk> = Vec::new();
    let mut tokens = header;

    for hunk in &file.hunks {
        for part in split_hunk(hunk, hunk_budget) {
            let part_tokens = hunk_tokens(&part);
            if tokens + part_tokens > budget && !hunks.is_empty() {
                pieces.push(file_piece(file, std::mem::take(&mut hunks)));
                tokens = header;
            }
            tokens += part_tokens;
            hunks.push(part);
        }
    }
    if !hunks.is_empty() {
        pieces.push(file_piece(file, hunks));
    }
    pieces
}

fn file_piece(file: &FileChange, hunks: Vec<DiffHunk>) -> FileChange {
    FileChange {
        hunks,
        ..file.clone()
    }
}

/// Batching and retry policy for one review.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    cfg: ReviewConfig,
}

impl BatchProcessor {
    pub fn new(cfg: ReviewConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.cfg
    }

    /// Files worth reviewing: binary files and files without hunks are dropped.
    pub fn prepare<'a>(&self, files: &'a [FileChange]) -> Vec<&'a FileChange> {
        let kept: Vec<&FileChange> = files
            .iter()
            .filter(|f| {
                if f.hunks.is_empty() {
                    debug!(path = f.path(), "no hunks, skipping");
                    return false;
                }
                if is_binary_change(f) {
                    info!(path = f.path(), "skipping binary or non-textual file");
                    return false;
                }
                true
            })
            .collect();

        info!(total = files.len(), kept = kept.len(), "diffs prepared for batching");
        kept
    }

    /// Packs the reviewable files into batches within the token budget.
    pub fn plan(&self, files: &[FileChange]) -> Vec<DiffBatch> {
        let budget = self.cfg.max_batch_tokens;
        let mut batches: Vec<DiffBatch> = Vec::new();
        let mut current: Vec<FileChange> = Vec::new();
        let mut current_tokens = 0usize;

        for file in self.prepare(files) {
            for piece in split_file(file, budget) {
                let tokens = file_tokens(&piece);
                if current_tokens + tokens > budget && !current.is_empty() {
                    batches.push(DiffBatch {
                        index: batches.len() + 1,
                        files: std::mem::take(&mut current),
                        estimated_tokens: current_tokens,
                    });
                    current_tokens = 0;
                }
                current_tokens += tokens;
                current.push(piece);
            }
        }
        if !current.is_empty() {
            batches.push(DiffBatch {
                index: batches.len() + 1,
                files: current,
                estimated_tokens: current_tokens,
            });
        }

        info!(
            batches = batches.len(),
            budget,
            total_tokens = batches.iter().map(|b| b.estimated_tokens).sum::<usize>(),
            "batch plan ready"
        );
        batches
    }

    /// Runs every batch in order; the first batch that exhausts its attempts
    /// fails the whole run.
    pub async fn run<R>(&self, reviewer: &R, batches: &[DiffBatch]) -> MrResult<Vec<BatchOutput>>
    where
        R: AiReviewer + ?Sized,
    {
        let mut outputs = Vec::with_capacity(batches.len());
        for batch in batches {
            outputs.push(self.run_batch(reviewer, batch).await?);
        }
        Ok(outputs)
    }

    async fn run_batch<R>(&self, reviewer: &R, batch: &DiffBatch) -> MrResult<BatchOutput>
    where
        R: AiReviewer + ?Sized,
    {
        let attempts = self.cfg.attempts();
        let mut last_err: Option<Error> = None;

        for attempt in 1..=attempts {
            let t0 = Instant::now();
            match reviewer.review_batch(batch).await {
                Ok(out) => {
                    debug!(
                        batch = batch.index,
                        attempt,
                        comments = out.comments.len(),
                        latency_ms = t0.elapsed().as_millis() as u64,
                        "batch reviewed"
                    );
                    return Ok(out);
                }
                Err(e) => {
                    warn!(batch = batch.index, attempt, attempts, error = %e, "batch attempt failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.cfg.retry_delay).await;
                    }
                }
            }
        }

        Err(Error::BatchFailed {
            batch: batch.index,
            attempts,
            source: Box::new(
                last_err.unwrap_or_else(|| Error::Validation("batch was never attempted".into())),
            ),
        })
    }
}

/// Merges batch outputs into one summary and one ordered comment list.
pub fn aggregate(outputs: Vec<BatchOutput>) -> BatchOutput {
    let mut summaries = Vec::new();
    let mut comments = Vec::new();
    for out in outputs {
        if !out.summary.trim().is_empty() {
            summaries.push(out.summary.trim().to_string());
        }
        comments.extend(out.comments);
    }

    let summary = if summaries.is_empty() {
        EMPTY_SUMMARY.to_string()
    } else {
        summaries.join("\n\n")
    };

    BatchOutput {
        summary,
        comments: dedup_comments(comments),
    }
}

/// One comment per `file:line`, keeping the more severe one in the position
/// of the first. General comments collapse only when their bodies match.
pub fn dedup_comments(comments: Vec<ReviewComment>) -> Vec<ReviewComment> {
    let mut out: Vec<ReviewComment> = Vec::with_capacity(comments.len());
    let mut seen: HashMap<String, usize> = HashMap::new();

    for comment in comments {
        let key = match &comment.location {
            Some(loc) => format!("{}:{}", loc.file_path, loc.line),
            None => format!("general:{}", comment.body),
        };
        match seen.get(&key) {
            Some(&idx) => {
                if comment.severity.rank() > out[idx].severity.rank() {
                    out[idx] = comment;
                }
            }
            None => {
                seen.insert(key, out.len());
                out.push(comment);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use git_context_engine::git_providers::{CommentLocation, CommentSide, Severity};

    use super::*;
    use crate::test_support::{MockAi, file_change, hunk};

    fn processor(budget: usize) -> BatchProcessor {
        BatchProcessor::new(ReviewConfig {
            max_batch_tokens: budget,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        })
    }

    #[test]
    fn estimator_counts_words_and_punctuation() {
        assert_eq!(estimate_tokens("let x = foo(1);"), 4 + 4);
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("@@ -1,3 +1,4 @@"), HUNK_HEADER_TOKENS);
        assert_eq!(estimate_tokens("@@ -120,30 +118,42 @@"), HUNK_HEADER_TOKENS);
    }

    #[test]
    fn binary_files_are_detected() {
        let png = file_change("assets/logo.PNG", vec![hunk(1, &["text"])]);
        assert!(is_binary_change(&png));

        let nul = file_change("data.txt", vec![hunk(1, &["a\0b"])]);
        assert!(is_binary_change(&nul));

        let noisy = file_change("blob.txt", vec![hunk(1, &[&"\u{1}\u{2}".repeat(20)])]);
        assert!(is_binary_change(&noisy));

        let code = file_change("src/main.rs", vec![hunk(1, &["fn main() {}", "// ünïcode"])]);
        assert!(!is_binary_change(&code));
    }

    #[test]
    fn every_batch_respects_the_budget() {
        let budget = 120;
        let long: Vec<String> = (0..60).map(|i| format!("let value_{i} = compute({i}, other);")).collect();
        let long_refs: Vec<&str> = long.iter().map(String::as_str).collect();

        let files = vec![
            file_change("src/a.rs", vec![hunk(1, &long_refs)]),
            file_change("src/b.rs", vec![hunk(10, &["fn b() {}"]), hunk(40, &["fn c() {}"])]),
            file_change("src/c.rs", vec![hunk(1, &[&"x + ".repeat(400)])]),
            file_change("img/icon.png", vec![hunk(1, &["binary"])]),
        ];

        let batches = processor(budget).plan(&files);
        assert!(batches.len() > 1);
        for batch in &batches {
            assert!(batch.estimated_tokens <= budget, "batch {} too big", batch.index);
            assert_eq!(batch.estimated_tokens, batch_tokens(&batch.files));
        }
        assert!(
            batches
                .iter()
                .flat_map(|b| &b.files)
                .all(|f| f.path() != "img/icon.png")
        );
    }

    #[test]
    fn estimate_matches_rendered_file() {
        let mut renamed = file_change("src/new_name.rs", vec![hunk(7, &["fn a() {}", ""]), hunk(90, &["x"])]);
        renamed.is_renamed = true;
        renamed.old_path = Some("src/old name.rs".into());

        let rendered = render_file(&renamed);
        assert!(rendered.contains("[RENAMED FROM: src/old name.rs]"));
        assert!(rendered.contains("L7 +fn a() {}\n"));
        assert_eq!(estimate_tokens(&rendered), file_tokens(&renamed));
    }

    #[test]
    fn rendered_batches_fit_the_budget() {
        let budget = 200;
        let short: Vec<String> = (0..300).map(|i| format!("a{i}")).collect();
        let refs: Vec<&str> = short.iter().map(String::as_str).collect();
        let mut created = file_change("src/short.rs", vec![hunk(1, &refs)]);
        created.is_new = true;
        let files = vec![created, file_change("src/tail.rs", vec![hunk(5, &["b", "c"])])];

        let batches = processor(budget).plan(&files);
        assert!(batches.len() > 1);
        for batch in &batches {
            let section: String = batch.files.iter().map(render_file).collect();
            assert!(
                estimate_tokens(&section) <= budget,
                "batch {} renders to {} tokens",
                batch.index,
                estimate_tokens(&section)
            );
            assert_eq!(estimate_tokens(&section), batch.estimated_tokens);
        }
    }

    #[test]
    fn split_hunks_get_fresh_headers() {
        let lines: Vec<String> = (0..40).map(|i| format!("line number {i} here")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let big = hunk(100, &refs);

        let pieces = split_hunk(&big, 60);
        assert!(pieces.len() > 1);
        assert_eq!(pieces[0].new_start, 100);
        for pair in pieces.windows(2) {
            assert_eq!(pair[1].new_start, pair[0].new_start + pair[0].new_lines);
        }
        let total: u32 = pieces.iter().map(|p| p.new_lines).sum();
        assert_eq!(total, 40);
        assert!(pieces.iter().all(|p| hunk_tokens(p) <= 60));
    }

    #[tokio::test]
    async fn failing_batch_is_attempted_max_retries_plus_one_times() {
        let ai = MockAi::failing();
        let files = vec![file_change("src/lib.rs", vec![hunk(1, &["pub fn x() {}"])])];
        let p = processor(10_000);

        let batches = p.plan(&files);
        let err = p.run(&ai, &batches).await.unwrap_err();

        assert_eq!(ai.calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err, Error::BatchFailed { batch: 1, attempts: 4, .. }));
    }

    #[tokio::test]
    async fn transient_failure_recovers() {
        let ai = MockAi::failing_times(2);
        let files = vec![file_change("src/lib.rs", vec![hunk(1, &["pub fn x() {}"])])];
        let p = processor(10_000);

        let outputs = p.run(&ai, &p.plan(&files)).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(ai.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dedup_keeps_most_severe_per_line() {
        let at = |line: u32, severity: Severity, body: &str| ReviewComment {
            location: Some(CommentLocation {
                file_path: "src/a.rs".into(),
                line,
                side: CommentSide::Right,
            }),
            body: body.into(),
            severity,
            category: "bug".into(),
        };

        let out = aggregate(vec![
            BatchOutput {
                summary: "first".into(),
                comments: vec![at(3, Severity::Info, "style"), at(7, Severity::Warning, "w")],
            },
            BatchOutput {
                summary: String::new(),
                comments: vec![at(3, Severity::Critical, "overflow"), at(3, Severity::Warning, "meh")],
            },
        ]);

        assert_eq!(out.summary, "first");
        assert_eq!(out.comments.len(), 2);
        assert_eq!(out.comments[0].body, "overflow");
        assert_eq!(out.comments[1].body, "w");
    }
}
