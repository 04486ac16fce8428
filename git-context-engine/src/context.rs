//! Before/after split of a timeline around a target comment.

use chrono::SecondsFormat;
use serde::Serialize;

use crate::timeline::{Timeline, TimelineEntry, TimelineItem, ZERO_INSTANT, parse_time_best_effort};

/// One side of the split. Lines are in timeline order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommentContext {
    /// `"<short sha> <title>"` lines.
    pub commits: Vec<String>,
    /// `"[<time>] <author>: <body>"` lines.
    pub comments: Vec<String>,
    /// Position of the target comment's own line in `comments`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<usize>,
}

/// Splits `timeline` into what happened up to the target comment and what
/// came after it.
///
/// Commits at or before the target instant go before. The target comment is
/// always placed before; other comments follow the same instant rule. When
/// the target timestamp cannot be parsed everything counts as before.
pub fn extract_comment_context(
    timeline: &Timeline,
    target_note_id: &str,
    target_created_at: &str,
) -> (CommentContext, CommentContext) {
    let target_time = parse_time_best_effort(target_created_at);
    let mut before = CommentContext::default();
    let mut after = CommentContext::default();

    let is_before = |item: &TimelineItem| target_time == ZERO_INSTANT || item.created_at <= target_time;

    for item in timeline.iter() {
        match &item.entry {
            TimelineEntry::Commit(commit) => {
                let line = format!("{} {}", commit.short_sha(), commit.title());
                if is_before(item) {
                    before.commits.push(line);
                } else {
                    after.commits.push(line);
                }
            }
            TimelineEntry::Comment { note_id, comment } => {
                let line = format!(
                    "[{}] {}: {}",
                    format_instant(item, &comment.created_at),
                    comment.author.display_name(),
                    comment.body
                );
                if note_id == target_note_id {
                    before.target = Some(before.comments.len());
                    before.comments.push(line);
                } else if is_before(item) {
                    before.comments.push(line);
                } else {
                    after.comments.push(line);
                }
            }
        }
    }

    (before, after)
}

fn format_instant(item: &TimelineItem, raw: &str) -> String {
    if item.created_at == ZERO_INSTANT {
        raw.to_string()
    } else {
        item.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}
