//! Chronological merge of commits and notes for one merge request.
//!
//! Inputs are fully materialized lists; the output order only depends on the
//! parsed timestamps and on enumeration order (commits, then discussion notes,
//! then standalone notes), so repeated runs are identical.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::unified::{UnifiedComment, UnifiedCommit, UnifiedDiscussion};

/// Instant used for timestamps that cannot be parsed. Sorts before everything.
pub const ZERO_INSTANT: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Commit,
    Comment,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEntry {
    Commit(UnifiedCommit),
    Comment {
        note_id: String,
        comment: UnifiedComment,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineItem {
    pub created_at: DateTime<Utc>,
    pub entry: TimelineEntry,
}

impl TimelineItem {
    pub fn kind(&self) -> TimelineKind {
        match self.entry {
            TimelineEntry::Commit(_) => TimelineKind::Commit,
            TimelineEntry::Comment { .. } => TimelineKind::Comment,
        }
    }

    pub fn note_id(&self) -> Option<&str> {
        match &self.entry {
            TimelineEntry::Comment { note_id, .. } => Some(note_id),
            TimelineEntry::Commit(_) => None,
        }
    }

    pub fn comment(&self) -> Option<&UnifiedComment> {
        match &self.entry {
            TimelineEntry::Comment { comment, .. } => Some(comment),
            TimelineEntry::Commit(_) => None,
        }
    }

    pub fn commit(&self) -> Option<&UnifiedCommit> {
        match &self.entry {
            TimelineEntry::Commit(c) => Some(c),
            TimelineEntry::Comment { .. } => None,
        }
    }
}

/// Ordered sequence of timeline items, ascending by instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timeline {
    pub items: Vec<TimelineItem>,
}

impl Timeline {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimelineItem> {
        self.items.iter()
    }
}

/// Builds the canonical timeline. System notes are dropped; each discussion
/// note keeps (or receives) its discussion id. Standalone notes already seen
/// inside a discussion are skipped, since providers list them in both places.
pub fn build_timeline(
    commits: &[UnifiedCommit],
    discussions: &[UnifiedDiscussion],
    standalone_notes: &[UnifiedComment],
) -> Timeline {
    let mut items = Vec::with_capacity(
        commits.len()
            + discussions.iter().map(|d| d.notes.len()).sum::<usize>()
            + standalone_notes.len(),
    );

    for commit in commits {
        items.push(TimelineItem {
            created_at: parse_time_best_effort(&commit.timestamp),
            entry: TimelineEntry::Commit(commit.clone()),
        });
    }

    let mut threaded: HashSet<&str> = HashSet::new();
    for discussion in discussions {
        for note in discussion.notes.iter().filter(|n| !n.system) {
            threaded.insert(note.id.as_str());
            let mut comment = note.clone();
            if comment.discussion_id.is_none() {
                comment.discussion_id = Some(discussion.id.clone());
            }
            items.push(comment_item(comment));
        }
    }

    for note in standalone_notes
        .iter()
        .filter(|n| !n.system && !threaded.contains(n.id.as_str()))
    {
        items.push(comment_item(note.clone()));
    }

    // `sort_by_key` is stable: equal instants keep enumeration order.
    items.sort_by_key(|item| item.created_at);

    Timeline { items }
}

fn comment_item(comment: UnifiedComment) -> TimelineItem {
    TimelineItem {
        created_at: parse_time_best_effort(&comment.created_at),
        entry: TimelineEntry::Comment {
            note_id: comment.id.clone(),
            comment,
        },
    }
}

/// Formats tried after RFC 3339, all interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%d %H:%M:%S%.f UTC",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parses a provider timestamp, returning [`ZERO_INSTANT`] when nothing matches.
pub fn parse_time_best_effort(raw: &str) -> DateTime<Utc> {
    let raw = raw.trim();
    if raw.is_empty() {
        return ZERO_INSTANT;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc);
    }

    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f %z") {
        return dt.with_timezone(&Utc);
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return naive.and_utc();
        }
    }

    warn!(timestamp = %raw, "failed to parse timestamp, using zero instant");
    ZERO_INSTANT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unified::{UnifiedCommitAuthor, UnifiedUser};

    fn commit(sha: &str, ts: &str) -> UnifiedCommit {
        UnifiedCommit {
            sha: sha.into(),
            message: format!("commit {sha}"),
            author: UnifiedCommitAuthor::default(),
            timestamp: ts.into(),
            web_url: None,
        }
    }

    fn note(id: &str, ts: &str, system: bool) -> UnifiedComment {
        UnifiedComment {
            id: id.into(),
            body: format!("note {id}"),
            created_at: ts.into(),
            updated_at: ts.into(),
            author: UnifiedUser {
                id: "7".into(),
                username: "alice".into(),
                name: "Alice".into(),
                ..Default::default()
            },
            position: None,
            discussion_id: None,
            in_reply_to_id: None,
            system,
            web_url: None,
            metadata: Default::default(),
        }
    }

    fn shape(t: &Timeline) -> Vec<(TimelineKind, String)> {
        t.iter()
            .map(|i| {
                let id = match &i.entry {
                    TimelineEntry::Commit(c) => c.sha.clone(),
                    TimelineEntry::Comment { note_id, .. } => note_id.clone(),
                };
                (i.kind(), id)
            })
            .collect()
    }

    const T1: &str = "2024-03-01T10:00:00Z";
    const T2: &str = "2024-03-01T11:00:00Z";

    #[test]
    fn drops_system_notes_and_orders_by_time() {
        let discussions = vec![UnifiedDiscussion {
            id: "d1".into(),
            notes: vec![note("20", T2, false), note("10", T1, true)],
        }];

        let timeline = build_timeline(&[commit("c1", T1)], &discussions, &[]);

        assert_eq!(
            shape(&timeline),
            vec![
                (TimelineKind::Commit, "c1".to_string()),
                (TimelineKind::Comment, "20".to_string()),
            ]
        );
        assert!(timeline.iter().all(|i| i.note_id() != Some("10")));
    }

    #[test]
    fn ties_keep_commit_then_thread_then_standalone_order() {
        let discussions = vec![UnifiedDiscussion {
            id: "d1".into(),
            notes: vec![note("2", T1, false)],
        }];
        let standalone = vec![note("3", T1, false)];

        let timeline = build_timeline(&[commit("c1", T1)], &discussions, &standalone);

        let ids: Vec<_> = shape(&timeline).into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec!["c1", "2", "3"]);
    }

    #[test]
    fn output_is_independent_of_input_order() {
        let commits = vec![commit("c2", T2), commit("c1", T1)];
        let standalone = vec![note("5", "2024-03-01T10:30:00Z", false), note("4", T1, false)];

        let mut reversed_commits = commits.clone();
        reversed_commits.reverse();
        let mut reversed_notes = standalone.clone();
        reversed_notes.reverse();

        let a = build_timeline(&commits, &[], &standalone);
        let b = build_timeline(&reversed_commits, &[], &reversed_notes);
        let again = build_timeline(&commits, &[], &standalone);

        let times = |t: &Timeline| t.iter().map(|i| i.created_at).collect::<Vec<_>>();
        assert_eq!(times(&a), times(&b));
        assert_eq!(shape(&a), shape(&again));
        assert!(times(&a).windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn discussion_ids_are_preserved_on_every_note() {
        let mut replied = note("31", T2, false);
        replied.discussion_id = Some("thread-9".into());
        let discussions = vec![UnifiedDiscussion {
            id: "thread-9".into(),
            notes: vec![note("30", T1, false), replied],
        }];

        let timeline = build_timeline(&[], &discussions, &[]);

        for item in timeline.iter() {
            let c = item.comment().expect("comment item");
            assert_eq!(c.discussion_id.as_deref(), Some("thread-9"));
        }
    }

    #[test]
    fn standalone_copies_of_threaded_notes_are_skipped() {
        let discussions = vec![UnifiedDiscussion {
            id: "d1".into(),
            notes: vec![note("40", T1, false)],
        }];
        let standalone = vec![note("40", T1, false), note("41", T2, false)];

        let timeline = build_timeline(&[], &discussions, &standalone);

        let ids: Vec<_> = shape(&timeline).into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec!["40", "41"]);
        assert_eq!(
            timeline.items[0].comment().and_then(|c| c.discussion_id.as_deref()),
            Some("d1")
        );
    }

    #[test]
    fn unparseable_timestamps_sort_first() {
        let timeline = build_timeline(&[commit("c1", T1)], &[], &[note("9", "yesterday", false)]);

        assert_eq!(timeline.items[0].note_id(), Some("9"));
        assert_eq!(timeline.items[0].created_at, ZERO_INSTANT);
    }

    #[test]
    fn parses_common_provider_formats() {
        let expected = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        for raw in [
            "2024-03-01T10:00:00Z",
            "2024-03-01T10:00:00.000Z",
            "2024-03-01T12:00:00+02:00",
            "2024-03-01 10:00:00 UTC",
            "2024-03-01 12:00:00 +0200",
            "2024-03-01 10:00:00",
            "2024-03-01T10:00:00",
        ] {
            assert_eq!(parse_time_best_effort(raw), expected, "format {raw}");
        }
        assert_eq!(parse_time_best_effort(""), ZERO_INSTANT);
    }
}
