//! Response-warrant engine: decides whether the bot answers a comment.
//!
//! Checks run strictly in order and stop at the first decisive one:
//! static bot list, fresh identity lookup, self check, direct mention,
//! reply in a thread the bot already took part in, question heuristics.
//! Any uncertainty (failed lookup, missing data) resolves to suppression.

use std::fmt;

use git_context_engine::{
    timeline::parse_time_best_effort,
    unified::{BotIdentity, UnifiedComment, UnifiedUser, UnifiedWebhookEvent},
    webhooks::WebhookAdapter,
};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Usernames treated as automation regardless of the configured identity.
pub const KNOWN_BOT_USERNAMES: &[&str] = &["livereviewbot", "LiveReviewBot", "ai-bot", "codebot", "reviewbot"];

/// Case-insensitive phrases that make a comment look like a question or a
/// request for help. The first match wins.
pub const QUESTION_INDICATORS: &[&str] = &[
    "what",
    "how",
    "why",
    "when",
    "where",
    "which",
    "who",
    "?",
    "can you",
    "could you",
    "would you",
    "help",
    "explain",
    "clarify",
    "understand",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioType {
    DirectMention,
    ThreadReply,
    ContentAnalysis,
    None,
}

impl ScenarioType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioType::DirectMention => "direct_mention",
            ScenarioType::ThreadReply => "thread_reply",
            ScenarioType::ContentAnalysis => "content_analysis",
            ScenarioType::None => "none",
        }
    }
}

impl fmt::Display for ScenarioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the warrant check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseScenario {
    #[serde(rename = "type")]
    pub kind: ScenarioType,
    pub reason: String,
    /// 0.0 for suppression, otherwise the confidence of the trigger.
    pub confidence: f32,
}

impl ResponseScenario {
    fn suppress(reason: impl Into<String>) -> Self {
        Self {
            kind: ScenarioType::None,
            reason: reason.into(),
            confidence: 0.0,
        }
    }

    fn trigger(kind: ScenarioType, confidence: f32, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            confidence,
        }
    }

    pub fn warrants_response(&self) -> bool {
        self.kind != ScenarioType::None
    }
}

/// Evaluates whether `event` (a comment event) should get an answer.
///
/// The bot identity is fetched on every call; nothing is cached between
/// deliveries.
pub async fn evaluate_response_warrant(
    adapter: &dyn WebhookAdapter,
    event: &UnifiedWebhookEvent,
) -> ResponseScenario {
    let Some(comment) = event.comment() else {
        return ResponseScenario::suppress("event carries no comment");
    };
    if comment.system {
        return ResponseScenario::suppress("system note");
    }

    debug!(
        provider = %event.provider,
        author = %comment.author.username,
        note_id = %comment.id,
        "evaluating response warrant"
    );

    // 1. static bot list
    if is_known_bot(&comment.author.username) {
        debug!(author = %comment.author.username, "author is a known bot account");
        return ResponseScenario::suppress("author is a known bot account");
    }

    // 2. fresh identity
    let bot = match adapter.fetch_bot_identity(&event.repository).await {
        Ok(bot) => bot,
        Err(e) => {
            warn!(provider = %event.provider, error = %e, "bot identity lookup failed, suppressing");
            return ResponseScenario::suppress("bot identity unavailable");
        }
    };

    // 3. self check
    if is_bot_author(&comment.author, &bot) {
        debug!(bot = %bot.username, "comment authored by the bot itself");
        return ResponseScenario::suppress("comment authored by the bot");
    }

    // 4. direct mention
    if mentions_bot(&comment.body, &bot) {
        info!(bot = %bot.username, note_id = %comment.id, "direct mention");
        return ResponseScenario::trigger(
            ScenarioType::DirectMention,
            0.9,
            "bot mentioned directly in comment",
        );
    }

    // 5. reply in a thread the bot already answered
    if is_reply_to_bot(adapter, event, comment, &bot).await {
        info!(bot = %bot.username, note_id = %comment.id, "reply in bot thread");
        return ResponseScenario::trigger(
            ScenarioType::ThreadReply,
            0.8,
            "reply to bot comment in thread",
        );
    }

    // 6. content heuristics
    if let Some(indicator) = question_indicator(&comment.body) {
        info!(indicator, note_id = %comment.id, "question indicator found");
        return ResponseScenario::trigger(
            ScenarioType::ContentAnalysis,
            0.7,
            format!("question detected: {indicator}"),
        );
    }

    debug!(note_id = %comment.id, "no trigger found");
    ResponseScenario::suppress("no mention, bot thread or question")
}

pub fn is_known_bot(username: &str) -> bool {
    KNOWN_BOT_USERNAMES
        .iter()
        .any(|b| b.eq_ignore_ascii_case(username.trim()))
}

pub(crate) fn is_bot_author(author: &UnifiedUser, bot: &BotIdentity) -> bool {
    if !author.id.is_empty() && !bot.id.is_empty() && author.id == bot.id {
        return true;
    }
    !bot.username.is_empty() && author.username.eq_ignore_ascii_case(&bot.username)
}

/// `@username` or the bare username anywhere in the body, ignoring case.
pub fn mentions_bot(body: &str, bot: &BotIdentity) -> bool {
    let username = bot.username.trim();
    if username.is_empty() {
        return false;
    }
    // the bare form also covers `@username`
    body.to_lowercase().contains(&username.to_lowercase())
}

pub fn question_indicator(body: &str) -> Option<&'static str> {
    let lower = body.to_lowercase();
    QUESTION_INDICATORS
        .iter()
        .copied()
        .find(|indicator| lower.contains(indicator))
}

async fn is_reply_to_bot(
    adapter: &dyn WebhookAdapter,
    event: &UnifiedWebhookEvent,
    comment: &UnifiedComment,
    bot: &BotIdentity,
) -> bool {
    let Some(discussion_id) = comment.discussion_id.as_deref().filter(|d| !d.is_empty()) else {
        return false;
    };
    let Some(mr) = event.merge_request.as_ref() else {
        return false;
    };

    let discussion = match adapter
        .fetch_discussion(&event.repository, mr, discussion_id)
        .await
    {
        Ok(d) => d,
        Err(e) => {
            warn!(discussion_id, error = %e, "discussion lookup failed, not treating as reply");
            return false;
        }
    };

    discussion
        .notes
        .iter()
        .filter(|note| precedes(note, comment))
        .any(|note| is_bot_author(&note.author, bot))
}

/// Whether `note` was written before `target`: numeric note ids when both
/// parse, otherwise creation time.
fn precedes(note: &UnifiedComment, target: &UnifiedComment) -> bool {
    if note.id == target.id {
        return false;
    }
    match (note.id.parse::<u64>(), target.id.parse::<u64>()) {
        (Ok(a), Ok(b)) => a < b,
        _ => parse_time_best_effort(&note.created_at) < parse_time_best_effort(&target.created_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockAdapter, comment_event, note};

    #[tokio::test]
    async fn direct_mention_wins() {
        let adapter = MockAdapter::with_bot("reviewbot");
        let event = comment_event("501", "alice", "hey @reviewbot can you explain this?", None);

        let scenario = evaluate_response_warrant(&adapter, &event).await;
        assert_eq!(scenario.kind, ScenarioType::DirectMention);
        assert_eq!(scenario.confidence, 0.9);
    }

    #[tokio::test]
    async fn thread_reply_needs_earlier_bot_note() {
        let mut adapter = MockAdapter::with_bot("assistant");
        adapter.discussion = Some(vec![
            note("100", "bob", "first"),
            note("120", "assistant", "answer"),
            note("130", "alice", "thanks, noted"),
        ]);
        let event = comment_event("130", "alice", "thanks, noted", Some("d1"));

        let scenario = evaluate_response_warrant(&adapter, &event).await;
        assert_eq!(scenario.kind, ScenarioType::ThreadReply);
        assert_eq!(scenario.confidence, 0.8);

        // bot note after the comment does not count
        adapter.discussion = Some(vec![
            note("130", "alice", "thanks, noted"),
            note("140", "assistant", "later"),
        ]);
        let scenario = evaluate_response_warrant(&adapter, &event).await;
        assert_eq!(scenario.kind, ScenarioType::None);
    }

    #[tokio::test]
    async fn question_words_trigger_content_analysis() {
        let adapter = MockAdapter::with_bot("assistant");
        let event = comment_event("7", "alice", "Why is this loop unbounded", None);

        let scenario = evaluate_response_warrant(&adapter, &event).await;
        assert_eq!(scenario.kind, ScenarioType::ContentAnalysis);
        assert!(scenario.reason.contains("why"));
    }

    #[tokio::test]
    async fn bot_authors_are_always_suppressed() {
        let adapter = MockAdapter::with_bot("assistant");

        let own = comment_event("8", "Assistant", "why? @assistant", None);
        assert!(!evaluate_response_warrant(&adapter, &own).await.warrants_response());

        let listed = comment_event("9", "CodeBot", "what about this?", None);
        assert!(!evaluate_response_warrant(&adapter, &listed).await.warrants_response());
        // static list short-circuits before the identity lookup
        assert_eq!(adapter.identity_calls(), 1);
    }

    #[tokio::test]
    async fn identity_failure_suppresses() {
        let adapter = MockAdapter::without_bot();
        let event = comment_event("10", "alice", "@assistant explain", None);

        let scenario = evaluate_response_warrant(&adapter, &event).await;
        assert_eq!(scenario.kind, ScenarioType::None);
    }

    #[tokio::test]
    async fn plain_statement_is_ignored() {
        let adapter = MockAdapter::with_bot("assistant");
        let event = comment_event("11", "alice", "LGTM, merging now", None);

        assert_eq!(
            evaluate_response_warrant(&adapter, &event).await.kind,
            ScenarioType::None
        );
    }
}
