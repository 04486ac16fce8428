//! Webhook response pipeline.
//!
//! - Comment events: warrant check, timeline + context, model reply,
//!   learning post-processing, reply in the same thread, emoji reaction.
//! - Reviewer events: when the bot was just added as a reviewer, a full
//!   review of the merge request through [`ReviewService`].
//!
//! Failures after a positive decision are reported back on the merge request
//! with a short notice so the author is not left waiting. The warrant check
//! and the reply each run under the review timeout.

use std::sync::Arc;
use std::time::Instant;

use git_context_engine::{
    context::{CommentContext, extract_comment_context},
    credentials::{TokenStore, extract_instance_url},
    git_providers::ProviderKind,
    load_timeline,
    unified::{
        EventPayload, UnifiedComment, UnifiedMergeRequest, UnifiedReviewerChange,
        UnifiedWebhookEvent,
    },
    webhooks::WebhookAdapter,
};
use tracing::{error, info, instrument, warn};

use crate::{
    errors::{Error, MrResult},
    learning::{LearningMetadata, append_learning_acknowledgment},
    review::{AiSettings, ProviderSettings, ReviewRequest, ReviewResult, ReviewService, TextGenerator},
    warrant::{ResponseScenario, evaluate_response_warrant, is_bot_author},
};

pub const REPLY_SYSTEM_PROMPT: &str = "You are an AI code review assistant taking part in a merge request discussion.";

/// Prior commits included in a reply prompt.
const PROMPT_COMMITS: usize = 8;
/// Characters kept from each prior comment in a reply prompt.
const PROMPT_COMMENT_CHARS: usize = 100;

const REPLY_FAILED: &str = "Failed to generate AI response";
const REVIEW_FAILED: &str = "Failed to generate code review";

#[derive(Debug)]
pub enum ResponseOutcome {
    /// The warrant engine decided not to answer.
    Suppressed(ResponseScenario),
    Replied {
        scenario: ResponseScenario,
        learning: Option<LearningMetadata>,
    },
    Reviewed(ReviewResult),
    /// Event needs no action (e.g. reviewers changed without the bot).
    Ignored(&'static str),
}

pub struct Responder {
    generator: Arc<dyn TextGenerator>,
    reviews: Arc<ReviewService>,
    tokens: Arc<dyn TokenStore>,
    ai: AiSettings,
}

impl Responder {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        reviews: Arc<ReviewService>,
        tokens: Arc<dyn TokenStore>,
        ai: AiSettings,
    ) -> Self {
        Self {
            generator,
            reviews,
            tokens,
            ai,
        }
    }

    #[instrument(skip_all, fields(provider = adapter.provider_name(), event = event.event_type().as_str()))]
    pub async fn handle_event(
        &self,
        adapter: &dyn WebhookAdapter,
        event: &UnifiedWebhookEvent,
    ) -> MrResult<ResponseOutcome> {
        let t0 = Instant::now();
        let outcome = match &event.payload {
            EventPayload::Comment(comment) => self.handle_comment(adapter, event, comment).await,
            EventPayload::ReviewerChange(change) => {
                self.handle_reviewer_change(adapter, event, change).await
            }
        };
        info!(
            ok = outcome.is_ok(),
            latency_ms = t0.elapsed().as_millis() as u64,
            "webhook event handled"
        );
        outcome
    }

    async fn handle_comment(
        &self,
        adapter: &dyn WebhookAdapter,
        event: &UnifiedWebhookEvent,
        comment: &UnifiedComment,
    ) -> MrResult<ResponseOutcome> {
        let deadline = self.reviews.config().timeout;
        let Ok(scenario) = tokio::time::timeout(deadline, evaluate_response_warrant(adapter, event)).await
        else {
            warn!(timeout_ms = deadline.as_millis() as u64, "warrant evaluation timed out");
            return Err(Error::Timeout(deadline));
        };
        if !scenario.warrants_response() {
            info!(reason = %scenario.reason, "no response warranted");
            return Ok(ResponseOutcome::Suppressed(scenario));
        }
        info!(scenario = %scenario.kind, confidence = scenario.confidence, "response warranted");

        let replied = match tokio::time::timeout(deadline, self.reply(adapter, event, comment)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(deadline)),
        };
        match replied {
            Ok(learning) => Ok(ResponseOutcome::Replied { scenario, learning }),
            Err(e) => {
                error!(error = %e, timeout = e.is_timeout(), "comment reply failed");
                post_error_reply(adapter, event, REPLY_FAILED).await;
                Err(e)
            }
        }
    }

    async fn reply(
        &self,
        adapter: &dyn WebhookAdapter,
        event: &UnifiedWebhookEvent,
        comment: &UnifiedComment,
    ) -> MrResult<Option<LearningMetadata>> {
        let mr = event
            .merge_request
            .as_ref()
            .ok_or_else(|| Error::Validation("comment event carries no merge request".into()))?;

        let timeline = load_timeline(adapter, &event.repository, mr).await?;
        let (before, _after) = extract_comment_context(&timeline, &comment.id, &comment.created_at);

        let prompt = build_reply_prompt(event, mr, comment, &before);
        let raw = self
            .generator
            .generate(&prompt, Some(REPLY_SYSTEM_PROMPT))
            .await?;

        let (body, learning) = append_learning_acknowledgment(&raw);
        if body.trim().is_empty() {
            return Err(Error::InvalidAiResponse("empty reply".into()));
        }

        adapter.post_comment_reply(event, &body).await?;
        info!(chars = body.len(), learning = learning.is_some(), "reply posted");

        let emoji = select_emoji(&comment.body);
        if let Err(e) = adapter.post_emoji_reaction(event, emoji).await {
            warn!(emoji, error = %e, "emoji reaction failed");
        }

        Ok(learning)
    }

    async fn handle_reviewer_change(
        &self,
        adapter: &dyn WebhookAdapter,
        event: &UnifiedWebhookEvent,
        change: &UnifiedReviewerChange,
    ) -> MrResult<ResponseOutcome> {
        let mr = event
            .merge_request
            .as_ref()
            .ok_or_else(|| Error::Validation("reviewer event carries no merge request".into()))?;

        let bot = adapter.fetch_bot_identity(&event.repository).await?;
        if !change.added_reviewers().any(|user| is_bot_author(user, &bot)) {
            info!(bot = %bot.username, "bot not among newly added reviewers");
            return Ok(ResponseOutcome::Ignored("bot not added as reviewer"));
        }
        info!(bot = %bot.username, mr = mr.number, "bot added as reviewer, starting full review");

        let request = self.review_request(event, mr).await?;
        let result = self.reviews.process_review(request).await;

        if !result.success {
            let body = format_error_response(REVIEW_FAILED);
            if let Err(e) = adapter.post_full_review(event, &body).await {
                error!(error = %e, "posting review failure notice failed");
            }
        }
        Ok(ResponseOutcome::Reviewed(result))
    }

    async fn review_request(
        &self,
        event: &UnifiedWebhookEvent,
        mr: &UnifiedMergeRequest,
    ) -> MrResult<ReviewRequest> {
        let kind = ProviderKind::from_type_str(&event.provider)?;
        let source = if mr.web_url.is_empty() {
            &event.repository.web_url
        } else {
            &mr.web_url
        };
        let instance = extract_instance_url(source);
        let token = self.tokens.lookup_token(kind, &instance).await?;

        Ok(ReviewRequest {
            review_id: format!(
                "webhook-{}-{}-{}",
                kind.as_str(),
                event.repository.full_name.replace('/', "-"),
                mr.number
            ),
            url: mr.web_url.clone(),
            provider: ProviderSettings {
                provider_type: kind.as_str().to_string(),
                base_url: instance,
                token,
            },
            ai: self.ai.clone(),
            timeout: None,
        })
    }
}

/// Reply prompt: merge request facts, the comment being answered, earlier
/// commits and discussion, and the learning-block instructions.
pub fn build_reply_prompt(
    event: &UnifiedWebhookEvent,
    mr: &UnifiedMergeRequest,
    comment: &UnifiedComment,
    before: &CommentContext,
) -> String {
    let mut s = String::new();
    s.push_str("CONTEXT:\n");
    s.push_str(&format!("- Repository: {}\n", event.repository.full_name));
    s.push_str(&format!("- MR/PR title: {}\n", mr.title));

    s.push_str("\nCURRENT COMMENT (reply only to this message unless explicitly asked otherwise):\n");
    s.push_str(&format!("@{} wrote: {}\n", comment.author.username, comment.body));
    if let Some(pos) = &comment.position {
        s.push_str(&format!("Anchored at {}:{}\n", pos.file_path, pos.line_number));
    }

    let skip = before.commits.len().saturating_sub(PROMPT_COMMITS);
    if before.commits.len() > skip {
        s.push_str("\nRECENT COMMITS:\n");
        for line in &before.commits[skip..] {
            s.push_str(&format!("- {line}\n"));
        }
    }

    let earlier: Vec<&String> = before
        .comments
        .iter()
        .enumerate()
        .filter(|(i, _)| before.target != Some(*i))
        .map(|(_, line)| line)
        .collect();
    if !earlier.is_empty() {
        s.push_str("\nEARLIER CONVERSATION (context only, do not answer these):\n");
        for line in earlier {
            s.push_str(&format!("- {}\n", truncate_chars(line, PROMPT_COMMENT_CHARS)));
        }
    }

    s.push_str("\nTASK:\n");
    s.push_str("Answer the CURRENT COMMENT directly. Keep the reply focused on the exact question or concern raised.\n");
    s.push_str("- Reference earlier discussion or code only when it improves the answer.\n");
    s.push_str("- Stay concise, professional and actionable.\n\n");

    s.push_str("LEARNING EXTRACTION:\n");
    s.push_str("If the comment states a team policy, coding standard or preference worth remembering\n");
    s.push_str("(\"our team prefers...\", \"we always...\", \"we use X instead of Y\"), add this block at the end:\n");
    s.push_str("```learning\n");
    s.push_str("{\n");
    s.push_str("  \"type\": \"team_policy|coding_standard|preference|rule\",\n");
    s.push_str("  \"title\": \"Brief descriptive title\",\n");
    s.push_str("  \"content\": \"Full description of the practice\",\n");
    s.push_str("  \"tags\": [\"keywords\"],\n");
    s.push_str("  \"scope\": \"org|repo\",\n");
    s.push_str("  \"confidence\": 1-5\n");
    s.push_str("}\n```\n");
    s.push_str("Most replies have no learning; omit the block then.\n\n");
    s.push_str("RESPONSE:\n");
    s
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Reaction matching the tone of the comment.
pub fn select_emoji(body: &str) -> &'static str {
    let lower = body.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has(&["thank", "appreciate"]) {
        "heart"
    } else if has(&["?", "how", "why", "what"]) {
        "point_up"
    } else if has(&["good", "great", "nice", "excellent"]) {
        "thumbsup"
    } else if has(&["issue", "problem", "bug", "error"]) {
        "eyes"
    } else {
        "thumbsup"
    }
}

pub fn format_error_response(message: &str) -> String {
    format!("⚠️ {message}\n\n*This issue has been logged and will be investigated.*")
}

async fn post_error_reply(adapter: &dyn WebhookAdapter, event: &UnifiedWebhookEvent, message: &str) {
    if let Err(e) = adapter
        .post_comment_reply(event, &format_error_response(message))
        .await
    {
        error!(error = %e, "posting error notice failed");
    }
}
