//! Review orchestration: fetch, batch, review, aggregate, post.
//!
//! Flow of [`ReviewService::process_review`]:
//!   1) build the provider client and the AI reviewer through the factories;
//!   2) resolve the URL into a change request id, fetch details, then the diff;
//!   3) an empty diff is a successful review without any model call;
//!   4) batch under the token budget and review each batch with retries;
//!   5) post the summary as one general comment, then the line comments.
//!
//! The whole flow runs under one deadline; expiry drops every in-flight call.
//! Posting is not idempotent: running the same request twice posts twice.

use std::sync::Arc;
use std::time::{Duration, Instant};

use git_context_engine::git_providers::ReviewComment;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    errors::{Error, MrResult},
    review::{
        batch::BatchProcessor,
        config::ReviewConfig,
        factories::{AiProviderFactory, ProviderFactory},
        types::{ReviewRequest, ReviewResult},
    },
};

pub const NO_CHANGES_SUMMARY: &str = "# No Changes Detected\n\nNo changes were found in this merge request.";

pub struct ReviewService {
    providers: Arc<dyn ProviderFactory>,
    ai: Arc<dyn AiProviderFactory>,
    config: ReviewConfig,
}

/// What a run produced so far; kept when a later step fails.
#[derive(Default)]
struct Progress {
    summary: String,
    comments: Vec<ReviewComment>,
}

impl ReviewService {
    pub fn new(
        providers: Arc<dyn ProviderFactory>,
        ai: Arc<dyn AiProviderFactory>,
        config: ReviewConfig,
    ) -> Self {
        Self {
            providers,
            ai,
            config,
        }
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    /// Runs one review to completion. Never panics and never returns an
    /// error: failures end up in [`ReviewResult::error`].
    #[instrument(skip_all, fields(review_id = %request.review_id, url = %request.url))]
    pub async fn process_review(&self, request: ReviewRequest) -> ReviewResult {
        let t0 = Instant::now();
        let deadline = request.timeout.unwrap_or(self.config.timeout);
        let mut progress = Progress::default();

        info!(timeout_secs = deadline.as_secs(), "review started");

        let outcome = match tokio::time::timeout(deadline, self.run(&request, &mut progress)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(deadline)),
        };
        let duration = t0.elapsed();

        match outcome {
            Ok(()) => {
                info!(
                    comments = progress.comments.len(),
                    latency_ms = duration.as_millis() as u64,
                    "review completed"
                );
                build_result(&request, progress, None, duration)
            }
            Err(e) => {
                error!(
                    error = %e,
                    timeout = e.is_timeout(),
                    latency_ms = duration.as_millis() as u64,
                    "review failed"
                );
                build_result(&request, progress, Some(e.to_string()), duration)
            }
        }
    }

    /// Spawns [`Self::process_review`] and hands back a receiver for its result.
    pub fn process_review_async(self: Arc<Self>, request: ReviewRequest) -> oneshot::Receiver<ReviewResult> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let review_id = request.review_id.clone();
            let result = self.process_review(request).await;
            if tx.send(result).is_err() {
                debug!(review_id, "review result receiver dropped");
            }
        });
        rx
    }

    async fn run(&self, request: &ReviewRequest, progress: &mut Progress) -> MrResult<()> {
        // 1) clients
        let provider = self.providers.create_provider(&request.provider)?;
        let reviewer = self.ai.create_reviewer(&request.ai)?;

        // 2) fetch
        let t_fetch = Instant::now();
        let id = provider.parse_change_request_url(&request.url)?;
        let details = provider.merge_request_details(&id).await?;
        let changes = provider.merge_request_changes(&id).await?;
        info!(
            provider = provider.kind().as_str(),
            project = %id.project,
            iid = id.iid,
            files = changes.files.len(),
            truncated = changes.is_truncated,
            latency_ms = t_fetch.elapsed().as_millis() as u64,
            "merge request fetched"
        );

        // 3) nothing to review
        if changes.is_empty() {
            info!("no changes found, skipping AI review");
            progress.summary = NO_CHANGES_SUMMARY.to_string();
            return Ok(());
        }

        // 4) batched review
        let processor = BatchProcessor::new(self.config.clone());
        let t_review = Instant::now();
        let output = reviewer.review_with_batching(&changes.files, &processor).await?;
        info!(
            comments = output.comments.len(),
            summary_chars = output.summary.len(),
            latency_ms = t_review.elapsed().as_millis() as u64,
            "AI review finished"
        );
        progress.summary = output.summary;
        progress.comments = output.comments;

        // 5) post
        let summary = ReviewComment::general(progress.summary.clone(), "summary");
        provider.post_comment(&details, &summary).await.inspect_err(|e| {
            warn!(error = %e, "posting summary failed");
        })?;

        if !progress.comments.is_empty() {
            provider
                .post_comments(&details, &progress.comments)
                .await
                .inspect_err(|e| {
                    warn!(error = %e, count = progress.comments.len(), "posting line comments failed");
                })?;
        }
        debug!(count = progress.comments.len(), "review results posted");

        Ok(())
    }
}

fn build_result(
    request: &ReviewRequest,
    progress: Progress,
    error: Option<String>,
    duration: Duration,
) -> ReviewResult {
    ReviewResult {
        review_id: request.review_id.clone(),
        success: error.is_none(),
        error,
        summary: progress.summary,
        comments_count: progress.comments.len(),
        comments: progress.comments,
        duration_ms: duration.as_millis(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::test_support::{MockAi, MockProvider, file_change, hunk, review_request, service_with};

    #[tokio::test]
    async fn empty_diff_is_trivial_success_without_ai_calls() {
        let provider = Arc::new(MockProvider::with_files(vec![]));
        let ai = Arc::new(MockAi::ok("unused"));
        let service = service_with(provider.clone(), ai.clone(), ReviewConfig::default());

        let result = service.process_review(review_request(None)).await;

        assert!(result.success);
        assert_eq!(result.comments_count, 0);
        assert_eq!(ai.calls.load(Ordering::SeqCst), 0);
        assert!(provider.posted().is_empty());
    }

    #[tokio::test]
    async fn always_failing_ai_fails_review_after_four_attempts() {
        let provider = Arc::new(MockProvider::with_files(vec![file_change(
            "src/lib.rs",
            vec![hunk(1, &["pub fn answer() -> u8 { 42 }"])],
        )]));
        let ai = Arc::new(MockAi::failing());
        let cfg = ReviewConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let service = service_with(provider.clone(), ai.clone(), cfg);

        let result = service.process_review(review_request(None)).await;

        assert!(!result.success);
        assert_eq!(ai.calls.load(Ordering::SeqCst), 4);
        assert!(result.error.unwrap().contains("4 attempts"));
        assert!(provider.posted().is_empty());
    }

    #[tokio::test]
    async fn posts_summary_then_line_comments() {
        let provider = Arc::new(MockProvider::with_files(vec![file_change(
            "src/lib.rs",
            vec![hunk(1, &["let x = 1;"])],
        )]));
        let ai = Arc::new(MockAi::ok("Looks reasonable").with_line_comment("src/lib.rs", 1));
        let service = service_with(provider.clone(), ai.clone(), ReviewConfig::default());

        let result = service.process_review(review_request(None)).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.comments_count, 1);
        let posted = provider.posted();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].category, "summary");
        assert_eq!(posted[0].body, "Looks reasonable");
        assert!(posted[1].location.is_some());
    }

    #[tokio::test]
    async fn posting_failure_keeps_summary_and_duration() {
        let mut provider = MockProvider::with_files(vec![file_change("a.rs", vec![hunk(1, &["x"])])]);
        provider.fail_posting = true;
        let provider = Arc::new(provider);
        let ai = Arc::new(MockAi::ok("summary text"));
        let service = service_with(provider, ai, ReviewConfig::default());

        let result = service.process_review(review_request(None)).await;

        assert!(!result.success);
        assert_eq!(result.summary, "summary text");
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn deadline_aborts_slow_review() {
        let provider = Arc::new(MockProvider::with_files(vec![file_change("a.rs", vec![hunk(1, &["x"])])]));
        let ai = Arc::new(MockAi::ok("late").with_delay(Duration::from_secs(5)));
        let service = service_with(provider.clone(), ai, ReviewConfig::default());

        let result = service
            .process_review(review_request(Some(Duration::from_millis(50))))
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(provider.posted().is_empty());
    }

    #[tokio::test]
    async fn async_review_delivers_result() {
        let provider = Arc::new(MockProvider::with_files(vec![]));
        let ai = Arc::new(MockAi::ok("unused"));
        let service = Arc::new(service_with(provider, ai, ReviewConfig::default()));

        let rx = service.process_review_async(review_request(None));
        let result = rx.await.unwrap();
        assert!(result.success);
        assert_eq!(result.review_id, "rev-1");
    }
}
