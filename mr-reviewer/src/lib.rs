//! Public entry for the mr-reviewer pipeline.
//!
//! Two ways in:
//!
//! 1) **Full review** through [`ReviewService::process_review`]
//!    - Resolve provider + AI settings into clients via the factories
//!    - Fetch MR/PR details and the parsed diff
//!    - Split the diff into token-bounded batches, review each with retries
//!    - Aggregate and post one summary note plus inline comments
//!
//! 2) **Webhook responses** through [`Responder::handle_event`]
//!    - Comment events pass the response-warrant check first
//!    - A warranted reply is built from the merge request timeline split
//!      around the comment, then posted in-thread with an emoji reaction
//!    - Adding the bot as a reviewer starts a full review
//!
//! Provider I/O lives in `git-context-engine`, model calls in
//! `ai-llm-service`. Everything here logs through `tracing`.

pub mod errors;
pub mod learning;
pub mod responder;
pub mod review;
pub mod warrant;

#[cfg(test)]
mod test_support;

pub use errors::{ConfigError, Error, MrResult};
pub use learning::{LearningMetadata, append_learning_acknowledgment, extract_learning};
pub use responder::{Responder, ResponseOutcome};
pub use review::{
    AiSettings, BatchOutput, DefaultProviderFactory, LlmAiFactory, ProviderSettings, ReviewConfig,
    ReviewRequest, ReviewResult, ReviewService,
};
pub use warrant::{ResponseScenario, ScenarioType, evaluate_response_warrant};
