//! Review orchestration for a whole merge request.

pub mod batch;
pub mod config;
pub mod factories;
pub mod llm;
pub mod service;
pub mod types;

pub use batch::{BatchProcessor, DiffBatch};
pub use config::ReviewConfig;
pub use factories::{
    AiProviderFactory, AiReviewer, DefaultProviderFactory, LlmAiFactory, ProviderFactory,
};
pub use llm::{LlmReviewer, TextGenerator};
pub use service::ReviewService;
pub use types::{AiSettings, BatchOutput, ProviderSettings, ReviewRequest, ReviewResult};
