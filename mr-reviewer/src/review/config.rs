//! Review orchestration settings.
//!
//! # Environment variables
//! - `REVIEW_TIMEOUT_SECS`     = deadline of one whole review, default 600
//! - `REVIEW_MAX_BATCH_TOKENS` = estimated-token budget per batch, default 10000
//! - `REVIEW_MAX_RETRIES`      = retries after the first attempt of a batch, default 3
//! - `REVIEW_RETRY_DELAY_MS`   = fixed delay between attempts, default 2000

use std::time::Duration;

use ai_llm_service::error_handler::env_opt_u32;

use crate::errors::{ConfigError, MrResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_BATCH_TOKENS: usize = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewConfig {
    /// Used when a request does not carry its own timeout.
    pub timeout: Duration,
    pub max_batch_tokens: usize,
    /// A batch gets `max_retries + 1` attempts in total.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_batch_tokens: DEFAULT_MAX_BATCH_TOKENS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl ReviewConfig {
    /// Defaults overridden by whichever `REVIEW_*` variables are set.
    pub fn from_env() -> MrResult<Self> {
        let mut cfg = Self::default();

        if let Some(secs) = env_opt_u32("REVIEW_TIMEOUT_SECS")? {
            cfg.timeout = Duration::from_secs(u64::from(secs));
        }
        if let Some(tokens) = env_opt_u32("REVIEW_MAX_BATCH_TOKENS")? {
            cfg.max_batch_tokens = tokens as usize;
        }
        if let Some(retries) = env_opt_u32("REVIEW_MAX_RETRIES")? {
            cfg.max_retries = retries;
        }
        if let Some(ms) = env_opt_u32("REVIEW_RETRY_DELAY_MS")? {
            cfg.retry_delay = Duration::from_millis(u64::from(ms));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> MrResult<()> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "REVIEW_TIMEOUT_SECS",
                reason: "must be greater than zero",
            }
            .into());
        }
        if self.max_batch_tokens == 0 {
            return Err(ConfigError::Invalid {
                field: "REVIEW_MAX_BATCH_TOKENS",
                reason: "must be greater than zero",
            }
            .into());
        }
        Ok(())
    }

    /// Total attempts a single batch may use.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
