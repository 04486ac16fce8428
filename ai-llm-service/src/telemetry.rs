use std::io::{self, IsTerminal};

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, filter, fmt};

/// Log targets of the review pipeline crates.
pub const PIPELINE_TARGETS: &[&str] = &[
    "ai_llm_service",
    "git_context_engine",
    "mr_reviewer",
    "api",
    "mr_review_backend",
];

/// RFC3339 UTC timer implemented via `chrono`.
/// Example output: `2025-09-12T10:20:30Z`
#[derive(Clone, Debug, Default)]
struct ChronoRfc3339Utc;

impl FormatTime for ChronoRfc3339Utc {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        // no fractional seconds, Z-suffix
        let s = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        w.write_str(&s)
    }
}

fn is_pipeline_target(target: &str) -> bool {
    PIPELINE_TARGETS.iter().any(|p| {
        target == *p
            || target
                .strip_prefix(p)
                .is_some_and(|rest| rest.starts_with("::"))
    })
}

/// Formatting layer that renders only events emitted by the pipeline crates.
///
/// - RFC3339 UTC timestamps
/// - Compact single-line format with `file:line` and target
/// - Span close events (durations of `#[instrument]`ed calls)
/// - ANSI colors only when stdout is a terminal
///
/// Uses a per-layer filter, so dependencies (hyper, reqwest, ...) stay silent
/// here regardless of the global `EnvFilter`.
pub fn layer<S>() -> impl Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let use_ansi = io::stdout().is_terminal();
    let pipeline_only = filter::filter_fn(|meta| is_pipeline_target(meta.target()));

    fmt::layer()
        .with_timer(ChronoRfc3339Utc)
        .with_level(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(use_ansi)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .event_format(fmt::format().compact().with_source_location(true))
        .with_filter(pipeline_only)
}

/// Directive like `mr_reviewer=debug`; `None` when the target is not a valid
/// directive.
pub fn level_directive(target: &str, level: Level) -> Option<Directive> {
    format!("{target}={}", level.as_str().to_lowercase())
        .parse()
        .ok()
}

/// `EnvFilter` from `RUST_LOG` when set; otherwise `default` with every
/// pipeline crate set to `level`.
///
/// Example: `default = "warn"`, `level = Level::DEBUG` shows WARN globally
/// and DEBUG for the pipeline.
pub fn env_filter_with_level(default: &str, level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        PIPELINE_TARGETS
            .iter()
            .filter_map(|t| level_directive(t, level))
            .fold(EnvFilter::new(default), EnvFilter::add_directive)
    })
}
