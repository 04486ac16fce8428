pub mod context;
pub mod credentials;
pub mod errors;
pub mod git_providers;
pub mod parser;
pub mod timeline;
pub mod unified;
pub mod webhooks;

use tracing::{debug, info};

use crate::{
    errors::GitContextEngineResult,
    timeline::{Timeline, build_timeline},
    unified::{UnifiedMergeRequest, UnifiedRepository},
    webhooks::WebhookAdapter,
};

pub use errors::GitContextEngineError;

/// Fetches commits, discussions and standalone notes of a merge request and
/// merges them into one chronological timeline.
///
/// Any provider failure aborts the whole load; a partial history would put
/// the target comment in the wrong place.
pub async fn load_timeline(
    adapter: &dyn WebhookAdapter,
    repo: &UnifiedRepository,
    mr: &UnifiedMergeRequest,
) -> GitContextEngineResult<Timeline> {
    info!(
        provider = adapter.provider_name(),
        repo = %repo.full_name,
        mr = mr.number,
        "loading merge request timeline"
    );

    let commits = adapter.fetch_merge_request_commits(repo, mr).await?;
    let discussions = adapter.fetch_merge_request_discussions(repo, mr).await?;
    let notes = adapter.fetch_merge_request_notes(repo, mr).await?;

    debug!(
        commits = commits.len(),
        discussions = discussions.len(),
        notes = notes.len(),
        "merge request history fetched"
    );

    Ok(build_timeline(&commits, &discussions, &notes))
}
