//! Workspace setting updates with their cache side effects

use rcp_common::cache::{invalidate_analysis, CacheStore};
use rcp_common::db::{get_matching_flags, set_matching_flags};
use rcp_common::{DbContext, MatchingFlags, Result};
use sqlx::SqlitePool;
use tracing::info;

const OPERATION: &str = "update matching flags";

/// Store new response matching flags and drop analyses computed under the old ones
///
/// Returns the previous flags.
pub async fn update_matching_flags(
    db: &SqlitePool,
    cache: &dyn CacheStore,
    workspace_id: i64,
    flags: &MatchingFlags,
) -> Result<MatchingFlags> {
    let previous = get_matching_flags(db, workspace_id)
        .await
        .db_context(OPERATION, workspace_id)?;

    set_matching_flags(db, workspace_id, flags)
        .await
        .db_context(OPERATION, workspace_id)?;

    let removed = invalidate_analysis(cache, workspace_id).await?;
    info!(
        workspace_id,
        from = %previous.cache_fragment(),
        to = %flags.cache_fragment(),
        invalidated = removed,
        "Response matching flags updated"
    );

    Ok(previous)
}
