//! Version reset with cascade
//!
//! Nulls the status/code/score columns of one coding version for a filtered
//! set of responses. Later versions are derived from v2, so resetting v2 also
//! resets v3. The operation is bulk maintenance: batches commit one by one
//! and a failed batch leaves earlier batches in place. Re-running is safe.

use super::invalidate_after_write;
use crate::filters::{build_triad_update, ResponseFilter};
use rcp_common::cache::CacheStore;
use rcp_common::{CodingTriad, CodingVersion, DbContext, JobContext, JobOutcome, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info};

/// Response ids per batch (keyset page)
pub const RESET_BATCH_SIZE: usize = 5000;

const OPERATION: &str = "version reset";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSummary {
    pub affected_response_count: i64,
    /// Every version nulled, the requested one first
    pub cascade_reset_versions: Vec<CodingVersion>,
    pub message: String,
}

pub struct VersionResetCascade {
    db: SqlitePool,
    cache: Arc<dyn CacheStore>,
}

impl VersionResetCascade {
    pub fn new(db: SqlitePool, cache: Arc<dyn CacheStore>) -> Self {
        Self { db, cache }
    }

    /// Reset `version` (and its cascade) for considered persons' responses
    ///
    /// `unit_names` / `variable_ids` restrict the reset when given; an empty
    /// list is rejected rather than read as "everything".
    pub async fn reset(
        &self,
        workspace_id: i64,
        version: CodingVersion,
        unit_names: Option<Vec<String>>,
        variable_ids: Option<Vec<String>>,
        ctx: &JobContext,
    ) -> Result<JobOutcome<ResetSummary>> {
        let filter = ResponseFilter::workspace(workspace_id)
            .units(unit_names)
            .variables(variable_ids);
        filter.validate()?;

        let versions = version.reset_cascade();
        let affected = self.count(&filter).await?;

        if affected == 0 {
            info!(workspace_id, version = %version, "No responses match the reset filter");
            ctx.report_progress(100);
            ctx.report_completed();
            return Ok(JobOutcome::Completed(ResetSummary {
                affected_response_count: 0,
                cascade_reset_versions: versions,
                message: "No responses matched the given filters".to_string(),
            }));
        }

        info!(
            workspace_id,
            version = %version,
            affected,
            cascade = ?versions,
            "Starting version reset"
        );
        ctx.report_progress(0);

        let total_batches = usize::try_from(affected)
            .unwrap_or(usize::MAX)
            .div_ceil(RESET_BATCH_SIZE);
        let mut last_id = 0i64;
        let mut batch = 0usize;
        let mut reset_rows = 0u64;

        loop {
            if ctx.is_cancelled() {
                ctx.report_cancelled();
                if reset_rows > 0 {
                    invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &versions).await;
                }
                return Ok(JobOutcome::Cancelled(ResetSummary {
                    affected_response_count: i64::try_from(reset_rows).unwrap_or(i64::MAX),
                    cascade_reset_versions: versions,
                    message: format!(
                        "Reset cancelled after {} of {} batches",
                        batch, total_batches
                    ),
                }));
            }

            match self.reset_batch(&filter, &versions, last_id).await {
                Ok(None) => break,
                Ok(Some((max_id, rows))) => {
                    last_id = max_id;
                    reset_rows += rows;
                    batch += 1;
                    debug!(workspace_id, batch, total_batches, rows, "Reset batch committed");
                    ctx.report_fraction(batch.min(total_batches), total_batches);
                }
                Err(e) => {
                    if reset_rows > 0 {
                        invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &versions)
                            .await;
                    }
                    return Err(e);
                }
            }
        }

        invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &versions).await;
        ctx.report_progress(100);

        let names: Vec<&str> = versions.iter().map(|v| v.as_str()).collect();
        info!(workspace_id, affected, batches = batch, "Version reset complete");
        ctx.report_completed();

        Ok(JobOutcome::Completed(ResetSummary {
            affected_response_count: affected,
            message: format!(
                "Reset {} for {} responses",
                names.join(", "),
                affected
            ),
            cascade_reset_versions: versions,
        }))
    }

    async fn count(&self, filter: &ResponseFilter) -> Result<i64> {
        let mut qb = filter.build_select("COUNT(*)");
        qb.build_query_scalar::<i64>()
            .fetch_one(&self.db)
            .await
            .db_context(OPERATION, filter.workspace_id)
    }

    /// Null every cascade version for the next page of ids after `after_id`
    async fn reset_batch(
        &self,
        filter: &ResponseFilter,
        versions: &[CodingVersion],
        after_id: i64,
    ) -> Result<Option<(i64, u64)>> {
        let workspace_id = filter.workspace_id;
        let mut tx = self.db.begin().await.db_context(OPERATION, workspace_id)?;

        let mut select = filter.clone().after_id(after_id).build_select("r.id");
        select.push(" ORDER BY r.id LIMIT ");
        select.push_bind(RESET_BATCH_SIZE as i64);

        let ids: Vec<i64> = select
            .build_query_scalar::<i64>()
            .fetch_all(&mut *tx)
            .await
            .db_context(OPERATION, workspace_id)?;

        let Some(&max_id) = ids.last() else {
            return Ok(None);
        };

        let result = build_triad_update(versions, &CodingTriad::default(), &ids)
            .build()
            .execute(&mut *tx)
            .await
            .db_context(OPERATION, workspace_id)?;

        tx.commit().await.db_context(OPERATION, workspace_id)?;

        Ok(Some((max_id, result.rows_affected())))
    }
}
