//! Duplicate aggregation
//!
//! Collapses each duplicate group onto its master response (lowest id) so
//! coders only see one case per distinct answer. Non-master occurrences whose
//! v2 is still open get the aggregation sentinel triad; reverting nulls it again.

use super::invalidate_after_write;
use super::response_analyzer::{DuplicateGroup, ResponseAnalyzer};
use crate::filters::{build_triad_update, ResponseFilter};
use rcp_common::cache::CacheStore;
use rcp_common::db::{count_aggregated_duplicates, set_aggregation_threshold};
use rcp_common::models::{AGGREGATION_SENTINEL_CODE, DEFAULT_DUPLICATE_THRESHOLD};
use rcp_common::{
    CodingTriad, CodingVersion, DbContext, Error, JobContext, JobOutcome, MatchingFlag, Result,
    StatusCode,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info};

/// Ids updated per statement (group members or revert batch)
pub const AGGREGATION_BATCH_SIZE: usize = 1000;

const APPLY_OPERATION: &str = "apply aggregation";
const REVERT_OPERATION: &str = "revert aggregation";

/// Outcome of an apply or revert call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSummary {
    /// Groups collapsed by this call
    pub aggregated_groups: usize,
    /// Responses carrying the sentinel in the workspace after this call
    pub aggregated_responses: i64,
    /// Responses marked (apply) or restored (revert) by this call
    pub changed_responses: u64,
    /// Manual coding cases left once duplicates are collapsed
    pub unique_coding_cases: i64,
    pub threshold: Option<i64>,
    pub message: String,
}

pub struct AggregationResolver {
    db: SqlitePool,
    cache: Arc<dyn CacheStore>,
    analyzer: ResponseAnalyzer,
}

impl AggregationResolver {
    pub fn new(db: SqlitePool, cache: Arc<dyn CacheStore>, analyzer: ResponseAnalyzer) -> Self {
        Self { db, cache, analyzer }
    }

    /// Apply (`enable = true`) or revert (`enable = false`) aggregation
    ///
    /// The threshold is only validated when applying.
    pub async fn apply_aggregation(
        &self,
        workspace_id: i64,
        threshold: i64,
        enable: bool,
        ctx: &JobContext,
    ) -> Result<JobOutcome<AggregationSummary>> {
        if enable {
            self.apply(workspace_id, threshold, ctx).await
        } else {
            self.revert(workspace_id, ctx).await
        }
    }

    async fn apply(
        &self,
        workspace_id: i64,
        threshold: i64,
        ctx: &JobContext,
    ) -> Result<JobOutcome<AggregationSummary>> {
        if threshold < DEFAULT_DUPLICATE_THRESHOLD {
            return Err(Error::Validation(format!(
                "Aggregation threshold must be at least {}, got {}",
                DEFAULT_DUPLICATE_THRESHOLD, threshold
            )));
        }

        let flags = rcp_common::db::get_matching_flags(&self.db, workspace_id)
            .await
            .db_context(APPLY_OPERATION, workspace_id)?;
        if flags.contains(MatchingFlag::NoAggregation) {
            return Err(Error::Validation(format!(
                "Workspace {} disables aggregation (NO_AGGREGATION)",
                workspace_id
            )));
        }

        info!(workspace_id, threshold, "Applying duplicate aggregation");
        ctx.report_progress(0);

        // The analysis shares the caller's token but reports its own progress nowhere
        let analysis_ctx = JobContext::detached().with_cancellation(ctx.cancellation_token());
        let analysis = match self
            .analyzer
            .analyze(workspace_id, Some(threshold), &analysis_ctx)
            .await?
        {
            JobOutcome::Completed(result) => result,
            JobOutcome::Cancelled(_) => {
                ctx.report_cancelled();
                let summary = self
                    .summary(workspace_id, 0, 0, Some(threshold), "Aggregation cancelled before any write")
                    .await?;
                return Ok(JobOutcome::Cancelled(summary));
            }
        };

        let min_count = usize::try_from(threshold).unwrap_or(usize::MAX);
        let groups: Vec<&DuplicateGroup> = analysis
            .duplicate_groups
            .iter()
            .filter(|g| g.count() >= min_count)
            .collect();

        if groups.is_empty() {
            info!(workspace_id, threshold, "No duplicate groups to aggregate");
            let summary = self
                .summary(workspace_id, 0, 0, Some(threshold), "No duplicate groups found")
                .await?;
            ctx.report_progress(100);
            ctx.report_completed();
            return Ok(JobOutcome::Completed(summary));
        }

        let mut aggregated_groups = 0usize;
        let mut marked = 0u64;

        for (index, group) in groups.iter().enumerate() {
            if ctx.is_cancelled() {
                ctx.report_cancelled();
                invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &[CodingVersion::V2])
                    .await;
                let summary = self
                    .summary(
                        workspace_id,
                        aggregated_groups,
                        marked,
                        Some(threshold),
                        &format!(
                            "Aggregation cancelled after {} of {} groups",
                            aggregated_groups,
                            groups.len()
                        ),
                    )
                    .await?;
                return Ok(JobOutcome::Cancelled(summary));
            }

            match self.mark_group(workspace_id, group).await {
                Ok(rows) => {
                    marked += rows;
                    aggregated_groups += 1;
                }
                Err(e) => {
                    // Earlier groups stay committed; their cached views are stale now
                    invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &[CodingVersion::V2])
                        .await;
                    return Err(e);
                }
            }

            ctx.report_fraction(index + 1, groups.len());
        }

        set_aggregation_threshold(&self.db, workspace_id, threshold)
            .await
            .db_context(APPLY_OPERATION, workspace_id)?;
        invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &[CodingVersion::V2]).await;

        let summary = self
            .summary(
                workspace_id,
                aggregated_groups,
                marked,
                Some(threshold),
                &format!(
                    "Aggregated {} duplicate groups ({} responses marked)",
                    aggregated_groups, marked
                ),
            )
            .await?;

        info!(
            workspace_id,
            threshold,
            groups = aggregated_groups,
            marked,
            aggregated_responses = summary.aggregated_responses,
            "Duplicate aggregation applied"
        );
        ctx.report_completed();

        Ok(JobOutcome::Completed(summary))
    }

    /// Mark every non-master occurrence of one group in a single transaction
    async fn mark_group(&self, workspace_id: i64, group: &DuplicateGroup) -> Result<u64> {
        let ids = group.duplicate_ids();
        if ids.is_empty() {
            return Ok(0);
        }

        let sentinel = CodingTriad::aggregated_duplicate();
        let mut tx = self
            .db
            .begin()
            .await
            .db_context(APPLY_OPERATION, workspace_id)?;

        let mut rows = 0u64;
        for chunk in ids.chunks(AGGREGATION_BATCH_SIZE) {
            // Only open cases; a human v2 code (or an earlier sentinel) is never replaced
            let mut qb = build_triad_update(&[CodingVersion::V2], &sentinel, chunk);
            qb.push(" AND status_v2 IS NULL");

            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .db_context(APPLY_OPERATION, workspace_id)?;
            rows += result.rows_affected();
        }

        tx.commit().await.db_context(APPLY_OPERATION, workspace_id)?;

        debug!(
            workspace_id,
            unit = %group.unit_name,
            variable = %group.variable_id,
            master = ?group.master().map(|m| m.response_id),
            marked = rows,
            "Aggregated duplicate group"
        );
        Ok(rows)
    }

    async fn revert(&self, workspace_id: i64, ctx: &JobContext) -> Result<JobOutcome<AggregationSummary>> {
        let total = count_aggregated_duplicates(&self.db, workspace_id)
            .await
            .db_context(REVERT_OPERATION, workspace_id)?;

        if total == 0 {
            info!(workspace_id, "No aggregated duplicates to revert");
            let summary = self
                .summary(workspace_id, 0, 0, None, "No aggregated responses found")
                .await?;
            ctx.report_progress(100);
            ctx.report_completed();
            return Ok(JobOutcome::Completed(summary));
        }

        info!(workspace_id, total, "Reverting duplicate aggregation");
        ctx.report_progress(0);

        let total_batches = usize::try_from(total)
            .unwrap_or(usize::MAX)
            .div_ceil(AGGREGATION_BATCH_SIZE);
        let mut restored = 0u64;
        let mut batch = 0usize;
        let mut last_id = 0i64;

        loop {
            if ctx.is_cancelled() {
                ctx.report_cancelled();
                if restored > 0 {
                    invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &[CodingVersion::V2])
                        .await;
                }
                let summary = self
                    .summary(
                        workspace_id,
                        0,
                        restored,
                        None,
                        &format!("Revert cancelled after {} responses", restored),
                    )
                    .await?;
                return Ok(JobOutcome::Cancelled(summary));
            }

            match self.revert_batch(workspace_id, last_id).await {
                Ok(None) => break,
                Ok(Some((max_id, rows))) => {
                    last_id = max_id;
                    restored += rows;
                    batch += 1;
                    debug!(workspace_id, batch, rows, "Reverted aggregation batch");
                    ctx.report_fraction(batch.min(total_batches), total_batches);
                }
                Err(e) => {
                    if restored > 0 {
                        invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &[CodingVersion::V2])
                            .await;
                    }
                    return Err(e);
                }
            }
        }

        invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &[CodingVersion::V2]).await;

        let summary = self
            .summary(
                workspace_id,
                0,
                restored,
                None,
                &format!("Reverted aggregation for {} responses", restored),
            )
            .await?;

        info!(workspace_id, restored, "Duplicate aggregation reverted");
        ctx.report_completed();

        Ok(JobOutcome::Completed(summary))
    }

    /// Null the v2 triad of the next batch of sentinel rows after `after_id`
    ///
    /// Returns the highest id touched and the row count, `None` when done.
    async fn revert_batch(&self, workspace_id: i64, after_id: i64) -> Result<Option<(i64, u64)>> {
        let mut tx = self
            .db
            .begin()
            .await
            .db_context(REVERT_OPERATION, workspace_id)?;

        let mut select = ResponseFilter::workspace(workspace_id)
            .including_unconsidered()
            .only_aggregated()
            .after_id(after_id)
            .build_select("r.id");
        select.push(" ORDER BY r.id LIMIT ");
        select.push_bind(AGGREGATION_BATCH_SIZE as i64);

        let ids: Vec<i64> = select
            .build_query_scalar::<i64>()
            .fetch_all(&mut *tx)
            .await
            .db_context(REVERT_OPERATION, workspace_id)?;

        let Some(&max_id) = ids.last() else {
            return Ok(None);
        };

        let mut update = build_triad_update(&[CodingVersion::V2], &CodingTriad::default(), &ids);
        update.push(" AND code_v2 = ");
        update.push_bind(AGGREGATION_SENTINEL_CODE);

        let result = update
            .build()
            .execute(&mut *tx)
            .await
            .db_context(REVERT_OPERATION, workspace_id)?;

        tx.commit().await.db_context(REVERT_OPERATION, workspace_id)?;

        Ok(Some((max_id, result.rows_affected())))
    }

    async fn summary(
        &self,
        workspace_id: i64,
        aggregated_groups: usize,
        changed_responses: u64,
        threshold: Option<i64>,
        message: &str,
    ) -> Result<AggregationSummary> {
        let aggregated_responses = count_aggregated_duplicates(&self.db, workspace_id)
            .await
            .db_context(APPLY_OPERATION, workspace_id)?;
        let unique_coding_cases = self.unique_coding_cases(workspace_id).await?;

        Ok(AggregationSummary {
            aggregated_groups,
            aggregated_responses,
            changed_responses,
            unique_coding_cases,
            threshold,
            message: message.to_string(),
        })
    }

    /// Manual coding cases still open once aggregated duplicates are hidden
    async fn unique_coding_cases(&self, workspace_id: i64) -> Result<i64> {
        let mut qb = ResponseFilter::workspace(workspace_id)
            .v1_statuses(&StatusCode::MANUAL_CODING_STATES)
            .excluding_aggregated()
            .v2_unset()
            .build_select("COUNT(*)");

        qb.build_query_scalar::<i64>()
            .fetch_one(&self.db)
            .await
            .db_context(APPLY_OPERATION, workspace_id)
    }
}
