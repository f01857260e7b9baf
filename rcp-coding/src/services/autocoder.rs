//! Automated coding passes
//!
//! The scheme evaluation itself is an external black box behind the
//! [`Autocoder`] trait. [`AutocoderRunner`] feeds it the responses of a
//! workspace and persists the returned triads as v1 (first pass) or v3
//! (second pass over human/aggregation results).

use super::invalidate_after_write;
use crate::filters::{build_triad_update, ResponseFilter};
use rcp_common::cache::CacheStore;
use rcp_common::db::status_from_column;
use rcp_common::{
    CodingTriad, CodingVersion, DbContext, Error, JobContext, JobOutcome, Result, StatusCode,
};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info};

/// Responses coded per transaction
pub const AUTOCODER_CHUNK_SIZE: usize = 1000;

/// v1 states the first automated pass codes
pub const AUTOCODE_V1_STATES: [StatusCode; 4] = [
    StatusCode::ValueChanged,
    StatusCode::Displayed,
    StatusCode::PartlyDisplayed,
    StatusCode::Unset,
];

const OPERATION: &str = "autocoding";

/// What the autocoder sees of one response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutocoderInput {
    pub id: i64,
    pub value: Option<String>,
    /// Status of the version the pass builds on
    pub status: Option<StatusCode>,
}

/// Coding scheme entry a response is evaluated against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeVariable {
    pub unit_name: String,
    pub variable_id: String,
}

/// External coding scheme evaluator
///
/// Called once per response, never retried, results never cached.
pub trait Autocoder: Send + Sync {
    fn code(&self, input: &AutocoderInput, variable: &SchemeVariable) -> CodingTriad;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutocoderRunSummary {
    pub target: CodingVersion,
    pub processed: u64,
    pub message: String,
}

pub struct AutocoderRunner {
    db: SqlitePool,
    cache: Arc<dyn CacheStore>,
    autocoder: Arc<dyn Autocoder>,
}

struct PendingRow {
    input: AutocoderInput,
    variable: SchemeVariable,
}

impl AutocoderRunner {
    pub fn new(db: SqlitePool, cache: Arc<dyn CacheStore>, autocoder: Arc<dyn Autocoder>) -> Self {
        Self {
            db,
            cache,
            autocoder,
        }
    }

    /// Run an autocoding pass writing `target` (v1 or v3)
    pub async fn run(
        &self,
        workspace_id: i64,
        target: CodingVersion,
        ctx: &JobContext,
    ) -> Result<JobOutcome<AutocoderRunSummary>> {
        let source_status = match target {
            CodingVersion::V1 => "r.status_v1",
            CodingVersion::V3 => "r.status_v2",
            CodingVersion::V2 => {
                return Err(Error::Validation(
                    "v2 is written by coders and aggregation, not the autocoder".to_string(),
                ))
            }
        };

        let total = self.count(workspace_id, target).await?;
        info!(workspace_id, target = %target, total, "Starting autocoder pass");
        ctx.report_progress(0);

        let mut processed = 0u64;
        let mut last_id = 0i64;

        loop {
            if ctx.is_cancelled() {
                ctx.report_cancelled();
                if processed > 0 {
                    invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &[target]).await;
                }
                return Ok(JobOutcome::Cancelled(AutocoderRunSummary {
                    target,
                    processed,
                    message: format!("Autocoding cancelled after {} of {} responses", processed, total),
                }));
            }

            match self
                .code_chunk(workspace_id, target, source_status, last_id)
                .await
            {
                Ok(None) => break,
                Ok(Some((max_id, rows))) => {
                    last_id = max_id;
                    processed += rows;
                    debug!(workspace_id, target = %target, processed, "Autocoded chunk");
                    ctx.report_fraction(
                        usize::try_from(processed).unwrap_or(usize::MAX),
                        usize::try_from(total).unwrap_or(usize::MAX),
                    );
                }
                Err(e) => {
                    if processed > 0 {
                        invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &[target])
                            .await;
                    }
                    return Err(e);
                }
            }
        }

        if processed > 0 {
            invalidate_after_write(self.cache.as_ref(), ctx, workspace_id, &[target]).await;
        }
        ctx.report_progress(100);
        ctx.report_completed();
        info!(workspace_id, target = %target, processed, "Autocoder pass complete");

        Ok(JobOutcome::Completed(AutocoderRunSummary {
            target,
            processed,
            message: format!("Autocoded {} responses into {}", processed, target),
        }))
    }

    fn filter(workspace_id: i64, target: CodingVersion, after_id: i64) -> ResponseFilter {
        let base = ResponseFilter::workspace(workspace_id).after_id(after_id);
        match target {
            CodingVersion::V3 => base.excluding_aggregated().v2_set(),
            _ => base.v1_statuses(&AUTOCODE_V1_STATES),
        }
    }

    async fn count(&self, workspace_id: i64, target: CodingVersion) -> Result<i64> {
        let mut qb = Self::filter(workspace_id, target, 0).build_select("COUNT(*)");
        qb.build_query_scalar::<i64>()
            .fetch_one(&self.db)
            .await
            .db_context(OPERATION, workspace_id)
    }

    /// Code and persist the next chunk after `after_id` in one transaction
    async fn code_chunk(
        &self,
        workspace_id: i64,
        target: CodingVersion,
        source_status: &str,
        after_id: i64,
    ) -> Result<Option<(i64, u64)>> {
        let mut tx = self.db.begin().await.db_context(OPERATION, workspace_id)?;

        let mut select = Self::filter(workspace_id, target, after_id).build_select(&format!(
            "r.id, r.value, {} AS source_status, u.name AS unit_name, r.variable_id",
            source_status
        ));
        select.push(" ORDER BY r.id LIMIT ");
        select.push_bind(AUTOCODER_CHUNK_SIZE as i64);

        let rows = select
            .build()
            .fetch_all(&mut *tx)
            .await
            .db_context(OPERATION, workspace_id)?;

        let pending: Vec<PendingRow> = rows
            .iter()
            .map(|row| PendingRow {
                input: AutocoderInput {
                    id: row.get("id"),
                    value: row.get("value"),
                    status: status_from_column(row.get("source_status")),
                },
                variable: SchemeVariable {
                    unit_name: row.get("unit_name"),
                    variable_id: row.get("variable_id"),
                },
            })
            .collect();

        let Some(max_id) = pending.last().map(|p| p.input.id) else {
            return Ok(None);
        };

        for row in &pending {
            let triad = self.autocoder.code(&row.input, &row.variable);
            build_triad_update(&[target], &triad, &[row.input.id])
                .build()
                .execute(&mut *tx)
                .await
                .db_context(OPERATION, workspace_id)?;
        }

        tx.commit().await.db_context(OPERATION, workspace_id)?;

        Ok(Some((max_id, pending.len() as u64)))
    }
}
