//! Coding progress statistics
//!
//! Per-version status distributions and the list of variables still waiting
//! for manual coding. Both are cached until a write invalidates them.

use crate::filters::ResponseFilter;
use rcp_common::cache::{incomplete_variables_key, statistics_key, CacheStore, CacheStoreExt};
use rcp_common::db::status_from_column;
use rcp_common::{CodingVersion, DbContext, Result, StatusCode};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const OPERATION: &str = "coding statistics";

/// Status distribution of one coding version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodingStatistics {
    pub workspace_id: i64,
    pub version: CodingVersion,
    /// Responses of considered persons, aggregated duplicates excluded
    pub total_responses: i64,
    /// Count per status name
    pub status_counts: BTreeMap<StatusCode, i64>,
    /// Responses with no status in this version
    pub uncoded: i64,
    /// Stored codes outside the status table
    pub unknown_statuses: i64,
    /// Responses hidden behind an aggregation master (v2 only, 0 otherwise)
    pub aggregated_duplicates: i64,
}

/// A variable with responses still waiting for manual coding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteVariable {
    pub unit_name: String,
    pub variable_id: String,
    pub response_count: i64,
}

pub struct CodingStatisticsService {
    db: SqlitePool,
    cache: Arc<dyn CacheStore>,
}

impl CodingStatisticsService {
    pub fn new(db: SqlitePool, cache: Arc<dyn CacheStore>) -> Self {
        Self { db, cache }
    }

    pub async fn get_statistics(
        &self,
        workspace_id: i64,
        version: CodingVersion,
    ) -> Result<CodingStatistics> {
        let key = statistics_key(workspace_id, version);
        if let Some(cached) = self.cache.get_json::<CodingStatistics>(&key).await {
            debug!(workspace_id, version = %version, "Statistics served from cache");
            return Ok(cached);
        }

        let (status_col, _, _) = version.columns();
        let mut filter = ResponseFilter::workspace(workspace_id);
        if version == CodingVersion::V2 {
            filter = filter.excluding_aggregated();
        }

        let mut qb = filter.build_select(&format!("r.{} AS status, COUNT(*) AS n", status_col));
        qb.push(format!(" GROUP BY r.{}", status_col));

        let rows = qb
            .build()
            .fetch_all(&self.db)
            .await
            .db_context(OPERATION, workspace_id)?;

        let mut stats = CodingStatistics {
            workspace_id,
            version,
            total_responses: 0,
            status_counts: BTreeMap::new(),
            uncoded: 0,
            unknown_statuses: 0,
            aggregated_duplicates: 0,
        };

        for row in &rows {
            let raw: Option<i64> = row.get("status");
            let count: i64 = row.get("n");
            stats.total_responses += count;

            match (raw, status_from_column(raw)) {
                (None, _) => stats.uncoded += count,
                (Some(_), Some(status)) => *stats.status_counts.entry(status).or_default() += count,
                (Some(_), None) => stats.unknown_statuses += count,
            }
        }

        if version == CodingVersion::V2 {
            let mut qb = ResponseFilter::workspace(workspace_id)
                .only_aggregated()
                .build_select("COUNT(*)");
            stats.aggregated_duplicates = qb
                .build_query_scalar::<i64>()
                .fetch_one(&self.db)
                .await
                .db_context(OPERATION, workspace_id)?;
        }

        self.cache.set_json(&key, &stats, None).await?;
        Ok(stats)
    }

    /// Variables with manual-coding responses whose v2 is still unset
    pub async fn incomplete_variables(&self, workspace_id: i64) -> Result<Vec<IncompleteVariable>> {
        let key = incomplete_variables_key(workspace_id);
        if let Some(cached) = self.cache.get_json::<Vec<IncompleteVariable>>(&key).await {
            return Ok(cached);
        }

        let mut qb = ResponseFilter::workspace(workspace_id)
            .v1_statuses(&StatusCode::MANUAL_CODING_STATES)
            .excluding_aggregated()
            .v2_unset()
            .build_select("u.name AS unit_name, r.variable_id, COUNT(*) AS response_count");
        qb.push(" GROUP BY u.name, r.variable_id ORDER BY u.name, r.variable_id");

        let rows = qb
            .build()
            .fetch_all(&self.db)
            .await
            .db_context(OPERATION, workspace_id)?;

        let variables: Vec<IncompleteVariable> = rows
            .iter()
            .map(|row| IncompleteVariable {
                unit_name: row.get("unit_name"),
                variable_id: row.get("variable_id"),
                response_count: row.get("response_count"),
            })
            .collect();

        self.cache.set_json(&key, &variables, None).await?;
        Ok(variables)
    }
}
