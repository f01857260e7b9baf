//! Empty and duplicate response analysis
//!
//! Scans every (unit, variable) pair that reached manual coding in v1
//! (CODING_INCOMPLETE / INTENDED_INCOMPLETE) and reports:
//! - empty responses (no value, v2 still unset)
//! - duplicate groups (same normalized value, at least `threshold` times)
//!
//! # Algorithm
//! 1. Resolve the effective threshold (forced to 2 under NO_AGGREGATION)
//! 2. Return the cached full result for (workspace, flags, threshold) if present
//! 3. Collect the eligible (unit, variable) universe
//! 4. Fetch and partition responses chunk by chunk (50 pairs per chunk),
//!    skipping responses already collapsed as aggregated duplicates
//! 5. Merge duplicate candidates across chunks, then apply the threshold
//! 6. Sort, attach the aggregation-applied flag, cache the full result
//!
//! Cancellation and progress are handled between chunks only.

use crate::filters::ResponseFilter;
use crate::normalization::normalize;
use crate::pagination::{paginate, Page};
use chrono::{DateTime, Utc};
use rcp_common::cache::{analysis_key, CacheStore, CacheStoreExt};
use rcp_common::db::{aggregation_applied, get_aggregation_threshold, get_matching_flags};
use rcp_common::models::{is_empty_value, DEFAULT_DUPLICATE_THRESHOLD};
use rcp_common::{
    DbContext, Error, JobContext, JobOutcome, MatchingFlag, MatchingFlags, Result, StatusCode,
};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Number of (unit, variable) pairs fetched per query
pub const ANALYSIS_CHUNK_SIZE: usize = 50;

const OPERATION: &str = "response analysis";

/// A response without a value that still needs handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyResponse {
    pub unit_name: String,
    pub unit_alias: Option<String>,
    pub variable_id: String,
    pub person_login: String,
    pub person_code: String,
    pub booklet_name: String,
    pub response_id: i64,
    pub value: Option<String>,
}

/// One response inside a duplicate group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateOccurrence {
    pub person_login: String,
    pub person_code: String,
    pub booklet_name: String,
    pub response_id: i64,
    pub value: String,
}

/// Responses of one variable sharing a normalized value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub unit_name: String,
    pub variable_id: String,
    pub normalized_value: String,
    /// Ordered by response id
    pub occurrences: Vec<DuplicateOccurrence>,
}

impl DuplicateGroup {
    pub fn count(&self) -> usize {
        self.occurrences.len()
    }

    /// Occurrence kept as master on aggregation: the lowest response id
    pub fn master(&self) -> Option<&DuplicateOccurrence> {
        self.occurrences.iter().min_by_key(|o| o.response_id)
    }

    /// Every response id except the master's
    pub fn duplicate_ids(&self) -> Vec<i64> {
        let master = self.master().map(|m| m.response_id);
        let mut ids: Vec<i64> = self
            .occurrences
            .iter()
            .map(|o| o.response_id)
            .filter(|id| Some(*id) != master)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Full (unpaginated) analysis of one workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub workspace_id: i64,
    pub empty_responses: Vec<EmptyResponse>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    pub aggregation_already_applied: bool,
    pub matching_flags: MatchingFlags,
    /// Effective threshold the groups were filtered with
    pub threshold: i64,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisResult {
    fn empty(workspace_id: i64, flags: MatchingFlags, threshold: i64, applied: bool) -> Self {
        Self {
            workspace_id,
            empty_responses: Vec::new(),
            duplicate_groups: Vec::new(),
            aggregation_already_applied: applied,
            matching_flags: flags,
            threshold,
            timestamp: Utc::now(),
        }
    }

    /// Number of responses across all duplicate groups
    pub fn duplicate_response_count(&self) -> usize {
        self.duplicate_groups.iter().map(DuplicateGroup::count).sum()
    }

    pub fn page_empty_responses(&self, page: usize, limit: usize) -> Page<EmptyResponse> {
        paginate(&self.empty_responses, page, limit)
    }

    pub fn page_duplicate_groups(&self, page: usize, limit: usize) -> Page<DuplicateGroup> {
        paginate(&self.duplicate_groups, page, limit)
    }
}

/// Response row as fetched for one chunk
#[derive(Debug, Clone)]
pub(crate) struct ChunkRow {
    pub response_id: i64,
    pub unit_name: String,
    pub unit_alias: Option<String>,
    pub variable_id: String,
    pub value: Option<String>,
    pub status_v2: Option<i64>,
    pub booklet_name: String,
    pub person_login: String,
    pub person_code: String,
}

/// (unit name, variable id, normalized value)
type GroupKey = (String, String, String);

/// Apply the NO_AGGREGATION override to a requested threshold
///
/// With NO_AGGREGATION set the threshold is always 2, whatever the caller asked.
pub fn resolve_threshold(flags: &MatchingFlags, requested: i64) -> i64 {
    if flags.contains(MatchingFlag::NoAggregation) {
        DEFAULT_DUPLICATE_THRESHOLD
    } else {
        requested
    }
}

/// Response analyzer service
pub struct ResponseAnalyzer {
    db: SqlitePool,
    cache: Arc<dyn CacheStore>,
    cache_ttl: Option<Duration>,
}

impl ResponseAnalyzer {
    pub fn new(db: SqlitePool, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            db,
            cache,
            cache_ttl: None,
        }
    }

    /// Bound the lifetime of cached results (default: until invalidated)
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Analyze a workspace for empty and duplicate responses
    ///
    /// `requested_threshold` defaults to the workspace's persisted aggregation
    /// threshold (2 if none). A cancelled run returns the partial result and
    /// does not populate the cache.
    pub async fn analyze(
        &self,
        workspace_id: i64,
        requested_threshold: Option<i64>,
        ctx: &JobContext,
    ) -> Result<JobOutcome<AnalysisResult>> {
        let flags = get_matching_flags(&self.db, workspace_id)
            .await
            .db_context(OPERATION, workspace_id)?;

        let requested = match requested_threshold {
            Some(t) => t,
            None => get_aggregation_threshold(&self.db, workspace_id)
                .await
                .db_context(OPERATION, workspace_id)?,
        };
        let threshold = resolve_threshold(&flags, requested);
        if threshold < DEFAULT_DUPLICATE_THRESHOLD {
            return Err(Error::Validation(format!(
                "Duplicate threshold must be at least {}, got {}",
                DEFAULT_DUPLICATE_THRESHOLD, threshold
            )));
        }

        let key = analysis_key(workspace_id, &flags, threshold);
        if let Some(cached) = self.cache.get_json::<AnalysisResult>(&key).await {
            debug!(workspace_id, key = %key, "Response analysis served from cache");
            return Ok(JobOutcome::Completed(cached));
        }

        info!(
            workspace_id,
            threshold,
            flags = %flags.cache_fragment(),
            "Starting response analysis"
        );
        ctx.report_progress(0);

        let aggregation_already_applied = aggregation_applied(&self.db, workspace_id)
            .await
            .db_context(OPERATION, workspace_id)?;

        let universe = self.eligible_variables(workspace_id).await?;
        if universe.is_empty() {
            info!(workspace_id, "No variables eligible for response analysis");
            let result =
                AnalysisResult::empty(workspace_id, flags, threshold, aggregation_already_applied);
            self.cache.set_json(&key, &result, self.cache_ttl).await?;
            ctx.report_progress(100);
            ctx.report_completed();
            return Ok(JobOutcome::Completed(result));
        }

        let total_chunks = universe.len().div_ceil(ANALYSIS_CHUNK_SIZE);
        let mut empty_responses = Vec::new();
        let mut candidates: BTreeMap<GroupKey, Vec<DuplicateOccurrence>> = BTreeMap::new();

        for (index, chunk) in universe.chunks(ANALYSIS_CHUNK_SIZE).enumerate() {
            if ctx.is_cancelled() {
                info!(
                    workspace_id,
                    processed_chunks = index,
                    total_chunks,
                    "Response analysis cancelled"
                );
                ctx.report_cancelled();
                let partial = finish(
                    workspace_id,
                    empty_responses,
                    candidates,
                    flags,
                    threshold,
                    aggregation_already_applied,
                );
                return Ok(JobOutcome::Cancelled(partial));
            }

            let rows = self.fetch_chunk(workspace_id, chunk).await?;
            let row_count = rows.len();
            let (chunk_empty, chunk_groups) = partition_rows(rows, &flags);

            empty_responses.extend(chunk_empty);
            for (key, occurrences) in chunk_groups {
                candidates.entry(key).or_default().extend(occurrences);
            }

            debug!(
                workspace_id,
                chunk = index + 1,
                total_chunks,
                rows = row_count,
                "Processed analysis chunk"
            );
            ctx.report_fraction(index + 1, total_chunks);
        }

        let result = finish(
            workspace_id,
            empty_responses,
            candidates,
            flags,
            threshold,
            aggregation_already_applied,
        );

        self.cache.set_json(&key, &result, self.cache_ttl).await?;

        info!(
            workspace_id,
            variables = universe.len(),
            empty = result.empty_responses.len(),
            duplicate_groups = result.duplicate_groups.len(),
            "Response analysis complete"
        );
        ctx.report_completed();

        Ok(JobOutcome::Completed(result))
    }

    /// Distinct (unit name, variable id) pairs that reached manual coding in v1
    async fn eligible_variables(&self, workspace_id: i64) -> Result<Vec<(String, String)>> {
        let mut qb = ResponseFilter::workspace(workspace_id)
            .v1_statuses(&StatusCode::MANUAL_CODING_STATES)
            .build_select("DISTINCT u.name AS unit_name, r.variable_id AS variable_id");
        qb.push(" ORDER BY unit_name, variable_id");

        let rows = qb
            .build()
            .fetch_all(&self.db)
            .await
            .db_context(OPERATION, workspace_id)?;

        Ok(rows
            .iter()
            .map(|row| (row.get("unit_name"), row.get("variable_id")))
            .collect())
    }

    async fn fetch_chunk(
        &self,
        workspace_id: i64,
        pairs: &[(String, String)],
    ) -> Result<Vec<ChunkRow>> {
        let mut qb = ResponseFilter::workspace(workspace_id)
            .unit_variables(pairs.to_vec())
            .v1_statuses(&StatusCode::MANUAL_CODING_STATES)
            .excluding_aggregated()
            .build_select(
                "r.id AS response_id, u.name AS unit_name, u.alias AS unit_alias, \
                 r.variable_id, r.value, r.status_v2, b.name AS booklet_name, \
                 p.login AS person_login, p.code AS person_code",
            );
        qb.push(" ORDER BY r.id");

        let rows = qb
            .build()
            .fetch_all(&self.db)
            .await
            .db_context(OPERATION, workspace_id)?;

        Ok(rows
            .iter()
            .map(|row| ChunkRow {
                response_id: row.get("response_id"),
                unit_name: row.get("unit_name"),
                unit_alias: row.get("unit_alias"),
                variable_id: row.get("variable_id"),
                value: row.get("value"),
                status_v2: row.get("status_v2"),
                booklet_name: row.get("booklet_name"),
                person_login: row.get("person_login"),
                person_code: row.get("person_code"),
            })
            .collect())
    }
}

/// Split one chunk into empty responses and duplicate candidates
///
/// Empty responses whose v2 status is already set were handled by a coder or
/// an aggregation and are dropped silently. Candidates are not yet
/// threshold-filtered; a group may continue in a later chunk.
pub(crate) fn partition_rows(
    rows: Vec<ChunkRow>,
    flags: &MatchingFlags,
) -> (Vec<EmptyResponse>, BTreeMap<GroupKey, Vec<DuplicateOccurrence>>) {
    let mut empty = Vec::new();
    let mut groups: BTreeMap<GroupKey, Vec<DuplicateOccurrence>> = BTreeMap::new();

    for row in rows {
        if is_empty_value(row.value.as_deref()) {
            if row.status_v2.is_none() {
                empty.push(EmptyResponse {
                    unit_name: row.unit_name,
                    unit_alias: row.unit_alias,
                    variable_id: row.variable_id,
                    person_login: row.person_login,
                    person_code: row.person_code,
                    booklet_name: row.booklet_name,
                    response_id: row.response_id,
                    value: row.value,
                });
            }
            continue;
        }

        let raw = row.value.unwrap_or_default();
        let normalized = normalize(Some(&raw), flags);
        groups
            .entry((row.unit_name, row.variable_id, normalized))
            .or_default()
            .push(DuplicateOccurrence {
                person_login: row.person_login,
                person_code: row.person_code,
                booklet_name: row.booklet_name,
                response_id: row.response_id,
                value: raw,
            });
    }

    (empty, groups)
}

/// Threshold-filter merged candidates and sort everything for stable paging
fn finish(
    workspace_id: i64,
    mut empty_responses: Vec<EmptyResponse>,
    candidates: BTreeMap<GroupKey, Vec<DuplicateOccurrence>>,
    flags: MatchingFlags,
    threshold: i64,
    aggregation_already_applied: bool,
) -> AnalysisResult {
    let min_count = usize::try_from(threshold).unwrap_or(usize::MAX);

    let mut duplicate_groups: Vec<DuplicateGroup> = candidates
        .into_iter()
        .filter(|(_, occurrences)| occurrences.len() >= min_count)
        .map(|((unit_name, variable_id, normalized_value), mut occurrences)| {
            occurrences.sort_by_key(|o| o.response_id);
            DuplicateGroup {
                unit_name,
                variable_id,
                normalized_value,
                occurrences,
            }
        })
        .collect();

    empty_responses.sort_by(|a, b| {
        (&a.unit_name, &a.variable_id, &a.person_login)
            .cmp(&(&b.unit_name, &b.variable_id, &b.person_login))
            .then(a.response_id.cmp(&b.response_id))
    });
    duplicate_groups.sort_by(|a, b| {
        (&a.unit_name, &a.variable_id)
            .cmp(&(&b.unit_name, &b.variable_id))
            .then_with(|| a.normalized_value.cmp(&b.normalized_value))
    });

    AnalysisResult {
        workspace_id,
        empty_responses,
        duplicate_groups,
        aggregation_already_applied,
        matching_flags: flags,
        threshold,
        timestamp: Utc::now(),
    }
}
