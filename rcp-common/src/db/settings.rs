//! Workspace settings
//!
//! Per-workspace key/value pairs. Matching flags are read at analysis start;
//! the aggregation threshold is persisted after a successful aggregation.

use crate::models::{MatchingFlag, MatchingFlags, DEFAULT_DUPLICATE_THRESHOLD};
use crate::{Error, Result};
use sqlx::{Pool, Sqlite, SqliteExecutor};

pub const MATCHING_MODE_KEY: &str = "response_matching_mode";
pub const AGGREGATION_THRESHOLD_KEY: &str = "aggregation_threshold";

/// Get the workspace's response matching flags
///
/// Missing setting means no flags. Unknown flag names are logged and skipped.
pub async fn get_matching_flags(db: &Pool<Sqlite>, workspace_id: i64) -> Result<MatchingFlags> {
    let raw = get_setting::<String>(db, workspace_id, MATCHING_MODE_KEY).await?;
    let Some(raw) = raw else {
        return Ok(MatchingFlags::new());
    };

    let names: Vec<String> = match serde_json::from_str(&raw) {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!(
                workspace_id,
                value = %raw,
                error = %e,
                "Ignoring malformed response matching setting"
            );
            return Ok(MatchingFlags::new());
        }
    };

    let flags = names
        .iter()
        .filter_map(|name| match name.parse::<MatchingFlag>() {
            Ok(flag) => Some(flag),
            Err(e) => {
                tracing::warn!(workspace_id, error = %e, "Ignoring unknown matching flag");
                None
            }
        })
        .collect();

    Ok(flags)
}

/// Store the workspace's response matching flags
pub async fn set_matching_flags(
    db: &Pool<Sqlite>,
    workspace_id: i64,
    flags: &MatchingFlags,
) -> Result<()> {
    let names: Vec<&str> = flags.iter().map(|f| f.as_str()).collect();
    let value = serde_json::to_string(&names)?;
    set_setting(db, workspace_id, MATCHING_MODE_KEY, value).await
}

/// Get the threshold of the last applied aggregation
///
/// **Default:** 2. A value that is not an integer ≥ 2 is logged and ignored.
pub async fn get_aggregation_threshold(db: &Pool<Sqlite>, workspace_id: i64) -> Result<i64> {
    let raw = get_setting::<String>(db, workspace_id, AGGREGATION_THRESHOLD_KEY).await?;
    let Some(raw) = raw else {
        return Ok(DEFAULT_DUPLICATE_THRESHOLD);
    };

    match raw.trim().parse::<i64>() {
        Ok(threshold) if threshold >= DEFAULT_DUPLICATE_THRESHOLD => Ok(threshold),
        _ => {
            tracing::warn!(
                workspace_id,
                value = %raw,
                "Ignoring malformed aggregation threshold setting"
            );
            Ok(DEFAULT_DUPLICATE_THRESHOLD)
        }
    }
}

/// Persist the threshold used by an applied aggregation
pub async fn set_aggregation_threshold(
    db: &Pool<Sqlite>,
    workspace_id: i64,
    threshold: i64,
) -> Result<()> {
    set_setting(db, workspace_id, AGGREGATION_THRESHOLD_KEY, threshold).await
}

/// Generic setting getter
pub async fn get_setting<T>(db: &Pool<Sqlite>, workspace_id: i64, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT value FROM workspace_settings WHERE workspace_id = ? AND key = ?")
            .bind(workspace_id)
            .bind(key)
            .fetch_optional(db)
            .await
            .map_err(Error::Database)?;

    match row {
        Some((Some(value),)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting {} failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

/// Generic setting setter (UPSERT)
pub async fn set_setting<'e, E, T>(executor: E, workspace_id: i64, key: &str, value: T) -> Result<()>
where
    E: SqliteExecutor<'e>,
    T: std::fmt::Display,
{
    sqlx::query(
        r#"
        INSERT INTO workspace_settings (workspace_id, key, value, updated_at)
        VALUES (?, ?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(workspace_id, key) DO UPDATE SET
            value = excluded.value,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(workspace_id)
    .bind(key)
    .bind(value.to_string())
    .execute(executor)
    .await
    .map_err(Error::Database)?;

    Ok(())
}
