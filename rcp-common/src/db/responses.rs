//! Response row mapping
//!
//! Status columns are read as raw integers and converted through the
//! [`StatusCode`] table; codes outside the table are logged and read as unset.

use crate::models::{CodingTriad, Response};
use crate::status::StatusCode;
use crate::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};

/// Column list matching [`response_from_row`]
pub const RESPONSE_COLUMNS: &str = "r.id, r.unit_id, r.variable_id, r.value, \
     r.status_v1, r.code_v1, r.score_v1, \
     r.status_v2, r.code_v2, r.score_v2, \
     r.status_v3, r.code_v3, r.score_v3";

/// Convert a stored status integer into a [`StatusCode`]
pub fn status_from_column(raw: Option<i64>) -> Option<StatusCode> {
    let code = raw?;
    let status = StatusCode::from_code(code);
    if status.is_none() {
        tracing::warn!(code, "Unknown status code in response row, treating as unset");
    }
    status
}

fn triad_from_row(row: &SqliteRow, status: &str, code: &str, score: &str) -> CodingTriad {
    CodingTriad {
        status: status_from_column(row.get(status)),
        code: row.get(code),
        score: row.get(score),
    }
}

/// Map a row selected with [`RESPONSE_COLUMNS`]
pub fn response_from_row(row: &SqliteRow) -> Response {
    Response {
        id: row.get("id"),
        unit_id: row.get("unit_id"),
        variable_id: row.get("variable_id"),
        value: row.get("value"),
        v1: triad_from_row(row, "status_v1", "code_v1", "score_v1"),
        v2: triad_from_row(row, "status_v2", "code_v2", "score_v2"),
        v3: triad_from_row(row, "status_v3", "code_v3", "score_v3"),
    }
}

/// Load one response by id
pub async fn load_response<'e, E>(executor: E, id: i64) -> Result<Option<Response>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("SELECT {} FROM responses r WHERE r.id = ?", RESPONSE_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;

    Ok(row.as_ref().map(response_from_row))
}

/// Count responses carrying the aggregation sentinel in a workspace
pub async fn count_aggregated_duplicates<'e, E>(executor: E, workspace_id: i64) -> Result<i64>
where
    E: SqliteExecutor<'e>,
{
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM responses r
        JOIN units u ON r.unit_id = u.id
        JOIN booklets b ON u.booklet_id = b.id
        JOIN persons p ON b.person_id = p.id
        WHERE p.workspace_id = ? AND r.code_v2 = ?
        "#,
    )
    .bind(workspace_id)
    .bind(crate::models::AGGREGATION_SENTINEL_CODE)
    .fetch_one(executor)
    .await?;

    Ok(count)
}

/// True when any response of the workspace carries the aggregation sentinel
pub async fn aggregation_applied<'e, E>(executor: E, workspace_id: i64) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let applied: i64 = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM responses r
            JOIN units u ON r.unit_id = u.id
            JOIN booklets b ON u.booklet_id = b.id
            JOIN persons p ON b.person_id = p.id
            WHERE p.workspace_id = ? AND r.code_v2 = ?
        )
        "#,
    )
    .bind(workspace_id)
    .bind(crate::models::AGGREGATION_SENTINEL_CODE)
    .fetch_one(executor)
    .await?;

    Ok(applied != 0)
}
