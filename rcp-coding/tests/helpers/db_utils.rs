//! Database Test Utilities
//!
//! In-memory workspace databases and row seeding

use anyhow::Result;
use rcp_common::cache::MemoryCache;
use rcp_common::db::{create_schema, load_response};
use rcp_common::events::EventBus;
use rcp_common::{CodingTriad, CodingVersion, Response, StatusCode};
use rcp_coding::PipelineState;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Create an in-memory database with the full schema
///
/// One connection only: every `sqlite::memory:` connection is its own database.
pub async fn create_test_db() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Pipeline state over a fresh database, with direct access to the cache
pub async fn test_state() -> Result<(PipelineState, Arc<MemoryCache>)> {
    let pool = create_test_db().await?;
    let cache = Arc::new(MemoryCache::new());
    let state = PipelineState::new(pool, cache.clone(), EventBus::new(256));
    Ok((state, cache))
}

/// Insert a person with one booklet, returning the booklet id
pub async fn add_booklet(
    pool: &SqlitePool,
    workspace_id: i64,
    login: &str,
    consider: bool,
) -> Result<i64> {
    let person_id = sqlx::query(
        "INSERT INTO persons (workspace_id, login, code, consider) VALUES (?, ?, ?, ?)",
    )
    .bind(workspace_id)
    .bind(login)
    .bind(format!("{}-code", login))
    .bind(consider as i64)
    .execute(pool)
    .await?
    .last_insert_rowid();

    let booklet_id = sqlx::query("INSERT INTO booklets (person_id, name) VALUES (?, 'BOOKLET_1')")
        .bind(person_id)
        .execute(pool)
        .await?
        .last_insert_rowid();

    Ok(booklet_id)
}

pub async fn add_unit(pool: &SqlitePool, booklet_id: i64, name: &str) -> Result<i64> {
    let id = sqlx::query("INSERT INTO units (booklet_id, name, alias) VALUES (?, ?, ?)")
        .bind(booklet_id)
        .bind(name)
        .bind(format!("{} alias", name))
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok(id)
}

pub async fn add_response(
    pool: &SqlitePool,
    unit_id: i64,
    variable_id: &str,
    value: Option<&str>,
    status_v1: StatusCode,
) -> Result<i64> {
    let id = sqlx::query(
        "INSERT INTO responses (unit_id, variable_id, value, status_v1) VALUES (?, ?, ?, ?)",
    )
    .bind(unit_id)
    .bind(variable_id)
    .bind(value)
    .bind(status_v1.code())
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Insert a response under a fixed id
pub async fn add_response_with_id(
    pool: &SqlitePool,
    id: i64,
    unit_id: i64,
    variable_id: &str,
    value: Option<&str>,
    status_v1: StatusCode,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO responses (id, unit_id, variable_id, value, status_v1) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(unit_id)
    .bind(variable_id)
    .bind(value)
    .bind(status_v1.code())
    .execute(pool)
    .await?;
    Ok(())
}

/// One person answering one unit variable, sent to manual coding by v1
///
/// Returns the response id.
pub async fn manual_response(
    pool: &SqlitePool,
    workspace_id: i64,
    login: &str,
    unit: &str,
    variable_id: &str,
    value: Option<&str>,
) -> Result<i64> {
    let booklet_id = add_booklet(pool, workspace_id, login, true).await?;
    let unit_id = add_unit(pool, booklet_id, unit).await?;
    add_response(pool, unit_id, variable_id, value, StatusCode::CodingIncomplete).await
}

/// Overwrite one version's triad of a response
pub async fn set_triad(
    pool: &SqlitePool,
    response_id: i64,
    version: CodingVersion,
    triad: CodingTriad,
) -> Result<()> {
    let (status_col, code_col, score_col) = version.columns();
    let sql = format!(
        "UPDATE responses SET {} = ?, {} = ?, {} = ? WHERE id = ?",
        status_col, code_col, score_col
    );
    sqlx::query(&sql)
        .bind(triad.status.map(StatusCode::code))
        .bind(triad.code)
        .bind(triad.score)
        .bind(response_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn load(pool: &SqlitePool, response_id: i64) -> Result<Response> {
    load_response(pool, response_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("response {} missing", response_id))
}

/// Coders and coding jobs for agreement tests
pub struct CodingSeed<'a> {
    pool: &'a SqlitePool,
    workspace_id: i64,
}

impl<'a> CodingSeed<'a> {
    pub fn new(pool: &'a SqlitePool, workspace_id: i64) -> Self {
        Self { pool, workspace_id }
    }

    pub async fn coder(&self, username: &str) -> Result<i64> {
        let id = sqlx::query("INSERT INTO coders (username) VALUES (?)")
            .bind(username)
            .execute(self.pool)
            .await?
            .last_insert_rowid();
        Ok(id)
    }

    /// Coding job assigned to one coder
    pub async fn job(&self, name: &str, coder_id: i64, training_id: Option<i64>) -> Result<i64> {
        let job_id = sqlx::query(
            "INSERT INTO coding_jobs (workspace_id, name, training_id) VALUES (?, ?, ?)",
        )
        .bind(self.workspace_id)
        .bind(name)
        .bind(training_id)
        .execute(self.pool)
        .await?
        .last_insert_rowid();

        sqlx::query("INSERT INTO coding_job_coders (coding_job_id, coder_id) VALUES (?, ?)")
            .bind(job_id)
            .bind(coder_id)
            .execute(self.pool)
            .await?;

        Ok(job_id)
    }

    /// Add another coder to an existing job
    pub async fn assign(&self, job_id: i64, coder_id: i64) -> Result<()> {
        sqlx::query("INSERT INTO coding_job_coders (coding_job_id, coder_id) VALUES (?, ?)")
            .bind(job_id)
            .bind(coder_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

/// Record a coder's code for a response within a coding job
pub async fn add_coding(
    pool: &SqlitePool,
    job_id: i64,
    response_id: i64,
    unit_name: &str,
    variable_id: &str,
    code: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO coding_job_units (coding_job_id, response_id, unit_name, variable_id, code) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(job_id)
    .bind(response_id)
    .bind(unit_name)
    .bind(variable_id)
    .bind(code)
    .execute(pool)
    .await?;
    Ok(())
}
