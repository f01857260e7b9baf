//! Database initialization
//!
//! Creates the response store schema idempotently. The `status_*` columns hold
//! [`StatusCode`](crate::StatusCode) integers and `code_v2 = -111` marks
//! aggregated duplicates; both are an on-disk contract.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (or create) the database and make sure all tables exist
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL lets analysis reads proceed while a batch update holds the writer
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every table and index used by the pipeline (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_persons_table(pool).await?;
    create_booklets_table(pool).await?;
    create_units_table(pool).await?;
    create_responses_table(pool).await?;
    create_workspace_settings_table(pool).await?;

    // Manual coding tables (written by the human coding path)
    create_coders_table(pool).await?;
    create_coding_jobs_tables(pool).await?;

    Ok(())
}

async fn create_persons_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS persons (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workspace_id INTEGER NOT NULL,
            login TEXT NOT NULL,
            code TEXT NOT NULL DEFAULT '',
            group_name TEXT NOT NULL DEFAULT '',
            consider INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_persons_workspace ON persons(workspace_id, consider)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_booklets_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS booklets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            person_id INTEGER NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
            name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_booklets_person ON booklets(person_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_units_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS units (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            booklet_id INTEGER NOT NULL REFERENCES booklets(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            alias TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_units_booklet ON units(booklet_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_units_name ON units(name)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_responses_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS responses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            unit_id INTEGER NOT NULL REFERENCES units(id) ON DELETE CASCADE,
            variable_id TEXT NOT NULL,
            value TEXT,
            status_v1 INTEGER,
            code_v1 INTEGER,
            score_v1 INTEGER,
            status_v2 INTEGER,
            code_v2 INTEGER,
            score_v2 INTEGER,
            status_v3 INTEGER,
            code_v3 INTEGER,
            score_v3 INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_responses_unit_variable ON responses(unit_id, variable_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_responses_status_v1 ON responses(status_v1)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_responses_code_v2 ON responses(code_v2)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the per-workspace key/value settings table
pub async fn create_workspace_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workspace_settings (
            workspace_id INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (workspace_id, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_coders_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS coders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_coding_jobs_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS coding_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workspace_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            training_id INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS coding_job_coders (
            coding_job_id INTEGER NOT NULL REFERENCES coding_jobs(id) ON DELETE CASCADE,
            coder_id INTEGER NOT NULL REFERENCES coders(id) ON DELETE CASCADE,
            PRIMARY KEY (coding_job_id, coder_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS coding_job_units (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            coding_job_id INTEGER NOT NULL REFERENCES coding_jobs(id) ON DELETE CASCADE,
            response_id INTEGER NOT NULL REFERENCES responses(id) ON DELETE CASCADE,
            unit_name TEXT NOT NULL,
            variable_id TEXT NOT NULL,
            code INTEGER,
            score INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_coding_job_units_response ON coding_job_units(response_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
