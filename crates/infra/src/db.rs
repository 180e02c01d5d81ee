//! SQLite connection setup and schema.
//!
//! One database file holds every table the pipeline needs; the queue may
//! point at its own file through `QUEUE_DATABASE_URL` and gets the same
//! schema applied.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

/// Database setup error. Any of these at startup is fatal.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("invalid database url {url:?}: {source}")]
    InvalidUrl { url: String, source: sqlx::Error },
    #[error("failed to create database directory {path}: {source}")]
    CreateDir { path: String, source: std::io::Error },
    #[error("failed to connect to {url:?}: {source}")]
    Connect { url: String, source: sqlx::Error },
    #[error("migration step {step} failed: {source}")]
    Migrate { step: &'static str, source: sqlx::Error },
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "create_apps",
        r#"
        CREATE TABLE IF NOT EXISTS apps (
            id          TEXT PRIMARY KEY,
            created_at  INTEGER NOT NULL
        )
        "#,
    ),
    (
        "create_reviews",
        r#"
        CREATE TABLE IF NOT EXISTS reviews (
            app_id      TEXT NOT NULL,
            id          TEXT NOT NULL,
            author      TEXT NOT NULL,
            title       TEXT NOT NULL,
            content     TEXT NOT NULL,
            rating      INTEGER NOT NULL,
            sent_at     INTEGER NOT NULL,
            created_at  INTEGER NOT NULL,
            PRIMARY KEY (app_id, id)
        )
        "#,
    ),
    (
        "index_reviews_sent_at",
        "CREATE INDEX IF NOT EXISTS reviews_app_sent_at ON reviews (app_id, sent_at DESC)",
    ),
    (
        "create_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            payload       BLOB NOT NULL,
            ack_deadline  INTEGER NULL,
            retry_count   INTEGER NOT NULL DEFAULT 0,
            created_at    INTEGER NOT NULL
        )
        "#,
    ),
    (
        "index_jobs_ack_deadline",
        "CREATE INDEX IF NOT EXISTS jobs_ack_deadline ON jobs (ack_deadline)",
    ),
    (
        "create_dead_letter_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS dead_letter_jobs (
            job_id            INTEGER PRIMARY KEY,
            payload           BLOB NOT NULL,
            retry_count       INTEGER NOT NULL,
            dead_lettered_at  INTEGER NOT NULL
        )
        "#,
    ),
];

/// Open a connection pool.
///
/// Creates the file (and its directory) when missing and switches the
/// database to WAL so the scheduler and consumer can write concurrently.
pub async fn connect(url: &str) -> Result<SqlitePool, DbError> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|source| DbError::InvalidUrl {
            url: url.to_string(),
            source,
        })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let filename = options.get_filename().to_path_buf();
    let in_memory = filename.as_os_str() == ":memory:";
    if !in_memory {
        if let Some(parent) = filename.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DbError::CreateDir {
                    path: parent.display().to_string(),
                    source,
                })?;
        }
    }

    // Every connection to `:memory:` is its own database.
    let max_connections = if in_memory { 1 } else { 5 };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|source| DbError::Connect {
            url: url.to_string(),
            source,
        })
}

/// Apply the schema. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<(), DbError> {
    for &(step, sql) in MIGRATIONS {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|source| DbError::Migrate { step, source })?;
    }
    info!(steps = MIGRATIONS.len(), "database schema up to date");
    Ok(())
}

/// Unix milliseconds, the representation of every timestamp column.
pub(crate) fn to_millis(at: chrono::DateTime<chrono::Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Fresh on-disk database with the schema applied.
    ///
    /// The returned directory must outlive the pool.
    pub async fn temp_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("pipeline.db").display());
        let pool = connect(&url).await.unwrap();
        migrate(&pool).await.unwrap();
        (dir, pool)
    }
}
