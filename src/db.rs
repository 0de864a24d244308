//! SQL pool construction and schema bootstrap.
//!
//! The job table doubles as the transport between the server and the compute
//! node, so both sides connect to the same database and both run
//! [`migrate`] on startup. Every statement is idempotent.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::DatabaseConfig;
use crate::error::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id              TEXT PRIMARY KEY,
        method          TEXT NOT NULL,
        state           TEXT NOT NULL DEFAULT 'new',
        input_payload   TEXT NOT NULL,
        output_payload  TEXT,
        created_at      INTEGER NOT NULL,
        claimed_at      INTEGER,
        finished_at     INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_state_created ON jobs (state, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS jobs_status (
        id             INTEGER PRIMARY KEY CHECK (id = 1),
        status         TEXT NOT NULL,
        ts_client      INTEGER NOT NULL,
        ts_worker      INTEGER NOT NULL,
        worker         TEXT,
        pending_since  INTEGER
    )
    "#,
];

/// Open a pool against the configured database and make sure the schema exists.
pub async fn connect(config: &DatabaseConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    tracing::info!(url = %config.url, "Database ready");
    Ok(pool)
}

/// Single-connection in-memory database. Each connection to `sqlite::memory:`
/// is its own database, so the pool must never recycle its only connection.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// `ts - age` in unix milliseconds, clamped at `i64::MIN` for ages too large
/// to represent.
pub(crate) fn millis_before(ts: DateTime<Utc>, age: Duration) -> i64 {
    let age = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
    to_millis(ts).saturating_sub(age)
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let pool = connect_in_memory().await.unwrap();
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('jobs', 'jobs_status')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn millis_conversion_keeps_precision() {
        let now = Utc::now();
        let back = from_millis(to_millis(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
