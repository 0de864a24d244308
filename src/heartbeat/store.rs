use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::{from_millis, millis_before, to_millis};
use crate::error::{OffloadError, Result};
use crate::heartbeat::record::HeartbeatRecord;

/// Storage for the singleton [`HeartbeatRecord`]. Every operation creates the
/// record if it does not exist yet.
///
/// Field ownership by role: the worker writes the heartbeat fields, the
/// server writes client activity. `status` is shared and only moved through
/// the conditional operations below.
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    async fn read(&self) -> Result<HeartbeatRecord>;

    /// Overwrite the whole record. Administrative use and tests.
    async fn put(&self, record: &HeartbeatRecord) -> Result<()>;

    /// Worker liveness: `status = on`, refresh heartbeat time and identity.
    async fn worker_beat(&self, identity: &str) -> Result<()>;

    /// Refresh client activity and return the updated record.
    async fn touch_client(&self) -> Result<HeartbeatRecord>;

    /// Move to `pending` unless another caller already did so less than
    /// `retry_after` ago. Returns `true` if this caller owns the wake-up.
    async fn begin_wake(&self, retry_after: Duration) -> Result<bool>;

    /// Move to `off` and refresh client activity. Returns `false` if the
    /// record was already `off`.
    async fn mark_off(&self) -> Result<bool>;
}

#[derive(sqlx::FromRow)]
struct HeartbeatRow {
    status: String,
    ts_client: i64,
    ts_worker: i64,
    worker: Option<String>,
    pending_since: Option<i64>,
}

impl TryFrom<HeartbeatRow> for HeartbeatRecord {
    type Error = OffloadError;

    fn try_from(row: HeartbeatRow) -> Result<Self> {
        Ok(HeartbeatRecord {
            status: row.status.parse()?,
            last_client_activity: from_millis(row.ts_client),
            last_worker_heartbeat: from_millis(row.ts_worker),
            worker_identity: row.worker,
            pending_since: row.pending_since.map(from_millis),
        })
    }
}

/// [`HeartbeatStore`] over the one-row `jobs_status` table.
#[derive(Debug, Clone)]
pub struct SqlHeartbeatStore {
    pool: SqlitePool,
}

impl SqlHeartbeatStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn ensure_row(&self) -> Result<()> {
        let initial = HeartbeatRecord::initial(Utc::now());
        sqlx::query(
            "INSERT INTO jobs_status (id, status, ts_client, ts_worker, worker, pending_since) \
             VALUES (1, ?, ?, ?, NULL, NULL) ON CONFLICT (id) DO NOTHING",
        )
        .bind(initial.status.as_str())
        .bind(to_millis(initial.last_client_activity))
        .bind(to_millis(initial.last_worker_heartbeat))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select(&self) -> Result<HeartbeatRecord> {
        let row: HeartbeatRow = sqlx::query_as(
            "SELECT status, ts_client, ts_worker, worker, pending_since FROM jobs_status WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }
}

#[async_trait]
impl HeartbeatStore for SqlHeartbeatStore {
    async fn read(&self) -> Result<HeartbeatRecord> {
        self.ensure_row().await?;
        self.select().await
    }

    async fn put(&self, record: &HeartbeatRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs_status (id, status, ts_client, ts_worker, worker, pending_since) \
             VALUES (1, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET status = excluded.status, ts_client = excluded.ts_client, \
             ts_worker = excluded.ts_worker, worker = excluded.worker, pending_since = excluded.pending_since",
        )
        .bind(record.status.as_str())
        .bind(to_millis(record.last_client_activity))
        .bind(to_millis(record.last_worker_heartbeat))
        .bind(record.worker_identity.as_deref())
        .bind(record.pending_since.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn worker_beat(&self, identity: &str) -> Result<()> {
        let now = to_millis(Utc::now());
        sqlx::query(
            "INSERT INTO jobs_status (id, status, ts_client, ts_worker, worker, pending_since) \
             VALUES (1, 'on', ?, ?, ?, NULL) \
             ON CONFLICT (id) DO UPDATE SET status = 'on', ts_worker = excluded.ts_worker, \
             worker = excluded.worker, pending_since = NULL",
        )
        .bind(now)
        .bind(now)
        .bind(identity)
        .execute(&self.pool)
        .await?;
        tracing::debug!(identity, "Worker heartbeat");
        Ok(())
    }

    async fn touch_client(&self) -> Result<HeartbeatRecord> {
        self.ensure_row().await?;
        sqlx::query("UPDATE jobs_status SET ts_client = ? WHERE id = 1")
            .bind(to_millis(Utc::now()))
            .execute(&self.pool)
            .await?;
        self.select().await
    }

    async fn begin_wake(&self, retry_after: Duration) -> Result<bool> {
        self.ensure_row().await?;
        let now = Utc::now();
        let cutoff = millis_before(now, retry_after);
        let result = sqlx::query(
            "UPDATE jobs_status SET status = 'pending', pending_since = ? \
             WHERE id = 1 AND (status != 'pending' OR pending_since IS NULL OR pending_since <= ?)",
        )
        .bind(to_millis(now))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_off(&self) -> Result<bool> {
        self.ensure_row().await?;
        let result = sqlx::query(
            "UPDATE jobs_status SET status = 'off', ts_client = ?, pending_since = NULL \
             WHERE id = 1 AND status != 'off'",
        )
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
