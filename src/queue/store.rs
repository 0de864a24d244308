use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::{from_millis, millis_before, to_millis};
use crate::error::{OffloadError, Result};
use crate::queue::job::{Job, JobCounts, JobInput, JobOutput, JobState};

/// Queue semantics over durable storage.
///
/// `claim_one` is the only operation that must be atomic across callers:
/// a `new` job is handed to exactly one claimant. Everything after the
/// claim is single-writer.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a `new` job. The method is not validated here.
    async fn enqueue(&self, method: &str, input: JobInput) -> Result<Uuid>;

    /// Move one `new` job to `working` and return it.
    async fn claim_one(&self) -> Result<Option<Job>>;

    /// `working -> done`. Returns `false` (and logs) if the job was not `working`.
    async fn complete(&self, id: Uuid, data: Value) -> Result<bool>;

    /// `working -> error`. Returns `false` (and logs) if the job was not `working`.
    async fn fail(&self, id: Uuid, message: &str) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Oldest first, optionally filtered by state.
    async fn list(&self, state: Option<JobState>, limit: u32) -> Result<Vec<Job>>;

    async fn counts(&self) -> Result<JobCounts>;

    /// Enqueue a copy of a terminal job. The original row is left untouched.
    async fn resubmit(&self, id: Uuid) -> Result<Uuid>;

    /// Fail every `working` job claimed more than `older_than` ago.
    async fn expire_stale(&self, older_than: Duration) -> Result<u64>;
}

/// Poll a job until it reaches a terminal state.
pub async fn await_terminal(
    queue: &dyn JobQueue,
    id: Uuid,
    poll: Duration,
    timeout: Duration,
) -> Result<Job> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = queue.get(id).await?.ok_or(OffloadError::JobNotFound(id))?;
        if job.state.is_terminal() {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(OffloadError::Timeout(format!(
                "job {} still {} after {:?}",
                id, job.state, timeout
            )));
        }
        tokio::time::sleep(poll).await;
    }
}

pub(crate) fn expiry_message(older_than: Duration) -> String {
    format!("claim expired after {}s", older_than.as_secs())
}

/// Log the rejected transition. A terminal row with an identical payload is
/// a repeated call and only worth a debug line.
pub(crate) fn report_rejected_transition(id: Uuid, current: Option<&Job>, wanted: &JobOutput) {
    match current {
        Some(job) if job.output.as_ref() == Some(wanted) => {
            tracing::debug!(job_id = %id, state = %job.state, "Job already finished with same payload");
        }
        Some(job) => {
            tracing::warn!(job_id = %id, state = %job.state, "Ignoring transition of job that is not working");
        }
        None => {
            tracing::warn!(job_id = %id, "Ignoring transition of unknown job");
        }
    }
}

const JOB_COLUMNS: &str =
    "id, method, state, input_payload, output_payload, created_at, claimed_at, finished_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    method: String,
    state: String,
    input_payload: String,
    output_payload: Option<String>,
    created_at: i64,
    claimed_at: Option<i64>,
    finished_at: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = OffloadError;

    fn try_from(row: JobRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| OffloadError::Internal(format!("bad job id '{}': {}", row.id, e)))?;
        let output = match row.output_payload {
            Some(raw) => Some(serde_json::from_str::<JobOutput>(&raw)?),
            None => None,
        };
        Ok(Job {
            id,
            method: row.method,
            state: row.state.parse()?,
            input: serde_json::from_str(&row.input_payload)?,
            output,
            created_at: from_millis(row.created_at),
            claimed_at: row.claimed_at.map(from_millis),
            finished_at: row.finished_at.map(from_millis),
        })
    }
}

/// [`JobQueue`] over the `jobs` table.
#[derive(Debug, Clone)]
pub struct SqlJobQueue {
    pool: SqlitePool,
}

impl SqlJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn finish(&self, id: Uuid, state: JobState, output: JobOutput) -> Result<bool> {
        let payload = serde_json::to_string(&output)?;
        let result = sqlx::query(
            "UPDATE jobs SET state = ?, output_payload = ?, finished_at = ? \
             WHERE id = ? AND state = 'working'",
        )
        .bind(state.as_str())
        .bind(&payload)
        .bind(to_millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tracing::info!(job_id = %id, state = %state, "Job finished");
            return Ok(true);
        }

        let current = self.get(id).await?;
        report_rejected_transition(id, current.as_ref(), &output);
        Ok(false)
    }
}

#[async_trait]
impl JobQueue for SqlJobQueue {
    async fn enqueue(&self, method: &str, input: JobInput) -> Result<Uuid> {
        let job = Job::new(method, input);
        sqlx::query(
            "INSERT INTO jobs (id, method, state, input_payload, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.method)
        .bind(job.state.as_str())
        .bind(serde_json::to_string(&job.input)?)
        .bind(to_millis(job.created_at))
        .execute(&self.pool)
        .await?;

        tracing::info!(job_id = %job.id, method, "Job enqueued");
        Ok(job.id)
    }

    async fn claim_one(&self) -> Result<Option<Job>> {
        // Single statement: the subselect and the guarded update run under one
        // write lock, so two claimants can never both see the row as `new`.
        let sql = format!(
            "UPDATE jobs SET state = 'working', claimed_at = ? \
             WHERE id = (SELECT id FROM jobs WHERE state = 'new' ORDER BY created_at, rowid LIMIT 1) \
             AND state = 'new' \
             RETURNING {}",
            JOB_COLUMNS
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(to_millis(Utc::now()))
            .fetch_optional(&self.pool)
            .await?;

        let job = row.map(Job::try_from).transpose()?;
        if let Some(ref job) = job {
            tracing::info!(job_id = %job.id, method = %job.method, "Job claimed");
        }
        Ok(job)
    }

    async fn complete(&self, id: Uuid, data: Value) -> Result<bool> {
        self.finish(id, JobState::Done, JobOutput::Data(data)).await
    }

    async fn fail(&self, id: Uuid, message: &str) -> Result<bool> {
        self.finish(id, JobState::Error, JobOutput::Error(message.to_string()))
            .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list(&self, state: Option<JobState>, limit: u32) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {} FROM jobs WHERE state = ? ORDER BY created_at, rowid LIMIT ?",
                    JOB_COLUMNS
                );
                sqlx::query_as(&sql)
                    .bind(state.as_str())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM jobs ORDER BY created_at, rowid LIMIT ?",
                    JOB_COLUMNS
                );
                sqlx::query_as(&sql)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn counts(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (state, n) in rows {
            counts.add(state.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn resubmit(&self, id: Uuid) -> Result<Uuid> {
        let job = self.get(id).await?.ok_or(OffloadError::JobNotFound(id))?;
        if !job.state.is_terminal() {
            return Err(OffloadError::InvalidState(format!(
                "job {} is {}, only finished jobs can be resubmitted",
                id, job.state
            )));
        }
        let new_id = self.enqueue(&job.method, job.input).await?;
        tracing::info!(job_id = %id, new_job_id = %new_id, "Job resubmitted");
        Ok(new_id)
    }

    async fn expire_stale(&self, older_than: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = millis_before(now, older_than);
        let payload = serde_json::to_string(&JobOutput::Error(expiry_message(older_than)))?;

        let result = sqlx::query(
            "UPDATE jobs SET state = 'error', output_payload = ?, finished_at = ? \
             WHERE state = 'working' AND claimed_at < ?",
        )
        .bind(&payload)
        .bind(to_millis(now))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let expired = result.rows_affected();
        if expired > 0 {
            tracing::warn!(expired, older_than_secs = older_than.as_secs(), "Expired stale claims");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use serde_json::json;

    async fn queue() -> SqlJobQueue {
        SqlJobQueue::new(connect_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn claim_returns_oldest_first() {
        let q = queue().await;
        let first = q.enqueue("a", JobInput::default()).await.unwrap();
        let second = q.enqueue("b", JobInput::default()).await.unwrap();

        assert_eq!(q.claim_one().await.unwrap().unwrap().id, first);
        assert_eq!(q.claim_one().await.unwrap().unwrap().id, second);
        assert!(q.claim_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_only_applies_to_working() {
        let q = queue().await;
        let id = q.enqueue("a", JobInput::default()).await.unwrap();

        // still `new`
        assert!(!q.complete(id, json!(1)).await.unwrap());
        assert_eq!(q.get(id).await.unwrap().unwrap().state, JobState::New);

        q.claim_one().await.unwrap();
        assert!(q.complete(id, json!(1)).await.unwrap());
        // repeat is a no-op
        assert!(!q.complete(id, json!(1)).await.unwrap());
        // a late fail cannot flip a finished job
        assert!(!q.fail(id, "late").await.unwrap());

        let job = q.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.data(), Some(&json!(1)));
    }

    #[tokio::test]
    async fn transition_on_unknown_job_is_noop() {
        let q = queue().await;
        assert!(!q.complete(Uuid::new_v4(), json!(null)).await.unwrap());
        assert!(!q.fail(Uuid::new_v4(), "x").await.unwrap());
    }

    #[tokio::test]
    async fn resubmit_requires_terminal_state() {
        let q = queue().await;
        let id = q.enqueue("a", JobInput::new(vec![json!(1)])).await.unwrap();
        assert!(matches!(
            q.resubmit(id).await,
            Err(OffloadError::InvalidState(_))
        ));

        q.claim_one().await.unwrap();
        q.fail(id, "boom").await.unwrap();

        let new_id = q.resubmit(id).await.unwrap();
        assert_ne!(new_id, id);
        let copy = q.get(new_id).await.unwrap().unwrap();
        assert_eq!(copy.state, JobState::New);
        assert_eq!(copy.method, "a");
        assert_eq!(copy.input.args, vec![json!(1)]);
        assert_eq!(q.get(id).await.unwrap().unwrap().state, JobState::Error);
    }

    #[tokio::test]
    async fn resubmit_unknown_job() {
        let q = queue().await;
        let missing = Uuid::new_v4();
        assert!(matches!(
            q.resubmit(missing).await,
            Err(OffloadError::JobNotFound(id)) if id == missing
        ));
    }
}
