use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{OffloadError, Result};
use crate::queue::job::{Job, JobCounts, JobInput, JobOutput, JobState};
use crate::queue::store::{expiry_message, report_rejected_transition, JobQueue};

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    /// Insertion order, used for FIFO claims
    order: Vec<Uuid>,
}

/// Process-local [`JobQueue`]. Useful for tests and for running the server
/// and worker roles inside one process; nothing survives a restart.
#[derive(Debug)]
pub struct MemoryJobQueue {
    inner: RwLock<Inner>,
    max_jobs: usize,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_jobs,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }

    async fn finish(&self, id: Uuid, state: JobState, output: JobOutput) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Working => {
                job.state = state;
                job.output = Some(output);
                job.finished_at = Some(Utc::now());
                tracing::info!(job_id = %id, state = %state, "Job finished");
                Ok(true)
            }
            other => {
                report_rejected_transition(id, other.as_deref(), &output);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, method: &str, input: JobInput) -> Result<Uuid> {
        let mut inner = self.inner.write().await;
        if inner.jobs.len() >= self.max_jobs {
            return Err(OffloadError::Internal("job queue is at capacity".to_string()));
        }
        let job = Job::new(method, input);
        let id = job.id;
        inner.order.push(id);
        inner.jobs.insert(id, job);
        tracing::info!(job_id = %id, method, "Job enqueued");
        Ok(id)
    }

    async fn claim_one(&self) -> Result<Option<Job>> {
        let mut inner = self.inner.write().await;
        let Inner { jobs, order } = &mut *inner;

        let next = order
            .iter()
            .find(|id| jobs.get(*id).map(|j| j.state) == Some(JobState::New))
            .copied();

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.state = JobState::Working;
            job.claimed_at = Some(Utc::now());
            tracing::info!(job_id = %id, method = %job.method, "Job claimed");
            Some(job.clone())
        }))
    }

    async fn complete(&self, id: Uuid, data: Value) -> Result<bool> {
        self.finish(id, JobState::Done, JobOutput::Data(data)).await
    }

    async fn fail(&self, id: Uuid, message: &str) -> Result<bool> {
        self.finish(id, JobState::Error, JobOutput::Error(message.to_string()))
            .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn list(&self, state: Option<JobState>, limit: u32) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| state.is_none_or(|s| job.state == s))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<JobCounts> {
        let inner = self.inner.read().await;
        let mut counts = JobCounts::default();
        for job in inner.jobs.values() {
            counts.add(job.state, 1);
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
        self.enqueue(&job.method, job.input).await
    }

    async fn expire_stale(&self, older_than: Duration) -> Result<u64> {
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let message = expiry_message(older_than);

        let mut inner = self.inner.write().await;
        let mut expired = 0;
        for job in inner.jobs.values_mut() {
            if job.state == JobState::Working && job.claimed_at.is_some_and(|t| t < cutoff) {
                job.state = JobState::Error;
                job.output = Some(JobOutput::Error(message.clone()));
                job.finished_at = Some(now);
                expired += 1;
            }
        }
        Ok(expired)
    }
}
