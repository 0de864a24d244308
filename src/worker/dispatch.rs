use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::queue::{Job, JobOutput, JobQueue, JobState};
use crate::worker::executor::ExecutionContext;
use crate::worker::heartbeat::HeartbeatSender;

/// Attempts at writing a job's result before the claim is left to expiry.
const FINISH_ATTEMPTS: u32 = 3;
const FINISH_BACKOFF: Duration = Duration::from_millis(50);

/// Turns queued jobs into results, strictly one at a time.
///
/// Each iteration:
///
/// 1. Writes a heartbeat
/// 2. Claims one `new` job; if there is none, sleeps for the poll interval
/// 3. Runs the job in the [`ExecutionContext`], beating while it runs
/// 4. Records the result (`done`) or the error message (`error`)
///
/// Handler failures never stop the loop and are never retried. Writing the
/// result is retried a few times with a short backoff. If that still fails,
/// or the execution context is lost mid-job, the row stays `working`; see
/// [`JobQueue::expire_stale`].
pub struct DispatchLoop {
    queue: Arc<dyn JobQueue>,
    context: Arc<dyn ExecutionContext>,
    heartbeat: HeartbeatSender,
    poll_interval: Duration,
}

impl DispatchLoop {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        context: Arc<dyn ExecutionContext>,
        heartbeat: HeartbeatSender,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            context,
            heartbeat,
            poll_interval,
        }
    }

    /// Poll until `shutdown` is cancelled. A running job is always finished
    /// before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            identity = self.heartbeat.identity(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Dispatch loop started"
        );

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Dispatch iteration failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("Dispatch loop stopped");
    }

    /// Heartbeat, then claim and execute at most one job. Returns the id of
    /// the job that was processed.
    pub async fn run_once(&self) -> Result<Option<Uuid>> {
        self.heartbeat.beat().await;

        let Some(job) = self.queue.claim_one().await? else {
            return Ok(None);
        };
        let id = job.id;
        self.execute(job).await?;
        Ok(Some(id))
    }

    /// Drain the queue: process jobs until none is left.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        while self.run_once().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    async fn execute(&self, job: Job) -> Result<JobState> {
        tracing::info!(job_id = %job.id, method = %job.method, "Running job");
        let started = Instant::now();

        let run = self.context.run(&job.method, &job.input);
        tokio::pin!(run);
        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            // keeps the node visible during long jobs
            never = self.heartbeat.run() => match never {},
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (output, state) = match outcome {
            Ok(data) => {
                tracing::info!(job_id = %job.id, elapsed_ms, "Job succeeded");
                (JobOutput::Data(data), JobState::Done)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, elapsed_ms, error = %e, "Job failed");
                (JobOutput::Error(e.to_string()), JobState::Error)
            }
        };
        self.finish(job.id, output).await?;
        Ok(state)
    }

    /// Record the terminal output, retrying transient store errors.
    async fn finish(&self, id: Uuid, output: JobOutput) -> Result<()> {
        let mut attempt = 1;
        loop {
            let written = match &output {
                JobOutput::Data(data) => self.queue.complete(id, data.clone()).await,
                JobOutput::Error(message) => self.queue.fail(id, message).await,
            };
            match written {
                Ok(_) => return Ok(()),
                Err(e) if attempt < FINISH_ATTEMPTS => {
                    tracing::warn!(job_id = %id, attempt, error = %e, "Failed to record job result, retrying");
                    tokio::time::sleep(FINISH_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %id,
                        attempts = attempt,
                        error = %e,
                        "Giving up on recording job result, claim stays working"
                    );
                    return Err(e);
                }
            }
        }
    }
}
