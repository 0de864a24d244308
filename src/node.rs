use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::{DatabaseConfig, Isolation, ServerConfig, WorkerConfig};
use crate::control::{ComputeInstance, DebounceCache, IdleReaper, ReapOutcome, StatusDebouncer};
use crate::db;
use crate::error::Result;
use crate::heartbeat::{HeartbeatStore, SqlHeartbeatStore};
use crate::queue::{JobQueue, SqlJobQueue};
use crate::worker::{
    DispatchLoop, ExecutionContext, HandlerRegistry, HeartbeatSender, InProcessContext,
    ProcessContext,
};

/// The always-on server: HTTP API, status debouncer and idle reaper.
pub struct ServerNode {
    config: ServerConfig,
    queue: Arc<dyn JobQueue>,
    debouncer: StatusDebouncer,
    reaper: IdleReaper,
}

impl ServerNode {
    /// Open the shared database and wire up the server components.
    pub async fn connect(config: ServerConfig) -> Result<Self> {
        let pool = db::connect(&config.database).await?;
        Ok(Self::from_parts(
            config,
            Arc::new(SqlJobQueue::new(pool.clone())),
            Arc::new(SqlHeartbeatStore::new(pool)),
        ))
    }

    pub fn from_parts(
        config: ServerConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn HeartbeatStore>,
    ) -> Self {
        let compute = ComputeInstance::from_config(&config.cloud);
        if !config.cloud.is_enabled() {
            tracing::warn!("No instance id configured, compute node will not be started or stopped");
        }

        let debouncer = StatusDebouncer::new(
            store.clone(),
            compute.clone(),
            config.status.clone(),
            Arc::new(DebounceCache::new()),
        );
        let reaper = IdleReaper::new(store, compute, &config.reaper);

        Self {
            config,
            queue,
            debouncer,
            reaper,
        }
    }

    pub fn debouncer(&self) -> &StatusDebouncer {
        &self.debouncer
    }

    pub fn reaper(&self) -> &IdleReaper {
        &self.reaper
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// 1. Spawns the reaper timer
    /// 2. Serves the HTTP API (blocking)
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            listen_addr = %self.config.listen_addr,
            instance_id = ?self.config.cloud.instance_id,
            trusted = ?self.config.status.trusted_identities,
            "Starting offload server"
        );

        let reaper = self.reaper.clone();
        let interval = Duration::from_secs(self.config.reaper.interval_secs);
        let reaper_shutdown = shutdown.clone();
        let reaper_task = tokio::spawn(async move {
            Self::reaper_loop(reaper, interval, reaper_shutdown).await;
        });

        let state = ApiState {
            queue: self.queue.clone(),
            debouncer: self.debouncer.clone(),
        };
        let served = api::serve(self.config.listen_addr, state, shutdown.clone()).await;

        // the API can fail on bind; take the reaper down with it
        shutdown.cancel();
        if let Err(e) = reaper_task.await {
            tracing::warn!(error = %e, "Reaper task ended abnormally");
        }
        served?;
        Ok(())
    }

    async fn reaper_loop(reaper: IdleReaper, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match reaper.reap_if_idle().await {
                Ok(ReapOutcome::Stopped) => {}
                Ok(outcome) => tracing::debug!(?outcome, "Reaper pass"),
                Err(e) => tracing::warn!(error = %e, "Reaper pass failed"),
            }
        }
    }
}

/// The compute node: heartbeat plus the dispatch loop.
pub struct WorkerNode {
    identity: String,
    dispatch: DispatchLoop,
}

impl WorkerNode {
    pub async fn connect(database: &DatabaseConfig, config: WorkerConfig) -> Result<Self> {
        let pool = db::connect(database).await?;
        Self::from_parts(
            config,
            Arc::new(SqlJobQueue::new(pool.clone())),
            Arc::new(SqlHeartbeatStore::new(pool)),
        )
    }

    pub fn from_parts(
        config: WorkerConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn HeartbeatStore>,
    ) -> Result<Self> {
        let context = execution_context(&config.isolation)?;
        let heartbeat = HeartbeatSender::new(store, config.identity.clone(), config.poll_interval());
        let dispatch = DispatchLoop::new(queue, context, heartbeat, config.poll_interval());

        Ok(Self {
            identity: config.identity,
            dispatch,
        })
    }

    pub fn dispatch(&self) -> &DispatchLoop {
        &self.dispatch
    }

    /// Process jobs until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(identity = %self.identity, "Starting offload worker");
        self.dispatch.run(shutdown).await;
        Ok(())
    }
}

fn execution_context(isolation: &Isolation) -> Result<Arc<dyn ExecutionContext>> {
    let context: Arc<dyn ExecutionContext> = match isolation {
        Isolation::Process { program: Some(program) } => {
            Arc::new(ProcessContext::new(program.clone()))
        }
        Isolation::Process { program: None } => Arc::new(ProcessContext::current_exe()?),
        Isolation::InProcess => Arc::new(InProcessContext::new(Arc::new(HandlerRegistry::builtin()))),
    };
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::heartbeat::MachineStatus;
    use crate::queue::{JobInput, JobState};
    use serde_json::json;

    #[tokio::test]
    async fn in_process_worker_drains_shared_queue() {
        let pool = connect_in_memory().await.unwrap();
        let queue = Arc::new(SqlJobQueue::new(pool.clone()));
        let store = Arc::new(SqlHeartbeatStore::new(pool));

        let config = WorkerConfig {
            identity: "gpu-1".to_string(),
            poll_interval_ms: 10,
            isolation: Isolation::InProcess,
        };
        let worker = WorkerNode::from_parts(config, queue.clone(), store.clone()).unwrap();

        let id = queue
            .enqueue("cosine", JobInput::new(vec![json!([1.0, 0.0]), json!([0.0, 1.0])]))
            .await
            .unwrap();
        assert_eq!(worker.dispatch().run_until_idle().await.unwrap(), 1);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.data(), Some(&json!(0.0)));
        assert_eq!(store.read().await.unwrap().status, MachineStatus::On);
    }

    #[tokio::test]
    async fn server_reports_on_after_worker_beat() {
        let pool = connect_in_memory().await.unwrap();
        let queue = Arc::new(SqlJobQueue::new(pool.clone()));
        let store = Arc::new(SqlHeartbeatStore::new(pool));

        let server = ServerNode::from_parts(ServerConfig::default(), queue, store.clone());
        store.worker_beat("gpu-1").await.unwrap();

        assert_eq!(server.debouncer().check_status().await, MachineStatus::On);
        assert_eq!(
            server.reaper().reap_if_idle().await.unwrap(),
            ReapOutcome::Active
        );
    }
}
