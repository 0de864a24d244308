use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::heartbeat::HeartbeatStore;

/// Writes the worker's liveness into the shared heartbeat record.
#[derive(Clone)]
pub struct HeartbeatSender {
    store: Arc<dyn HeartbeatStore>,
    identity: String,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(store: Arc<dyn HeartbeatStore>, identity: impl Into<String>, interval: Duration) -> Self {
        Self {
            store,
            identity: identity.into(),
            interval,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// One heartbeat. Store failures are logged; they say nothing about jobs.
    pub async fn beat(&self) {
        if let Err(e) = self.store.worker_beat(&self.identity).await {
            tracing::warn!(identity = %self.identity, error = %e, "Failed to write heartbeat");
        }
    }

    /// Beat every interval until the future is dropped. The first beat is one
    /// interval from now.
    pub async fn run(&self) -> Infallible {
        let start = tokio::time::Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);

        loop {
            interval.tick().await;
            self.beat().await;
        }
    }
}
