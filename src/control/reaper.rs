use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::ReaperConfig;
use crate::control::cloud::ComputeInstance;
use crate::error::Result;
use crate::heartbeat::{HeartbeatStore, MachineStatus};

/// What a single reaper pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Status was already `off`; nothing issued
    AlreadyOff,
    /// Clients were active within the idle threshold
    Active,
    /// Status moved to `off` and a stop call was issued
    Stopped,
}

/// Stops the compute node once clients have been quiet for long enough.
/// Driven by an external timer; one call is one check.
#[derive(Clone)]
pub struct IdleReaper {
    store: Arc<dyn HeartbeatStore>,
    compute: ComputeInstance,
    idle_threshold: Duration,
}

impl IdleReaper {
    pub fn new(store: Arc<dyn HeartbeatStore>, compute: ComputeInstance, config: &ReaperConfig) -> Self {
        Self {
            store,
            compute,
            idle_threshold: Duration::from_secs(config.idle_threshold_secs),
        }
    }

    pub async fn reap_if_idle(&self) -> Result<ReapOutcome> {
        let record = self.store.read().await?;
        if record.status == MachineStatus::Off {
            return Ok(ReapOutcome::AlreadyOff);
        }

        let idle = record.client_idle(Utc::now());
        if idle.to_std().map_or(true, |idle| idle < self.idle_threshold) {
            return Ok(ReapOutcome::Active);
        }

        // conditional: a concurrent reaper that got here first wins
        if !self.store.mark_off().await? {
            return Ok(ReapOutcome::AlreadyOff);
        }

        tracing::info!(
            instance_id = self.compute.instance_id(),
            idle_secs = idle.num_seconds(),
            "Clients idle, stopping compute node"
        );
        if let Err(e) = self.compute.stop().await {
            tracing::warn!(
                instance_id = self.compute.instance_id(),
                error = %e,
                "Failed to stop compute node"
            );
        }
        Ok(ReapOutcome::Stopped)
    }
}
