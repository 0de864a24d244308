use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::config::StatusConfig;
use crate::control::cloud::ComputeInstance;
use crate::error::Result;
use crate::heartbeat::{HeartbeatRecord, HeartbeatStore, MachineStatus};

/// Last computed status and when it was computed.
#[derive(Debug, Default)]
pub struct DebounceCache {
    slot: Mutex<Option<(Instant, MachineStatus)>>,
}

impl DebounceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached status if it is younger than `window`.
    #[cfg(test)]
    pub(crate) async fn get(&self, window: Duration) -> Option<MachineStatus> {
        fresh(&*self.slot.lock().await, window)
    }

    #[cfg(test)]
    pub(crate) async fn clear(&self) {
        *self.slot.lock().await = None;
    }
}

fn fresh(slot: &Option<(Instant, MachineStatus)>, window: Duration) -> Option<MachineStatus> {
    match slot {
        Some((at, status)) if at.elapsed() < window => Some(*status),
        _ => None,
    }
}

/// Answers "can jobs run right now?" for the web layer and wakes the compute
/// node when it is needed.
///
/// Checks within the debounce window are served from the cache. Concurrent
/// callers arriving after the window expired queue on the cache lock, so
/// only the first one reaches the heartbeat store; the rest see its answer.
#[derive(Clone)]
pub struct StatusDebouncer {
    store: Arc<dyn HeartbeatStore>,
    compute: ComputeInstance,
    config: StatusConfig,
    cache: Arc<DebounceCache>,
    wakes: TaskTracker,
}

impl StatusDebouncer {
    pub fn new(
        store: Arc<dyn HeartbeatStore>,
        compute: ComputeInstance,
        config: StatusConfig,
        cache: Arc<DebounceCache>,
    ) -> Self {
        Self {
            store,
            compute,
            config,
            cache,
            wakes: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &StatusConfig {
        &self.config
    }

    /// Current availability. Store failures are logged and reported as
    /// `pending` so callers never see an error.
    pub async fn check_status(&self) -> MachineStatus {
        let window = self.config.debounce();
        let mut slot = self.cache.slot.lock().await;
        if let Some(status) = fresh(&slot, window) {
            return status;
        }

        match self.refresh().await {
            Ok(status) => {
                *slot = Some((Instant::now(), status));
                status
            }
            Err(e) => {
                // not cached; the next caller retries the store
                tracing::warn!(error = %e, "Status check failed, reporting pending");
                MachineStatus::Pending
            }
        }
    }

    async fn refresh(&self) -> Result<MachineStatus> {
        let record = self.store.touch_client().await?;
        if self.is_available(&record) {
            return Ok(MachineStatus::On);
        }

        if self
            .store
            .begin_wake(Duration::from_secs(self.config.wake_retry_secs))
            .await?
        {
            self.wake();
        } else {
            tracing::debug!("Wake-up already in flight");
        }
        Ok(MachineStatus::Pending)
    }

    fn is_available(&self, record: &HeartbeatRecord) -> bool {
        // a heartbeat stamped ahead of our clock counts as fresh
        let age = record
            .worker_age(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        if age < Duration::from_secs(self.config.fresh_threshold_secs) {
            return true;
        }
        // a trusted node that was seen recently usually comes back by itself
        age < Duration::from_secs(self.config.grace_threshold_secs)
            && record
                .worker_identity
                .as_deref()
                .is_some_and(|id| self.config.is_trusted(id))
    }

    /// Wait for the start calls issued so far. One-shot callers use this
    /// before exiting.
    pub async fn settle(&self) {
        self.wakes.close();
        self.wakes.wait().await;
        self.wakes.reopen();
    }

    /// Fire-and-forget start of the compute node.
    fn wake(&self) {
        let compute = self.compute.clone();
        tracing::info!(instance_id = compute.instance_id(), "Compute node stale, starting it");
        self.wakes.spawn(async move {
            if let Err(e) = compute.start().await {
                tracing::warn!(
                    instance_id = compute.instance_id(),
                    error = %e,
                    "Failed to start compute node"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::cloud::NoopCloud;
    use crate::db::connect_in_memory;
    use crate::heartbeat::SqlHeartbeatStore;

    async fn debouncer(config: StatusConfig) -> (StatusDebouncer, Arc<SqlHeartbeatStore>) {
        let store = Arc::new(SqlHeartbeatStore::new(connect_in_memory().await.unwrap()));
        let debouncer = StatusDebouncer::new(
            store.clone(),
            ComputeInstance::new(Arc::new(NoopCloud), "i-test"),
            config,
            Arc::new(DebounceCache::new()),
        );
        (debouncer, store)
    }

    fn record(age_secs: i64, identity: &str) -> HeartbeatRecord {
        let now = Utc::now();
        HeartbeatRecord {
            status: MachineStatus::On,
            last_client_activity: now,
            last_worker_heartbeat: now - chrono::Duration::seconds(age_secs),
            worker_identity: Some(identity.to_string()),
            pending_since: None,
        }
    }

    #[tokio::test]
    async fn fresh_heartbeat_is_on() {
        let (d, _) = debouncer(StatusConfig::default()).await;
        assert!(d.is_available(&record(1, "gpu")));
        assert!(!d.is_available(&record(10, "gpu")));
    }

    #[tokio::test]
    async fn trusted_identity_gets_grace_period() {
        let (d, _) = debouncer(StatusConfig::default().with_trusted("desktop")).await;
        assert!(d.is_available(&record(200, "desktop")));
        assert!(!d.is_available(&record(400, "desktop")));
        assert!(!d.is_available(&record(200, "gpu")));
    }

    #[tokio::test]
    async fn unbounded_thresholds_do_not_overflow() {
        let config = StatusConfig {
            fresh_threshold_secs: 0,
            grace_threshold_secs: u64::MAX,
            ..StatusConfig::default()
        }
        .with_trusted("desktop");
        let (d, _) = debouncer(config).await;
        assert!(d.is_available(&record(86_400 * 365, "desktop")));
        assert!(!d.is_available(&record(86_400 * 365, "gpu")));
    }

    #[tokio::test]
    async fn heartbeat_ahead_of_clock_is_fresh() {
        let (d, _) = debouncer(StatusConfig::default()).await;
        assert!(d.is_available(&record(-30, "gpu")));
    }

    #[tokio::test]
    async fn cache_expires_after_window() {
        let config = StatusConfig {
            debounce_ms: 200,
            ..Default::default()
        };
        let (d, store) = debouncer(config).await;

        assert_eq!(d.check_status().await, MachineStatus::Pending);
        store.worker_beat("gpu").await.unwrap();
        assert_eq!(d.check_status().await, MachineStatus::Pending);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(d.check_status().await, MachineStatus::On);
    }

    #[tokio::test]
    async fn cleared_cache_recomputes() {
        let (d, store) = debouncer(StatusConfig::default()).await;
        assert_eq!(d.check_status().await, MachineStatus::Pending);
        assert_eq!(d.cache.get(Duration::from_secs(3)).await, Some(MachineStatus::Pending));

        store.worker_beat("gpu").await.unwrap();
        d.cache.clear().await;
        assert_eq!(d.check_status().await, MachineStatus::On);
    }
}
