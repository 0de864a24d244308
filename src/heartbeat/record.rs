use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OffloadError;

/// Availability of the compute node as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Off,
    Pending,
    On,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Off => "off",
            MachineStatus::Pending => "pending",
            MachineStatus::On => "on",
        }
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MachineStatus {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(MachineStatus::Off),
            "pending" => Ok(MachineStatus::Pending),
            "on" => Ok(MachineStatus::On),
            other => Err(OffloadError::InvalidState(format!(
                "unknown machine status '{}'",
                other
            ))),
        }
    }
}

/// The single shared liveness record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub status: MachineStatus,
    pub last_client_activity: DateTime<Utc>,
    pub last_worker_heartbeat: DateTime<Utc>,
    pub worker_identity: Option<String>,
    /// Set while `status == Pending`: when the last start call was issued
    pub pending_since: Option<DateTime<Utc>>,
}

impl HeartbeatRecord {
    /// Record created on first access. The worker has never been seen, so its
    /// heartbeat starts at the epoch and reads as stale.
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            status: MachineStatus::Off,
            last_client_activity: now,
            last_worker_heartbeat: DateTime::<Utc>::UNIX_EPOCH,
            worker_identity: None,
            pending_since: None,
        }
    }

    pub fn worker_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_worker_heartbeat
    }

    pub fn client_idle(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_client_activity
    }
}
