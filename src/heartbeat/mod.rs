//! Shared liveness record of the compute node.
//!
//! One logical row, written by both sides: the worker refreshes its
//! heartbeat on every poll, the server records client activity and moves the
//! status between `off`, `pending` and `on`.

pub mod record;
pub mod store;

pub use record::{HeartbeatRecord, MachineStatus};
pub use store::{HeartbeatStore, SqlHeartbeatStore};
