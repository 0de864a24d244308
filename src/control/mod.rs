//! Server-side control loop for the compute node.
//!
//! - [`StatusDebouncer`]: cheap, cached availability checks that wake the node
//! - [`IdleReaper`]: stops the node after client inactivity
//! - [`CloudControl`]: provider start/stop, always best-effort

pub mod cloud;
pub mod debouncer;
pub mod reaper;

pub use cloud::{CloudControl, CloudError, CommandCloud, ComputeInstance, NoopCloud};
pub use debouncer::{DebounceCache, StatusDebouncer};
pub use reaper::{IdleReaper, ReapOutcome};
