//! Compute-node side: turns queued jobs into results.
//!
//! # Components
//!
//! - [`DispatchLoop`]: heartbeat, claim, execute, record; one job at a time
//! - [`ExecutionContext`]: isolation boundary around a single job
//!   ([`ProcessContext`] spawns a fresh process, [`InProcessContext`] uses the
//!   blocking pool)
//! - [`HandlerRegistry`]: method name to handler, see [`handlers`]
//! - [`HeartbeatSender`]: liveness writes into the shared heartbeat record
//!
//! # Execution Flow
//!
//! 1. [`DispatchLoop::run_once`] beats and claims the oldest `new` job
//! 2. The execution context looks up the method; unknown methods fail with
//!    `unknown method: <name>`
//! 3. Handler output is stored as `{"data": ..}`, failures as `{"error": ..}`

pub mod dispatch;
pub mod executor;
pub mod handlers;
pub mod heartbeat;
pub mod registry;

pub use dispatch::DispatchLoop;
pub use executor::{
    execute_request, ExecutionContext, ExecutionRequest, InProcessContext, ProcessContext,
    RUN_JOB_SUBCOMMAND,
};
pub use heartbeat::HeartbeatSender;
pub use registry::HandlerRegistry;
