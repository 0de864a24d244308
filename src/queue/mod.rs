//! Durable job queue built on a plain table.
//!
//! Producers [`enqueue`](JobQueue::enqueue) rows in state `new`; the worker
//! [`claim_one`](JobQueue::claim_one)s them (`new -> working`) and writes back
//! either a result (`done`) or an error (`error`). Producers observe
//! completion by polling the row, see [`await_terminal`].
//!
//! Two backends implement [`JobQueue`]:
//!
//! - [`SqlJobQueue`]: the shared database, used in production
//! - [`MemoryJobQueue`]: process-local, for tests and single-process setups

pub mod job;
pub mod memory;
pub mod store;

pub use job::{Job, JobCounts, JobInput, JobOutput, JobState};
pub use memory::MemoryJobQueue;
pub use store::{await_terminal, JobQueue, SqlJobQueue};
