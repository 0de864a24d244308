pub mod api;
pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod heartbeat;
pub mod node;
pub mod queue;
pub mod shutdown;
pub mod worker;
