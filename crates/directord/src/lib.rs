//! directord — the deployment director daemon.
//!
//! Assembles every director subsystem into one process:
//! - State store (redb)
//! - Lock manager + expired-lock sweeper
//! - Task manager, worker pool and task-timeout sweeper
//! - Dummy CPI and agent
//! - REST API
//!
//! `main.rs` only parses the command line, installs logging and calls
//! [`serve`]; tests build a [`Director`] directly.

pub mod app;
pub mod telemetry;

pub use app::{serve, Director};
