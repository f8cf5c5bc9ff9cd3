//! director-rollout — execute a deployment plan against the cloud.
//!
//! # Components
//!
//! - **`batches`** — per-group batch state machine: canaries, then
//!   `max_in_flight` batches, stopping at the first failure
//! - **`executor`** — converges instances through the CPI and agents:
//!   VM creation with bounded retries, create-swap-delete or
//!   delete-create replacement, persistent disks, orphaning, deletes

pub mod batches;
pub mod error;
pub mod executor;

pub use batches::{batch_count, Batch, GroupRollout, RolloutPhase};
pub use error::{RolloutError, RolloutResult};
pub use executor::{Executor, RolloutSummary};
