//! director-state — transactional store for director entities.
//!
//! Backed by [redb](https://docs.rs/redb). Deployments, variable sets,
//! instances, VMs, disks, links, locks, tasks and configs each live in
//! their own table under `&str` keys with JSON-serialized values.
//! Composite keys (`{deployment}/{group}/{uuid}`, `{set_id}/{name}/...`)
//! keep related records adjacent so ownership queries are prefix scans.
//!
//! `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is shared by the API, the worker pool and the background sweepers.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
