//! director-jobs — the background jobs behind director tasks.
//!
//! # Components
//!
//! - **`update_deployment`** — merge, plan, bind links, render and roll out
//!   a manifest under the deployment lock
//! - **`delete_deployment`** — delete every instance, orphan its disks and
//!   drop the deployment's links, variable sets and record
//! - **`delete_orphan_disks`** — destroy orphaned disks through their CPI
//! - **`resurrection`** — per-instance resurrection toggles, run inline
//! - **`registry`** — maps persisted job types back to job constructors

pub mod delete_deployment;
pub mod delete_orphan_disks;
pub mod env;
pub mod error;
pub mod registry;
pub mod resurrection;
pub mod update_deployment;

pub use delete_deployment::{DeleteDeployment, DeleteDeploymentArgs};
pub use delete_orphan_disks::{DeleteOrphanDisks, DeleteOrphanDisksArgs};
pub use env::{JobEnv, CLOUD_CONFIG, RUNTIME_CONFIG};
pub use error::{JobError, JobResult};
pub use registry::registry;
pub use resurrection::{change_vm_resurrection, resurrection_state};
pub use update_deployment::{UpdateDeployment, UpdateDeploymentArgs};
