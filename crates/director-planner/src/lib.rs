//! director-planner — turn a manifest into an executable deployment plan.
//!
//! # Stages
//!
//! - **`merge`** folds cloud-configs and runtime-configs into the manifest
//! - **`planner`** validates references, places instances and detects
//!   infrastructure changes against persisted state
//! - **`spec`** renders per-instance specs once variables and links are
//!   resolved, adding configuration changes
//!
//! Nothing here calls the CPI or writes to the store.

pub mod error;
pub mod merge;
pub mod placement;
pub mod plan;
pub mod planner;
pub mod spec;
pub mod versions;

pub use error::{PlanError, PlanResult};
pub use merge::{merge, MergedManifest, IGNORED_CLOUD_CONFIG_WARNING};
pub use plan::{
    Action, Change, DeploymentPlan, InstanceGroupPlan, InstancePlan, JobRef, UpdateSettings, VmRequirements,
};
pub use planner::{PlanOptions, Planner};
pub use spec::{addresses, configuration_hash, render_specs};
