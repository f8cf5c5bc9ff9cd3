//! The executable plan the rollout consumes.

use std::collections::BTreeSet;
use std::fmt;

use director_core::manifest::WatchTime;
use director_core::{InstanceState, UpdateStrategy};
use director_state::Instance;
use serde::Serialize;
use serde_json::Value;

/// Why an existing instance needs work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Stemcell,
    Network,
    VmType,
    Env,
    PersistentDisk,
    Configuration,
    State,
    Recreate,
    /// The instance has no active VM.
    MissingVm,
}

impl Change {
    /// Changes the agent cannot apply to a running VM.
    pub fn requires_new_vm(&self) -> bool {
        matches!(
            self,
            Change::Stemcell | Change::Network | Change::VmType | Change::Env | Change::Recreate | Change::MissingVm
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Change::Stemcell => "stemcell",
            Change::Network => "network",
            Change::VmType => "vm_type",
            Change::Env => "env",
            Change::PersistentDisk => "persistent_disk",
            Change::Configuration => "configuration",
            Change::State => "state",
            Change::Recreate => "recreate",
            Change::MissingVm => "missing_vm",
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Keep,
    Delete,
}

/// Planned work for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstancePlan {
    pub action: Action,
    pub group: String,
    pub uuid: String,
    pub index: u32,
    pub az: Option<String>,
    pub bootstrap: bool,
    pub state: InstanceState,
    #[serde(skip)]
    pub existing: Option<Instance>,
    pub changes: BTreeSet<Change>,
    /// Rendered instance spec; filled in once variables and links resolve.
    pub spec: Value,
}

impl InstancePlan {
    pub fn name(&self) -> String {
        format!("{}/{}", self.group, self.uuid)
    }

    pub fn needs_new_vm(&self) -> bool {
        self.action == Action::Create || self.changes.iter().any(Change::requires_new_vm)
    }

    pub fn has_work(&self) -> bool {
        matches!(self.action, Action::Create | Action::Update | Action::Delete)
    }

    /// Re-derive the action after `changes` moved.
    pub(crate) fn settle(&mut self) {
        if self.action == Action::Keep && !self.changes.is_empty() {
            self.action = Action::Update;
        } else if self.action == Action::Update && self.changes.is_empty() {
            self.action = Action::Keep;
        }
    }
}

/// Rollout pacing for a group, with percentages resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateSettings {
    pub canaries: u32,
    pub max_in_flight: u32,
    pub canary_watch_time: WatchTime,
    pub update_watch_time: WatchTime,
    pub serial: bool,
    pub strategy: UpdateStrategy,
}

/// Infrastructure a group's VMs are built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmRequirements {
    pub stemcell_name: String,
    pub stemcell_version: String,
    pub stemcell_cid: String,
    pub vm_type: String,
    /// VM type cloud properties with vm_extensions merged in.
    pub cloud_properties: Value,
    pub networks: Value,
    pub env: Value,
    /// Persistent disk size in MiB, 0 for none.
    pub disk_size: u64,
    pub disk_cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRef {
    pub name: String,
    pub release: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceGroupPlan {
    pub name: String,
    pub update: UpdateSettings,
    pub vm: VmRequirements,
    pub jobs: Vec<JobRef>,
    pub instances: Vec<InstancePlan>,
}

impl InstanceGroupPlan {
    /// Instances that need a create or an update, in index order.
    pub fn pending(&self) -> impl Iterator<Item = &InstancePlan> {
        self.instances
            .iter()
            .filter(|i| matches!(i.action, Action::Create | Action::Update))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentPlan {
    pub deployment: String,
    pub groups: Vec<InstanceGroupPlan>,
    /// Instances dropped from the manifest, deleted after every group converges.
    pub deletions: Vec<InstancePlan>,
    pub warnings: Vec<String>,
}

impl DeploymentPlan {
    pub fn group(&self, name: &str) -> Option<&InstanceGroupPlan> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn count(&self, action: Action) -> usize {
        let planned = self
            .groups
            .iter()
            .flat_map(|g| g.instances.iter())
            .filter(|i| i.action == action)
            .count();
        planned + self.deletions.iter().filter(|i| i.action == action).count()
    }

    pub fn has_work(&self) -> bool {
        !self.deletions.is_empty() || self.groups.iter().any(|g| g.pending().next().is_some())
    }
}
