//! Persisted director entities.
//!
//! Every record is JSON-serialized into a redb value column. Timestamps are
//! epoch milliseconds. Record ids that need ordering are allocated from the
//! store's sequence table and zero-padded inside keys.

use director_core::InstanceState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub name: String,
    /// Manifest text exactly as submitted.
    pub manifest_text: String,
    /// Parsed manifest tree (placeholders still unresolved).
    pub manifest: Value,
    #[serde(default)]
    pub cloud_config_ids: Vec<u64>,
    #[serde(default)]
    pub runtime_config_ids: Vec<u64>,
    #[serde(default)]
    pub teams: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Variable sets ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariableSet {
    pub id: u64,
    pub deployment: String,
    pub created_at: u64,
    pub deployed_successfully: bool,
    pub writable: bool,
}

/// A name to config-server id binding inside one variable set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variable {
    pub set_id: u64,
    pub name: String,
    pub variable_id: String,
    /// Resolved value. Stands in for the external config server.
    pub value: Value,
    pub is_local: bool,
    /// Owning deployment for variables shared through links, empty otherwise.
    #[serde(default)]
    pub provider_deployment: String,
}

// ── Instances, VMs and disks ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub uuid: String,
    pub deployment: String,
    /// Instance group name.
    pub job: String,
    pub index: u32,
    pub state: InstanceState,
    pub az: Option<String>,
    /// Last applied instance spec.
    pub spec: Value,
    pub variable_set_id: Option<u64>,
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub resurrection_paused: bool,
    #[serde(default)]
    pub ignore: bool,
    pub created_at: u64,
}

impl Instance {
    pub fn table_key(&self) -> String {
        instance_key(&self.deployment, &self.job, &self.uuid)
    }

    /// `group/uuid`, the form used in logs and task events.
    pub fn name(&self) -> String {
        format!("{}/{}", self.job, self.uuid)
    }
}

pub fn instance_key(deployment: &str, job: &str, uuid: &str) -> String {
    format!("{deployment}/{job}/{uuid}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vm {
    pub id: u64,
    pub instance_uuid: String,
    pub agent_id: String,
    pub cid: String,
    pub active: bool,
    #[serde(default)]
    pub cpi: String,
    pub stemcell_name: String,
    pub stemcell_version: String,
    #[serde(default)]
    pub network_spec: Value,
    #[serde(default)]
    pub env: Value,
    #[serde(default)]
    pub cloud_properties: Value,
    pub created_at: u64,
}

impl Vm {
    pub fn table_key(&self) -> String {
        format!("{}/{:020}", self.instance_uuid, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrphanedVm {
    pub id: u64,
    pub cid: String,
    pub deployment: String,
    pub instance_name: String,
    pub az: Option<String>,
    pub cpi: String,
    pub stemcell_name: String,
    pub stemcell_version: String,
    pub orphaned_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentDisk {
    pub cid: String,
    pub instance_uuid: String,
    pub deployment: String,
    /// Size in MiB.
    pub size: u64,
    pub active: bool,
    /// CPI of the owning AZ, fixed when the disk is created.
    pub cpi: String,
    #[serde(default)]
    pub cloud_properties: Value,
    #[serde(default)]
    pub name: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrphanDisk {
    pub cid: String,
    pub deployment: String,
    pub instance_name: String,
    pub az: Option<String>,
    pub size: u64,
    pub cpi: String,
    #[serde(default)]
    pub cloud_properties: Value,
    pub created_at: u64,
}

// ── Links ──────────────────────────────────────────────────────────

/// A link exposed by a job on an instance group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkProvider {
    pub deployment: String,
    pub instance_group: String,
    pub job: String,
    pub original_name: String,
    /// Alias the link is published under (`as:`), defaults to the original name.
    pub name: String,
    pub link_type: String,
    pub content: Value,
    pub shared: bool,
    /// False when the provider was blocked with `provides: {x: nil}`.
    pub consumable: bool,
}

impl LinkProvider {
    pub fn table_key(&self) -> String {
        link_owner_key(&self.deployment, &self.instance_group, &self.job, &self.original_name)
    }
}

/// A link requirement declared by a job on an instance group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConsumer {
    pub deployment: String,
    pub instance_group: String,
    pub job: String,
    pub original_name: String,
    pub link_type: String,
    /// Explicit provider alias (`from:`).
    pub from: Option<String>,
    /// Provider deployment for cross-deployment links.
    pub provider_deployment: Option<String>,
    pub optional: bool,
    pub blocked: bool,
    /// Inline content for manual links.
    pub manual_content: Option<Value>,
}

impl LinkConsumer {
    pub fn table_key(&self) -> String {
        link_owner_key(&self.deployment, &self.instance_group, &self.job, &self.original_name)
    }
}

pub fn link_owner_key(deployment: &str, group: &str, job: &str, name: &str) -> String {
    format!("{deployment}/{group}/{job}/{name}")
}

/// Resolved binding between a consumer and its content source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Link {
    /// `table_key()` of the consumer.
    pub consumer: String,
    /// `table_key()` of the provider, or `manual` for inline content.
    pub source: String,
    pub name: String,
    pub content: Value,
    pub created_at: u64,
}

impl Link {
    pub const MANUAL_SOURCE: &'static str = "manual";

    pub fn table_key(&self) -> String {
        format!("{}#{}", self.consumer, self.source)
    }
}

// ── Locks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub name: String,
    /// Holder identity; only the holder may renew or release.
    pub uid: String,
    pub expired_at: u64,
    pub task_id: Option<u64>,
}

impl LockRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expired_at
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Processing,
    Cancelling,
    Cancelled,
    Done,
    Error,
    Timeout,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Error | TaskState::Cancelled | TaskState::Timeout
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Allowed edges of the task state machine.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelling)
                | (Queued, Cancelled)
                | (Processing, Done)
                | (Processing, Error)
                | (Processing, Cancelling)
                | (Processing, Timeout)
                | (Cancelling, Cancelled)
                | (Cancelling, Done)
                | (Cancelling, Error)
                | (Cancelling, Timeout)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Processing => "processing",
            TaskState::Cancelling => "cancelling",
            TaskState::Cancelled => "cancelled",
            TaskState::Done => "done",
            TaskState::Error => "error",
            TaskState::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => TaskState::Queued,
            "processing" => TaskState::Processing,
            "cancelling" => TaskState::Cancelling,
            "cancelled" => TaskState::Cancelled,
            "done" => TaskState::Done,
            "error" => TaskState::Error,
            "timeout" => TaskState::Timeout,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: u64,
    pub state: TaskState,
    pub job_type: String,
    pub description: String,
    pub username: String,
    pub deployment: Option<String>,
    pub context_id: Option<String>,
    #[serde(default)]
    pub teams: Vec<String>,
    /// Job arguments, replayed when a queued task is recovered.
    pub args: Value,
    pub result: Option<String>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub checkpoint_at: Option<u64>,
    pub finished_at: Option<u64>,
}

/// Named output streams of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Event,
    Result,
    Debug,
}

impl OutputStream {
    pub const ALL: [OutputStream; 3] = [OutputStream::Event, OutputStream::Result, OutputStream::Debug];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Event => "event",
            OutputStream::Result => "result",
            OutputStream::Debug => "debug",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "event" => Some(OutputStream::Event),
            "result" => Some(OutputStream::Result),
            "debug" => Some(OutputStream::Debug),
            _ => None,
        }
    }
}

// ── Configs, releases, stemcells ───────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigRecord {
    pub id: u64,
    /// `cloud`, `runtime`, `cpi`, ...
    pub kind: String,
    pub name: String,
    /// Raw YAML text.
    pub content: String,
    pub team: Option<String>,
    pub created_at: u64,
}

impl ConfigRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}/{:020}", self.kind, self.name, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseVersion {
    pub name: String,
    pub version: String,
    /// Job names the release ships, with their provided/consumed link types.
    #[serde(default)]
    pub jobs: Vec<ReleaseJob>,
    pub uploaded_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReleaseJob {
    pub name: String,
    #[serde(default)]
    pub provides: Vec<ReleaseLinkDef>,
    #[serde(default)]
    pub consumes: Vec<ReleaseLinkDef>,
    /// Default values for the job's properties.
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReleaseLinkDef {
    pub name: String,
    #[serde(rename = "type")]
    pub link_type: String,
    #[serde(default)]
    pub optional: bool,
    /// Property names exported in the link content.
    #[serde(default)]
    pub properties: Vec<String>,
}

impl ReleaseVersion {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }

    pub fn job(&self, name: &str) -> Option<&ReleaseJob> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stemcell {
    pub name: String,
    pub os: String,
    pub version: String,
    pub cid: String,
    #[serde(default)]
    pub cpi: String,
    pub uploaded_at: u64,
}

impl Stemcell {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}
