//! The agent running on every VM.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CloudResult;

/// What an agent reports about its VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    /// `running`, `stopped` or `failing`.
    pub job_state: String,
    /// The last applied spec.
    pub spec: Value,
}

impl AgentState {
    pub fn is_running(&self) -> bool {
        self.job_state == "running"
    }
}

/// Opaque blocking RPC to the agent identified by `agent_id`.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Push the configuration the instance should converge to.
    async fn apply(&self, agent_id: &str, spec: &Value) -> CloudResult<()>;
    async fn start(&self, agent_id: &str) -> CloudResult<()>;
    async fn stop(&self, agent_id: &str) -> CloudResult<()>;
    /// Let jobs finish in-flight work before a stop. Returns seconds waited.
    async fn drain(&self, agent_id: &str) -> CloudResult<u64>;
    async fn get_state(&self, agent_id: &str) -> CloudResult<AgentState>;
    async fn mount_disk(&self, agent_id: &str, disk_cid: &str) -> CloudResult<()>;
    async fn unmount_disk(&self, agent_id: &str, disk_cid: &str) -> CloudResult<()>;
}
