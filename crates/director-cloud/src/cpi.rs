//! The cloud provider interface.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CloudError, CloudResult};

/// Everything a CPI needs to boot one VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub agent_id: String,
    pub stemcell_cid: String,
    #[serde(default)]
    pub cloud_properties: Value,
    #[serde(default)]
    pub networks: Value,
    #[serde(default)]
    pub disk_cids: Vec<String>,
    #[serde(default)]
    pub env: Value,
}

/// Blocking remote calls against one infrastructure. Every call either
/// returns or fails with a [`CloudError`]; callers treat failures as fatal
/// unless they are flagged retryable.
#[async_trait]
pub trait Cpi: Send + Sync {
    /// Name under which cloud-config AZs refer to this CPI.
    fn name(&self) -> &str;

    async fn create_vm(&self, request: &CreateVmRequest) -> CloudResult<String>;
    async fn delete_vm(&self, vm_cid: &str) -> CloudResult<()>;
    async fn has_vm(&self, vm_cid: &str) -> CloudResult<bool>;
    async fn set_vm_metadata(&self, vm_cid: &str, metadata: &BTreeMap<String, String>) -> CloudResult<()>;

    async fn create_disk(&self, size_mb: u64, cloud_properties: &Value, vm_cid: Option<&str>) -> CloudResult<String>;
    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()>;
    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()>;
    async fn delete_disk(&self, disk_cid: &str) -> CloudResult<()>;
}

/// CPIs by name. The empty name selects the default CPI.
#[derive(Clone)]
pub struct CpiRegistry {
    default: Arc<dyn Cpi>,
    named: HashMap<String, Arc<dyn Cpi>>,
}

impl CpiRegistry {
    pub fn new(default: Arc<dyn Cpi>) -> Self {
        Self {
            default,
            named: HashMap::new(),
        }
    }

    pub fn with(mut self, cpi: Arc<dyn Cpi>) -> Self {
        self.named.insert(cpi.name().to_string(), cpi);
        self
    }

    pub fn default_cpi(&self) -> Arc<dyn Cpi> {
        self.default.clone()
    }

    /// The CPI recorded on a VM or disk, or the one an AZ maps to.
    pub fn get(&self, name: &str) -> CloudResult<Arc<dyn Cpi>> {
        if name.is_empty() || name == self.default.name() {
            return Ok(self.default.clone());
        }
        self.named
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::UnknownCpi(name.to_string()))
    }
}
