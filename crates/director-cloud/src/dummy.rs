//! In-memory cloud used by tests and by `cpi.kind = "dummy"`.
//!
//! VMs, disks and agents live in one shared map. Faults can be injected
//! per CPI method or per instance to exercise retry and canary paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::agent::{Agent, AgentState};
use crate::cpi::{Cpi, CreateVmRequest};
use crate::error::{CloudError, CloudResult};

#[derive(Debug, Clone)]
struct DummyVm {
    agent_id: String,
    request: CreateVmRequest,
    metadata: BTreeMap<String, String>,
    disks: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct DummyDisk {
    size_mb: u64,
    attached_to: Option<String>,
}

#[derive(Debug, Clone)]
struct DummyAgent {
    job_state: String,
    spec: Value,
    mounted: BTreeSet<String>,
}

#[derive(Debug, Clone)]
enum Fault {
    Method {
        method: &'static str,
        remaining: u32,
        retryable: bool,
    },
    Instance {
        group: String,
        index: u64,
    },
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    vms: BTreeMap<String, DummyVm>,
    disks: BTreeMap<String, DummyDisk>,
    agents: BTreeMap<String, DummyAgent>,
    faults: Vec<Fault>,
    calls: Vec<String>,
}

impl State {
    fn next_cid(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Record the call and consume a pending fault for `method`, if any.
    fn call(&mut self, method: &'static str, arg: &str) -> CloudResult<()> {
        self.calls.push(format!("{method} {arg}").trim_end().to_string());
        for fault in self.faults.iter_mut() {
            if let Fault::Method {
                method: m,
                remaining,
                retryable,
            } = fault
                && *m == method
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(CloudError::cpi(method, "injected failure", *retryable));
            }
        }
        Ok(())
    }

    fn instance_fault(&self, spec: &Value) -> bool {
        let group = spec.get("name").and_then(Value::as_str);
        let index = spec.get("index").and_then(Value::as_u64);
        self.faults.iter().any(|f| match f {
            Fault::Instance { group: g, index: i } => group == Some(g.as_str()) && index == Some(*i),
            Fault::Method { .. } => false,
        })
    }

    fn agent(&mut self, agent_id: &str, action: &'static str) -> CloudResult<&mut DummyAgent> {
        self.agents.get_mut(agent_id).ok_or_else(|| CloudError::Agent {
            agent_id: agent_id.to_string(),
            action,
            message: "agent not responding".to_string(),
        })
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DummyCloud {
    name: String,
    state: Arc<Mutex<State>>,
}

impl Default for DummyCloud {
    fn default() -> Self {
        Self::new("dummy")
    }
}

impl DummyCloud {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Fail the next `times` calls of `method`.
    pub async fn fail_next(&self, method: &'static str, times: u32, retryable: bool) {
        self.state.lock().await.faults.push(Fault::Method {
            method,
            remaining: times,
            retryable,
        });
    }

    /// Make every `apply` for instance `group/index` fail.
    pub async fn fail_instance(&self, group: &str, index: u64) {
        self.state.lock().await.faults.push(Fault::Instance {
            group: group.to_string(),
            index,
        });
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    /// Calls made so far, as `"<method> <arg>"`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn count_calls(&self, method: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(method))
            .count()
    }

    pub async fn vm_cids(&self) -> Vec<String> {
        self.state.lock().await.vms.keys().cloned().collect()
    }

    pub async fn disk_cids(&self) -> Vec<String> {
        self.state.lock().await.disks.keys().cloned().collect()
    }

    pub async fn disk_size(&self, disk_cid: &str) -> Option<u64> {
        self.state.lock().await.disks.get(disk_cid).map(|d| d.size_mb)
    }

    pub async fn vm_disks(&self, vm_cid: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .vms
            .get(vm_cid)
            .map(|vm| vm.disks.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn vm_request(&self, vm_cid: &str) -> Option<CreateVmRequest> {
        self.state.lock().await.vms.get(vm_cid).map(|vm| vm.request.clone())
    }

    pub async fn vm_metadata(&self, vm_cid: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .await
            .vms
            .get(vm_cid)
            .map(|vm| vm.metadata.clone())
            .unwrap_or_default()
    }

    /// The agent of a VM.
    pub async fn agent_id(&self, vm_cid: &str) -> Option<String> {
        self.state.lock().await.vms.get(vm_cid).map(|vm| vm.agent_id.clone())
    }
}

#[async_trait]
impl Cpi for DummyCloud {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        state.call("create_vm", &request.agent_id)?;
        if request.stemcell_cid.is_empty() {
            return Err(CloudError::cpi("create_vm", "no stemcell given", false));
        }
        let cid = state.next_cid("vm");
        let mut disks = BTreeSet::new();
        for disk in &request.disk_cids {
            if let Some(d) = state.disks.get_mut(disk) {
                d.attached_to = Some(cid.clone());
                disks.insert(disk.clone());
            }
        }
        state.vms.insert(
            cid.clone(),
            DummyVm {
                agent_id: request.agent_id.clone(),
                request: request.clone(),
                metadata: BTreeMap::new(),
                disks,
            },
        );
        state.agents.insert(
            request.agent_id.clone(),
            DummyAgent {
                job_state: "stopped".to_string(),
                spec: Value::Null,
                mounted: BTreeSet::new(),
            },
        );
        debug!(cpi = %self.name, vm_cid = %cid, agent_id = %request.agent_id, "dummy vm created");
        Ok(cid)
    }

    async fn delete_vm(&self, vm_cid: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("delete_vm", vm_cid)?;
        let vm = state
            .vms
            .remove(vm_cid)
            .ok_or_else(|| CloudError::VmNotFound(vm_cid.to_string()))?;
        for disk in &vm.disks {
            if let Some(d) = state.disks.get_mut(disk) {
                d.attached_to = None;
            }
        }
        state.agents.remove(&vm.agent_id);
        Ok(())
    }

    async fn has_vm(&self, vm_cid: &str) -> CloudResult<bool> {
        let mut state = self.state.lock().await;
        state.call("has_vm", vm_cid)?;
        Ok(state.vms.contains_key(vm_cid))
    }

    async fn set_vm_metadata(&self, vm_cid: &str, metadata: &BTreeMap<String, String>) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("set_vm_metadata", vm_cid)?;
        let vm = state
            .vms
            .get_mut(vm_cid)
            .ok_or_else(|| CloudError::VmNotFound(vm_cid.to_string()))?;
        vm.metadata.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn create_disk(&self, size_mb: u64, _cloud_properties: &Value, vm_cid: Option<&str>) -> CloudResult<String> {
        let mut state = self.state.lock().await;
        state.call("create_disk", vm_cid.unwrap_or_default())?;
        let cid = state.next_cid("disk");
        state.disks.insert(
            cid.clone(),
            DummyDisk {
                size_mb,
                attached_to: None,
            },
        );
        Ok(cid)
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("attach_disk", disk_cid)?;
        if !state.vms.contains_key(vm_cid) {
            return Err(CloudError::VmNotFound(vm_cid.to_string()));
        }
        let disk = state
            .disks
            .get_mut(disk_cid)
            .ok_or_else(|| CloudError::DiskNotFound(disk_cid.to_string()))?;
        if let Some(other) = &disk.attached_to
            && other != vm_cid
        {
            return Err(CloudError::cpi(
                "attach_disk",
                format!("disk '{disk_cid}' is attached to '{other}'"),
                false,
            ));
        }
        disk.attached_to = Some(vm_cid.to_string());
        if let Some(vm) = state.vms.get_mut(vm_cid) {
            vm.disks.insert(disk_cid.to_string());
        }
        Ok(())
    }

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("detach_disk", disk_cid)?;
        let vm = state
            .vms
            .get_mut(vm_cid)
            .ok_or_else(|| CloudError::VmNotFound(vm_cid.to_string()))?;
        vm.disks.remove(disk_cid);
        let disk = state
            .disks
            .get_mut(disk_cid)
            .ok_or_else(|| CloudError::DiskNotFound(disk_cid.to_string()))?;
        disk.attached_to = None;
        Ok(())
    }

    async fn delete_disk(&self, disk_cid: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("delete_disk", disk_cid)?;
        let attached = state
            .disks
            .get(disk_cid)
            .map(|d| d.attached_to.clone())
            .ok_or_else(|| CloudError::DiskNotFound(disk_cid.to_string()))?;
        if let Some(vm) = attached {
            return Err(CloudError::cpi(
                "delete_disk",
                format!("disk '{disk_cid}' is still attached to '{vm}'"),
                false,
            ));
        }
        state.disks.remove(disk_cid);
        Ok(())
    }
}

#[async_trait]
impl Agent for DummyCloud {
    async fn apply(&self, agent_id: &str, spec: &Value) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("apply", agent_id)?;
        if state.instance_fault(spec) {
            return Err(CloudError::Agent {
                agent_id: agent_id.to_string(),
                action: "apply",
                message: "job failed to start".to_string(),
            });
        }
        state.agent(agent_id, "apply")?.spec = spec.clone();
        Ok(())
    }

    async fn start(&self, agent_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("start", agent_id)?;
        state.agent(agent_id, "start")?.job_state = "running".to_string();
        Ok(())
    }

    async fn stop(&self, agent_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("stop", agent_id)?;
        state.agent(agent_id, "stop")?.job_state = "stopped".to_string();
        Ok(())
    }

    async fn drain(&self, agent_id: &str) -> CloudResult<u64> {
        let mut state = self.state.lock().await;
        state.call("drain", agent_id)?;
        state.agent(agent_id, "drain")?;
        Ok(0)
    }

    async fn get_state(&self, agent_id: &str) -> CloudResult<AgentState> {
        let mut state = self.state.lock().await;
        state.call("get_state", agent_id)?;
        let agent = state.agent(agent_id, "report state")?;
        Ok(AgentState {
            agent_id: agent_id.to_string(),
            job_state: agent.job_state.clone(),
            spec: agent.spec.clone(),
        })
    }

    async fn mount_disk(&self, agent_id: &str, disk_cid: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("mount_disk", disk_cid)?;
        state.agent(agent_id, "mount disk")?.mounted.insert(disk_cid.to_string());
        Ok(())
    }

    async fn unmount_disk(&self, agent_id: &str, disk_cid: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.call("unmount_disk", disk_cid)?;
        state.agent(agent_id, "unmount disk")?.mounted.remove(disk_cid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(agent: &str) -> CreateVmRequest {
        CreateVmRequest {
            agent_id: agent.to_string(),
            stemcell_cid: "sc-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn vm_and_disk_lifecycle() {
        let cloud = DummyCloud::default();
        let vm = cloud.create_vm(&request("agent-1")).await.unwrap();
        assert!(cloud.has_vm(&vm).await.unwrap());

        let disk = cloud.create_disk(1024, &json!({}), Some(&vm)).await.unwrap();
        cloud.attach_disk(&vm, &disk).await.unwrap();
        assert_eq!(cloud.vm_disks(&vm).await, vec![disk.clone()]);
        assert!(cloud.delete_disk(&disk).await.is_err());

        cloud.detach_disk(&vm, &disk).await.unwrap();
        cloud.delete_disk(&disk).await.unwrap();
        cloud.delete_vm(&vm).await.unwrap();
        assert!(!cloud.has_vm(&vm).await.unwrap());
        assert!(matches!(cloud.delete_vm(&vm).await, Err(CloudError::VmNotFound(_))));
    }

    #[tokio::test]
    async fn injected_method_faults_are_consumed() {
        let cloud = DummyCloud::default();
        cloud.fail_next("create_vm", 2, true).await;
        let first = cloud.create_vm(&request("a")).await.unwrap_err();
        assert!(first.is_retryable());
        assert!(cloud.create_vm(&request("a")).await.is_err());
        cloud.create_vm(&request("a")).await.unwrap();
        assert_eq!(cloud.count_calls("create_vm").await, 3);
    }

    #[tokio::test]
    async fn agent_applies_and_reports_state() {
        let cloud = DummyCloud::default();
        cloud.create_vm(&request("agent-1")).await.unwrap();
        let spec = json!({"name": "web", "index": 0});
        cloud.apply("agent-1", &spec).await.unwrap();
        cloud.start("agent-1").await.unwrap();
        let state = cloud.get_state("agent-1").await.unwrap();
        assert!(state.is_running());
        assert_eq!(state.spec, spec);

        cloud.fail_instance("web", 0).await;
        let err = cloud.apply("agent-1", &spec).await.unwrap_err();
        assert!(matches!(err, CloudError::Agent { action: "apply", .. }));
        assert!(cloud.apply("missing", &json!({})).await.is_err());
    }
}
