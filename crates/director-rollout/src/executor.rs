//! Plan executor.
//!
//! Groups converge one after another. Within a group the canary batch runs
//! first and must fully succeed before regular batches of `max_in_flight`
//! start; the first failed instance fails the whole rollout. Instances
//! dropped from the manifest are deleted once every group has converged.
//!
//! Cancellation, and loss of the lock the rollout runs under, is checked
//! between batches and between VM creation retries. Instances that already
//! converged stay converged; their records carry the new spec, the rest
//! keep the spec they had.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use director_cloud::{Agent, CloudError, CpiRegistry, CreateVmRequest};
use director_core::manifest::WatchTime;
use director_core::{epoch_ms, CloudConfig, InstanceState, UpdateStrategy};
use director_planner::{Action, DeploymentPlan, InstanceGroupPlan, InstancePlan, VmRequirements};
use director_state::{Instance, PersistentDisk, StateStore, Vm};
use director_tasks::{EventState, TaskLogger};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batches::GroupRollout;
use crate::error::{RolloutError, RolloutResult};

const UPDATE_STAGE: &str = "Updating instance";
const DELETE_STAGE: &str = "Deleting unneeded instances";

/// What a rollout did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RolloutSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// Per-group settings shared by the instance workers of one batch.
struct GroupContext {
    deployment: String,
    vm: VmRequirements,
    strategy: UpdateStrategy,
}

/// Drives a [`DeploymentPlan`] through the CPI and the agents.
///
/// Cheap to clone; each instance worker gets its own handle.
#[derive(Clone)]
pub struct Executor {
    store: StateStore,
    cpis: CpiRegistry,
    agent: Arc<dyn Agent>,
    cloud: Arc<CloudConfig>,
    logger: TaskLogger,
    cancel: CancellationToken,
    lock_lost: Option<CancellationToken>,
    max_vm_create_tries: u32,
    variable_set_id: Option<u64>,
}

impl Executor {
    pub fn new(
        store: StateStore,
        cpis: CpiRegistry,
        agent: Arc<dyn Agent>,
        logger: TaskLogger,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            cpis,
            agent,
            cloud: Arc::new(CloudConfig::default()),
            logger,
            cancel,
            lock_lost: None,
            max_vm_create_tries: 5,
            variable_set_id: None,
        }
    }

    /// Cloud config used to map AZs to CPIs.
    pub fn with_cloud_config(mut self, cloud: CloudConfig) -> Self {
        self.cloud = Arc::new(cloud);
        self
    }

    pub fn with_max_vm_create_tries(mut self, tries: u32) -> Self {
        self.max_vm_create_tries = tries.max(1);
        self
    }

    /// Stop at the next checkpoint once `lost` fires.
    pub fn with_lock_guard(mut self, lost: CancellationToken) -> Self {
        self.lock_lost = Some(lost);
        self
    }

    /// Variable set the rendered specs were resolved against; recorded on
    /// every instance of the deployment.
    pub fn with_variable_set(mut self, id: u64) -> Self {
        self.variable_set_id = Some(id);
        self
    }

    pub async fn execute(&self, plan: &DeploymentPlan) -> RolloutResult<RolloutSummary> {
        let mut summary = RolloutSummary::default();
        info!(
            deployment = %plan.deployment,
            groups = plan.groups.len(),
            deletions = plan.deletions.len(),
            "executing deployment plan"
        );

        for group in &plan.groups {
            self.check_cancelled()?;
            self.roll_group(&plan.deployment, group).await?;
            for instance in &group.instances {
                match instance.action {
                    Action::Create => summary.created += 1,
                    Action::Update => summary.updated += 1,
                    Action::Keep => {
                        self.pin_variable_set(&plan.deployment, instance)?;
                        summary.unchanged += 1;
                    }
                    Action::Delete => {}
                }
            }
        }

        let total = plan.deletions.len();
        for (position, planned) in plan.deletions.iter().enumerate() {
            self.check_cancelled()?;
            let Some(instance) = &planned.existing else {
                continue;
            };
            let name = instance.name();
            self.logger.event(DELETE_STAGE, &name, position + 1, total, EventState::Started);
            if let Err(e) = self.delete_instance(instance).await {
                self.logger
                    .event_failed(DELETE_STAGE, &name, position + 1, total, &e.to_string());
                return Err(RolloutError::instance(name, e));
            }
            self.logger.event(DELETE_STAGE, &name, position + 1, total, EventState::Finished);
            summary.deleted += 1;
        }

        info!(
            deployment = %plan.deployment,
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            "deployment plan executed"
        );
        Ok(summary)
    }

    async fn roll_group(&self, deployment: &str, group: &InstanceGroupPlan) -> RolloutResult<()> {
        let pending: Vec<InstancePlan> = group.pending().cloned().collect();
        let mut rollout = GroupRollout::new(
            &group.name,
            pending.len(),
            group.update.canaries,
            group.update.max_in_flight,
        );
        rollout.start();

        let context = Arc::new(GroupContext {
            deployment: deployment.to_string(),
            vm: group.vm.clone(),
            strategy: group.update.strategy,
        });
        let total = pending.len();

        while let Some(batch) = rollout.advance() {
            self.check_cancelled()?;
            let watch = if batch.canary {
                group.update.canary_watch_time
            } else {
                group.update.update_watch_time
            };
            debug!(group = %group.name, canary = batch.canary, size = batch.len(), "starting batch");

            let mut workers = JoinSet::new();
            for position in batch.range.clone() {
                let instance = pending[position].clone();
                let label = event_label(&instance, batch.canary);
                self.logger
                    .event(UPDATE_STAGE, &label, position + 1, total, EventState::Started);
                let executor = self.clone();
                let context = context.clone();
                workers.spawn(async move {
                    let outcome = executor.converge(&context, &instance, watch).await;
                    (position, label, instance.name(), outcome)
                });
            }

            let mut failure = None;
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok((position, label, _, Ok(()))) => {
                        self.logger
                            .event(UPDATE_STAGE, &label, position + 1, total, EventState::Finished);
                    }
                    Ok((position, label, name, Err(e))) => {
                        self.logger
                            .event_failed(UPDATE_STAGE, &label, position + 1, total, &e.to_string());
                        warn!(instance = %name, error = %e, "instance failed to converge");
                        failure.get_or_insert(match e {
                            e @ (RolloutError::Cancelled { .. } | RolloutError::LockLost { .. }) => e,
                            e => RolloutError::instance(name, e),
                        });
                    }
                    Err(e) => {
                        failure.get_or_insert(RolloutError::Join(e.to_string()));
                    }
                }
            }
            if let Some(e) = failure {
                rollout.fail(e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Bring one instance to its planned spec.
    async fn converge(&self, context: &GroupContext, plan: &InstancePlan, watch: WatchTime) -> RolloutResult<()> {
        if plan.state == InstanceState::Detached {
            return self.persist(context, plan, plan.spec.clone());
        }

        // Record the instance before touching the cloud so a failure part
        // way through leaves it visible to the next plan.
        let previous = plan.existing.as_ref().map_or_else(|| json!({}), |i| i.spec.clone());
        self.persist(context, plan, previous)?;

        let current = self.store.active_vm(&plan.uuid)?;
        let (vm, fresh) = match current {
            Some(vm) if !plan.needs_new_vm() => {
                self.stop_jobs(&vm).await?;
                (vm, false)
            }
            Some(old) => (self.replace_vm(context, plan, old).await?, true),
            None => {
                let vm = self.create_vm(context, plan).await?;
                (self.store.activate_vm(&plan.uuid, vm.id)?, true)
            }
        };

        self.converge_disk(context, plan, &vm, fresh).await?;
        self.agent.apply(&vm.agent_id, &plan.spec).await?;
        if plan.state == InstanceState::Started {
            self.agent.start(&vm.agent_id).await?;
            self.wait_running(&vm.agent_id, &plan.name(), watch).await?;
        } else {
            self.agent.stop(&vm.agent_id).await?;
        }

        self.persist(context, plan, plan.spec.clone())?;
        debug!(instance = %plan.name(), vm_cid = %vm.cid, "instance converged");
        Ok(())
    }

    async fn replace_vm(&self, context: &GroupContext, plan: &InstancePlan, old: Vm) -> RolloutResult<Vm> {
        match context.strategy {
            UpdateStrategy::CreateSwapDelete => {
                let new = self.create_vm(context, plan).await?;
                self.stop_quietly(&old).await;
                self.detach_disks(&plan.uuid, &old).await?;
                let new = self.store.activate_vm(&plan.uuid, new.id)?;
                info!(instance = %plan.name(), old_vm = %old.cid, new_vm = %new.cid, "swapped active vm");
                self.retire_vm(context, plan, &old).await?;
                Ok(new)
            }
            UpdateStrategy::DeleteCreate => {
                self.stop_quietly(&old).await;
                self.detach_disks(&plan.uuid, &old).await?;
                self.delete_vm(&old).await?;
                let new = self.create_vm(context, plan).await?;
                Ok(self.store.activate_vm(&plan.uuid, new.id)?)
            }
        }
    }

    /// Create a VM through the AZ's CPI and record it, inactive.
    async fn create_vm(&self, context: &GroupContext, plan: &InstancePlan) -> RolloutResult<Vm> {
        let cpi_name = self.cloud.cpi_for_az(plan.az.as_deref());
        let cpi = self.cpis.get(&cpi_name)?;
        let request = CreateVmRequest {
            agent_id: uuid::Uuid::new_v4().to_string(),
            stemcell_cid: context.vm.stemcell_cid.clone(),
            cloud_properties: context.vm.cloud_properties.clone(),
            networks: context.vm.networks.clone(),
            disk_cids: Vec::new(),
            env: context.vm.env.clone(),
        };

        let mut attempt = 0;
        let cid = loop {
            attempt += 1;
            match cpi.create_vm(&request).await {
                Ok(cid) => break cid,
                Err(e) if e.is_retryable() && attempt < self.max_vm_create_tries => {
                    warn!(
                        instance = %plan.name(),
                        attempt,
                        max_tries = self.max_vm_create_tries,
                        error = %e,
                        "vm creation failed, retrying"
                    );
                    self.logger.debug(&format!(
                        "create_vm for {} failed (attempt {attempt}): {e}",
                        plan.name()
                    ));
                    self.check_cancelled()?;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let metadata: BTreeMap<String, String> = [
            ("deployment", context.deployment.clone()),
            ("instance_group", plan.group.clone()),
            ("index", plan.index.to_string()),
            ("id", plan.uuid.clone()),
            ("name", plan.name()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        cpi.set_vm_metadata(&cid, &metadata).await?;

        let vm = self.store.create_vm(Vm {
            id: 0,
            instance_uuid: plan.uuid.clone(),
            agent_id: request.agent_id,
            cid,
            active: false,
            cpi: cpi_name,
            stemcell_name: context.vm.stemcell_name.clone(),
            stemcell_version: context.vm.stemcell_version.clone(),
            network_spec: context.vm.networks.clone(),
            env: context.vm.env.clone(),
            cloud_properties: context.vm.cloud_properties.clone(),
            created_at: epoch_ms(),
        })?;
        info!(instance = %plan.name(), vm_cid = %vm.cid, cpi = %vm.cpi, "created vm");
        Ok(vm)
    }

    async fn delete_vm(&self, vm: &Vm) -> RolloutResult<()> {
        let cpi = self.cpis.get(&vm.cpi)?;
        match cpi.delete_vm(&vm.cid).await {
            Ok(()) | Err(CloudError::VmNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_vm(&vm.instance_uuid, vm.id)?;
        info!(vm_cid = %vm.cid, instance_uuid = %vm.instance_uuid, "deleted vm");
        Ok(())
    }

    /// Orphan a replaced VM, then delete it. A failed delete leaves the
    /// orphan record for later cleanup.
    async fn retire_vm(&self, context: &GroupContext, plan: &InstancePlan, vm: &Vm) -> RolloutResult<()> {
        let orphan = self
            .store
            .orphan_vm(vm, &context.deployment, &plan.name(), plan.az.as_deref(), epoch_ms())?;
        let cpi = self.cpis.get(&vm.cpi)?;
        match cpi.delete_vm(&vm.cid).await {
            Ok(()) | Err(CloudError::VmNotFound(_)) => {
                self.store.delete_orphaned_vm(orphan.id)?;
            }
            Err(e) => {
                warn!(vm_cid = %vm.cid, error = %e, "failed to delete replaced vm, keeping it orphaned");
                self.logger
                    .warning(&format!("Failed to delete replaced VM '{}': {e}", vm.cid));
            }
        }
        Ok(())
    }

    async fn stop_jobs(&self, vm: &Vm) -> RolloutResult<()> {
        let wait = self.agent.drain(&vm.agent_id).await?;
        if wait > 0 {
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
        self.agent.stop(&vm.agent_id).await?;
        Ok(())
    }

    /// Stop a VM that is about to go away; an unresponsive agent is expected.
    async fn stop_quietly(&self, vm: &Vm) {
        if let Err(e) = self.stop_jobs(vm).await {
            warn!(vm_cid = %vm.cid, error = %e, "failed to stop jobs, continuing");
        }
    }

    async fn detach_disks(&self, instance_uuid: &str, vm: &Vm) -> RolloutResult<()> {
        for disk in self.store.list_disks_for_instance(instance_uuid)? {
            if !disk.active {
                continue;
            }
            self.detach_disk(vm, &disk).await?;
        }
        Ok(())
    }

    async fn detach_disk(&self, vm: &Vm, disk: &PersistentDisk) -> RolloutResult<()> {
        if let Err(e) = self.agent.unmount_disk(&vm.agent_id, &disk.cid).await {
            warn!(disk_cid = %disk.cid, error = %e, "failed to unmount disk, detaching anyway");
        }
        let cpi = self.cpis.get(&disk.cpi)?;
        match cpi.detach_disk(&vm.cid, &disk.cid).await {
            Ok(()) | Err(CloudError::VmNotFound(_)) | Err(CloudError::DiskNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn attach_disk(&self, vm: &Vm, disk: &PersistentDisk) -> RolloutResult<()> {
        let cpi = self.cpis.get(&disk.cpi)?;
        cpi.attach_disk(&vm.cid, &disk.cid).await?;
        self.agent.mount_disk(&vm.agent_id, &disk.cid).await?;
        Ok(())
    }

    /// Make the instance's persistent disk match the group's disk type.
    /// `fresh` is set when `vm` has just been created and has nothing attached.
    async fn converge_disk(&self, context: &GroupContext, plan: &InstancePlan, vm: &Vm, fresh: bool) -> RolloutResult<()> {
        let current = self
            .store
            .list_disks_for_instance(&plan.uuid)?
            .into_iter()
            .find(|d| d.active);
        let desired = context.vm.disk_size;

        match current {
            None if desired == 0 => Ok(()),
            None => {
                self.create_disk(context, plan, vm).await?;
                Ok(())
            }
            Some(disk) if desired == 0 => {
                if !fresh {
                    self.detach_disk(vm, &disk).await?;
                }
                self.orphan_disk(plan, &disk)
            }
            Some(disk) if disk.size != desired || disk.cloud_properties != context.vm.disk_cloud_properties => {
                self.create_disk(context, plan, vm).await?;
                if !fresh {
                    self.detach_disk(vm, &disk).await?;
                }
                self.orphan_disk(plan, &disk)
            }
            Some(disk) if fresh => self.attach_disk(vm, &disk).await,
            Some(_) => Ok(()),
        }
    }

    /// New disks are tagged with the CPI of the instance's AZ.
    async fn create_disk(&self, context: &GroupContext, plan: &InstancePlan, vm: &Vm) -> RolloutResult<PersistentDisk> {
        let cpi_name = self.cloud.cpi_for_az(plan.az.as_deref());
        let cpi = self.cpis.get(&cpi_name)?;
        let cid = cpi
            .create_disk(context.vm.disk_size, &context.vm.disk_cloud_properties, Some(&vm.cid))
            .await?;
        let mut disk = PersistentDisk {
            cid,
            instance_uuid: plan.uuid.clone(),
            deployment: context.deployment.clone(),
            size: context.vm.disk_size,
            active: false,
            cpi: cpi_name,
            cloud_properties: context.vm.disk_cloud_properties.clone(),
            name: String::new(),
            created_at: epoch_ms(),
        };
        self.store.put_disk(&disk)?;
        self.attach_disk(vm, &disk).await?;
        disk.active = true;
        self.store.put_disk(&disk)?;
        info!(instance = %plan.name(), disk_cid = %disk.cid, size = disk.size, "created persistent disk");
        Ok(disk)
    }

    fn orphan_disk(&self, plan: &InstancePlan, disk: &PersistentDisk) -> RolloutResult<()> {
        self.store
            .orphan_disk(&disk.cid, &plan.name(), plan.az.as_deref(), epoch_ms())?;
        info!(instance = %plan.name(), disk_cid = %disk.cid, "orphaned persistent disk");
        Ok(())
    }

    async fn wait_running(&self, agent_id: &str, instance: &str, watch: WatchTime) -> RolloutResult<()> {
        let started = Instant::now();
        let step = Duration::from_millis(watch.min_ms.clamp(1, 1000));
        loop {
            if self.agent.get_state(agent_id).await?.is_running() {
                return Ok(());
            }
            let waited_ms = started.elapsed().as_millis() as u64;
            if waited_ms >= watch.max_ms {
                return Err(RolloutError::NotRunning {
                    instance: instance.to_string(),
                    waited_ms,
                });
            }
            tokio::time::sleep(step).await;
        }
    }

    /// Delete an instance: its VMs through the CPI, its disks into orphans,
    /// then its record.
    pub async fn delete_instance(&self, instance: &Instance) -> RolloutResult<()> {
        let name = instance.name();
        for vm in self.store.list_vms(&instance.uuid)? {
            if vm.active {
                self.stop_quietly(&vm).await;
                self.detach_disks(&instance.uuid, &vm).await?;
            }
            self.delete_vm(&vm).await?;
        }
        for disk in self.store.list_disks_for_instance(&instance.uuid)? {
            self.store
                .orphan_disk(&disk.cid, &name, instance.az.as_deref(), epoch_ms())?;
            info!(instance = %name, disk_cid = %disk.cid, "orphaned persistent disk");
        }
        self.store
            .delete_instance(&instance.deployment, &instance.job, &instance.uuid)?;
        info!(instance = %name, "deleted instance");
        Ok(())
    }

    fn persist(&self, context: &GroupContext, plan: &InstancePlan, spec: Value) -> RolloutResult<()> {
        let existing = plan.existing.as_ref();
        self.store.put_instance(&Instance {
            uuid: plan.uuid.clone(),
            deployment: context.deployment.clone(),
            job: plan.group.clone(),
            index: plan.index,
            state: plan.state,
            az: plan.az.clone(),
            spec,
            variable_set_id: self.variable_set_id.or(existing.and_then(|i| i.variable_set_id)),
            bootstrap: plan.bootstrap,
            resurrection_paused: existing.is_some_and(|i| i.resurrection_paused),
            ignore: existing.is_some_and(|i| i.ignore),
            created_at: existing.map_or_else(epoch_ms, |i| i.created_at),
        })?;
        Ok(())
    }

    /// Untouched instances move to the deploy's variable set too.
    fn pin_variable_set(&self, deployment: &str, plan: &InstancePlan) -> RolloutResult<()> {
        let (Some(set_id), Some(existing)) = (self.variable_set_id, &plan.existing) else {
            return Ok(());
        };
        if existing.variable_set_id == Some(set_id) {
            return Ok(());
        }
        let mut instance = existing.clone();
        instance.deployment = deployment.to_string();
        instance.variable_set_id = Some(set_id);
        self.store.put_instance(&instance)?;
        Ok(())
    }

    fn check_cancelled(&self) -> RolloutResult<()> {
        if self.cancel.is_cancelled() {
            return Err(RolloutError::Cancelled {
                task_id: self.logger.task_id(),
            });
        }
        if self.lock_lost.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(RolloutError::LockLost {
                task_id: self.logger.task_id(),
            });
        }
        Ok(())
    }
}

fn event_label(instance: &InstancePlan, canary: bool) -> String {
    let mut label = format!("{} ({})", instance.name(), instance.index);
    if canary {
        label.push_str(" (canary)");
    }
    label
}
