//! StateStore — redb-backed persistence for every director entity.
//!
//! Records are JSON-serialized into `&[u8]` value columns. Operations that
//! must appear atomic to concurrent jobs (lock steal, task state change,
//! active VM swap, disk orphaning, cascading deletes) run inside a single
//! write transaction. redb serializes write transactions, so a read-check-
//! write sequence inside one of them behaves like a row lock.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Wrap a redb error as `StateError::Storage`, tagged with the failed step.
macro_rules! storage {
    ($op:literal) => {
        |e| StateError::Storage {
            op: $op,
            message: e.to_string(),
        }
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn get_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(storage!("read"))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// All records whose key starts with `prefix`, in key order.
fn scan_json<T, R>(table: &R, prefix: &str) -> StateResult<Vec<(String, T)>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(storage!("read"))? {
        let (key, value) = entry.map_err(storage!("read"))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        results.push((key.to_string(), decode(value.value())?));
    }
    Ok(results)
}

fn scan_keys<R>(table: &R, prefix: &str) -> StateResult<Vec<String>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.range(prefix..).map_err(storage!("read"))? {
        let (key, _) = entry.map_err(storage!("read"))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

fn put_in<T: Serialize>(txn: &WriteTransaction, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
    let bytes = encode(value)?;
    let mut table = txn.open_table(def).map_err(storage!("open table"))?;
    table.insert(key, bytes.as_slice()).map_err(storage!("write"))?;
    Ok(())
}

fn get_in<T: DeserializeOwned>(txn: &WriteTransaction, def: JsonTable, key: &str) -> StateResult<Option<T>> {
    let table = txn.open_table(def).map_err(storage!("open table"))?;
    get_json(&table, key)
}

fn scan_in<T: DeserializeOwned>(
    txn: &WriteTransaction,
    def: JsonTable,
    prefix: &str,
) -> StateResult<Vec<(String, T)>> {
    let table = txn.open_table(def).map_err(storage!("open table"))?;
    scan_json(&table, prefix)
}

fn remove_in(txn: &WriteTransaction, def: JsonTable, key: &str) -> StateResult<bool> {
    let mut table = txn.open_table(def).map_err(storage!("open table"))?;
    let existed = table.remove(key).map_err(storage!("write"))?.is_some();
    Ok(existed)
}

/// Remove every record under `prefix`. Returns the number removed.
fn remove_prefix_in(txn: &WriteTransaction, def: JsonTable, prefix: &str) -> StateResult<usize> {
    let mut table = txn.open_table(def).map_err(storage!("open table"))?;
    let keys = scan_keys(&table, prefix)?;
    for key in &keys {
        table.remove(key.as_str()).map_err(storage!("write"))?;
    }
    Ok(keys.len())
}

fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(storage!("open table"))?;
    let current = table
        .get(sequence)
        .map_err(storage!("read"))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(sequence, next).map_err(storage!("write"))?;
    Ok(next)
}

fn padded(id: u64) -> String {
    format!("{id:020}")
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(storage!("open"))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(storage!("open"))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(storage!("transaction"))?;
        for def in [
            DEPLOYMENTS,
            VARIABLE_SETS,
            VARIABLES,
            INSTANCES,
            VMS,
            ORPHANED_VMS,
            PERSISTENT_DISKS,
            ORPHAN_DISKS,
            LINK_PROVIDERS,
            LINK_CONSUMERS,
            LINKS,
            LOCKS,
            TASKS,
            TASK_OUTPUT,
            CONFIGS,
            RELEASES,
            STEMCELLS,
        ] {
            txn.open_table(def).map_err(storage!("open table"))?;
        }
        txn.open_table(SEQUENCES).map_err(storage!("open table"))?;
        txn.commit().map_err(storage!("transaction"))?;
        Ok(())
    }

    /// Run `f` inside one write transaction, committing only if it succeeds.
    fn write<R, E>(&self, f: impl FnOnce(&WriteTransaction) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(storage!("transaction"))?;
        let result = f(&txn)?;
        txn.commit().map_err(storage!("transaction"))?;
        Ok(result)
    }

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(storage!("transaction"))?;
        let table = txn.open_table(def).map_err(storage!("open table"))?;
        get_json(&table, key)
    }

    fn scan<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(storage!("transaction"))?;
        let table = txn.open_table(def).map_err(storage!("open table"))?;
        Ok(scan_json(&table, prefix)?.into_iter().map(|(_, v)| v).collect())
    }

    fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        self.write(|txn| put_in(txn, def, key, value))
    }

    fn remove(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        self.write(|txn| remove_in(txn, def, key))
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put(DEPLOYMENTS, &deployment.name, deployment)?;
        debug!(deployment = %deployment.name, "deployment stored");
        Ok(())
    }

    pub fn get_deployment(&self, name: &str) -> StateResult<Option<Deployment>> {
        self.get(DEPLOYMENTS, name)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.scan(DEPLOYMENTS, "")
    }

    /// Delete a deployment and everything it owns: instances, their VMs and
    /// disks, variable sets, variables and link records. Orphan records are
    /// kept for audit. Returns true if the deployment existed.
    pub fn delete_deployment(&self, name: &str) -> StateResult<bool> {
        let existed = self.write(|txn| {
            let existed = remove_in(txn, DEPLOYMENTS, name)?;
            let owned = format!("{name}/");

            let instances: Vec<(String, Instance)> = scan_in(txn, INSTANCES, &owned)?;
            for (key, instance) in &instances {
                remove_prefix_in(txn, VMS, &format!("{}/", instance.uuid))?;
                remove_in(txn, INSTANCES, key)?;
            }

            let disks: Vec<(String, PersistentDisk)> = scan_in(txn, PERSISTENT_DISKS, "")?;
            for (key, disk) in disks.iter().filter(|(_, d)| d.deployment == name) {
                remove_in(txn, PERSISTENT_DISKS, key)?;
                debug!(cid = %disk.cid, "persistent disk row removed with deployment");
            }

            let sets: Vec<(String, VariableSet)> = scan_in(txn, VARIABLE_SETS, &owned)?;
            for (key, set) in &sets {
                remove_prefix_in(txn, VARIABLES, &format!("{}/", padded(set.id)))?;
                remove_in(txn, VARIABLE_SETS, key)?;
            }

            remove_prefix_in(txn, LINK_PROVIDERS, &owned)?;
            remove_prefix_in(txn, LINK_CONSUMERS, &owned)?;
            remove_prefix_in(txn, LINKS, &owned)?;
            Ok::<_, StateError>(existed)
        })?;
        debug!(deployment = %name, existed, "deployment deleted");
        Ok(existed)
    }

    // ── Variable sets ──────────────────────────────────────────────

    /// Start a new variable set; it becomes the deployment's current set.
    pub fn create_variable_set(&self, deployment: &str, writable: bool, now_ms: u64) -> StateResult<VariableSet> {
        self.write(|txn| {
            let id = next_id(txn, "variable_sets")?;
            let set = VariableSet {
                id,
                deployment: deployment.to_string(),
                created_at: now_ms,
                deployed_successfully: false,
                writable,
            };
            put_in(txn, VARIABLE_SETS, &variable_set_key(deployment, id), &set)?;
            Ok(set)
        })
    }

    pub fn get_variable_set(&self, deployment: &str, id: u64) -> StateResult<Option<VariableSet>> {
        self.get(VARIABLE_SETS, &variable_set_key(deployment, id))
    }

    /// Sets in creation order, oldest first.
    pub fn list_variable_sets(&self, deployment: &str) -> StateResult<Vec<VariableSet>> {
        self.scan(VARIABLE_SETS, &format!("{deployment}/"))
    }

    pub fn current_variable_set(&self, deployment: &str) -> StateResult<Option<VariableSet>> {
        Ok(self.list_variable_sets(deployment)?.pop())
    }

    pub fn update_variable_set(&self, set: &VariableSet) -> StateResult<()> {
        let key = variable_set_key(&set.deployment, set.id);
        self.write(|txn| {
            if get_in::<VariableSet>(txn, VARIABLE_SETS, &key)?.is_none() {
                return Err(StateError::NotFound(format!("variable set {}", set.id)));
            }
            put_in(txn, VARIABLE_SETS, &key, set)
        })
    }

    /// Delete a variable set along with its variables.
    pub fn delete_variable_set(&self, deployment: &str, id: u64) -> StateResult<bool> {
        self.write(|txn| {
            remove_prefix_in(txn, VARIABLES, &format!("{}/", padded(id)))?;
            remove_in(txn, VARIABLE_SETS, &variable_set_key(deployment, id))
        })
    }

    /// Insert a variable. `(set, name, provider_deployment)` is unique.
    pub fn put_variable(&self, variable: &Variable) -> StateResult<()> {
        let key = variable_key(variable.set_id, &variable.name, &variable.provider_deployment);
        self.write(|txn| {
            if get_in::<Variable>(txn, VARIABLES, &key)?.is_some() {
                return Err(StateError::Conflict(format!(
                    "variable '{}' already exists in set {}",
                    variable.name, variable.set_id
                )));
            }
            put_in(txn, VARIABLES, &key, variable)
        })
    }

    pub fn get_variable(&self, set_id: u64, name: &str, provider_deployment: &str) -> StateResult<Option<Variable>> {
        self.get(VARIABLES, &variable_key(set_id, name, provider_deployment))
    }

    pub fn list_variables(&self, set_id: u64) -> StateResult<Vec<Variable>> {
        self.scan(VARIABLES, &format!("{}/", padded(set_id)))
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put(INSTANCES, &instance.table_key(), instance)
    }

    pub fn get_instance(&self, deployment: &str, job: &str, uuid: &str) -> StateResult<Option<Instance>> {
        self.get(INSTANCES, &instance_key(deployment, job, uuid))
    }

    pub fn list_instances(&self, deployment: &str) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, &format!("{deployment}/"))
    }

    /// Instances of one group, ordered by index.
    pub fn list_instances_for_group(&self, deployment: &str, job: &str) -> StateResult<Vec<Instance>> {
        let mut instances: Vec<Instance> = self.scan(INSTANCES, &format!("{deployment}/{job}/"))?;
        instances.sort_by_key(|i| i.index);
        Ok(instances)
    }

    /// Delete an instance row and any VM rows still attached to it.
    pub fn delete_instance(&self, deployment: &str, job: &str, uuid: &str) -> StateResult<bool> {
        self.write(|txn| {
            remove_prefix_in(txn, VMS, &format!("{uuid}/"))?;
            remove_in(txn, INSTANCES, &instance_key(deployment, job, uuid))
        })
    }

    // ── VMs ────────────────────────────────────────────────────────

    /// Record a new VM, inactive. The id is allocated here.
    pub fn create_vm(&self, mut vm: Vm) -> StateResult<Vm> {
        self.write(|txn| {
            vm.id = next_id(txn, "vms")?;
            vm.active = false;
            put_in(txn, VMS, &vm.table_key(), &vm)?;
            Ok(vm)
        })
    }

    pub fn put_vm(&self, vm: &Vm) -> StateResult<()> {
        self.put(VMS, &vm.table_key(), vm)
    }

    pub fn list_vms(&self, instance_uuid: &str) -> StateResult<Vec<Vm>> {
        self.scan(VMS, &format!("{instance_uuid}/"))
    }

    pub fn active_vm(&self, instance_uuid: &str) -> StateResult<Option<Vm>> {
        Ok(self.list_vms(instance_uuid)?.into_iter().find(|vm| vm.active))
    }

    /// Make `vm_id` the instance's only active VM.
    pub fn activate_vm(&self, instance_uuid: &str, vm_id: u64) -> StateResult<Vm> {
        self.write(|txn| {
            let vms: Vec<(String, Vm)> = scan_in(txn, VMS, &format!("{instance_uuid}/"))?;
            let mut activated = None;
            for (key, mut vm) in vms {
                let active = vm.id == vm_id;
                if vm.active != active {
                    vm.active = active;
                    put_in(txn, VMS, &key, &vm)?;
                }
                if active {
                    activated = Some(vm);
                }
            }
            activated.ok_or_else(|| StateError::NotFound(format!("vm {vm_id} of instance {instance_uuid}")))
        })
    }

    pub fn delete_vm(&self, instance_uuid: &str, vm_id: u64) -> StateResult<bool> {
        self.remove(VMS, &format!("{instance_uuid}/{}", padded(vm_id)))
    }

    /// Detach a VM from its instance and keep it as an orphan record.
    pub fn orphan_vm(
        &self,
        vm: &Vm,
        deployment: &str,
        instance_name: &str,
        az: Option<&str>,
        now_ms: u64,
    ) -> StateResult<OrphanedVm> {
        self.write(|txn| {
            remove_in(txn, VMS, &vm.table_key())?;
            let orphan = OrphanedVm {
                id: next_id(txn, "orphaned_vms")?,
                cid: vm.cid.clone(),
                deployment: deployment.to_string(),
                instance_name: instance_name.to_string(),
                az: az.map(str::to_string),
                cpi: vm.cpi.clone(),
                stemcell_name: vm.stemcell_name.clone(),
                stemcell_version: vm.stemcell_version.clone(),
                orphaned_at: now_ms,
            };
            put_in(txn, ORPHANED_VMS, &padded(orphan.id), &orphan)?;
            Ok(orphan)
        })
    }

    pub fn list_orphaned_vms(&self) -> StateResult<Vec<OrphanedVm>> {
        self.scan(ORPHANED_VMS, "")
    }

    pub fn delete_orphaned_vm(&self, id: u64) -> StateResult<bool> {
        self.remove(ORPHANED_VMS, &padded(id))
    }

    // ── Disks ──────────────────────────────────────────────────────

    pub fn put_disk(&self, disk: &PersistentDisk) -> StateResult<()> {
        self.put(PERSISTENT_DISKS, &disk.cid, disk)
    }

    pub fn get_disk(&self, cid: &str) -> StateResult<Option<PersistentDisk>> {
        self.get(PERSISTENT_DISKS, cid)
    }

    pub fn list_disks_for_instance(&self, instance_uuid: &str) -> StateResult<Vec<PersistentDisk>> {
        let disks: Vec<PersistentDisk> = self.scan(PERSISTENT_DISKS, "")?;
        Ok(disks.into_iter().filter(|d| d.instance_uuid == instance_uuid).collect())
    }

    pub fn list_disks_for_deployment(&self, deployment: &str) -> StateResult<Vec<PersistentDisk>> {
        let disks: Vec<PersistentDisk> = self.scan(PERSISTENT_DISKS, "")?;
        Ok(disks.into_iter().filter(|d| d.deployment == deployment).collect())
    }

    pub fn delete_disk(&self, cid: &str) -> StateResult<bool> {
        self.remove(PERSISTENT_DISKS, cid)
    }

    /// Move an attached disk to the orphan table, keeping its history.
    pub fn orphan_disk(
        &self,
        cid: &str,
        instance_name: &str,
        az: Option<&str>,
        now_ms: u64,
    ) -> StateResult<OrphanDisk> {
        self.write(|txn| {
            let disk: PersistentDisk = get_in(txn, PERSISTENT_DISKS, cid)?
                .ok_or_else(|| StateError::NotFound(format!("disk {cid}")))?;
            remove_in(txn, PERSISTENT_DISKS, cid)?;
            let orphan = OrphanDisk {
                cid: disk.cid,
                deployment: disk.deployment,
                instance_name: instance_name.to_string(),
                az: az.map(str::to_string),
                size: disk.size,
                cpi: disk.cpi,
                cloud_properties: disk.cloud_properties,
                created_at: now_ms,
            };
            put_in(txn, ORPHAN_DISKS, &orphan.cid, &orphan)?;
            Ok(orphan)
        })
    }

    pub fn get_orphan_disk(&self, cid: &str) -> StateResult<Option<OrphanDisk>> {
        self.get(ORPHAN_DISKS, cid)
    }

    pub fn list_orphan_disks(&self) -> StateResult<Vec<OrphanDisk>> {
        self.scan(ORPHAN_DISKS, "")
    }

    pub fn delete_orphan_disk(&self, cid: &str) -> StateResult<bool> {
        self.remove(ORPHAN_DISKS, cid)
    }

    // ── Links ──────────────────────────────────────────────────────

    /// Replace every provider owned by `deployment`.
    pub fn replace_link_providers(&self, deployment: &str, providers: &[LinkProvider]) -> StateResult<()> {
        self.write(|txn| {
            remove_prefix_in(txn, LINK_PROVIDERS, &format!("{deployment}/"))?;
            for provider in providers {
                put_in(txn, LINK_PROVIDERS, &provider.table_key(), provider)?;
            }
            Ok(())
        })
    }

    pub fn list_link_providers(&self, deployment: Option<&str>) -> StateResult<Vec<LinkProvider>> {
        let prefix = deployment.map(|d| format!("{d}/")).unwrap_or_default();
        self.scan(LINK_PROVIDERS, &prefix)
    }

    /// Replace every consumer owned by `deployment`.
    pub fn replace_link_consumers(&self, deployment: &str, consumers: &[LinkConsumer]) -> StateResult<()> {
        self.write(|txn| {
            remove_prefix_in(txn, LINK_CONSUMERS, &format!("{deployment}/"))?;
            for consumer in consumers {
                put_in(txn, LINK_CONSUMERS, &consumer.table_key(), consumer)?;
            }
            Ok(())
        })
    }

    pub fn list_link_consumers(&self, deployment: &str) -> StateResult<Vec<LinkConsumer>> {
        self.scan(LINK_CONSUMERS, &format!("{deployment}/"))
    }

    pub fn put_link(&self, link: &Link) -> StateResult<()> {
        self.put(LINKS, &link.table_key(), link)
    }

    pub fn get_link(&self, consumer: &str, source: &str) -> StateResult<Option<Link>> {
        self.get(LINKS, &format!("{consumer}#{source}"))
    }

    pub fn list_links_for_consumer(&self, consumer: &str) -> StateResult<Vec<Link>> {
        self.scan(LINKS, &format!("{consumer}#"))
    }

    pub fn list_links(&self, deployment: &str) -> StateResult<Vec<Link>> {
        self.scan(LINKS, &format!("{deployment}/"))
    }

    /// Drop cached links for a consumer that now resolves elsewhere.
    pub fn delete_links_for_consumer(&self, consumer: &str) -> StateResult<usize> {
        self.write(|txn| remove_prefix_in(txn, LINKS, &format!("{consumer}#")))
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Take `name` if it is free or its lease has run out. Returns `None`
    /// while another holder's lease is still live.
    pub fn try_acquire_lock(
        &self,
        name: &str,
        uid: &str,
        task_id: Option<u64>,
        lease_ms: u64,
        now_ms: u64,
    ) -> StateResult<Option<LockRecord>> {
        self.write(|txn| {
            if let Some(existing) = get_in::<LockRecord>(txn, LOCKS, name)? {
                if !existing.is_expired(now_ms) {
                    return Ok(None);
                }
                debug!(lock = %name, previous = %existing.uid, "stealing expired lock");
            }
            let record = LockRecord {
                name: name.to_string(),
                uid: uid.to_string(),
                expired_at: now_ms.saturating_add(lease_ms),
                task_id,
            };
            put_in(txn, LOCKS, name, &record)?;
            Ok(Some(record))
        })
    }

    /// Extend the lease if `uid` still holds the lock.
    pub fn renew_lock(&self, name: &str, uid: &str, lease_ms: u64, now_ms: u64) -> StateResult<Option<LockRecord>> {
        self.write(|txn| match get_in::<LockRecord>(txn, LOCKS, name)? {
            Some(mut record) if record.uid == uid => {
                record.expired_at = now_ms.saturating_add(lease_ms);
                put_in(txn, LOCKS, name, &record)?;
                Ok(Some(record))
            }
            _ => Ok(None),
        })
    }

    /// Release the lock if `uid` holds it. Returns false if someone else
    /// owns the row (or nobody does).
    pub fn release_lock(&self, name: &str, uid: &str) -> StateResult<bool> {
        self.write(|txn| match get_in::<LockRecord>(txn, LOCKS, name)? {
            Some(record) if record.uid == uid => remove_in(txn, LOCKS, name),
            _ => Ok(false),
        })
    }

    pub fn get_lock(&self, name: &str) -> StateResult<Option<LockRecord>> {
        self.get(LOCKS, name)
    }

    pub fn list_locks(&self) -> StateResult<Vec<LockRecord>> {
        self.scan(LOCKS, "")
    }

    /// Remove every lock whose lease has run out. Returns the removed names.
    pub fn delete_expired_locks(&self, now_ms: u64) -> StateResult<Vec<String>> {
        self.write(|txn| {
            let locks: Vec<(String, LockRecord)> = scan_in(txn, LOCKS, "")?;
            let mut removed = Vec::new();
            for (key, lock) in locks {
                if lock.is_expired(now_ms) {
                    remove_in(txn, LOCKS, &key)?;
                    removed.push(key);
                }
            }
            Ok(removed)
        })
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Persist a new task; its id is allocated here.
    pub fn create_task(&self, mut task: Task) -> StateResult<Task> {
        self.write(|txn| {
            task.id = next_id(txn, "tasks")?;
            put_in(txn, TASKS, &padded(task.id), &task)?;
            Ok(task)
        })
    }

    pub fn get_task(&self, id: u64) -> StateResult<Option<Task>> {
        self.get(TASKS, &padded(id))
    }

    /// All tasks, oldest first.
    pub fn list_tasks(&self) -> StateResult<Vec<Task>> {
        self.scan(TASKS, "")
    }

    /// Read-modify-write a task atomically. If `f` fails nothing is written.
    pub fn update_task<E, F>(&self, id: u64, f: F) -> Result<Task, E>
    where
        E: From<StateError>,
        F: FnOnce(&mut Task) -> Result<(), E>,
    {
        let key = padded(id);
        self.write(|txn| {
            let mut task: Task = get_in(txn, TASKS, &key)?
                .ok_or_else(|| StateError::NotFound(format!("task {id}")))?;
            f(&mut task)?;
            put_in(txn, TASKS, &key, &task)?;
            Ok(task)
        })
    }

    /// Delete a task and all of its output.
    pub fn delete_task(&self, id: u64) -> StateResult<bool> {
        self.write(|txn| {
            remove_prefix_in(txn, TASK_OUTPUT, &format!("{}/", padded(id)))?;
            let mut seqs = txn.open_table(SEQUENCES).map_err(storage!("open table"))?;
            for stream in OutputStream::ALL {
                seqs.remove(output_sequence(id, stream).as_str())
                    .map_err(storage!("write"))?;
            }
            drop(seqs);
            remove_in(txn, TASKS, &padded(id))
        })
    }

    /// Append a chunk to one of a task's output streams.
    pub fn append_task_output(&self, id: u64, stream: OutputStream, bytes: &[u8]) -> StateResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.write(|txn| {
            let chunk = next_id(txn, &output_sequence(id, stream))?;
            let key = format!("{}/{}/{:010}", padded(id), stream.as_str(), chunk);
            let mut table = txn.open_table(TASK_OUTPUT).map_err(storage!("open table"))?;
            table.insert(key.as_str(), bytes).map_err(storage!("write"))?;
            Ok(())
        })
    }

    /// The full contents of a task output stream.
    pub fn read_task_output(&self, id: u64, stream: OutputStream) -> StateResult<Vec<u8>> {
        let prefix = format!("{}/{}/", padded(id), stream.as_str());
        let txn = self.db.begin_read().map_err(storage!("transaction"))?;
        let table = txn.open_table(TASK_OUTPUT).map_err(storage!("open table"))?;
        let mut out = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(storage!("read"))? {
            let (key, value) = entry.map_err(storage!("read"))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            out.extend_from_slice(value.value());
        }
        Ok(out)
    }

    // ── Configs ────────────────────────────────────────────────────

    /// Store a new config version unless its content equals the latest for
    /// `(kind, name)`. Returns the latest record and whether it was written.
    pub fn create_config(
        &self,
        kind: &str,
        name: &str,
        content: &str,
        team: Option<&str>,
        now_ms: u64,
    ) -> StateResult<(ConfigRecord, bool)> {
        self.write(|txn| {
            let existing: Vec<(String, ConfigRecord)> = scan_in(txn, CONFIGS, &format!("{kind}/{name}/"))?;
            if let Some((_, latest)) = existing.into_iter().last() {
                if latest.content == content {
                    return Ok((latest, false));
                }
            }
            let record = ConfigRecord {
                id: next_id(txn, "configs")?,
                kind: kind.to_string(),
                name: name.to_string(),
                content: content.to_string(),
                team: team.map(str::to_string),
                created_at: now_ms,
            };
            put_in(txn, CONFIGS, &record.table_key(), &record)?;
            Ok((record, true))
        })
    }

    pub fn latest_config(&self, kind: &str, name: &str) -> StateResult<Option<ConfigRecord>> {
        Ok(self.scan::<ConfigRecord>(CONFIGS, &format!("{kind}/{name}/"))?.pop())
    }

    /// Latest version of every named config of `kind`, ordered by name.
    pub fn latest_configs(&self, kind: &str) -> StateResult<Vec<ConfigRecord>> {
        let all: Vec<ConfigRecord> = self.scan(CONFIGS, &format!("{kind}/"))?;
        let mut latest: Vec<ConfigRecord> = Vec::new();
        for record in all {
            match latest.last_mut() {
                Some(last) if last.name == record.name => *last = record,
                _ => latest.push(record),
            }
        }
        Ok(latest)
    }

    /// Every stored config, grouped by kind and name, oldest first within a group.
    pub fn list_configs(&self) -> StateResult<Vec<ConfigRecord>> {
        self.scan(CONFIGS, "")
    }

    pub fn get_config(&self, id: u64) -> StateResult<Option<ConfigRecord>> {
        Ok(self.list_configs()?.into_iter().find(|c| c.id == id))
    }

    // ── Releases & stemcells ───────────────────────────────────────

    pub fn put_release(&self, release: &ReleaseVersion) -> StateResult<()> {
        self.put(RELEASES, &release.table_key(), release)
    }

    pub fn get_release(&self, name: &str, version: &str) -> StateResult<Option<ReleaseVersion>> {
        self.get(RELEASES, &format!("{name}/{version}"))
    }

    pub fn list_release_versions(&self, name: &str) -> StateResult<Vec<ReleaseVersion>> {
        self.scan(RELEASES, &format!("{name}/"))
    }

    pub fn list_releases(&self) -> StateResult<Vec<ReleaseVersion>> {
        self.scan(RELEASES, "")
    }

    pub fn put_stemcell(&self, stemcell: &Stemcell) -> StateResult<()> {
        self.put(STEMCELLS, &stemcell.table_key(), stemcell)
    }

    pub fn get_stemcell(&self, name: &str, version: &str) -> StateResult<Option<Stemcell>> {
        self.get(STEMCELLS, &format!("{name}/{version}"))
    }

    pub fn list_stemcells(&self) -> StateResult<Vec<Stemcell>> {
        self.scan(STEMCELLS, "")
    }
}

fn variable_set_key(deployment: &str, id: u64) -> String {
    format!("{deployment}/{}", padded(id))
}

fn variable_key(set_id: u64, name: &str, provider_deployment: &str) -> String {
    format!("{}/{name}/{provider_deployment}", padded(set_id))
}

fn output_sequence(id: u64, stream: OutputStream) -> String {
    format!("output/{id}/{}", stream.as_str())
}
