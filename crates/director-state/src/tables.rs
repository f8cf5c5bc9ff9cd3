//! redb table definitions for the director state store.
//!
//! Keys are `&str`, values JSON-serialized records. Numeric ids inside keys
//! are zero-padded to 20 digits so lexical order matches allocation order.

use redb::TableDefinition;

/// Deployments keyed by `{name}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Variable sets keyed by `{deployment}/{set_id}`.
pub const VARIABLE_SETS: TableDefinition<&str, &[u8]> = TableDefinition::new("variable_sets");

/// Variables keyed by `{set_id}/{name}/{provider_deployment}`.
pub const VARIABLES: TableDefinition<&str, &[u8]> = TableDefinition::new("variables");

/// Instances keyed by `{deployment}/{group}/{uuid}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// VMs keyed by `{instance_uuid}/{vm_id}`.
pub const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

/// Orphaned VMs keyed by `{id}`.
pub const ORPHANED_VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("orphaned_vms");

/// Persistent disks keyed by `{cid}`.
pub const PERSISTENT_DISKS: TableDefinition<&str, &[u8]> = TableDefinition::new("persistent_disks");

/// Orphan disks keyed by `{cid}`.
pub const ORPHAN_DISKS: TableDefinition<&str, &[u8]> = TableDefinition::new("orphan_disks");

/// Link providers keyed by `{deployment}/{group}/{job}/{original_name}`.
pub const LINK_PROVIDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("link_providers");

/// Link consumers keyed by `{deployment}/{group}/{job}/{original_name}`.
pub const LINK_CONSUMERS: TableDefinition<&str, &[u8]> = TableDefinition::new("link_consumers");

/// Resolved links keyed by `{consumer_key}#{source}`.
pub const LINKS: TableDefinition<&str, &[u8]> = TableDefinition::new("links");

/// Locks keyed by `{name}`.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Tasks keyed by `{id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Task output chunks keyed by `{task_id}/{stream}/{chunk}`.
pub const TASK_OUTPUT: TableDefinition<&str, &[u8]> = TableDefinition::new("task_output");

/// Configs keyed by `{kind}/{name}/{id}`.
pub const CONFIGS: TableDefinition<&str, &[u8]> = TableDefinition::new("configs");

/// Release versions keyed by `{name}/{version}`.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// Stemcells keyed by `{name}/{version}`.
pub const STEMCELLS: TableDefinition<&str, &[u8]> = TableDefinition::new("stemcells");

/// Monotonic counters keyed by sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
