//! Diff a merged manifest against persisted instances.
//!
//! Planning is read-only: it validates every reference, places instances
//! into AZs and flags what changed for existing instances. It never calls
//! the CPI and never writes to the store.

use std::collections::BTreeSet;

use director_core::manifest::{CountOrPercent, DeploymentManifest, InstanceGroupSpec, UpdateBlock, WatchTime};
use director_core::{codes, CloudConfig, DirectorConfig, DirectorError, InstanceState, UpdateStrategy};
use director_state::{Instance, ReleaseVersion, StateStore};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{PlanError, PlanResult};
use crate::merge::MergedManifest;
use crate::placement::place;
use crate::plan::{
    Action, Change, DeploymentPlan, InstanceGroupPlan, InstancePlan, JobRef, UpdateSettings, VmRequirements,
};
use crate::versions::{find_release, find_stemcell};

const DEFAULT_WATCH_TIME: WatchTime = WatchTime {
    min_ms: 1_000,
    max_ms: 30_000,
};

/// Per-deploy overrides from the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanOptions {
    /// Recreate every VM even when nothing changed.
    pub recreate: bool,
    pub canaries: Option<CountOrPercent>,
    pub max_in_flight: Option<CountOrPercent>,
}

#[derive(Clone)]
pub struct Planner {
    store: StateStore,
    default_strategy: UpdateStrategy,
}

impl Planner {
    pub fn new(store: StateStore, config: &DirectorConfig) -> Self {
        let default_strategy = if config.enable_create_swap_delete {
            UpdateStrategy::CreateSwapDelete
        } else {
            UpdateStrategy::DeleteCreate
        };
        Self {
            store,
            default_strategy,
        }
    }

    pub fn with_default_strategy(store: StateStore, default_strategy: UpdateStrategy) -> Self {
        Self {
            store,
            default_strategy,
        }
    }

    /// Plan a deploy. Fails before anything is mutated when the manifest
    /// references something that does not exist.
    pub fn plan(&self, merged: &MergedManifest, options: &PlanOptions) -> PlanResult<(DeploymentPlan, Vec<ReleaseVersion>)> {
        let manifest = &merged.manifest;
        let releases = self.releases(manifest)?;

        let mut groups = Vec::with_capacity(manifest.instance_groups.len());
        let mut deletions = Vec::new();
        for group in &manifest.instance_groups {
            let (planned, obsolete) = self.plan_group(manifest, &merged.cloud, &releases, group, options)?;
            groups.push(planned);
            deletions.extend(obsolete);
        }

        let wanted: BTreeSet<&str> = manifest.instance_groups.iter().map(|g| g.name.as_str()).collect();
        for instance in self.store.list_instances(&manifest.name)? {
            if !wanted.contains(instance.job.as_str()) {
                deletions.push(deletion(instance));
            }
        }

        let plan = DeploymentPlan {
            deployment: manifest.name.clone(),
            groups,
            deletions,
            warnings: merged.warnings.clone(),
        };
        info!(
            deployment = %plan.deployment,
            creates = plan.count(Action::Create),
            updates = plan.count(Action::Update),
            deletes = plan.count(Action::Delete),
            "deployment planned"
        );
        Ok((plan, releases))
    }

    fn releases(&self, manifest: &DeploymentManifest) -> PlanResult<Vec<ReleaseVersion>> {
        let mut releases = Vec::with_capacity(manifest.releases.len());
        for reference in &manifest.releases {
            reference.validate()?;
            releases.push(find_release(&self.store, reference)?);
        }
        for group in &manifest.instance_groups {
            for job in &group.jobs {
                let release = releases.iter().find(|r| r.name == job.release).ok_or_else(|| {
                    DirectorError::validation(
                        codes::RELEASE_NOT_FOUND,
                        format!(
                            "Job '{}' references release '{}' which is not listed in the releases section",
                            job.name, job.release
                        ),
                    )
                })?;
                if release.job(&job.name).is_none() {
                    return Err(PlanError::JobNotInRelease {
                        job: job.name.clone(),
                        release: format!("{}/{}", release.name, release.version),
                    });
                }
            }
        }
        Ok(releases)
    }

    fn plan_group(
        &self,
        manifest: &DeploymentManifest,
        cloud: &CloudConfig,
        releases: &[ReleaseVersion],
        group: &InstanceGroupSpec,
        options: &PlanOptions,
    ) -> PlanResult<(InstanceGroupPlan, Vec<InstancePlan>)> {
        for az in &group.azs {
            if cloud.az(az).is_none() {
                return Err(PlanError::UnknownAz {
                    group: group.name.clone(),
                    az: az.clone(),
                });
            }
        }
        let vm = self.vm_requirements(manifest, cloud, group)?;
        let update = self.update_settings(manifest, group, options)?;
        let jobs = group
            .jobs
            .iter()
            .map(|job| JobRef {
                name: job.name.clone(),
                release: job.release.clone(),
                version: releases
                    .iter()
                    .find(|r| r.name == job.release)
                    .map(|r| r.version.clone())
                    .unwrap_or_default(),
            })
            .collect();

        let existing = self.store.list_instances_for_group(&manifest.name, &group.name)?;
        let placed = place(&group.azs, group.instances, existing);

        let bootstrap_index = placed
            .placements
            .iter()
            .find(|p| p.existing.as_ref().is_some_and(|i| i.bootstrap))
            .or_else(|| placed.placements.first())
            .map(|p| p.index);

        let mut instances = Vec::with_capacity(placed.placements.len());
        for placement in placed.placements {
            let bootstrap = Some(placement.index) == bootstrap_index;
            let plan = match placement.existing {
                Some(existing) => {
                    let changes = self.infrastructure_changes(&existing, &vm, bootstrap, options)?;
                    let mut plan = InstancePlan {
                        action: Action::Keep,
                        group: group.name.clone(),
                        uuid: existing.uuid.clone(),
                        index: placement.index,
                        az: placement.az,
                        bootstrap,
                        state: existing.state,
                        existing: Some(existing),
                        changes,
                        spec: Value::Null,
                    };
                    plan.settle();
                    plan
                }
                None => InstancePlan {
                    action: Action::Create,
                    group: group.name.clone(),
                    uuid: uuid::Uuid::new_v4().to_string(),
                    index: placement.index,
                    az: placement.az,
                    bootstrap,
                    state: InstanceState::Started,
                    existing: None,
                    changes: BTreeSet::new(),
                    spec: Value::Null,
                },
            };
            debug!(
                instance = %plan.name(),
                index = plan.index,
                action = ?plan.action,
                changes = ?plan.changes,
                "instance planned"
            );
            instances.push(plan);
        }

        let obsolete = placed.obsolete.into_iter().map(deletion).collect();
        Ok((
            InstanceGroupPlan {
                name: group.name.clone(),
                update,
                vm,
                jobs,
                instances,
            },
            obsolete,
        ))
    }

    fn vm_requirements(
        &self,
        manifest: &DeploymentManifest,
        cloud: &CloudConfig,
        group: &InstanceGroupSpec,
    ) -> PlanResult<VmRequirements> {
        let stemcell_ref = match &group.stemcell {
            Some(alias) => manifest.stemcells.iter().find(|s| &s.alias == alias),
            None if manifest.stemcells.len() == 1 => manifest.stemcells.first(),
            None => None,
        }
        .ok_or_else(|| PlanError::UnknownStemcell {
            group: group.name.clone(),
            alias: group.stemcell.clone().unwrap_or_default(),
        })?;
        let stemcell = find_stemcell(&self.store, stemcell_ref)?;

        let vm_type_name = group.vm_type.clone().ok_or_else(|| PlanError::MissingVmType {
            group: group.name.clone(),
        })?;
        let vm_type = cloud.vm_type(&vm_type_name).ok_or_else(|| PlanError::UnknownVmType {
            group: group.name.clone(),
            vm_type: vm_type_name.clone(),
        })?;
        let mut cloud_properties = vm_type.cloud_properties.clone();
        for name in &group.vm_extensions {
            let extension = cloud.vm_extension(name).ok_or_else(|| PlanError::UnknownVmType {
                group: group.name.clone(),
                vm_type: name.clone(),
            })?;
            for (key, value) in &extension.cloud_properties {
                cloud_properties.insert(key.clone(), value.clone());
            }
        }

        if group.networks.is_empty() {
            return Err(PlanError::MissingNetworks {
                group: group.name.clone(),
            });
        }
        let mut networks = Map::new();
        for network in &group.networks {
            let spec = cloud.network(&network.name).ok_or_else(|| PlanError::UnknownNetwork {
                group: group.name.clone(),
                network: network.name.clone(),
            })?;
            let default: Vec<String> = if network.default.is_empty() && group.networks.len() == 1 {
                vec!["dns".to_string(), "gateway".to_string()]
            } else {
                network.default.clone()
            };
            networks.insert(
                network.name.clone(),
                json!({
                    "type": spec.kind,
                    "default": default,
                    "cloud_properties": spec.cloud_properties,
                }),
            );
        }

        let (disk_size, disk_cloud_properties) = match (&group.persistent_disk_type, group.persistent_disk) {
            (Some(name), _) => {
                let disk = cloud.disk_type(name).ok_or_else(|| PlanError::UnknownDiskType {
                    group: group.name.clone(),
                    disk_type: name.clone(),
                })?;
                (disk.disk_size, Value::Object(disk.cloud_properties.clone()))
            }
            (None, Some(size)) => (size, Value::Object(Map::new())),
            (None, None) => (0, Value::Object(Map::new())),
        };

        Ok(VmRequirements {
            stemcell_name: stemcell.name,
            stemcell_version: stemcell.version,
            stemcell_cid: stemcell.cid,
            vm_type: vm_type_name,
            cloud_properties: Value::Object(cloud_properties),
            networks: Value::Object(networks),
            env: Value::Object(group.env.clone()),
            disk_size,
            disk_cloud_properties,
        })
    }

    fn update_settings(
        &self,
        manifest: &DeploymentManifest,
        group: &InstanceGroupSpec,
        options: &PlanOptions,
    ) -> PlanResult<UpdateSettings> {
        let block = match (&group.update, &manifest.update) {
            (Some(own), Some(parent)) => own.inherit(parent),
            (Some(own), None) => own.clone(),
            (None, Some(parent)) => parent.clone(),
            (None, None) => UpdateBlock::default(),
        };
        let strategy = match &block.strategy {
            Some(value) => UpdateStrategy::parse(value).ok_or_else(|| PlanError::InvalidStrategy {
                group: group.name.clone(),
                value: value.clone(),
            })?,
            None => self.default_strategy,
        };
        let total = group.instances;
        let canaries = options
            .canaries
            .or(block.canaries)
            .map_or(1, |c| c.resolve(total))
            .min(total);
        let max_in_flight = options
            .max_in_flight
            .or(block.max_in_flight)
            .map_or(1, |c| c.resolve(total))
            .max(1);
        Ok(UpdateSettings {
            canaries,
            max_in_flight,
            canary_watch_time: block.canary_watch_time.unwrap_or(DEFAULT_WATCH_TIME),
            update_watch_time: block.update_watch_time.unwrap_or(DEFAULT_WATCH_TIME),
            serial: block.serial.unwrap_or(true),
            strategy,
        })
    }

    /// Changes visible before variables and links resolve. Configuration
    /// and env changes are decided when specs are rendered.
    fn infrastructure_changes(
        &self,
        existing: &Instance,
        vm: &VmRequirements,
        bootstrap: bool,
        options: &PlanOptions,
    ) -> PlanResult<BTreeSet<Change>> {
        let applied = &existing.spec;
        let mut changes = BTreeSet::new();
        if applied["stemcell"] != json!({"name": vm.stemcell_name, "version": vm.stemcell_version}) {
            changes.insert(Change::Stemcell);
        }
        if applied["networks"] != vm.networks {
            changes.insert(Change::Network);
        }
        if applied["vm_type"] != json!({"name": vm.vm_type, "cloud_properties": vm.cloud_properties}) {
            changes.insert(Change::VmType);
        }
        if applied["persistent_disk"] != json!(vm.disk_size)
            || applied["persistent_disk_cloud_properties"] != vm.disk_cloud_properties
        {
            changes.insert(Change::PersistentDisk);
        }
        if applied["bootstrap"] != json!(bootstrap) {
            changes.insert(Change::Configuration);
        }
        if options.recreate {
            changes.insert(Change::Recreate);
        }
        if existing.state != InstanceState::Detached && self.store.active_vm(&existing.uuid)?.is_none() {
            changes.insert(Change::MissingVm);
        }
        Ok(changes)
    }
}

fn deletion(instance: Instance) -> InstancePlan {
    InstancePlan {
        action: Action::Delete,
        group: instance.job.clone(),
        uuid: instance.uuid.clone(),
        index: instance.index,
        az: instance.az.clone(),
        bootstrap: instance.bootstrap,
        state: instance.state,
        existing: Some(instance),
        changes: BTreeSet::new(),
        spec: Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge;
    use crate::spec::render_specs;
    use director_resolve::ResolvedLinks;
    use director_state::{ReleaseJob, Stemcell, Vm};

    const CLOUD: &str = r#"
azs: [{name: z1}, {name: z2}]
networks: [{name: private, subnets: [{range: 10.0.0.0/24, azs: [z1, z2]}]}]
vm_types: [{name: small, cloud_properties: {cpu: 2}}]
disk_types: [{name: fast, disk_size: 4096}]
"#;

    fn manifest(instances: u32, extra: &str) -> String {
        format!(
            r#"
name: simple
releases: [{{name: bosh-release, version: 0.1-dev}}]
stemcells: [{{alias: default, os: ubuntu-jammy, version: latest}}]
update: {{canaries: 2, max_in_flight: 1}}
instance_groups:
- name: dea
  instances: {instances}
  azs: [z1, z2]
  vm_type: small
  stemcell: default
  networks: [{{name: private}}]
  jobs: [{{name: dea_next, release: bosh-release}}]
{extra}"#
        )
    }

    fn store() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_release(&ReleaseVersion {
                name: "bosh-release".into(),
                version: "0.1-dev".into(),
                jobs: vec![
                    ReleaseJob {
                        name: "dea_next".into(),
                        ..Default::default()
                    },
                    ReleaseJob {
                        name: "router".into(),
                        ..Default::default()
                    },
                ],
                uploaded_at: 0,
            })
            .unwrap();
        store
            .put_stemcell(&Stemcell {
                name: "bosh-dummy".into(),
                os: "ubuntu-jammy".into(),
                version: "1.100".into(),
                cid: "sc-1".into(),
                cpi: String::new(),
                uploaded_at: 0,
            })
            .unwrap();
        store
    }

    fn plan_for(store: &StateStore, yaml: &str, options: &PlanOptions) -> PlanResult<DeploymentPlan> {
        let (m, _) = DeploymentManifest::from_yaml(yaml).unwrap();
        let cloud = CloudConfig::from_yaml(CLOUD).unwrap();
        let merged = merge(&m, vec![cloud], vec![])?;
        let planner = Planner::with_default_strategy(store.clone(), UpdateStrategy::DeleteCreate);
        let (mut plan, releases) = planner.plan(&merged, options)?;
        render_specs(&mut plan, &merged.manifest, &releases, &ResolvedLinks::default(), |v| Ok(v.clone()))?;
        Ok(plan)
    }

    /// Persist a plan as if the rollout had applied it.
    fn converge(store: &StateStore, plan: &DeploymentPlan) {
        for group in &plan.groups {
            for i in &group.instances {
                store
                    .put_instance(&Instance {
                        uuid: i.uuid.clone(),
                        deployment: plan.deployment.clone(),
                        job: group.name.clone(),
                        index: i.index,
                        state: i.state,
                        az: i.az.clone(),
                        spec: i.spec.clone(),
                        variable_set_id: None,
                        bootstrap: i.bootstrap,
                        resurrection_paused: false,
                        ignore: false,
                        created_at: 0,
                    })
                    .unwrap();
                if store.active_vm(&i.uuid).unwrap().is_none() {
                    let vm = store
                        .create_vm(Vm {
                            id: 0,
                            instance_uuid: i.uuid.clone(),
                            agent_id: format!("agent-{}", i.index),
                            cid: format!("vm-{}", i.index),
                            active: false,
                            cpi: String::new(),
                            stemcell_name: group.vm.stemcell_name.clone(),
                            stemcell_version: group.vm.stemcell_version.clone(),
                            network_spec: Value::Null,
                            env: Value::Null,
                            cloud_properties: Value::Null,
                            created_at: 0,
                        })
                        .unwrap();
                    store.activate_vm(&i.uuid, vm.id).unwrap();
                }
            }
        }
    }

    #[test]
    fn scaling_from_three_to_five_creates_two() {
        let store = store();
        let first = plan_for(&store, &manifest(3, ""), &PlanOptions::default()).unwrap();
        assert_eq!(first.count(Action::Create), 3);
        converge(&store, &first);

        let plan = plan_for(&store, &manifest(5, ""), &PlanOptions::default()).unwrap();
        assert_eq!(plan.count(Action::Create), 2);
        assert_eq!(plan.count(Action::Delete), 0);
        assert_eq!(plan.count(Action::Update), 0);
        assert_eq!(plan.count(Action::Keep), 3);
        let group = plan.group("dea").unwrap();
        assert_eq!(group.vm.stemcell_version, "1.100");
        assert_eq!(group.instances.iter().filter(|i| i.bootstrap).count(), 1);
    }

    #[test]
    fn unchanged_manifest_has_no_work_and_property_edits_update() {
        let store = store();
        let plan = plan_for(&store, &manifest(2, ""), &PlanOptions::default()).unwrap();
        converge(&store, &plan);
        assert!(!plan_for(&store, &manifest(2, ""), &PlanOptions::default()).unwrap().has_work());

        let edited = manifest(2, "  properties: {port: 8080}\n");
        let plan = plan_for(&store, &edited, &PlanOptions::default()).unwrap();
        let group = plan.group("dea").unwrap();
        assert!(group.instances.iter().all(|i| i.action == Action::Update));
        assert!(group.instances.iter().all(|i| i.changes.contains(&Change::Configuration)));
        assert!(group.instances.iter().all(|i| !i.needs_new_vm()));

        let recreate = PlanOptions {
            recreate: true,
            ..Default::default()
        };
        let plan = plan_for(&store, &manifest(2, ""), &recreate).unwrap();
        assert!(plan.group("dea").unwrap().instances.iter().all(InstancePlan::needs_new_vm));
    }

    #[test]
    fn dropped_groups_and_shrinks_are_deleted() {
        let store = store();
        let plan = plan_for(&store, &manifest(3, ""), &PlanOptions::default()).unwrap();
        converge(&store, &plan);

        let renamed = manifest(1, "").replace("name: dea\n", "name: router_group\n").replace("dea_next", "router");
        let plan = plan_for(&store, &renamed, &PlanOptions::default()).unwrap();
        assert_eq!(plan.deletions.len(), 3);
        assert!(plan.deletions.iter().all(|d| d.group == "dea"));
        assert_eq!(plan.count(Action::Create), 1);

        let shrunk = plan_for(&store, &manifest(1, ""), &PlanOptions::default()).unwrap();
        assert_eq!(shrunk.count(Action::Delete), 2);
    }

    #[test]
    fn references_must_exist() {
        let store = store();
        let cases = [
            (manifest(1, "").replace("0.1-dev", "9"), "ReleaseNotFound"),
            (manifest(1, "").replace("ubuntu-jammy", "windows"), "StemcellNotFound"),
            (manifest(1, "").replace("[z1, z2]", "[z9]"), "UnknownAz"),
            (manifest(1, "").replace("name: private", "name: public"), "UnknownNetwork"),
            (manifest(1, "").replace("vm_type: small", "vm_type: huge"), "UnknownVmType"),
            (manifest(1, "  persistent_disk_type: slow\n"), "UnknownDiskType"),
            (manifest(1, "").replace("dea_next", "nope"), "JobNotInRelease"),
        ];
        for (yaml, expected) in cases {
            let err = plan_for(&store, &yaml, &PlanOptions::default()).unwrap_err();
            assert!(format!("{err:?}").starts_with(expected), "{expected}: got {err:?}");
        }
        assert!(store.list_instances("simple").unwrap().is_empty());
    }

    #[test]
    fn update_settings_resolve_percentages_and_strategy_aliases() {
        let store = store();
        let yaml = manifest(5, "  update: {canaries: 40%, max_in_flight: 60%, strategy: hot-swap}\n");
        let plan = plan_for(&store, &yaml, &PlanOptions::default()).unwrap();
        let update = &plan.group("dea").unwrap().update;
        assert_eq!(update.canaries, 2);
        assert_eq!(update.max_in_flight, 3);
        assert_eq!(update.strategy, UpdateStrategy::CreateSwapDelete);

        let plain = plan_for(&store, &manifest(5, ""), &PlanOptions::default()).unwrap();
        assert_eq!(plain.group("dea").unwrap().update.strategy, UpdateStrategy::DeleteCreate);

        let bad = manifest(5, "  update: {strategy: sideways}\n");
        assert!(matches!(
            plan_for(&store, &bad, &PlanOptions::default()),
            Err(PlanError::InvalidStrategy { .. })
        ));

        let overridden = PlanOptions {
            canaries: Some(CountOrPercent::Count(0)),
            max_in_flight: Some(CountOrPercent::Count(10)),
            ..Default::default()
        };
        let plan = plan_for(&store, &manifest(5, ""), &overridden).unwrap();
        let update = &plan.group("dea").unwrap().update;
        assert_eq!((update.canaries, update.max_in_flight), (0, 10));
    }
}
