//! Render final instance specs once variables and links are known.

use std::collections::BTreeMap;

use director_core::manifest::{DeploymentManifest, InstanceGroupSpec, JobSpec, Properties};
use director_resolve::{insert_path, lookup_path, InstanceAddress, ResolveResult, ResolvedLinks};
use director_state::ReleaseVersion;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::PlanResult;
use crate::plan::{Action, Change, DeploymentPlan, InstanceGroupPlan, InstancePlan, JobRef, VmRequirements};

/// Instance addresses per group, as published in link content.
pub fn addresses(plan: &DeploymentPlan) -> BTreeMap<String, Vec<InstanceAddress>> {
    plan.groups
        .iter()
        .map(|group| {
            let network = default_network(group).unwrap_or_default();
            let addresses = group
                .instances
                .iter()
                .map(|i| InstanceAddress {
                    name: group.name.clone(),
                    index: i.index,
                    id: i.uuid.clone(),
                    az: i.az.clone(),
                    address: format!("{}.{}.{}.{}.bosh", i.uuid, group.name, network, plan.deployment),
                    bootstrap: i.bootstrap,
                })
                .collect();
            (group.name.clone(), addresses)
        })
        .collect()
}

fn default_network(group: &InstanceGroupPlan) -> Option<String> {
    let networks = group.vm.networks.as_object()?;
    networks
        .iter()
        .find(|(_, n)| n["default"].as_array().is_some_and(|d| d.iter().any(|v| v == "gateway")))
        .or_else(|| networks.iter().next())
        .map(|(name, _)| name.clone())
}

/// Fill in each planned instance's spec and flag configuration and env
/// changes. `interpolate` resolves `((placeholders))` against the deploy's
/// variable set.
pub fn render_specs<F>(
    plan: &mut DeploymentPlan,
    manifest: &DeploymentManifest,
    releases: &[ReleaseVersion],
    links: &ResolvedLinks,
    mut interpolate: F,
) -> PlanResult<()>
where
    F: FnMut(&Value) -> ResolveResult<Value>,
{
    let deployment = plan.deployment.clone();
    for group in &mut plan.groups {
        let Some(spec) = manifest.instance_group(&group.name) else {
            continue;
        };

        let mut properties = Map::new();
        let mut job_links = Map::new();
        for job in &spec.jobs {
            let merged = with_defaults(job_properties(manifest, spec, job), releases, job);
            properties.insert(job.name.clone(), interpolate(&Value::Object(merged))?);
            let resolved: Map<String, Value> = links.for_job(&group.name, &job.name).into_iter().collect();
            job_links.insert(job.name.clone(), Value::Object(resolved));
        }
        group.vm.env = interpolate(&group.vm.env)?;

        let properties = Value::Object(properties);
        let job_links = Value::Object(job_links);
        for instance in &mut group.instances {
            instance.spec = instance_spec(
                &deployment,
                &group.name,
                &group.vm,
                &group.jobs,
                instance,
                &properties,
                &job_links,
            );
            if instance.action == Action::Create {
                continue;
            }
            if let Some(existing) = &instance.existing {
                if existing.spec["configuration_hash"] != instance.spec["configuration_hash"] {
                    instance.changes.insert(Change::Configuration);
                }
                if existing.spec["env"] != group.vm.env {
                    instance.changes.insert(Change::Env);
                }
            }
            instance.settle();
        }
    }
    Ok(())
}

fn instance_spec(
    deployment: &str,
    name: &str,
    vm: &VmRequirements,
    jobs: &[JobRef],
    instance: &InstancePlan,
    properties: &Value,
    links: &Value,
) -> Value {
    let jobs: Vec<Value> = jobs
        .iter()
        .map(|j| json!({"name": j.name, "release": j.release, "version": j.version}))
        .collect();
    let configuration_hash = configuration_hash(&json!({
        "jobs": jobs,
        "properties": properties,
        "links": links,
        "bootstrap": instance.bootstrap,
    }));
    json!({
        "deployment": deployment,
        "name": name,
        "index": instance.index,
        "id": instance.uuid,
        "az": instance.az,
        "bootstrap": instance.bootstrap,
        "stemcell": {"name": vm.stemcell_name, "version": vm.stemcell_version},
        "vm_type": {"name": vm.vm_type, "cloud_properties": vm.cloud_properties},
        "networks": vm.networks,
        "env": vm.env,
        "persistent_disk": vm.disk_size,
        "persistent_disk_cloud_properties": vm.disk_cloud_properties,
        "jobs": jobs,
        "properties": properties,
        "links": links,
        "configuration_hash": configuration_hash,
    })
}

/// Job properties fall back to instance group properties, then global ones.
fn job_properties(manifest: &DeploymentManifest, group: &InstanceGroupSpec, job: &JobSpec) -> Properties {
    if !job.properties.is_empty() {
        job.properties.clone()
    } else if !group.properties.is_empty() {
        group.properties.clone()
    } else {
        manifest.properties.clone()
    }
}

fn with_defaults(mut properties: Properties, releases: &[ReleaseVersion], job: &JobSpec) -> Properties {
    let Some(definition) = releases
        .iter()
        .find(|r| r.name == job.release)
        .and_then(|r| r.job(&job.name))
    else {
        return properties;
    };
    for (path, declared) in &definition.properties {
        if lookup_path(&properties, path).is_some() {
            continue;
        }
        if let Some(default) = declared.get("default") {
            insert_path(&mut properties, path, default.clone());
        }
    }
    properties
}

/// SHA-256 over the canonical JSON of `value`, with object keys sorted so
/// manifest key order does not matter.
pub fn configuration_hash(value: &Value) -> String {
    let canonical = canonical(value);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), canonical(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(configuration_hash(&a), configuration_hash(&b));
        let c: Value = serde_json::from_str(r#"{"a": {"x": 4, "y": 2}, "b": 1}"#).unwrap();
        assert_ne!(configuration_hash(&a), configuration_hash(&c));
    }
}
