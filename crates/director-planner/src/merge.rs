//! Fold cloud-configs and runtime-configs into a deployment manifest.
//!
//! The manifest owns everything under its instance groups. Cloud-config
//! owns the infrastructure definitions groups refer to by name, unless the
//! manifest carries its own `networks` section, in which case cloud-config
//! is ignored entirely. Runtime configs add releases and addon jobs.

use director_core::manifest::{DeploymentManifest, InstanceGroupSpec, JobSpec, Properties};
use director_core::{CloudConfig, RuntimeConfig};
use tracing::{debug, warn};

use crate::error::{PlanError, PlanResult};

pub const IGNORED_CLOUD_CONFIG_WARNING: &str =
    "Ignoring cloud config. Manifest contains 'networks' section.";

/// A manifest with every config fragment applied.
#[derive(Debug, Clone)]
pub struct MergedManifest {
    pub manifest: DeploymentManifest,
    pub cloud: CloudConfig,
    pub ignored_cloud_config: bool,
    /// Deprecation notices for the task event log.
    pub warnings: Vec<String>,
}

pub fn merge(
    manifest: &DeploymentManifest,
    cloud_configs: Vec<CloudConfig>,
    runtime_configs: Vec<RuntimeConfig>,
) -> PlanResult<MergedManifest> {
    let mut warnings = Vec::new();
    let had_cloud_configs = !cloud_configs.is_empty();

    let (cloud, ignored_cloud_config) = match manifest.embedded_cloud_config() {
        Some(embedded) => {
            if had_cloud_configs {
                warn!(deployment = %manifest.name, "{IGNORED_CLOUD_CONFIG_WARNING}");
                warnings.push(IGNORED_CLOUD_CONFIG_WARNING.to_string());
            }
            (embedded, had_cloud_configs)
        }
        None => (CloudConfig::merge(cloud_configs)?, false),
    };

    let runtime = RuntimeConfig::merge(runtime_configs)?;
    let mut merged = manifest.clone();

    for release in &runtime.releases {
        match merged.release(&release.name) {
            Some(existing) if existing.version != release.version => {
                return Err(PlanError::ReleaseConflict {
                    name: release.name.clone(),
                    manifest: existing.version.clone(),
                    runtime: release.version.clone(),
                });
            }
            Some(_) => {}
            None => merged.releases.push(release.clone()),
        }
    }

    for addon in &runtime.addons {
        for group in &mut merged.instance_groups {
            if !addon.applies_to(&manifest.name, &group.name, &group.jobs) {
                continue;
            }
            debug!(addon = %addon.name, instance_group = %group.name, "applying addon");
            add_addon_jobs(group, &addon.jobs, &addon.properties);
        }
    }
    for (key, value) in runtime.tags {
        merged.tags.entry(key).or_insert(value);
    }

    Ok(MergedManifest {
        manifest: merged,
        cloud,
        ignored_cloud_config,
        warnings,
    })
}

fn add_addon_jobs(group: &mut InstanceGroupSpec, jobs: &[JobSpec], properties: &Properties) {
    for job in jobs {
        if group.jobs.iter().any(|j| j.name == job.name && j.release == job.release) {
            continue;
        }
        let mut job = job.clone();
        if job.properties.is_empty() {
            job.properties = properties.clone();
        }
        group.jobs.push(job);
    }
}
