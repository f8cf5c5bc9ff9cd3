//! Runtime-config: director-wide releases and addons applied on top of
//! every deployment manifest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{codes, DirectorError, DirectorResult};
use crate::manifest::{parse_yaml, JobSpec, Properties, ReleaseRef};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub releases: Vec<ReleaseRef>,
    #[serde(default)]
    pub addons: Vec<Addon>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Addon {
    pub name: String,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub include: Option<AddonFilter>,
    #[serde(default)]
    pub exclude: Option<AddonFilter>,
}

/// Placement filter. An empty filter matches nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AddonFilter {
    #[serde(default)]
    pub deployments: Vec<String>,
    #[serde(default)]
    pub jobs: Vec<FilterJob>,
    #[serde(default)]
    pub instance_groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterJob {
    pub name: String,
    pub release: String,
}

impl AddonFilter {
    fn is_empty(&self) -> bool {
        self.deployments.is_empty() && self.jobs.is_empty() && self.instance_groups.is_empty()
    }

    /// Whether the filter selects an instance group running `jobs` in
    /// `deployment`. Every non-empty criterion must match.
    pub fn matches(&self, deployment: &str, group: &str, jobs: &[JobSpec]) -> bool {
        if self.is_empty() {
            return false;
        }
        if !self.deployments.is_empty() && !self.deployments.iter().any(|d| d == deployment) {
            return false;
        }
        if !self.instance_groups.is_empty() && !self.instance_groups.iter().any(|g| g == group) {
            return false;
        }
        if !self.jobs.is_empty()
            && !self
                .jobs
                .iter()
                .any(|f| jobs.iter().any(|j| j.name == f.name && j.release == f.release))
        {
            return false;
        }
        true
    }
}

impl Addon {
    /// Whether this addon applies to an instance group. No `include` means
    /// everywhere; `exclude` always wins.
    pub fn applies_to(&self, deployment: &str, group: &str, jobs: &[JobSpec]) -> bool {
        let included = match &self.include {
            Some(filter) => filter.matches(deployment, group, jobs),
            None => true,
        };
        let excluded = match &self.exclude {
            Some(filter) => filter.matches(deployment, group, jobs),
            None => false,
        };
        included && !excluded
    }
}

impl RuntimeConfig {
    pub fn from_yaml(text: &str) -> DirectorResult<Self> {
        let raw = parse_yaml(text)?;
        Self::from_value(&raw)
    }

    pub fn from_value(raw: &Value) -> DirectorResult<Self> {
        if raw.is_null() {
            return Ok(Self::default());
        }
        if !raw.is_object() {
            return Err(DirectorError::bad_manifest("Runtime config should be a hash"));
        }
        let config: RuntimeConfig = serde_json::from_value(raw.clone()).map_err(|e| {
            DirectorError::validation(codes::VALIDATION_INVALID_TYPE, format!("Invalid runtime config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> DirectorResult<()> {
        for release in &self.releases {
            if release.version == "latest" {
                return Err(DirectorError::validation(
                    codes::RUNTIME_INVALID_RELEASE_VERSION,
                    format!(
                        "Runtime manifest contains the release '{}' with version as 'latest'. Please specify the actual version string.",
                        release.name
                    ),
                ));
            }
        }
        for addon in &self.addons {
            for job in &addon.jobs {
                if !self.releases.iter().any(|r| r.name == job.release) {
                    return Err(DirectorError::validation(
                        codes::ADDON_RELEASE_NOT_LISTED,
                        format!(
                            "Manifest specifies job '{}' which is defined in '{}', but '{}' is not listed in the runtime releases section.",
                            job.name, job.release, job.release
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Fold several runtime configs together. The same release may appear
    /// more than once only with the same version.
    pub fn merge(configs: impl IntoIterator<Item = RuntimeConfig>) -> DirectorResult<Self> {
        let mut merged = RuntimeConfig::default();
        for config in configs {
            for release in config.releases {
                match merged.releases.iter().find(|r| r.name == release.name) {
                    Some(existing) if existing.version != release.version => {
                        return Err(release_conflict(&release.name, &existing.version, &release.version));
                    }
                    Some(_) => {}
                    None => merged.releases.push(release),
                }
            }
            merged.addons.extend(config.addons);
            merged.tags.extend(config.tags);
        }
        Ok(merged)
    }
}

pub fn release_conflict(name: &str, a: &str, b: &str) -> DirectorError {
    DirectorError::validation(
        codes::RUNTIME_AMBIGUOUS_RELEASE_SPEC,
        format!("Runtime manifest specifies release '{name}' with version '{b}', which conflicts with version '{a}'"),
    )
}
