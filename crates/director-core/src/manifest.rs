//! Typed deployment manifest.
//!
//! A manifest arrives as YAML text. It is parsed once into a generic
//! `serde_json::Value` tree (kept for diffing and placeholder interpolation)
//! and then into `DeploymentManifest`, which the planner consumes.

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cloud_config::{AzSpec, CloudConfig, CompilationSpec, DiskTypeSpec, NetworkSpec, VmTypeSpec};
use crate::error::{codes, DirectorError, DirectorResult};

/// Free-form property tree.
pub type Properties = Map<String, Value>;

/// Parse YAML text into a generic tree.
pub fn parse_yaml(text: &str) -> DirectorResult<Value> {
    serde_yaml::from_str::<Value>(text).map_err(|e| {
        DirectorError::validation(
            codes::INVALID_YAML,
            format!("Incorrect YAML structure of the supplied manifest: {e}"),
        )
    })
}

/// Render a generic tree back into YAML text.
pub fn to_yaml(value: &Value) -> DirectorResult<String> {
    serde_yaml::to_string(value).map_err(|e| DirectorError::Internal(e.to_string()))
}

// ── Deployment manifest ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentManifest {
    pub name: String,
    #[serde(default)]
    pub director_uuid: Option<String>,
    #[serde(default)]
    pub releases: Vec<ReleaseRef>,
    #[serde(default)]
    pub stemcells: Vec<StemcellRef>,
    #[serde(default)]
    pub update: Option<UpdateBlock>,
    /// `jobs` is the legacy spelling of this section.
    #[serde(default, alias = "jobs")]
    pub instance_groups: Vec<InstanceGroupSpec>,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    // Legacy manifests carry their own infrastructure sections.
    #[serde(default)]
    pub azs: Option<Vec<AzSpec>>,
    #[serde(default)]
    pub networks: Option<Vec<NetworkSpec>>,
    #[serde(default)]
    pub vm_types: Option<Vec<VmTypeSpec>>,
    #[serde(default)]
    pub disk_types: Option<Vec<DiskTypeSpec>>,
    #[serde(default)]
    pub compilation: Option<CompilationSpec>,
}

impl DeploymentManifest {
    /// Parse and validate a manifest from its YAML text.
    pub fn from_yaml(text: &str) -> DirectorResult<(Self, Value)> {
        let raw = parse_yaml(text)?;
        let manifest = Self::from_value(&raw)?;
        Ok((manifest, raw))
    }

    /// Build a typed manifest from an already parsed tree.
    pub fn from_value(raw: &Value) -> DirectorResult<Self> {
        let map = raw
            .as_object()
            .ok_or_else(|| DirectorError::bad_manifest("Manifest should be a hash"))?;

        match map.get("name") {
            Some(Value::String(name)) if !name.is_empty() => {}
            Some(Value::String(_)) | None | Some(Value::Null) => {
                return Err(DirectorError::validation(
                    codes::VALIDATION_MISSING_FIELD,
                    "Required property 'name' was not specified in object",
                ));
            }
            Some(other) => {
                return Err(DirectorError::validation(
                    codes::VALIDATION_INVALID_TYPE,
                    format!("Property 'name' value ({other}) did not match the required type 'String'"),
                ));
            }
        }

        if map.contains_key("jobs") && map.contains_key("instance_groups") {
            return Err(DirectorError::validation(
                codes::JOB_BOTH_INSTANCE_GROUP_AND_JOB,
                "Deployment specifies both jobs and instance_groups keys, only one is allowed",
            ));
        }

        let manifest: DeploymentManifest = serde_json::from_value(raw.clone()).map_err(|e| {
            DirectorError::validation(codes::VALIDATION_INVALID_TYPE, format!("Invalid manifest: {e}"))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> DirectorResult<()> {
        let mut seen = std::collections::HashSet::new();
        for group in &self.instance_groups {
            if !seen.insert(group.name.as_str()) {
                return Err(DirectorError::bad_manifest(format!(
                    "Duplicate instance group name '{}'",
                    group.name
                )));
            }
        }
        for release in &self.releases {
            release.validate()?;
        }
        Ok(())
    }

    /// Whether this manifest declares its own networks (legacy style), in
    /// which case any cloud-config is ignored.
    pub fn ignores_cloud_config(&self) -> bool {
        self.networks.is_some()
    }

    /// The infrastructure sections carried by a legacy manifest.
    pub fn embedded_cloud_config(&self) -> Option<CloudConfig> {
        let networks = self.networks.clone()?;
        Some(CloudConfig {
            azs: self.azs.clone().unwrap_or_default(),
            networks,
            vm_types: self.vm_types.clone().unwrap_or_default(),
            vm_extensions: Vec::new(),
            disk_types: self.disk_types.clone().unwrap_or_default(),
            compilation: self.compilation.clone(),
        })
    }

    pub fn instance_group(&self, name: &str) -> Option<&InstanceGroupSpec> {
        self.instance_groups.iter().find(|g| g.name == name)
    }

    pub fn release(&self, name: &str) -> Option<&ReleaseRef> {
        self.releases.iter().find(|r| r.name == name)
    }
}

// ── Releases & stemcells ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseRef {
    pub name: String,
    #[serde(deserialize_with = "de_version")]
    pub version: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
}

impl ReleaseRef {
    pub fn validate(&self) -> DirectorResult<()> {
        if self.version == "create" && self.url.is_none() {
            return Err(DirectorError::validation(
                codes::RELEASE_VERSION_INVALID,
                format!(
                    "Release '{}' specifies version 'create' but no 'url' to create it from",
                    self.name
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StemcellRef {
    pub alias: String,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(deserialize_with = "de_version")]
    pub version: String,
}

/// Accept versions written as YAML strings or numbers.
fn de_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("invalid version: {other}"))),
    }
}

// ── Instance groups ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceGroupSpec {
    pub name: String,
    pub instances: u32,
    #[serde(default)]
    pub azs: Vec<String>,
    /// `templates` is the legacy spelling.
    #[serde(default, alias = "templates")]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub vm_type: Option<String>,
    #[serde(default)]
    pub vm_extensions: Vec<String>,
    #[serde(default)]
    pub stemcell: Option<String>,
    /// Persistent disk size in MiB.
    #[serde(default)]
    pub persistent_disk: Option<u64>,
    #[serde(default)]
    pub persistent_disk_type: Option<String>,
    #[serde(default)]
    pub networks: Vec<InstanceGroupNetwork>,
    #[serde(default)]
    pub update: Option<UpdateBlock>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub env: Properties,
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Service,
    Errand,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceGroupNetwork {
    pub name: String,
    #[serde(default)]
    pub default: Vec<String>,
    #[serde(default)]
    pub static_ips: Vec<String>,
}

/// A release job colocated on an instance group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub release: String,
    #[serde(default)]
    pub properties: Properties,
    /// Provided links by name; `null` blocks the provider.
    #[serde(default)]
    pub provides: BTreeMap<String, Option<ProvidesSpec>>,
    /// Consumed links by name; `null` blocks the consumer.
    #[serde(default)]
    pub consumes: BTreeMap<String, Option<ConsumesSpec>>,
    #[serde(default)]
    pub custom_provider_definitions: Vec<CustomProviderDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvidesSpec {
    #[serde(default, rename = "as")]
    pub alias: Option<String>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default, rename = "type")]
    pub link_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsumesSpec {
    /// Alias of the provider to bind to.
    #[serde(default)]
    pub from: Option<String>,
    /// Provider deployment for cross-deployment links.
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, rename = "type")]
    pub link_type: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    // Manual link content, supplied instead of a provider.
    #[serde(default)]
    pub instances: Option<Vec<Value>>,
    #[serde(default)]
    pub properties: Option<Value>,
    #[serde(default)]
    pub address: Option<String>,
}

impl ConsumesSpec {
    /// Whether the link content is supplied inline rather than by a provider.
    pub fn is_manual(&self) -> bool {
        self.instances.is_some() || self.properties.is_some() || self.address.is_some()
    }

    pub fn manual_content(&self) -> Value {
        let mut content = Map::new();
        content.insert(
            "instances".to_string(),
            Value::Array(self.instances.clone().unwrap_or_default()),
        );
        content.insert(
            "properties".to_string(),
            self.properties.clone().unwrap_or(Value::Object(Map::new())),
        );
        if let Some(address) = &self.address {
            content.insert("address".to_string(), Value::String(address.clone()));
        }
        Value::Object(content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomProviderDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub link_type: String,
    #[serde(default)]
    pub properties: Vec<String>,
}

// ── Update block ──────────────────────────────────────────────────

/// The `update:` block, at deployment level or per instance group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdateBlock {
    #[serde(default)]
    pub canaries: Option<CountOrPercent>,
    #[serde(default)]
    pub max_in_flight: Option<CountOrPercent>,
    #[serde(default)]
    pub canary_watch_time: Option<WatchTime>,
    #[serde(default)]
    pub update_watch_time: Option<WatchTime>,
    #[serde(default)]
    pub serial: Option<bool>,
    #[serde(default, alias = "vm_strategy")]
    pub strategy: Option<String>,
}

impl UpdateBlock {
    /// Fill unset fields from `parent`.
    pub fn inherit(&self, parent: &UpdateBlock) -> UpdateBlock {
        UpdateBlock {
            canaries: self.canaries.or(parent.canaries),
            max_in_flight: self.max_in_flight.or(parent.max_in_flight),
            canary_watch_time: self.canary_watch_time.or(parent.canary_watch_time),
            update_watch_time: self.update_watch_time.or(parent.update_watch_time),
            serial: self.serial.or(parent.serial),
            strategy: self.strategy.clone().or_else(|| parent.strategy.clone()),
        }
    }
}

/// An absolute count or a percentage of the instance group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum CountOrPercent {
    Count(u32),
    Percent(u32),
}

impl CountOrPercent {
    /// Resolve against a group size; percentages round down.
    pub fn resolve(self, total: u32) -> u32 {
        match self {
            CountOrPercent::Count(n) => n,
            CountOrPercent::Percent(p) => ((total as u64 * p as u64) / 100) as u32,
        }
    }
}

impl TryFrom<Value> for CountOrPercent {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(CountOrPercent::Count)
                .ok_or_else(|| format!("expected a non-negative integer, got {n}")),
            Value::String(s) => {
                let s = s.trim();
                if let Some(pct) = s.strip_suffix('%') {
                    pct.trim()
                        .parse::<u32>()
                        .map(CountOrPercent::Percent)
                        .map_err(|_| format!("invalid percentage '{s}'"))
                } else {
                    s.parse::<u32>()
                        .map(CountOrPercent::Count)
                        .map_err(|_| format!("invalid count '{s}'"))
                }
            }
            other => Err(format!("expected a count or percentage, got {other}")),
        }
    }
}

impl From<CountOrPercent> for Value {
    fn from(v: CountOrPercent) -> Self {
        match v {
            CountOrPercent::Count(n) => Value::from(n),
            CountOrPercent::Percent(p) => Value::String(format!("{p}%")),
        }
    }
}

/// Watch time in milliseconds, written as `30000` or `"1000-30000"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct WatchTime {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl TryFrom<Value> for WatchTime {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::Number(n) => n
                .as_u64()
                .map(|ms| WatchTime { min_ms: ms, max_ms: ms })
                .ok_or_else(|| format!("invalid watch time {n}")),
            Value::String(s) => {
                let parse = |p: &str| {
                    p.trim()
                        .parse::<u64>()
                        .map_err(|_| format!("invalid watch time '{s}'"))
                };
                match s.split_once('-') {
                    Some((lo, hi)) => {
                        let (min_ms, max_ms) = (parse(lo)?, parse(hi)?);
                        if min_ms > max_ms {
                            return Err(format!("watch time range '{s}' is inverted"));
                        }
                        Ok(WatchTime { min_ms, max_ms })
                    }
                    None => {
                        let ms = parse(s)?;
                        Ok(WatchTime { min_ms: ms, max_ms: ms })
                    }
                }
            }
            other => Err(format!("invalid watch time {other}")),
        }
    }
}

impl From<WatchTime> for Value {
    fn from(w: WatchTime) -> Self {
        if w.min_ms == w.max_ms {
            Value::from(w.min_ms)
        } else {
            Value::String(format!("{}-{}", w.min_ms, w.max_ms))
        }
    }
}

// ── Variables ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariableSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: Properties,
}
