//! Cloud-config: the global infrastructure definitions (AZs, networks,
//! VM types, disk types) that manifests reference by name.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{codes, DirectorError, DirectorResult};
use crate::manifest::{parse_yaml, Properties};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CloudConfig {
    #[serde(default)]
    pub azs: Vec<AzSpec>,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    #[serde(default, alias = "resource_pools")]
    pub vm_types: Vec<VmTypeSpec>,
    #[serde(default)]
    pub vm_extensions: Vec<VmExtensionSpec>,
    #[serde(default, alias = "disk_pools")]
    pub disk_types: Vec<DiskTypeSpec>,
    #[serde(default)]
    pub compilation: Option<CompilationSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AzSpec {
    pub name: String,
    #[serde(default)]
    pub cpi: Option<String>,
    #[serde(default)]
    pub cloud_properties: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default = "default_network_type", rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,
    #[serde(default)]
    pub cloud_properties: Properties,
}

fn default_network_type() -> String {
    "manual".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubnetSpec {
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub azs: Vec<String>,
    #[serde(default)]
    pub az: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default, rename = "static")]
    pub static_ips: Vec<String>,
    #[serde(default)]
    pub reserved: Vec<String>,
    #[serde(default)]
    pub cloud_properties: Properties,
}

impl SubnetSpec {
    /// AZs this subnet is reachable from; `az` is the single-AZ spelling.
    pub fn az_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.azs.iter().map(String::as_str).collect();
        if let Some(az) = &self.az {
            names.push(az);
        }
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmTypeSpec {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmExtensionSpec {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskTypeSpec {
    pub name: String,
    pub disk_size: u64,
    #[serde(default)]
    pub cloud_properties: Properties,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompilationSpec {
    #[serde(default)]
    pub workers: Option<u32>,
    #[serde(default)]
    pub az: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub vm_type: Option<String>,
    #[serde(default)]
    pub reuse_compilation_vms: bool,
}

impl CloudConfig {
    pub fn from_yaml(text: &str) -> DirectorResult<Self> {
        let raw = parse_yaml(text)?;
        Self::from_value(&raw)
    }

    pub fn from_value(raw: &Value) -> DirectorResult<Self> {
        if raw.is_null() {
            return Ok(Self::default());
        }
        if !raw.is_object() {
            return Err(DirectorError::bad_manifest("Cloud config should be a hash"));
        }
        serde_json::from_value(raw.clone()).map_err(|e| {
            DirectorError::validation(codes::VALIDATION_INVALID_TYPE, format!("Invalid cloud config: {e}"))
        })
    }

    /// Combine several named cloud configs into one. Names must stay
    /// unique across every fragment.
    pub fn merge(configs: impl IntoIterator<Item = CloudConfig>) -> DirectorResult<Self> {
        let mut merged = CloudConfig::default();
        for config in configs {
            merged.azs.extend(config.azs);
            merged.networks.extend(config.networks);
            merged.vm_types.extend(config.vm_types);
            merged.vm_extensions.extend(config.vm_extensions);
            merged.disk_types.extend(config.disk_types);
            if config.compilation.is_some() {
                if merged.compilation.is_some() {
                    return Err(DirectorError::bad_manifest(
                        "Cloud config 'compilation' key cannot be defined in multiple cloud configs",
                    ));
                }
                merged.compilation = config.compilation;
            }
        }
        check_unique("azs", merged.azs.iter().map(|a| a.name.as_str()))?;
        check_unique("networks", merged.networks.iter().map(|n| n.name.as_str()))?;
        check_unique("vm_types", merged.vm_types.iter().map(|v| v.name.as_str()))?;
        check_unique("vm_extensions", merged.vm_extensions.iter().map(|v| v.name.as_str()))?;
        check_unique("disk_types", merged.disk_types.iter().map(|d| d.name.as_str()))?;
        Ok(merged)
    }

    pub fn az(&self, name: &str) -> Option<&AzSpec> {
        self.azs.iter().find(|a| a.name == name)
    }

    pub fn network(&self, name: &str) -> Option<&NetworkSpec> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn vm_type(&self, name: &str) -> Option<&VmTypeSpec> {
        self.vm_types.iter().find(|v| v.name == name)
    }

    pub fn vm_extension(&self, name: &str) -> Option<&VmExtensionSpec> {
        self.vm_extensions.iter().find(|v| v.name == name)
    }

    pub fn disk_type(&self, name: &str) -> Option<&DiskTypeSpec> {
        self.disk_types.iter().find(|d| d.name == name)
    }

    /// CPI an AZ is bound to; empty when the AZ names none.
    pub fn cpi_for_az(&self, az: Option<&str>) -> String {
        az.and_then(|name| self.az(name))
            .and_then(|a| a.cpi.clone())
            .unwrap_or_default()
    }
}

fn check_unique<'a>(section: &str, names: impl Iterator<Item = &'a str>) -> DirectorResult<()> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(DirectorError::bad_manifest(format!(
                "Duplicate {section} name '{name}' in cloud config"
            )));
        }
    }
    Ok(())
}
