//! director.toml configuration parser.
//!
//! The daemon loads one `DirectorConfig` at startup and hands it (usually
//! behind an `Arc`) to every component it constructs. Nothing reads settings
//! from process-wide statics; the config lives exactly as long as the process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub port: u16,
    /// Size of the background worker pool.
    pub workers: usize,
    pub task_checkpoint_interval_secs: u64,
    /// A processing task whose checkpoint is older than
    /// `multiplier * interval` is reported as timed out.
    pub task_timeout_multiplier: u32,
    /// Finished tasks retained per task type.
    pub max_tasks: usize,
    pub lock_lease_secs: u64,
    pub lock_renew_interval_secs: u64,
    pub lock_poll_interval_ms: u64,
    pub lock_sweep_interval_secs: u64,
    pub deployment_lock_timeout_secs: u64,
    pub max_vm_create_tries: u32,
    pub max_parallel_downloads: u32,
    /// Default VM replacement strategy when a manifest doesn't pick one.
    pub enable_create_swap_delete: bool,
    pub logging: LoggingConfig,
    pub cpi: CpiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpiConfig {
    pub kind: String,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            name: "director".to_string(),
            data_dir: PathBuf::from("/var/vcap/store/director"),
            port: 25555,
            workers: 3,
            task_checkpoint_interval_secs: 30,
            task_timeout_multiplier: 2,
            max_tasks: 100,
            lock_lease_secs: 30,
            lock_renew_interval_secs: 10,
            lock_poll_interval_ms: 500,
            lock_sweep_interval_secs: 60,
            deployment_lock_timeout_secs: 10,
            max_vm_create_tries: 5,
            max_parallel_downloads: 5,
            enable_create_swap_delete: false,
            logging: LoggingConfig::default(),
            cpi: CpiConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for CpiConfig {
    fn default() -> Self {
        Self {
            kind: "dummy".to_string(),
        }
    }
}

impl DirectorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: DirectorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would break lease or checkpoint invariants.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.task_checkpoint_interval_secs == 0 {
            anyhow::bail!("task_checkpoint_interval_secs must be positive");
        }
        if self.task_timeout_multiplier == 0 {
            anyhow::bail!("task_timeout_multiplier must be positive");
        }
        if self.lock_renew_interval_secs >= self.lock_lease_secs {
            anyhow::bail!(
                "lock_renew_interval_secs ({}) must be smaller than lock_lease_secs ({})",
                self.lock_renew_interval_secs,
                self.lock_lease_secs
            );
        }
        if self.cpi.kind != "dummy" {
            anyhow::bail!("unsupported cpi kind '{}'", self.cpi.kind);
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("director.redb")
    }

    pub fn task_checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.task_checkpoint_interval_secs)
    }

    /// Age past which a processing task's checkpoint counts as stalled.
    pub fn task_timeout(&self) -> Duration {
        self.task_checkpoint_interval() * self.task_timeout_multiplier
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn lock_renew_interval(&self) -> Duration {
        Duration::from_secs(self.lock_renew_interval_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_interval_secs)
    }

    pub fn deployment_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_lock_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DirectorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.task_timeout(), Duration::from_secs(60));
        assert!(config.lock_renew_interval() < config.lock_lease());
    }

    #[test]
    fn test_parse_partial() {
        let config = DirectorConfig::from_toml_str(
            r#"
name = "lab"
workers = 8

[logging]
json = true
"#,
        )
        .unwrap();
        assert_eq!(config.name, "lab");
        assert_eq!(config.workers, 8);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.max_vm_create_tries, 5);
    }

    #[test]
    fn test_rejects_renew_not_below_lease() {
        let err = DirectorConfig::from_toml_str(
            r#"
lock_lease_secs = 10
lock_renew_interval_secs = 10
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be smaller"));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = DirectorConfig::default();
        let text = config.to_toml_string().unwrap();
        let back = DirectorConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.port, 25555);
    }
}
