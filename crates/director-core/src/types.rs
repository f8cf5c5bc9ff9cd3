//! Shared types used across director crates.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How a VM that must be recreated is replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    /// Delete the old VM, then create the new one.
    #[default]
    DeleteCreate,
    /// Create and activate the new VM before deleting the old one.
    CreateSwapDelete,
}

impl UpdateStrategy {
    /// Normalize a manifest `update.strategy` value, accepting legacy aliases.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "delete-create" | "legacy" => Some(Self::DeleteCreate),
            "create-swap-delete" | "hot-swap" => Some(Self::CreateSwapDelete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeleteCreate => "delete-create",
            Self::CreateSwapDelete => "create-swap-delete",
        }
    }
}

/// Desired lifecycle state of an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Started,
    Stopped,
    Detached,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Detached => "detached",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_aliases() {
        assert_eq!(UpdateStrategy::parse("legacy"), Some(UpdateStrategy::DeleteCreate));
        assert_eq!(UpdateStrategy::parse("hot-swap"), Some(UpdateStrategy::CreateSwapDelete));
        assert_eq!(UpdateStrategy::parse("create-swap-delete"), Some(UpdateStrategy::CreateSwapDelete));
        assert_eq!(UpdateStrategy::parse("sideways"), None);
    }
}
