pub mod cloud_config;
pub mod config;
pub mod error;
pub mod manifest;
pub mod runtime_config;
pub mod types;

pub use cloud_config::CloudConfig;
pub use config::DirectorConfig;
pub use error::{codes, DirectorError, DirectorResult};
pub use manifest::DeploymentManifest;
pub use runtime_config::RuntimeConfig;
pub use types::*;
