//! Job type name to constructor wiring.

use director_core::DirectorError;
use director_tasks::{Job, JobRegistry};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::delete_deployment::{self, DeleteDeployment};
use crate::delete_orphan_disks::{self, DeleteOrphanDisks};
use crate::env::JobEnv;
use crate::error::JobError;
use crate::update_deployment::{self, UpdateDeployment};

/// Every job the director runs, built against `env`.
pub fn registry(env: JobEnv) -> JobRegistry {
    let mut registry = JobRegistry::new();

    let deploy_env = env.clone();
    registry.register(update_deployment::JOB_TYPE, move |args| {
        Ok(Box::new(UpdateDeployment::new(deploy_env.clone(), parse(args)?)) as Box<dyn Job>)
    });

    let delete_env = env.clone();
    registry.register(delete_deployment::JOB_TYPE, move |args| {
        Ok(Box::new(DeleteDeployment::new(delete_env.clone(), parse(args)?)) as Box<dyn Job>)
    });

    registry.register(delete_orphan_disks::JOB_TYPE, move |args| {
        Ok(Box::new(DeleteOrphanDisks::new(env.clone(), parse(args)?)) as Box<dyn Job>)
    });

    registry
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, DirectorError> {
    serde_json::from_value(args).map_err(|e| JobError::Arguments(e).into())
}
