//! Services every job is built with.

use std::sync::Arc;

use director_cloud::{Agent, CpiRegistry};
use director_core::{CloudConfig, DirectorConfig, RuntimeConfig};
use director_lock::LockManager;
use director_rollout::Executor;
use director_state::StateStore;
use director_tasks::JobContext;

use crate::error::JobResult;

pub const CLOUD_CONFIG: &str = "cloud";
pub const RUNTIME_CONFIG: &str = "runtime";

/// Process-wide handles, built once by the daemon and cloned into each job.
#[derive(Clone)]
pub struct JobEnv {
    pub store: StateStore,
    pub locks: LockManager,
    pub cpis: CpiRegistry,
    pub agent: Arc<dyn Agent>,
    pub config: Arc<DirectorConfig>,
}

impl JobEnv {
    pub fn new(
        store: StateStore,
        locks: LockManager,
        cpis: CpiRegistry,
        agent: Arc<dyn Agent>,
        config: Arc<DirectorConfig>,
    ) -> Self {
        Self {
            store,
            locks,
            cpis,
            agent,
            config,
        }
    }

    /// An executor reporting into the running task.
    pub fn executor(&self, ctx: &JobContext) -> Executor {
        Executor::new(
            self.store.clone(),
            self.cpis.clone(),
            self.agent.clone(),
            ctx.logger().clone(),
            ctx.cancellation().clone(),
        )
        .with_max_vm_create_tries(self.config.max_vm_create_tries)
    }

    /// Latest cloud configs, one per name, with their ids.
    pub fn cloud_configs(&self) -> JobResult<(Vec<u64>, Vec<CloudConfig>)> {
        let mut ids = Vec::new();
        let mut configs = Vec::new();
        for record in self.store.latest_configs(CLOUD_CONFIG)? {
            configs.push(CloudConfig::from_yaml(&record.content)?);
            ids.push(record.id);
        }
        Ok((ids, configs))
    }

    /// Latest runtime configs, one per name, with their ids.
    pub fn runtime_configs(&self) -> JobResult<(Vec<u64>, Vec<RuntimeConfig>)> {
        let mut ids = Vec::new();
        let mut configs = Vec::new();
        for record in self.store.latest_configs(RUNTIME_CONFIG)? {
            configs.push(RuntimeConfig::from_yaml(&record.content)?);
            ids.push(record.id);
        }
        Ok((ids, configs))
    }
}
