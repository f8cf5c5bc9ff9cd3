//! `delete_deployment`: tear down every instance, then forget the deployment.

use async_trait::async_trait;
use director_core::DirectorError;
use director_lock::{deployment_lock, HeldLock, LockError};
use director_tasks::{EventState, Job, JobContext};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::env::JobEnv;
use crate::error::{JobError, JobResult};

pub const JOB_TYPE: &str = "delete_deployment";

const STAGE: &str = "Deleting instances";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDeploymentArgs {
    pub deployment: String,
    /// Keep going when an instance fails to delete.
    #[serde(default)]
    pub force: bool,
}

pub struct DeleteDeployment {
    env: JobEnv,
    args: DeleteDeploymentArgs,
}

impl DeleteDeployment {
    pub fn new(env: JobEnv, args: DeleteDeploymentArgs) -> Self {
        Self { env, args }
    }

    async fn run(&self, ctx: &JobContext, lock: &HeldLock) -> JobResult<String> {
        let name = &self.args.deployment;
        let store = &self.env.store;
        if store.get_deployment(name)?.is_none() {
            return Err(JobError::DeploymentNotFound(name.clone()));
        }

        let executor = self.env.executor(ctx);
        let instances = store.list_instances(name)?;
        let total = instances.len();
        for (position, instance) in instances.iter().enumerate() {
            ctx.check_cancelled()?;
            if lock.is_lost() {
                return Err(LockError::Lost(lock.name().to_string()).into());
            }
            let label = instance.name();
            ctx.logger().event(STAGE, &label, position + 1, total, EventState::Started);
            match executor.delete_instance(instance).await {
                Ok(()) => ctx.logger().event(STAGE, &label, position + 1, total, EventState::Finished),
                Err(e) if self.args.force => {
                    warn!(deployment = %name, instance = %label, error = %e, "ignoring failed instance delete");
                    ctx.logger().warning(&format!("Failed to delete '{label}': {e}"));
                    store.delete_instance(&instance.deployment, &instance.job, &instance.uuid)?;
                    ctx.logger().event(STAGE, &label, position + 1, total, EventState::Finished);
                }
                Err(e) => {
                    ctx.logger()
                        .event_failed(STAGE, &label, position + 1, total, &e.to_string());
                    return Err(e.into());
                }
            }
        }

        for link in store.list_links(name)? {
            store.delete_links_for_consumer(&link.consumer)?;
        }
        store.replace_link_consumers(name, &[])?;
        store.replace_link_providers(name, &[])?;
        for set in store.list_variable_sets(name)? {
            store.delete_variable_set(name, set.id)?;
        }
        store.delete_deployment(name)?;

        info!(deployment = %name, instances = total, "deployment deleted");
        Ok(format!("/deployments/{name}"))
    }
}

#[async_trait]
impl Job for DeleteDeployment {
    fn job_type(&self) -> &'static str {
        JOB_TYPE
    }

    async fn perform(&mut self, ctx: &JobContext) -> Result<String, DirectorError> {
        let lock = self
            .env
            .locks
            .hold(
                &deployment_lock(&self.args.deployment),
                self.env.config.deployment_lock_timeout(),
                Some(ctx.task_id()),
            )
            .await
            .map_err(DirectorError::from)?;

        let result = self.run(ctx, &lock).await;
        if let Err(e) = lock.release().await {
            warn!(task_id = ctx.task_id(), error = %e, "failed to release deployment lock");
        }
        result.map_err(DirectorError::from)
    }
}
