//! `update_deployment`: plan a manifest and converge the fleet to it.
//!
//! Runs under the deployment lock. The deployment record is created before
//! the first mutation so a failed first deploy can still be deleted; its
//! config ids are filled in only when the rollout succeeded. The whole
//! deploy pins one variable set; it is closed at the end of every attempt
//! and marked deployed only on success.

use async_trait::async_trait;
use director_core::manifest::CountOrPercent;
use director_core::{epoch_ms, DeploymentManifest, DirectorError};
use director_lock::{deployment_lock, HeldLock};
use director_planner::{addresses, merge, render_specs, Action, DeploymentPlan, MergedManifest, PlanOptions, Planner};
use director_resolve::{collect_intents, LinkResolver, VariableResolver};
use director_state::{Deployment, ReleaseVersion, VariableSet};
use director_tasks::{EventState, Job, JobContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::env::JobEnv;
use crate::error::JobResult;

pub const JOB_TYPE: &str = "update_deployment";

const PREPARE_STAGE: &str = "Preparing deployment";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDeploymentArgs {
    /// Manifest text as submitted.
    pub manifest_text: String,
    #[serde(default)]
    pub recreate: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub canaries: Option<CountOrPercent>,
    #[serde(default)]
    pub max_in_flight: Option<CountOrPercent>,
    /// Teams that own the deployment.
    #[serde(default)]
    pub teams: Vec<String>,
}

pub struct UpdateDeployment {
    env: JobEnv,
    args: UpdateDeploymentArgs,
}

impl UpdateDeployment {
    pub fn new(env: JobEnv, args: UpdateDeploymentArgs) -> Self {
        Self { env, args }
    }

    async fn run(&self, ctx: &JobContext, lock: &HeldLock, manifest: DeploymentManifest, raw: Value) -> JobResult<String> {
        let name = manifest.name.clone();
        let logger = ctx.logger();

        logger.event(PREPARE_STAGE, "Binding deployment", 1, 4, EventState::Started);
        let (cloud_ids, clouds) = self.env.cloud_configs()?;
        let (runtime_ids, runtimes) = self.env.runtime_configs()?;
        let merged = merge(&manifest, clouds, runtimes)?;
        for warning in &merged.warnings {
            warn!(deployment = %name, "{warning}");
            logger.warning(warning);
        }
        logger.event(PREPARE_STAGE, "Binding deployment", 1, 4, EventState::Finished);

        logger.event(PREPARE_STAGE, "Planning instances", 2, 4, EventState::Started);
        let options = PlanOptions {
            recreate: self.args.recreate,
            canaries: self.args.canaries,
            max_in_flight: self.args.max_in_flight,
        };
        let planner = Planner::new(self.env.store.clone(), &self.env.config);
        let (mut plan, releases) = planner.plan(&merged, &options)?;
        logger.event(PREPARE_STAGE, "Planning instances", 2, 4, EventState::Finished);
        ctx.check_cancelled()?;

        if !self.args.dry_run {
            self.ensure_deployment(&name, &raw)?;
        }
        let variables = VariableResolver::new(self.env.store.clone(), &self.env.config.name);
        let mut set = variables.start_set(&name)?;
        let outcome = self
            .converge(ctx, lock, &merged, &mut plan, &releases, &variables, &set)
            .await;

        if self.args.dry_run {
            self.env.store.delete_variable_set(&name, set.id)?;
            outcome?;
            info!(
                deployment = %name,
                creates = plan.count(Action::Create),
                updates = plan.count(Action::Update),
                deletes = plan.count(Action::Delete),
                "dry run planned"
            );
            return Ok(format!("/deployments/{name}"));
        }

        let closed = variables.close_set(&mut set);
        outcome?;
        closed?;
        variables.mark_deployed(&mut set)?;
        variables.cleanup_unused(&name)?;

        let now = epoch_ms();
        let previous = self.env.store.get_deployment(&name)?;
        self.env.store.put_deployment(&Deployment {
            name: name.clone(),
            manifest_text: self.args.manifest_text.clone(),
            manifest: raw,
            cloud_config_ids: if merged.ignored_cloud_config { Vec::new() } else { cloud_ids },
            runtime_config_ids: runtime_ids,
            teams: if self.args.teams.is_empty() {
                previous.as_ref().map(|d| d.teams.clone()).unwrap_or_default()
            } else {
                self.args.teams.clone()
            },
            created_at: previous.as_ref().map_or(now, |d| d.created_at),
            updated_at: now,
        })?;
        info!(deployment = %name, task_id = ctx.task_id(), "deployment updated");
        Ok(format!("/deployments/{name}"))
    }

    /// Record a first deploy before anything is touched. Existing records
    /// stay as they are until the rollout succeeds.
    fn ensure_deployment(&self, name: &str, raw: &Value) -> JobResult<()> {
        if self.env.store.get_deployment(name)?.is_some() {
            return Ok(());
        }
        let now = epoch_ms();
        self.env.store.put_deployment(&Deployment {
            name: name.to_string(),
            manifest_text: self.args.manifest_text.clone(),
            manifest: raw.clone(),
            cloud_config_ids: Vec::new(),
            runtime_config_ids: Vec::new(),
            teams: self.args.teams.clone(),
            created_at: now,
            updated_at: now,
        })?;
        info!(deployment = %name, "deployment record created");
        Ok(())
    }

    /// Bind links, render specs and, unless this is a dry run, execute.
    #[allow(clippy::too_many_arguments)]
    async fn converge(
        &self,
        ctx: &JobContext,
        lock: &HeldLock,
        merged: &MergedManifest,
        plan: &mut DeploymentPlan,
        releases: &[ReleaseVersion],
        variables: &VariableResolver,
        set: &VariableSet,
    ) -> JobResult<()> {
        let logger = ctx.logger();
        let manifest = &merged.manifest;

        logger.event(PREPARE_STAGE, "Binding links", 3, 4, EventState::Started);
        let (providers, consumers) = collect_intents(manifest, releases, &addresses(plan));
        let resolver = LinkResolver::new(self.env.store.clone());
        let links = if self.args.dry_run {
            resolver.resolve(&manifest.name, &providers, &consumers)?
        } else {
            resolver.bind(&manifest.name, &providers, &consumers)?
        };
        logger.event(PREPARE_STAGE, "Binding links", 3, 4, EventState::Finished);

        logger.event(PREPARE_STAGE, "Rendering templates", 4, 4, EventState::Started);
        variables.ensure_declared(set, &manifest.variables)?;
        render_specs(plan, manifest, releases, &links, |value| {
            variables.interpolate(set, &manifest.variables, value)
        })?;
        logger.event(PREPARE_STAGE, "Rendering templates", 4, 4, EventState::Finished);

        if self.args.dry_run {
            return Ok(());
        }
        ctx.check_cancelled()?;

        let summary = self
            .env
            .executor(ctx)
            .with_cloud_config(merged.cloud.clone())
            .with_variable_set(set.id)
            .with_lock_guard(lock.lost_signal())
            .execute(plan)
            .await?;
        logger.debug(&format!(
            "created {}, updated {}, deleted {}, unchanged {}",
            summary.created, summary.updated, summary.deleted, summary.unchanged
        ));
        Ok(())
    }
}

#[async_trait]
impl Job for UpdateDeployment {
    fn job_type(&self) -> &'static str {
        JOB_TYPE
    }

    async fn perform(&mut self, ctx: &JobContext) -> Result<String, DirectorError> {
        let (manifest, raw) = DeploymentManifest::from_yaml(&self.args.manifest_text)?;
        let lock = self
            .env
            .locks
            .hold(
                &deployment_lock(&manifest.name),
                self.env.config.deployment_lock_timeout(),
                Some(ctx.task_id()),
            )
            .await
            .map_err(DirectorError::from)?;

        let result = self.run(ctx, &lock, manifest, raw).await;
        if let Err(e) = lock.release().await {
            warn!(task_id = ctx.task_id(), error = %e, "failed to release deployment lock");
        }
        result.map_err(DirectorError::from)
    }
}
