//! The `Job` contract and the context a running job sees.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use director_core::DirectorError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{TaskError, TaskResult};
use crate::manager::TaskManager;
use crate::output::TaskLogger;

/// A unit of background work bound to one task.
#[async_trait]
pub trait Job: Send {
    fn job_type(&self) -> &'static str;

    /// Run to completion. The returned string becomes the task result.
    /// Return `DirectorError::TaskCancelled` after observing cancellation.
    async fn perform(&mut self, ctx: &JobContext) -> Result<String, DirectorError>;
}

/// Handed to a job while it runs.
#[derive(Clone)]
pub struct JobContext {
    task_id: u64,
    username: String,
    manager: TaskManager,
    logger: TaskLogger,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(task_id: u64, username: String, manager: TaskManager, cancel: CancellationToken) -> Self {
        let logger = TaskLogger::new(manager.store().clone(), task_id);
        Self {
            task_id,
            username,
            manager,
            logger,
            cancel,
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn logger(&self) -> &TaskLogger {
        &self.logger
    }

    /// Token fired when cancellation of this task is requested.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point: fail with `TaskCancelled` if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), DirectorError> {
        if self.cancel.is_cancelled() {
            self.logger.debug("cancellation observed at safe point");
            return Err(DirectorError::TaskCancelled(self.task_id));
        }
        Ok(())
    }

    /// Record liveness now instead of waiting for the background ticker.
    pub fn checkpoint(&self) -> Result<(), DirectorError> {
        let state = self.manager.checkpoint(self.task_id).map_err(DirectorError::from)?;
        if state == director_state::TaskState::Cancelling {
            self.cancel.cancel();
        }
        Ok(())
    }
}

type JobFactory = Arc<dyn Fn(Value) -> Result<Box<dyn Job>, DirectorError> + Send + Sync>;

/// Builds jobs from a persisted job type and argument document.
#[derive(Default, Clone)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, job_type: &str, factory: F)
    where
        F: Fn(Value) -> Result<Box<dyn Job>, DirectorError> + Send + Sync + 'static,
    {
        self.factories.insert(job_type.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    pub fn build(&self, job_type: &str, args: Value) -> TaskResult<Result<Box<dyn Job>, DirectorError>> {
        let factory = self
            .factories
            .get(job_type)
            .ok_or_else(|| TaskError::UnknownJobType(job_type.to_string()))?;
        Ok(factory(args))
    }
}
