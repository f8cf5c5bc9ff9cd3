//! Task manager: the persisted task state machine.
//!
//! ```text
//! queued ──▶ processing ──▶ done | error
//!   │            │  └──(stale checkpoint)──▶ timeout
//!   └──────┬─────┘
//!          ▼
//!     cancelling ──▶ cancelled | done | error
//! ```
//!
//! Timeout is detected lazily: any read through `find_task`/`select` and
//! the periodic sweep force a processing task whose checkpoint is older than
//! `timeout` into `timeout`. The worker is not stopped by this.

use std::time::Duration;

use director_core::{epoch_ms, DirectorConfig};
use director_state::{StateStore, Task, TaskState};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{TaskError, TaskResult};

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub checkpoint_interval: Duration,
    /// Checkpoint age after which a processing task is timed out.
    pub timeout: Duration,
    /// Finished tasks retained per job type.
    pub max_tasks: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            max_tasks: 100,
        }
    }
}

impl TaskConfig {
    pub fn from_director(config: &DirectorConfig) -> Self {
        Self {
            checkpoint_interval: config.task_checkpoint_interval(),
            timeout: config.task_timeout(),
            max_tasks: config.max_tasks,
        }
    }
}

/// Parameters of a new task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub username: String,
    pub job_type: String,
    pub description: String,
    pub args: Value,
    pub deployment: Option<String>,
    pub context_id: Option<String>,
    pub teams: Vec<String>,
}

/// Filter for `select`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub states: Option<Vec<TaskState>>,
    pub deployment: Option<String>,
    pub job_types: Option<Vec<String>>,
    pub context_id: Option<String>,
    /// Tasks visible to a caller restricted to these teams.
    pub teams: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&task.state) {
                return false;
            }
        }
        if let Some(deployment) = &self.deployment {
            if task.deployment.as_deref() != Some(deployment.as_str()) {
                return false;
            }
        }
        if let Some(types) = &self.job_types {
            if !types.iter().any(|t| t == &task.job_type) {
                return false;
            }
        }
        if let Some(context_id) = &self.context_id {
            if task.context_id.as_deref() != Some(context_id.as_str()) {
                return false;
            }
        }
        if let Some(teams) = &self.teams {
            if !task.teams.iter().any(|t| teams.contains(t)) {
                return false;
            }
        }
        true
    }
}

/// Final outcome reported by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done(String),
    Error(String),
    Cancelled,
}

#[derive(Clone)]
pub struct TaskManager {
    store: StateStore,
    config: TaskConfig,
}

impl TaskManager {
    pub fn new(store: StateStore, config: TaskConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Persist a queued task.
    pub fn create_task(&self, new: NewTask) -> TaskResult<Task> {
        let task = self.store.create_task(Task {
            id: 0,
            state: TaskState::Queued,
            job_type: new.job_type,
            description: new.description,
            username: new.username,
            deployment: new.deployment,
            context_id: new.context_id,
            teams: new.teams,
            args: new.args,
            result: None,
            created_at: epoch_ms(),
            started_at: None,
            checkpoint_at: None,
            finished_at: None,
        })?;
        info!(task_id = task.id, job_type = %task.job_type, "task queued");
        Ok(task)
    }

    /// Look up a task, timing it out first if its checkpoint went stale.
    pub fn find_task(&self, id: u64) -> TaskResult<Task> {
        let task = self.store.get_task(id)?.ok_or(TaskError::NotFound(id))?;
        self.timeout_if_stale(task, epoch_ms())
    }

    /// Tasks matching `filter`, newest first.
    pub fn select(&self, filter: &TaskFilter) -> TaskResult<Vec<Task>> {
        let now = epoch_ms();
        let mut tasks = Vec::new();
        for task in self.store.list_tasks()?.into_iter().rev() {
            let task = self.timeout_if_stale(task, now)?;
            if filter.matches(&task) {
                tasks.push(task);
                if filter.limit.is_some_and(|limit| tasks.len() >= limit) {
                    break;
                }
            }
        }
        Ok(tasks)
    }

    /// Request cancellation. Only queued or processing tasks may be cancelled.
    pub fn cancel(&self, id: u64) -> TaskResult<Task> {
        let task = self.store.update_task(id, |task| {
            if !matches!(task.state, TaskState::Queued | TaskState::Processing) {
                return Err(TaskError::UnexpectedState(format!(
                    "Cannot cancel task {}: invalid state ({})",
                    task.id,
                    task.state.as_str()
                )));
            }
            task.state = TaskState::Cancelling;
            Ok(())
        })?;
        info!(task_id = id, "task cancellation requested");
        Ok(task)
    }

    /// Cancel every queued or processing task matching `filter`; tasks in
    /// other states are skipped. Returns the cancelled tasks.
    pub fn cancel_all(&self, filter: &TaskFilter) -> TaskResult<Vec<Task>> {
        let filter = TaskFilter {
            states: Some(vec![TaskState::Queued, TaskState::Processing]),
            ..filter.clone()
        };
        let mut cancelled = Vec::new();
        for task in self.select(&filter)? {
            match self.cancel(task.id) {
                Ok(task) => cancelled.push(task),
                Err(TaskError::UnexpectedState(msg)) => debug!(task_id = task.id, %msg, "skipped"),
                Err(e) => return Err(e),
            }
        }
        Ok(cancelled)
    }

    /// Move a picked-up task to processing. A task cancelled while queued is
    /// finished as cancelled instead and `None` is returned.
    pub fn start(&self, id: u64) -> TaskResult<Option<Task>> {
        let now = epoch_ms();
        let task = self.store.update_task(id, |task| {
            match task.state {
                TaskState::Queued => {
                    task.state = TaskState::Processing;
                    task.started_at = Some(now);
                    task.checkpoint_at = Some(now);
                }
                TaskState::Cancelling => {
                    task.state = TaskState::Cancelled;
                    task.finished_at = Some(now);
                }
                other => {
                    return Err(TaskError::UnexpectedState(format!(
                        "Cannot start task {}: invalid state ({})",
                        task.id,
                        other.as_str()
                    )));
                }
            }
            Ok(())
        })?;
        if task.state == TaskState::Processing {
            debug!(task_id = id, "task processing");
            Ok(Some(task))
        } else {
            info!(task_id = id, "task cancelled before start");
            Ok(None)
        }
    }

    /// Record that the worker is alive. Returns the current state so the
    /// caller can notice a cancellation request.
    pub fn checkpoint(&self, id: u64) -> TaskResult<TaskState> {
        let now = epoch_ms();
        let task = self.store.update_task(id, |task| {
            if task.state.is_active() {
                task.checkpoint_at = Some(now);
            }
            Ok::<_, TaskError>(())
        })?;
        Ok(task.state)
    }

    /// Record the final outcome. Fails if the task already reached a
    /// terminal state (for example a timeout raised by a sweeper).
    pub fn finish(&self, id: u64, outcome: Outcome) -> TaskResult<Task> {
        let now = epoch_ms();
        let (next, result) = match outcome {
            Outcome::Done(result) => (TaskState::Done, Some(result)),
            Outcome::Error(message) => (TaskState::Error, Some(message)),
            Outcome::Cancelled => (TaskState::Cancelled, Some("task cancelled".to_string())),
        };
        let task = self.store.update_task(id, |task| {
            if !task.state.can_transition_to(next) {
                return Err(TaskError::UnexpectedState(format!(
                    "Cannot finish task {} as {}: invalid state ({})",
                    task.id,
                    next.as_str(),
                    task.state.as_str()
                )));
            }
            task.state = next;
            task.result = result;
            task.finished_at = Some(now);
            Ok(())
        })?;
        info!(task_id = id, state = next.as_str(), "task finished");
        Ok(task)
    }

    fn timeout_if_stale(&self, task: Task, now_ms: u64) -> TaskResult<Task> {
        if !self.is_stale(&task, now_ms) {
            return Ok(task);
        }
        let id = task.id;
        let timeout_ms = self.config.timeout.as_millis() as u64;
        let updated = self.store.update_task(id, |task| {
            // Re-check inside the transaction; the worker may have checkpointed.
            if is_stale(task, now_ms, timeout_ms) {
                task.state = TaskState::Timeout;
                task.finished_at = Some(now_ms);
            }
            Ok::<_, TaskError>(())
        })?;
        if updated.state == TaskState::Timeout {
            warn!(task_id = id, "task checkpoint went stale, marked timeout");
        }
        Ok(updated)
    }

    fn is_stale(&self, task: &Task, now_ms: u64) -> bool {
        is_stale(task, now_ms, self.config.timeout.as_millis() as u64)
    }

    /// Time out every processing task with a stale checkpoint.
    pub fn mark_timeouts(&self) -> TaskResult<Vec<u64>> {
        let now = epoch_ms();
        let mut timed_out = Vec::new();
        for task in self.store.list_tasks()? {
            if self.is_stale(&task, now) {
                let task = self.timeout_if_stale(task, now)?;
                if task.state == TaskState::Timeout {
                    timed_out.push(task.id);
                }
            }
        }
        Ok(timed_out)
    }

    /// Keep the newest `max_tasks` finished tasks of `job_type`; delete older
    /// ones along with their output.
    pub fn prune(&self, job_type: &str) -> TaskResult<usize> {
        let finished: Vec<Task> = self
            .store
            .list_tasks()?
            .into_iter()
            .filter(|t| t.job_type == job_type && t.state.is_terminal())
            .collect();
        let excess = finished.len().saturating_sub(self.config.max_tasks);
        for task in finished.iter().take(excess) {
            self.store.delete_task(task.id)?;
        }
        if excess > 0 {
            debug!(%job_type, removed = excess, "pruned old tasks");
        }
        Ok(excess)
    }

    /// Startup recovery: time out stale processing tasks left by a previous
    /// process and return queued tasks for re-dispatch, oldest first.
    pub fn recover(&self) -> TaskResult<Vec<Task>> {
        let timed_out = self.mark_timeouts()?;
        if !timed_out.is_empty() {
            warn!(count = timed_out.len(), "timed out tasks abandoned by a previous process");
        }
        let queued: Vec<Task> = self
            .store
            .list_tasks()?
            .into_iter()
            .filter(|t| matches!(t.state, TaskState::Queued | TaskState::Cancelling) && t.started_at.is_none())
            .collect();
        Ok(queued)
    }
}

fn is_stale(task: &Task, now_ms: u64, timeout_ms: u64) -> bool {
    if !matches!(task.state, TaskState::Processing | TaskState::Cancelling) {
        return false;
    }
    match task.checkpoint_at {
        Some(at) => now_ms.saturating_sub(at) > timeout_ms,
        None => false,
    }
}

/// Periodically time out stalled tasks until shutdown is signalled.
pub async fn run_timeout_sweeper(manager: TaskManager, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = manager.mark_timeouts() {
                    warn!(error = %e, "task timeout sweep failed");
                }
            }
            _ = shutdown.changed() => {
                debug!("task timeout sweeper shutting down");
                break;
            }
        }
    }
}
