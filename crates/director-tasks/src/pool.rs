//! Job queue and bounded worker pool.
//!
//! Enqueued task ids go into one FIFO channel shared by `workers` loops, so
//! at most `workers` jobs run at once and tasks start in enqueue order as
//! workers free up. Each running job gets a ticker that checkpoints the task
//! and turns a `cancelling` state into a fired cancellation token.

use std::sync::Arc;
use std::time::Duration;

use director_core::DirectorError;
use director_state::TaskState;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{TaskError, TaskResult};
use crate::job::{JobContext, JobRegistry};
use crate::manager::{NewTask, Outcome, TaskManager};

/// How often a running job's task row is polled for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Persists tasks and hands them to the worker pool.
#[derive(Clone)]
pub struct JobQueue {
    manager: TaskManager,
    registry: Arc<JobRegistry>,
    tx: mpsc::UnboundedSender<u64>,
}

impl JobQueue {
    /// Create a queue plus a pool of `workers` loops draining it.
    pub fn start(
        manager: TaskManager,
        registry: JobRegistry,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, WorkerPool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(registry);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|n| {
                tokio::spawn(worker_loop(
                    n,
                    manager.clone(),
                    registry.clone(),
                    rx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();
        info!(workers, "worker pool started");
        let queue = Self { manager, registry, tx };
        (queue, WorkerPool { handles })
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Persist a queued task and dispatch it.
    pub fn enqueue(&self, new: NewTask) -> TaskResult<director_state::Task> {
        if !self.registry.contains(&new.job_type) {
            return Err(TaskError::UnknownJobType(new.job_type));
        }
        let task = self.manager.create_task(new)?;
        self.dispatch(task.id);
        Ok(task)
    }

    /// Re-dispatch tasks left queued by a previous process.
    pub fn recover(&self) -> TaskResult<usize> {
        let queued = self.manager.recover()?;
        for task in &queued {
            info!(task_id = task.id, job_type = %task.job_type, "re-dispatching recovered task");
            self.dispatch(task.id);
        }
        Ok(queued.len())
    }

    fn dispatch(&self, task_id: u64) {
        if self.tx.send(task_id).is_err() {
            warn!(task_id, "worker pool is gone, task stays queued");
        }
    }
}

/// Handles of the running worker loops.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Wait for every worker to stop after shutdown was signalled.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    n: usize,
    manager: TaskManager,
    registry: Arc<JobRegistry>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<u64>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                id = rx.recv() => id,
                _ = shutdown.changed() => None,
            }
        };
        let Some(task_id) = next else {
            debug!(worker = n, "worker shutting down");
            return;
        };
        debug!(worker = n, task_id, "worker picked up task");
        if let Err(e) = run_task(&manager, &registry, task_id).await {
            error!(worker = n, task_id, error = %e, "task bookkeeping failed");
        }
    }
}

/// Run one task through its whole lifecycle.
///
/// A failed task keeps the plain error message in `result`; the `result`
/// output stream gets one JSON line with the error `code` and
/// `description` for clients that need the code.
pub async fn run_task(manager: &TaskManager, registry: &JobRegistry, task_id: u64) -> TaskResult<()> {
    let Some(task) = manager.start(task_id)? else {
        return Ok(());
    };

    let mut job = match registry.build(&task.job_type, task.args.clone())? {
        Ok(job) => job,
        Err(e) => {
            manager.finish(task_id, Outcome::Error(e.to_string()))?;
            return Ok(());
        }
    };

    let cancel = CancellationToken::new();
    let ctx = JobContext::new(task_id, task.username.clone(), manager.clone(), cancel.clone());
    let stop = CancellationToken::new();
    let ticker = tokio::spawn(ticker_loop(manager.clone(), task_id, cancel.clone(), stop.clone()));

    info!(task_id, job_type = job.job_type(), "job started");
    let result = job.perform(&ctx).await;
    stop.cancel();
    let _ = ticker.await;

    let outcome = match result {
        Ok(result) => {
            ctx.logger().result(&result);
            Outcome::Done(result)
        }
        Err(DirectorError::TaskCancelled(_)) => Outcome::Cancelled,
        Err(e) => {
            ctx.logger().debug(&format!("job failed: {e}"));
            ctx.logger().result(&error_result(&e));
            Outcome::Error(e.to_string())
        }
    };

    match manager.finish(task_id, outcome) {
        Ok(task) => info!(task_id, state = task.state.as_str(), "job finished"),
        // Already terminal, e.g. timed out by a sweeper while running.
        Err(TaskError::UnexpectedState(msg)) => warn!(task_id, %msg, "could not record job outcome"),
        Err(e) => return Err(e),
    }
    manager.prune(&task.job_type)?;
    Ok(())
}

fn error_result(e: &DirectorError) -> String {
    serde_json::json!({ "code": e.code(), "description": e.to_string() }).to_string()
}

async fn ticker_loop(manager: TaskManager, task_id: u64, cancel: CancellationToken, stop: CancellationToken) {
    let checkpoint_every = manager.config().checkpoint_interval;
    let mut since_checkpoint = Duration::ZERO;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(CANCEL_POLL) => {}
            _ = stop.cancelled() => return,
        }
        since_checkpoint += CANCEL_POLL;
        let state = if since_checkpoint >= checkpoint_every {
            since_checkpoint = Duration::ZERO;
            manager.checkpoint(task_id)
        } else {
            manager.find_task(task_id).map(|t| t.state)
        };
        match state {
            Ok(TaskState::Cancelling) if !cancel.is_cancelled() => {
                info!(task_id, "cancellation requested, signalling job");
                cancel.cancel();
            }
            Ok(_) => {}
            Err(e) => warn!(task_id, error = %e, "task checkpoint failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::manager::TaskConfig;
    use async_trait::async_trait;
    use director_state::StateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sleepy {
        millis: u64,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for Sleepy {
        fn job_type(&self) -> &'static str {
            "sleepy"
        }

        async fn perform(&mut self, ctx: &JobContext) -> Result<String, DirectorError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let deadline = tokio::time::Instant::now() + Duration::from_millis(self.millis);
            while tokio::time::Instant::now() < deadline {
                if let Err(e) = ctx.check_cancelled() {
                    self.running.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("slept {}", self.millis))
        }
    }

    struct Failing;

    #[async_trait]
    impl Job for Failing {
        fn job_type(&self) -> &'static str {
            "failing"
        }

        async fn perform(&mut self, _ctx: &JobContext) -> Result<String, DirectorError> {
            Err(DirectorError::Cpi("create_vm failed".into()))
        }
    }

    fn registry(running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register("sleepy", move |args| {
            let millis = args.get("millis").and_then(|m| m.as_u64()).unwrap_or(50);
            Ok(Box::new(Sleepy {
                millis,
                running: running.clone(),
                peak: peak.clone(),
            }) as Box<dyn Job>)
        });
        registry.register("failing", |_| Ok(Box::new(Failing) as Box<dyn Job>));
        registry
    }

    async fn wait_terminal(manager: &TaskManager, id: u64) -> director_state::Task {
        for _ in 0..300 {
            let task = manager.find_task(id).unwrap();
            if task.state.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} did not finish");
    }

    fn new(job_type: &str, args: serde_json::Value) -> NewTask {
        NewTask {
            username: "admin".into(),
            job_type: job_type.into(),
            description: job_type.into(),
            args,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let manager = TaskManager::new(StateStore::open_in_memory().unwrap(), TaskConfig::default());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = watch::channel(false);
        let (queue, _pool) = JobQueue::start(manager.clone(), registry(running, peak.clone()), 2, rx);

        let ids: Vec<u64> = (0..5)
            .map(|_| queue.enqueue(new("sleepy", serde_json::json!({"millis": 60}))).unwrap().id)
            .collect();
        for id in ids {
            let task = wait_terminal(&manager, id).await;
            assert_eq!(task.state, TaskState::Done);
            assert_eq!(task.result.as_deref(), Some("slept 60"));
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn failing_job_marks_error_with_description() {
        let manager = TaskManager::new(StateStore::open_in_memory().unwrap(), TaskConfig::default());
        let (_tx, rx) = watch::channel(false);
        let reg = registry(Arc::default(), Arc::default());
        let (queue, _pool) = JobQueue::start(manager.clone(), reg, 1, rx);

        let task = queue.enqueue(new("failing", serde_json::Value::Null)).unwrap();
        let task = wait_terminal(&manager, task.id).await;
        assert_eq!(task.state, TaskState::Error);
        assert_eq!(task.result.as_deref(), Some("CPI error: create_vm failed"));

        let stream = crate::output::read_output(manager.store(), task.id, director_state::OutputStream::Result, None)
            .unwrap()
            .unwrap();
        let line = String::from_utf8(stream.bytes).unwrap();
        let result: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(result["code"], director_core::codes::CPI_ERROR);
        assert_eq!(result["description"], "CPI error: create_vm failed");
    }

    #[tokio::test]
    async fn running_job_observes_cancellation() {
        let manager = TaskManager::new(StateStore::open_in_memory().unwrap(), TaskConfig::default());
        let (_tx, rx) = watch::channel(false);
        let reg = registry(Arc::default(), Arc::default());
        let (queue, _pool) = JobQueue::start(manager.clone(), reg, 1, rx);

        let task = queue.enqueue(new("sleepy", serde_json::json!({"millis": 5000}))).unwrap();
        for _ in 0..100 {
            if manager.find_task(task.id).unwrap().state == TaskState::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        manager.cancel(task.id).unwrap();
        let task = wait_terminal(&manager, task.id).await;
        assert_eq!(task.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn unknown_job_type_is_rejected_at_enqueue() {
        let manager = TaskManager::new(StateStore::open_in_memory().unwrap(), TaskConfig::default());
        let (_tx, rx) = watch::channel(false);
        let (queue, _pool) = JobQueue::start(manager, JobRegistry::new(), 1, rx);
        assert!(matches!(
            queue.enqueue(new("nope", serde_json::Value::Null)),
            Err(TaskError::UnknownJobType(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_workers() {
        let manager = TaskManager::new(StateStore::open_in_memory().unwrap(), TaskConfig::default());
        let (tx, rx) = watch::channel(false);
        let (_queue, pool) = JobQueue::start(manager, JobRegistry::new(), 3, rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), pool.join()).await.unwrap();
    }
}
