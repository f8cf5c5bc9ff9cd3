//! director-tasks — asynchronous, cancellable, checkpointed background jobs.
//!
//! A task is the persisted record of one job invocation. `JobQueue`
//! persists it and hands its id to a bounded `WorkerPool`; `TaskManager`
//! owns the state machine, timeout detection, cancellation and pruning;
//! `TaskLogger` writes the event/result/debug output streams.

pub mod error;
pub mod job;
pub mod manager;
pub mod output;
pub mod pool;

pub use error::{TaskError, TaskResult};
pub use job::{Job, JobContext, JobRegistry};
pub use manager::{run_timeout_sweeper, NewTask, Outcome, TaskConfig, TaskFilter, TaskManager};
pub use output::{read_output, ByteRange, Event, EventState, OutputSlice, TaskLogger};
pub use pool::{run_task, JobQueue, WorkerPool};
