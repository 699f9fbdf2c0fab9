//! Task scheduling for CPU-side density generation and meshing
//!
//! Work is handed to a [`TaskScheduler`] as a boxed closure. `submit` wraps
//! it so the result (or the panic that replaced it) travels back over a
//! oneshot channel, and returns a [`TaskHandle`] the coordinating thread
//! polls once per tick.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::oneshot;

use crate::core::types::Result;
use crate::core::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs somewhere, now or later
pub trait TaskScheduler: Send + Sync {
    fn spawn(&self, job: Job);

    /// Short name for logs
    fn name(&self) -> &'static str;
}

impl dyn TaskScheduler {
    /// Run `f` on the scheduler and get a handle to its result
    pub fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f)).map_err(panic_message);
            // The receiver is gone when the task was cancelled
            let _ = tx.send(result);
        }));
        TaskHandle { rx: Some(rx) }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

/// Result of a non-blocking poll
#[derive(Debug)]
pub enum TaskState<T> {
    Pending,
    Done(T),
    Failed(String),
}

/// Receiving end of a submitted task
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Option<oneshot::Receiver<std::result::Result<T, String>>>,
}

impl<T> TaskHandle<T> {
    /// Check for completion without blocking
    ///
    /// `Done` and `Failed` are returned once; later polls report the
    /// handle as consumed.
    pub fn poll(&mut self) -> TaskState<T> {
        let Some(rx) = self.rx.as_mut() else {
            return TaskState::Failed("task result already taken".to_string());
        };
        match rx.try_recv() {
            Ok(result) => {
                self.rx = None;
                match result {
                    Ok(value) => TaskState::Done(value),
                    Err(message) => TaskState::Failed(message),
                }
            }
            Err(oneshot::error::TryRecvError::Empty) => TaskState::Pending,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.rx = None;
                TaskState::Failed("task dropped before completing".to_string())
            }
        }
    }

    /// Block until the task finishes
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(mut self) -> Result<T> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| Error::Task("task result already taken".to_string()))?;
        match rx.blocking_recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(Error::Task(message)),
            Err(_) => Err(Error::Task("task dropped before completing".to_string())),
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.rx.is_none()
    }
}

/// Dedicated rayon pool for terrain work
pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    /// Create a pool; `threads == 0` uses one thread per core
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("terrain-worker-{i}"))
            .build()
            .map_err(|e| Error::Task(format!("failed to build worker pool: {e}")))?;
        log::info!("Terrain worker pool started with {} threads", pool.current_num_threads());
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl TaskScheduler for WorkerPool {
    fn spawn(&self, job: Job) {
        self.pool.spawn_fifo(job);
    }

    fn name(&self) -> &'static str {
        "worker-pool"
    }
}

/// Runs every job immediately on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl TaskScheduler for InlineScheduler {
    fn spawn(&self, job: Job) {
        job();
    }

    fn name(&self) -> &'static str {
        "inline"
    }
}
