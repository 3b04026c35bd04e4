use super::queue::{FifoQueue, TaskQueue};
use super::task::TaskRef;
use super::worker::WorkerExecutor;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::telemetry::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Started,
    Terminated,
}

/// A fixed set of workers pulling from one shared FIFO queue.
///
/// Tasks may be added before or after [`ThreadPool::execute`]. Queue depth is
/// unbounded.
pub struct ThreadPool {
    queue: Arc<FifoQueue>,
    workers: Vec<WorkerExecutor>,
    lifecycle: Mutex<Lifecycle>,
    metrics: Arc<Metrics>,
}

impl ThreadPool {
    /// Pool with `num_threads` workers and otherwise default settings.
    pub fn new(num_threads: usize) -> Result<Self> {
        let config = Config::builder().num_threads(num_threads).build()?;
        Self::with_config(&config)
    }

    pub fn with_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let num_threads = config.worker_threads();
        let queue = Arc::new(FifoQueue::new());
        let metrics = Arc::new(Metrics::new());

        let workers = (0..num_threads)
            .map(|id| {
                WorkerExecutor::new(
                    format!("{}-worker-{}", config.thread_name_prefix, id),
                    queue.clone(),
                    metrics.clone(),
                    config.stack_size,
                    config.idle_yields,
                )
            })
            .collect();

        Ok(Self {
            queue,
            workers,
            lifecycle: Mutex::new(Lifecycle::Idle),
            metrics,
        })
    }

    /// Enqueue without blocking. Ignored once the pool is terminated.
    pub fn add_task(&self, task: TaskRef) {
        if *self.lifecycle.lock() == Lifecycle::Terminated {
            debug!(task_id = %task.id(), "pool terminated, task dropped");
            return;
        }
        self.queue.enqueue(task);
    }

    /// Drop `task` if it is still queued, and cancel it if a worker is
    /// running it.
    pub fn cancel_task(&self, task: &TaskRef) {
        if self.queue.erase(task) {
            debug!(task_id = %task.id(), "pending task removed");
        }
        for worker in &self.workers {
            if worker.cancel_task_if_running(task) {
                debug!(task_id = %task.id(), worker = worker.name(), "running task cancelled");
            }
        }
    }

    /// Start every worker. Calling it again is a no-op; calling it after
    /// [`ThreadPool::terminate`] is an error.
    pub fn execute(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Started => return Ok(()),
            Lifecycle::Terminated => return Err(Error::Terminated),
            Lifecycle::Idle => {}
        }

        for worker in &self.workers {
            if let Err(e) = worker.execute() {
                for started in &self.workers {
                    started.terminate();
                }
                return Err(e);
            }
        }

        *lifecycle = Lifecycle::Started;
        debug!(workers = self.workers.len(), "thread pool started");
        Ok(())
    }

    /// Stop all workers, cancelling running tasks, and discard the queue.
    pub fn terminate(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Terminated {
            return;
        }
        *lifecycle = Lifecycle::Terminated;
        drop(lifecycle);

        for worker in &self.workers {
            worker.terminate();
        }
        self.queue.clear();
        debug!("thread pool terminated");
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    pub fn is_started(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Started
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads())
            .field("pending_tasks", &self.pending_tasks())
            .field("lifecycle", &*self.lifecycle.lock())
            .finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.terminate();
    }
}
