// worker thread stuff
use super::queue::TaskQueue;
use super::task::{Admitted, TaskRef};
use crate::error::{Error, Result};
use crate::telemetry::Metrics;
use crate::util::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

struct Shared {
    queue: Arc<dyn TaskQueue>,
    // Held while a task is claimed so cancel never misses a hand-off.
    current: Mutex<Option<TaskRef>>,
    // Bumped by terminate; a loop exits once it no longer matches its own.
    epoch: AtomicU64,
    metrics: Arc<Metrics>,
    idle_yields: u32,
}

/// One OS thread bound to a [`TaskQueue`].
///
/// The thread pulls a task, runs it to completion, and loops until
/// [`WorkerExecutor::terminate`] is called.
pub struct WorkerExecutor {
    name: String,
    stack_size: Option<usize>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerExecutor {
    pub fn new(
        name: String,
        queue: Arc<dyn TaskQueue>,
        metrics: Arc<Metrics>,
        stack_size: Option<usize>,
        idle_yields: u32,
    ) -> Self {
        Self {
            name,
            stack_size,
            shared: Arc::new(Shared {
                queue,
                current: Mutex::new(None),
                epoch: AtomicU64::new(0),
                metrics,
                idle_yields,
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.thread.lock().is_some()
    }

    pub fn current_task(&self) -> Option<TaskRef> {
        self.shared.current.lock().clone()
    }

    /// Start the worker thread. Starting twice is a no-op.
    pub fn execute(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared = self.shared.clone();
        let epoch = shared.epoch.load(Ordering::Acquire);
        let handle = builder
            .spawn(move || run(shared, epoch))
            .map_err(|e| Error::executor(format!("spawn failed: {}", e)))?;

        debug!(worker = %self.name, "worker started");
        *thread = Some(handle);
        Ok(())
    }

    /// Stop the thread, cancelling whatever it is running, and join it.
    pub fn terminate(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = self.shared.current.lock().as_ref() {
            task.cancel();
            self.shared.metrics.record_task_cancelled();
        }

        if handle.thread().id() == thread::current().id() {
            // Terminated from one of its own tasks; the loop exits on its own.
            warn!(worker = %self.name, "worker terminated from its own thread, detaching");
        } else if handle.join().is_err() {
            error!(worker = %self.name, "worker thread panicked");
        }

        *self.shared.current.lock() = None;
        debug!(worker = %self.name, "worker terminated");
    }

    /// Cancel `task` if it is the one this worker is running.
    pub fn cancel_task_if_running(&self, task: &TaskRef) -> bool {
        let current = self.shared.current.lock();
        match current.as_ref() {
            Some(running) if running.id() == task.id() => {
                running.cancel();
                self.shared.metrics.record_task_cancelled();
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("name", &self.name)
            .field("started", &self.is_started())
            .field("current", &self.current_task().map(|t| t.id()))
            .finish()
    }
}

impl Drop for WorkerExecutor {
    fn drop(&mut self) {
        self.terminate();
    }
}

// main loop
fn run(shared: Arc<Shared>, epoch: u64) {
    let mut backoff = Backoff::new(shared.idle_yields);

    loop {
        let admitted = {
            let mut current = shared.current.lock();
            if shared.epoch.load(Ordering::Acquire) != epoch {
                break;
            }

            match shared.queue.dequeue() {
                Some(task) => match Admitted::try_new(&task) {
                    Some(admitted) => {
                        *current = Some(task);
                        Some(admitted)
                    }
                    None => {
                        debug!(task_id = %task.id(), "task already running elsewhere, skipped");
                        None
                    }
                },
                None => None,
            }
        };

        let Some(admitted) = admitted else {
            backoff.snooze();
            continue;
        };

        backoff.reset();
        let task_id = admitted.task().id();
        let start = Instant::now();
        admitted.execute();
        let elapsed = start.elapsed();

        shared.metrics.record_task_execution(elapsed);
        *shared.current.lock() = None;
        trace!(task_id = %task_id, elapsed_us = elapsed.as_micros() as u64, "task finished");
    }
}
