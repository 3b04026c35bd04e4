//! Bounded-concurrency task manager.
//!
//! Every admitted task gets a dedicated thread. When a task finishes, its
//! thread reports back and the manager refills the freed slot from the
//! pending list, so a single [`TaskManager::execute_all_tasks`] call drains
//! the whole backlog.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{Admitted, TaskId, TaskRef};
use crate::telemetry::Metrics;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

struct Slot {
    task: TaskRef,
    handle: Option<JoinHandle<()>>,
    thread: ThreadId,
}

#[derive(Default)]
struct State {
    pending: VecDeque<TaskRef>,
    running: HashMap<TaskId, Slot>,
    stopping: bool,
    finalized: bool,
}

impl State {
    fn pending_position(&self, id: TaskId) -> Option<usize> {
        self.pending.iter().position(|t| t.id() == id)
    }
}

struct Inner {
    config: Config,
    state: Mutex<State>,
    // Signalled whenever the running set shrinks.
    idle: Condvar,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Clone, Copy)]
enum Wait {
    No,
    Forever,
    For(Duration),
}

/// Spawn-per-task scheduler capped at `max_concurrency` running tasks.
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(max_concurrency: usize) -> Result<Self> {
        let config = Config::builder().max_concurrency(max_concurrency).build()?;
        Self::with_config(&config)
    }

    pub fn with_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                state: Mutex::new(State::default()),
                idle: Condvar::new(),
                metrics: Arc::new(Metrics::new()),
            }),
        })
    }

    /// Append to the pending list. Nothing is spawned until
    /// [`TaskManager::execute_all_tasks`].
    pub fn add_task(&self, task: TaskRef) {
        let mut state = self.inner.state.lock();
        if state.finalized {
            debug!(task_id = %task.id(), "manager finalized, task dropped");
            return;
        }
        let id = task.id();
        if state.running.contains_key(&id) || state.pending_position(id).is_some() {
            return;
        }
        state.pending.push_back(task);
    }

    /// Admit pending tasks up to the concurrency limit.
    pub fn execute_all_tasks(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.finalized {
            return Err(Error::Finalized);
        }
        state.stopping = false;
        self.inner.admit(&mut state)
    }

    /// Remove `task` from the pending list and signal it if running.
    ///
    /// With `blocking`, waits (without bound) until the task has stopped and
    /// joins its thread; otherwise the thread is left to finish detached.
    pub fn cancel_task(&self, task: &TaskRef, blocking: bool) {
        let wait = if blocking { Wait::Forever } else { Wait::No };
        self.cancel_with(task, wait);
    }

    /// Blocking cancel bounded by `timeout`.
    pub fn cancel_task_timeout(&self, task: &TaskRef, timeout: Duration) -> Result<()> {
        if self.cancel_with(task, Wait::For(timeout)) {
            Ok(())
        } else {
            Err(Error::CancelTimeout(timeout))
        }
    }

    /// Cancel everything and block until no task is running.
    ///
    /// The pending list is discarded. [`TaskManager::execute_all_tasks`]
    /// re-arms the manager afterwards.
    pub fn stop_all_tasks(&self) {
        let me = thread::current().id();
        let mut handles = Vec::new();

        let mut state = self.inner.state.lock();
        state.stopping = true;
        state.pending.clear();

        for slot in state.running.values_mut() {
            slot.task.cancel();
            self.inner.metrics.record_task_cancelled();
            if slot.thread != me {
                handles.extend(slot.handle.take());
            }
        }

        // A task stopping its own manager cannot wait for itself.
        while state.running.values().any(|slot| slot.thread != me) {
            self.inner.idle.wait(&mut state);
        }
        drop(state);

        for handle in handles {
            if handle.join().is_err() {
                error!("task thread panicked");
            }
        }
        debug!("all tasks stopped");
    }

    /// Whether any admitted task is currently running.
    pub fn is_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .running
            .values()
            .any(|slot| slot.task.is_running())
    }

    pub fn is_remaining_tasks(&self) -> bool {
        !self.inner.state.lock().pending.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.config.max_concurrency
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Stop everything and release all references. The manager rejects
    /// further work afterwards.
    pub fn finalize(&self) {
        if self.inner.state.lock().finalized {
            return;
        }
        self.stop_all_tasks();

        let mut state = self.inner.state.lock();
        state.finalized = true;
        state.pending.clear();
        state.running.clear();
        debug!("task manager finalized");
    }

    // Returns false only when a bounded wait expired.
    fn cancel_with(&self, task: &TaskRef, wait: Wait) -> bool {
        let id = task.id();
        let (running, thread) = {
            let mut state = self.inner.state.lock();
            if let Some(pos) = state.pending_position(id) {
                state.pending.remove(pos);
                debug!(task_id = %id, "pending task removed");
            }
            match state.running.get(&id) {
                Some(slot) => (slot.task.clone(), slot.thread),
                None => return true,
            }
        };

        running.cancel();
        self.inner.metrics.record_task_cancelled();
        debug!(task_id = %id, ?wait, "running task cancelled");

        if thread == thread::current().id() {
            if !matches!(wait, Wait::No) {
                warn!(task_id = %id, "task cancelled itself, not waiting");
            }
            return true;
        }

        let stopped = match wait {
            Wait::No => return true,
            Wait::Forever => running.state().wait_stopped(None),
            Wait::For(timeout) => running.state().wait_stopped(Some(timeout)),
        };
        if !stopped {
            return false;
        }

        let handle = self
            .inner
            .state
            .lock()
            .running
            .get_mut(&id)
            .filter(|slot| slot.thread == thread)
            .and_then(|slot| slot.handle.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(task_id = %id, "task thread panicked");
            }
        }
        true
    }
}

impl Inner {
    fn admit(self: &Arc<Self>, state: &mut State) -> Result<()> {
        let max = self.config.max_concurrency;
        let mut idx = 0;

        while state.running.len() < max && idx < state.pending.len() {
            let task = state.pending[idx].clone();
            // Running elsewhere; leave it queued for a later pass.
            let Some(admitted) = Admitted::try_new(&task) else {
                idx += 1;
                continue;
            };
            state.pending.remove(idx);

            let id = task.id();
            let weak = Arc::downgrade(self);
            let metrics = self.metrics.clone();
            let spawned = self
                .config
                .thread_builder(format!("{}-task-{}", self.config.thread_name_prefix, id))
                .spawn(move || {
                    let _report = Completion { manager: weak, id };
                    let start = Instant::now();
                    admitted.execute();
                    metrics.record_task_execution(start.elapsed());
                });

            match spawned {
                Ok(handle) => {
                    let thread = handle.thread().id();
                    state.running.insert(
                        id,
                        Slot {
                            task,
                            handle: Some(handle),
                            thread,
                        },
                    );
                    debug!(task_id = %id, running = state.running.len(), "task admitted");
                }
                Err(e) => {
                    state.pending.insert(idx, task);
                    return Err(Error::executor(format!("spawn failed: {}", e)));
                }
            }
        }
        Ok(())
    }
}

// Reports back to the manager when the task thread exits, unwinding included.
struct Completion {
    manager: Weak<Inner>,
    id: TaskId,
}

impl Drop for Completion {
    fn drop(&mut self) {
        on_task_completion(&self.manager, self.id);
    }
}

fn on_task_completion(manager: &Weak<Inner>, id: TaskId) {
    let Some(inner) = manager.upgrade() else {
        return;
    };

    let mut state = inner.state.lock();
    // Dropping our own handle detaches this thread.
    state.running.remove(&id);
    inner.idle.notify_all();

    if state.stopping || state.finalized {
        return;
    }
    if let Err(e) = inner.admit(&mut state) {
        error!(error = %e, "failed to admit pending task");
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TaskManager")
            .field("max_concurrency", &self.inner.config.max_concurrency)
            .field("pending", &state.pending.len())
            .field("running", &state.running.len())
            .field("finalized", &state.finalized)
            .finish()
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::task::tests::SleepyTask;
    use crate::executor::{Task, TaskState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackedTask {
        state: TaskState,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        runs: AtomicUsize,
        millis: u64,
    }

    impl Task for TrackedTask {
        fn state(&self) -> &TaskState {
            &self.state
        }

        fn on_run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.state.wait_cancelled(Duration::from_millis(self.millis));
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn tracked(n: usize, millis: u64) -> (Vec<Arc<TrackedTask>>, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..n)
            .map(|_| {
                Arc::new(TrackedTask {
                    state: TaskState::new(),
                    active: active.clone(),
                    peak: peak.clone(),
                    runs: AtomicUsize::new(0),
                    millis,
                })
            })
            .collect();
        (tasks, peak)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_capacity_and_refill() {
        let manager = TaskManager::new(4).unwrap();
        let (tasks, peak) = tracked(6, 30);
        for task in &tasks {
            manager.add_task(task.clone());
        }

        manager.execute_all_tasks().unwrap();
        assert_eq!(manager.running_count(), 4);
        assert_eq!(manager.pending_count(), 2);
        assert!(manager.is_remaining_tasks());

        wait_until(|| manager.running_count() == 0 && !manager.is_remaining_tasks());

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(tasks.iter().all(|t| t.runs.load(Ordering::SeqCst) == 1));
        assert_eq!(manager.metrics().snapshot().tasks_executed, 6);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(TaskManager::new(0).is_err());
    }

    #[test]
    fn test_duplicate_add_ignored() {
        let manager = TaskManager::new(1).unwrap();
        let task: TaskRef = SleepyTask::new(1);
        manager.add_task(task.clone());
        manager.add_task(task);
        assert_eq!(manager.pending_count(), 1);
    }

    #[test]
    fn test_blocking_cancel_waits() {
        let manager = TaskManager::new(2).unwrap();
        let task = SleepyTask::new(60_000);
        let task_ref: TaskRef = task.clone();

        manager.add_task(task_ref.clone());
        manager.execute_all_tasks().unwrap();
        assert!(task.is_running());

        manager.cancel_task(&task_ref, true);
        assert!(!task.is_running());
        assert!(task.saw_cancel.load(Ordering::SeqCst));
        wait_until(|| manager.running_count() == 0);
    }

    #[test]
    fn test_cancel_pending_task() {
        let manager = TaskManager::new(1).unwrap();
        let blocker: TaskRef = SleepyTask::new(60_000);
        let queued = SleepyTask::new(1);
        let queued_ref: TaskRef = queued.clone();

        manager.add_task(blocker.clone());
        manager.add_task(queued_ref.clone());
        manager.execute_all_tasks().unwrap();

        manager.cancel_task(&queued_ref, false);
        assert_eq!(manager.pending_count(), 0);

        manager.cancel_task(&blocker, true);
        wait_until(|| manager.running_count() == 0);
        assert_eq!(queued.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_unknown_task_is_noop() {
        let manager = TaskManager::new(1).unwrap();
        let stranger: TaskRef = SleepyTask::new(1);
        manager.cancel_task(&stranger, true);
        assert!(manager.cancel_task_timeout(&stranger, Duration::from_millis(1)).is_ok());
    }

    struct StubbornTask {
        state: TaskState,
        release: Arc<AtomicUsize>,
    }

    impl Task for StubbornTask {
        fn state(&self) -> &TaskState {
            &self.state
        }

        fn on_run(&self) {
            // Ignores cancellation until released.
            while self.release.load(Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn test_cancel_timeout_expires() {
        let manager = TaskManager::new(1).unwrap();
        let release = Arc::new(AtomicUsize::new(0));
        let task: TaskRef = Arc::new(StubbornTask {
            state: TaskState::new(),
            release: release.clone(),
        });

        manager.add_task(task.clone());
        manager.execute_all_tasks().unwrap();

        let result = manager.cancel_task_timeout(&task, Duration::from_millis(20));
        assert!(matches!(result, Err(Error::CancelTimeout(_))));

        release.store(1, Ordering::SeqCst);
        assert!(manager.cancel_task_timeout(&task, Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_cancel_timeout_max_duration() {
        let manager = TaskManager::new(1).unwrap();
        let task = SleepyTask::new(60_000);
        let task_ref: TaskRef = task.clone();

        manager.add_task(task_ref.clone());
        manager.execute_all_tasks().unwrap();

        assert!(manager.cancel_task_timeout(&task_ref, Duration::MAX).is_ok());
        assert!(!task.is_running());
        assert!(task.saw_cancel.load(Ordering::SeqCst));
    }

    struct PanickingTask {
        state: TaskState,
    }

    impl Task for PanickingTask {
        fn state(&self) -> &TaskState {
            &self.state
        }

        fn on_run(&self) {
            thread::sleep(Duration::from_millis(30));
            panic!("task body failed");
        }
    }

    #[test]
    fn test_panicking_task_frees_its_slot() {
        let manager = TaskManager::new(1).unwrap();
        let failing: TaskRef = Arc::new(PanickingTask {
            state: TaskState::new(),
        });
        let next = SleepyTask::new(60_000);

        manager.add_task(failing.clone());
        manager.add_task(next.clone());
        manager.execute_all_tasks().unwrap();
        assert_eq!(manager.pending_count(), 1);

        // The unwinding thread still reports back and admits the next task.
        wait_until(|| next.runs.load(Ordering::SeqCst) == 1);
        assert!(!failing.is_running());
        assert!(failing.state().wait_stopped(Some(Duration::from_secs(1))));

        manager.stop_all_tasks();
        assert_eq!(manager.running_count(), 0);
        assert!(!next.is_running());
    }

    #[test]
    fn test_stop_all_tasks() {
        let manager = TaskManager::new(2).unwrap();
        let tasks: Vec<_> = (0..5).map(|_| SleepyTask::new(60_000)).collect();
        for task in &tasks {
            manager.add_task(task.clone());
        }
        manager.execute_all_tasks().unwrap();
        assert!(manager.is_running());

        manager.stop_all_tasks();
        assert!(!manager.is_running());
        assert_eq!(manager.running_count(), 0);
        assert!(!manager.is_remaining_tasks());
        assert_eq!(
            tasks.iter().filter(|t| t.runs.load(Ordering::SeqCst) == 1).count(),
            2
        );
    }

    #[test]
    fn test_finalize_rejects_reuse() {
        let manager = TaskManager::new(2).unwrap();
        manager.add_task(SleepyTask::new(60_000));
        manager.execute_all_tasks().unwrap();

        manager.finalize();
        manager.finalize();

        manager.add_task(SleepyTask::new(1));
        assert_eq!(manager.pending_count(), 0);
        assert!(matches!(manager.execute_all_tasks(), Err(Error::Finalized)));
    }
}
