//! Task representation and run/cancel lifecycle.
//!
//! A task is anything implementing [`Task`]: it owns a [`TaskState`] and
//! supplies a body in [`Task::on_run`]. Pools, managers and periodic buckets
//! only ever see the capability through a [`TaskRef`], never the concrete
//! type.
//!
//! Cancellation is cooperative. [`Task::cancel`] only raises a flag; the body
//! is expected to poll [`Task::is_cancelled`] (or sleep through
//! [`TaskState::wait_cancelled`]) and return promptly.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global task ID counter
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared handle to a schedulable task.
pub type TaskRef = Arc<dyn Task>;

/// Run/cancel bookkeeping embedded in every task.
pub struct TaskState {
    id: TaskId,
    running: AtomicBool,
    cancel_requested: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            id: TaskId::next(),
            running: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            lock: Mutex::new(()),
            signal: Condvar::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Raise the cancel flag. A no-op unless the task is running.
    pub fn request_cancel(&self) {
        // Start and finish flip `running` under the same lock.
        let _guard = self.lock.lock();
        if !self.is_running() {
            return;
        }
        self.cancel_requested.store(true, Ordering::Release);
        self.signal.notify_all();
    }

    /// Sleep for up to `timeout`, waking early on cancellation.
    ///
    /// Returns `true` if cancellation was requested.
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock.lock();
        while !self.is_cancelled() {
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut guard, deadline).timed_out() {
                        return self.is_cancelled();
                    }
                }
                None => self.signal.wait(&mut guard),
            }
        }
        true
    }

    /// Block until the task is not running.
    ///
    /// With `Some(timeout)` the wait is bounded; returns `false` if the task
    /// was still running when the timeout expired. A timeout too large to
    /// represent as a deadline waits without bound.
    pub fn wait_stopped(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut guard = self.lock.lock();
        while self.is_running() {
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut guard, deadline).timed_out() {
                        return !self.is_running();
                    }
                }
                None => self.signal.wait(&mut guard),
            }
        }
        true
    }

    // Idle -> Running. Fails if another thread already runs this task.
    fn try_start(&self) -> bool {
        let _guard = self.lock.lock();
        let started = self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if started {
            self.cancel_requested.store(false, Ordering::Release);
        }
        started
    }

    fn finish(&self) {
        let _guard = self.lock.lock();
        self.cancel_requested.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.signal.notify_all();
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskState")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("cancel_requested", &self.is_cancelled())
            .finish()
    }
}

/// A cancellable unit of schedulable work.
pub trait Task: Send + Sync + 'static {
    fn state(&self) -> &TaskState;

    /// The work itself. Poll [`Task::is_cancelled`] at safe points.
    fn on_run(&self);

    /// Invoked after [`Task::on_run`] returns.
    fn on_complete(&self) {}

    fn cancel(&self) {
        self.state().request_cancel();
    }

    fn id(&self) -> TaskId {
        self.state().id()
    }

    fn is_running(&self) -> bool {
        self.state().is_running()
    }

    fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    /// Run the body on the calling thread.
    ///
    /// Returns `false` without running anything if the task is already
    /// running elsewhere.
    fn run(&self) -> bool {
        let Some(_guard) = RunGuard::try_new(self.state()) else {
            return false;
        };
        self.on_run();
        self.on_complete();
        true
    }
}

impl fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("state", self.state()).finish()
    }
}

// Returns the task to idle when dropped, including on unwind.
struct RunGuard<'a> {
    state: &'a TaskState,
}

impl<'a> RunGuard<'a> {
    fn try_new(state: &'a TaskState) -> Option<Self> {
        state.try_start().then_some(Self { state })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.finish();
    }
}

/// A task that has already been moved to Running but whose body has not
/// been entered yet.
///
/// Executors claim a task while holding their own bookkeeping lock, so a
/// concurrent cancel can never observe a task that was handed out but still
/// reports idle.
pub(crate) struct Admitted {
    task: TaskRef,
}

impl Admitted {
    pub(crate) fn try_new(task: &TaskRef) -> Option<Self> {
        task.state().try_start().then(|| Self { task: task.clone() })
    }

    pub(crate) fn task(&self) -> &TaskRef {
        &self.task
    }

    pub(crate) fn execute(self) {
        self.task.on_run();
        self.task.on_complete();
    }
}

impl Drop for Admitted {
    fn drop(&mut self) {
        self.task.state().finish();
    }
}
