//! One-shot and repeating timers.
//!
//! A [`Timer`] wraps a task. Repeating timers register a per-timer wrapper
//! with the context's [`PeriodicTaskManager`] at the timer's delay, so
//! timers sharing one task schedule and cancel independently; one-shot timers
//! submit a delay-then-run wrapper to the context's [`ThreadPool`].
//!
//! # Shared context
//!
//! Timers built with [`Timer::new`] share a process-wide [`TimerContext`].
//! The registry only keeps a weak reference: the first live timer creates
//! the context, every timer holds a strong reference, and dropping the last
//! timer tears the context down (terminating its pool and periodic threads).
//! A later timer lazily builds a fresh one. Use [`Timer::with_context`] to
//! inject a context explicitly instead.

use crate::config::Config;
use crate::error::Result;
use crate::executor::{Task, TaskRef, TaskState, ThreadPool};
use crate::scheduler::PeriodicTaskManager;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

static SHARED_CONTEXT: Mutex<Weak<TimerContext>> = Mutex::new(Weak::new());

/// The pool and periodic scheduler timers run on.
pub struct TimerContext {
    pool: ThreadPool,
    periodic: PeriodicTaskManager,
}

impl TimerContext {
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            pool: ThreadPool::with_config(config)?,
            periodic: PeriodicTaskManager::with_config(config)?,
        }))
    }

    /// The process-wide context, created on first use.
    pub fn shared() -> Result<Arc<Self>> {
        let mut slot = SHARED_CONTEXT.lock();
        if let Some(context) = slot.upgrade() {
            return Ok(context);
        }

        let context = Self::new(&Config::default())?;
        *slot = Arc::downgrade(&context);
        debug!("shared timer context created");
        Ok(context)
    }

    /// Number of live holders of the shared context.
    pub fn shared_refs() -> usize {
        SHARED_CONTEXT.lock().strong_count()
    }

    pub fn thread_pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn periodic(&self) -> &PeriodicTaskManager {
        &self.periodic
    }
}

impl std::fmt::Debug for TimerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerContext")
            .field("pool", &self.pool)
            .field("periodic", &self.periodic)
            .finish()
    }
}

impl Drop for TimerContext {
    fn drop(&mut self) {
        self.periodic.terminate();
        self.pool.terminate();
        debug!("timer context torn down");
    }
}

// Sleeps for the delay, then runs the wrapped task unless cancelled first.
struct DelayTask {
    state: TaskState,
    delay: Duration,
    target: TaskRef,
    done: AtomicBool,
}

impl Task for DelayTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    fn on_run(&self) {
        if self.state.wait_cancelled(self.delay) {
            trace!(task_id = %self.target.id(), "one-shot timer cancelled before firing");
        } else if !self.target.run() {
            debug!(task_id = %self.target.id(), "timer target already running, skipped");
        }
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
    }
}

// Per-timer registration in a period bucket. Buckets key membership on task
// id, so two timers wrapping the same task stay independent.
struct RepeatTask {
    state: TaskState,
    target: TaskRef,
}

impl Task for RepeatTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    fn on_run(&self) {
        if !self.target.run() {
            trace!(task_id = %self.target.id(), "timer target already running, tick skipped");
        }
    }

    fn cancel(&self) {
        self.state.request_cancel();
        self.target.cancel();
    }
}

enum Scheduled {
    Repeating(Arc<RepeatTask>),
    OneShot(Arc<DelayTask>),
}

/// A delayed or repeating wrapper around a task.
pub struct Timer {
    delay: Duration,
    repeat: bool,
    task: TaskRef,
    context: Arc<TimerContext>,
    scheduled: Mutex<Option<Scheduled>>,
}

impl Timer {
    /// Timer on the shared process-wide context.
    pub fn new(task: TaskRef, delay_ms: u64, repeat: bool) -> Result<Self> {
        Ok(Self::with_context(
            TimerContext::shared()?,
            task,
            delay_ms,
            repeat,
        ))
    }

    pub fn with_context(
        context: Arc<TimerContext>,
        task: TaskRef,
        delay_ms: u64,
        repeat: bool,
    ) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            repeat,
            task,
            context,
            scheduled: Mutex::new(None),
        }
    }

    /// Arm the timer. A no-op while it is already armed.
    pub fn schedule(&self) -> Result<()> {
        let mut scheduled = self.scheduled.lock();
        if Self::is_armed(scheduled.as_ref()) {
            return Ok(());
        }

        if self.repeat {
            let wrapper = Arc::new(RepeatTask {
                state: TaskState::new(),
                target: self.task.clone(),
            });
            let periodic = self.context.periodic();
            periodic.schedule_repeat(wrapper.clone(), self.delay_ms())?;
            periodic.execute()?;
            *scheduled = Some(Scheduled::Repeating(wrapper));
        } else {
            let wrapper = Arc::new(DelayTask {
                state: TaskState::new(),
                delay: self.delay,
                target: self.task.clone(),
                done: AtomicBool::new(false),
            });
            let pool = self.context.thread_pool();
            pool.add_task(wrapper.clone());
            pool.execute()?;
            *scheduled = Some(Scheduled::OneShot(wrapper));
        }

        debug!(task_id = %self.task.id(), delay_ms = self.delay_ms(), repeat = self.repeat, "timer scheduled");
        Ok(())
    }

    /// Disarm the timer.
    ///
    /// A one-shot timer is only stopped if its delay has not elapsed yet; a
    /// body that already started runs to completion.
    pub fn cancel_schedule(&self) {
        match self.scheduled.lock().take() {
            Some(Scheduled::Repeating(wrapper)) => {
                let wrapper: TaskRef = wrapper;
                self.context.periodic().cancel_schedule_repeat(&wrapper);
            }
            Some(Scheduled::OneShot(wrapper)) => {
                let wrapper: TaskRef = wrapper;
                self.context.thread_pool().cancel_task(&wrapper);
            }
            None => return,
        }
        debug!(task_id = %self.task.id(), "timer cancelled");
    }

    pub fn is_scheduled(&self) -> bool {
        Self::is_armed(self.scheduled.lock().as_ref())
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn context(&self) -> &Arc<TimerContext> {
        &self.context
    }

    fn delay_ms(&self) -> u64 {
        self.delay.as_millis() as u64
    }

    fn is_armed(scheduled: Option<&Scheduled>) -> bool {
        match scheduled {
            Some(Scheduled::Repeating(_)) => true,
            Some(Scheduled::OneShot(wrapper)) => !wrapper.done.load(Ordering::Acquire),
            None => false,
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("task", &self.task.id())
            .field("delay", &self.delay)
            .field("repeat", &self.repeat)
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel_schedule();
    }
}
