//! Period-bucketed repeating execution.
//!
//! All tasks sharing a period share one [`PeriodicTask`], one thread and one
//! sleep/wake cycle. [`PeriodicTaskManager`] keeps one bucket per distinct
//! period and creates buckets lazily.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{Task, TaskId, TaskQueue, TaskRef, TaskState, WorkerExecutor};
use crate::telemetry::Metrics;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Runs a set of sub-tasks once per period until cancelled.
///
/// Sub-tasks run in registration order on the loop's own thread. The set may
/// change while the loop runs; a sub-task removed mid-tick is skipped for the
/// rest of that tick.
pub struct PeriodicTask {
    state: TaskState,
    period: Duration,
    tasks: Mutex<Vec<TaskRef>>,
    metrics: Arc<Metrics>,
}

impl PeriodicTask {
    pub fn new(period: Duration) -> Self {
        Self::with_metrics(period, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(period: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            state: TaskState::new(),
            period,
            tasks: Mutex::new(Vec::new()),
            metrics,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn add_task(&self, task: TaskRef) {
        let mut tasks = self.tasks.lock();
        if !tasks.iter().any(|t| t.id() == task.id()) {
            tasks.push(task);
        }
    }

    pub fn cancel_task(&self, task: &TaskRef) -> bool {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| t.id() != task.id());
        tasks.len() != before
    }

    pub fn contains(&self, task: &TaskRef) -> bool {
        self.is_registered(task.id())
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn is_registered(&self, id: TaskId) -> bool {
        self.tasks.lock().iter().any(|t| t.id() == id)
    }

    fn run_tick(&self) {
        self.metrics.record_tick();

        // Run from a snapshot so add/cancel never wait on a whole tick.
        let snapshot = self.tasks.lock().clone();
        for task in &snapshot {
            if self.is_cancelled() {
                return;
            }
            if !self.is_registered(task.id()) {
                continue;
            }
            let start = Instant::now();
            if task.run() {
                self.metrics.record_task_execution(start.elapsed());
            }
        }
    }
}

impl Task for PeriodicTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    fn on_run(&self) {
        let period_ms = self.period.as_millis() as u64;
        debug!(period_ms, "periodic loop started");

        let mut tick_start = Instant::now();
        loop {
            let elapsed = tick_start.elapsed();
            if elapsed > self.period {
                self.metrics.record_tick_overrun();
                warn!(
                    period_ms,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "periodic tick overran its period"
                );
                if self.is_cancelled() {
                    break;
                }
            } else if self.state.wait_cancelled(self.period - elapsed) {
                break;
            }

            tick_start = Instant::now();
            self.run_tick();
            if self.is_cancelled() {
                break;
            }
        }

        debug!(period_ms, "periodic loop stopped");
    }

    fn cancel(&self) {
        self.state.request_cancel();
        for task in self.tasks.lock().iter() {
            task.cancel();
        }
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("state", &self.state)
            .field("period", &self.period)
            .field("tasks", &self.len())
            .finish()
    }
}

/// A task queue holding the single [`PeriodicTask`] of one period bucket.
///
/// Enqueueing attaches a sub-task; dequeueing hands out the periodic task
/// itself.
pub struct PeriodicTaskPool {
    period: Duration,
    current: Mutex<Option<Arc<PeriodicTask>>>,
    metrics: Arc<Metrics>,
}

impl PeriodicTaskPool {
    pub fn new(period: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            period,
            current: Mutex::new(None),
            metrics,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn periodic_task(&self) -> Option<Arc<PeriodicTask>> {
        self.current.lock().clone()
    }

    fn fresh(&self) -> Arc<PeriodicTask> {
        Arc::new(PeriodicTask::with_metrics(self.period, self.metrics.clone()))
    }
}

impl TaskQueue for PeriodicTaskPool {
    fn enqueue(&self, task: TaskRef) {
        let mut current = self.current.lock();
        current.get_or_insert_with(|| self.fresh()).add_task(task);
    }

    fn dequeue(&self) -> Option<TaskRef> {
        self.current
            .lock()
            .clone()
            .map(|periodic| periodic as TaskRef)
    }

    fn erase(&self, task: &TaskRef) -> bool {
        match self.current.lock().as_ref() {
            Some(periodic) => periodic.cancel_task(task),
            None => false,
        }
    }

    fn clear(&self) {
        let previous = self.current.lock().replace(self.fresh());
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn contains(&self, task: &TaskRef) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|periodic| periodic.contains(task))
    }

    fn len(&self) -> usize {
        self.current.lock().as_ref().map_or(0, |periodic| periodic.len())
    }
}

impl std::fmt::Debug for PeriodicTaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTaskPool")
            .field("period", &self.period)
            .field("tasks", &self.len())
            .finish()
    }
}

struct Bucket {
    pool: Arc<PeriodicTaskPool>,
    executor: WorkerExecutor,
}

/// Routes repeating tasks to one bucket (pool + thread) per period.
pub struct PeriodicTaskManager {
    config: Config,
    buckets: Mutex<BTreeMap<u64, Bucket>>,
    metrics: Arc<Metrics>,
}

impl PeriodicTaskManager {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            buckets: Mutex::new(BTreeMap::new()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            buckets: Mutex::new(BTreeMap::new()),
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Run `task` every `period_ms` milliseconds.
    ///
    /// The bucket for `period_ms` is created on first use and its thread is
    /// started if it is not running yet.
    pub fn schedule_repeat(&self, task: TaskRef, period_ms: u64) -> Result<()> {
        if period_ms == 0 {
            return Err(Error::config("period must be > 0"));
        }

        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(period_ms)
            .or_insert_with(|| self.new_bucket(period_ms));

        debug!(task_id = %task.id(), period_ms, "repeating task scheduled");
        bucket.pool.enqueue(task);
        bucket.executor.execute()
    }

    /// Detach `task` from every bucket holding it.
    pub fn cancel_schedule_repeat(&self, task: &TaskRef) -> bool {
        let mut found = false;
        for (period_ms, bucket) in self.buckets.lock().iter() {
            if bucket.pool.erase(task) {
                debug!(task_id = %task.id(), period_ms, "repeating task cancelled");
                found = true;
            }
        }
        found
    }

    /// Start every bucket's thread.
    pub fn execute(&self) -> Result<()> {
        for bucket in self.buckets.lock().values() {
            bucket.executor.execute()?;
        }
        Ok(())
    }

    /// Stop every bucket's thread and discard all buckets.
    pub fn terminate(&self) {
        let buckets = std::mem::take(&mut *self.buckets.lock());
        for (_, bucket) in buckets {
            bucket.executor.terminate();
            bucket.pool.clear();
        }
    }

    pub fn periods(&self) -> Vec<u64> {
        self.buckets.lock().keys().copied().collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_scheduled(&self, task: &TaskRef) -> bool {
        self.buckets
            .lock()
            .values()
            .any(|bucket| bucket.pool.contains(task))
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn new_bucket(&self, period_ms: u64) -> Bucket {
        let pool = Arc::new(PeriodicTaskPool::new(
            Duration::from_millis(period_ms),
            self.metrics.clone(),
        ));
        // Only sub-task runs count toward the manager's metrics.
        let executor = WorkerExecutor::new(
            format!("{}-periodic-{}ms", self.config.thread_name_prefix, period_ms),
            pool.clone(),
            Arc::new(Metrics::new()),
            self.config.stack_size,
            self.config.idle_yields,
        );
        debug!(period_ms, "period bucket created");
        Bucket { pool, executor }
    }
}

impl Default for PeriodicTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PeriodicTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTaskManager")
            .field("periods", &self.periods())
            .finish()
    }
}

impl Drop for PeriodicTaskManager {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Counter {
        state: TaskState,
        hits: AtomicUsize,
        work: Duration,
    }

    impl Counter {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                state: TaskState::new(),
                hits: AtomicUsize::new(0),
                work,
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl Task for Counter {
        fn state(&self) -> &TaskState {
            &self.state
        }

        fn on_run(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if !self.work.is_zero() {
                thread::sleep(self.work);
            }
        }
    }

    fn spawn_loop(periodic: &Arc<PeriodicTask>) -> thread::JoinHandle<bool> {
        let periodic = periodic.clone();
        thread::spawn(move || periodic.run())
    }

    #[test]
    fn test_periodic_task_ticks() {
        let periodic = Arc::new(PeriodicTask::new(Duration::from_millis(20)));
        let a = Counter::new(Duration::ZERO);
        let b = Counter::new(Duration::ZERO);
        periodic.add_task(a.clone());
        periodic.add_task(b.clone());

        let handle = spawn_loop(&periodic);
        thread::sleep(Duration::from_millis(210));
        periodic.cancel();
        assert!(handle.join().unwrap());

        assert!((8..=11).contains(&a.hits()), "hits = {}", a.hits());
        assert_eq!(a.hits(), b.hits());
        assert_eq!(periodic.metrics().snapshot().tick_overruns, 0);
    }

    #[test]
    fn test_cancel_wakes_sleeping_loop() {
        let periodic = Arc::new(PeriodicTask::new(Duration::from_secs(60)));
        let handle = spawn_loop(&periodic);
        while !periodic.is_running() {
            thread::yield_now();
        }

        let start = Instant::now();
        periodic.cancel();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_overrun_runs_next_tick_immediately() {
        let periodic = Arc::new(PeriodicTask::new(Duration::from_millis(10)));
        let slow = Counter::new(Duration::from_millis(30));
        periodic.add_task(slow.clone());

        let handle = spawn_loop(&periodic);
        thread::sleep(Duration::from_millis(145));
        periodic.cancel();
        handle.join().unwrap();

        // 10ms first wait, then back-to-back 30ms ticks.
        assert!(slow.hits() >= 4, "hits = {}", slow.hits());
        assert!(periodic.metrics().snapshot().tick_overruns >= 3);
    }

    #[test]
    fn test_removed_subtask_skipped() {
        let periodic = Arc::new(PeriodicTask::new(Duration::from_millis(10)));
        let keep = Counter::new(Duration::ZERO);
        let drop_me = Counter::new(Duration::ZERO);
        let drop_ref: TaskRef = drop_me.clone();
        periodic.add_task(keep.clone());
        periodic.add_task(drop_ref.clone());

        let handle = spawn_loop(&periodic);
        thread::sleep(Duration::from_millis(55));
        assert!(periodic.cancel_task(&drop_ref));
        let frozen = drop_me.hits();
        thread::sleep(Duration::from_millis(55));
        periodic.cancel();
        handle.join().unwrap();

        assert!(drop_me.hits() <= frozen + 1);
        assert!(keep.hits() > drop_me.hits());
    }

    #[test]
    fn test_pool_enqueue_creates_periodic_task() {
        let pool = PeriodicTaskPool::new(Duration::from_millis(50), Arc::new(Metrics::new()));
        assert!(pool.dequeue().is_none());

        let task: TaskRef = Counter::new(Duration::ZERO);
        pool.enqueue(task.clone());
        pool.enqueue(task.clone());
        assert_eq!(pool.len(), 1);

        let first = pool.dequeue().unwrap();
        let second = pool.dequeue().unwrap();
        assert_eq!(first.id(), second.id());

        assert!(pool.erase(&task));
        assert!(!pool.contains(&task));
    }

    #[test]
    fn test_pool_clear_replaces_periodic_task() {
        let pool = PeriodicTaskPool::new(Duration::from_millis(50), Arc::new(Metrics::new()));
        pool.enqueue(Counter::new(Duration::ZERO));
        let before = pool.periodic_task().unwrap();

        pool.clear();
        let after = pool.periodic_task().unwrap();
        assert_ne!(before.id(), after.id());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_manager_buckets_by_period() {
        let manager = PeriodicTaskManager::new();
        let slow: TaskRef = Counter::new(Duration::ZERO);
        let also_slow: TaskRef = Counter::new(Duration::ZERO);
        let fast: TaskRef = Counter::new(Duration::ZERO);

        manager.schedule_repeat(slow.clone(), 100).unwrap();
        manager.schedule_repeat(also_slow.clone(), 100).unwrap();
        manager.schedule_repeat(fast.clone(), 20).unwrap();

        assert_eq!(manager.periods(), vec![20, 100]);
        assert!(manager.is_scheduled(&fast));

        assert!(manager.cancel_schedule_repeat(&fast));
        assert!(!manager.cancel_schedule_repeat(&fast));
        assert!(!manager.is_scheduled(&fast));
        assert_eq!(manager.bucket_count(), 2);

        manager.terminate();
        assert_eq!(manager.bucket_count(), 0);
    }

    #[test]
    fn test_zero_period_rejected() {
        let manager = PeriodicTaskManager::new();
        let task: TaskRef = Counter::new(Duration::ZERO);
        assert!(manager.schedule_repeat(task, 0).is_err());
        assert_eq!(manager.bucket_count(), 0);
    }

    #[test]
    fn test_multi_bucket_cancel_removes_all() {
        let manager = PeriodicTaskManager::new();
        let task: TaskRef = Counter::new(Duration::ZERO);
        manager.schedule_repeat(task.clone(), 30).unwrap();
        manager.schedule_repeat(task.clone(), 70).unwrap();

        assert!(manager.cancel_schedule_repeat(&task));
        assert!(!manager.is_scheduled(&task));
    }

    #[test]
    fn test_manager_metrics_count_only_subtask_runs() {
        let manager = PeriodicTaskManager::new();
        let counter = Counter::new(Duration::ZERO);
        manager.schedule_repeat(counter.clone(), 10).unwrap();

        thread::sleep(Duration::from_millis(120));
        manager.terminate();

        let snapshot = manager.metrics().snapshot();
        assert!(counter.hits() > 0);
        assert_eq!(snapshot.tasks_executed, counter.hits() as u64);
        // The bucket loop ran for the whole window; sub-task bodies are instant.
        assert!(snapshot.max_latency_ns < 50_000_000);
    }
}
