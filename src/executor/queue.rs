//! Thread-safe task queues.

use super::task::{TaskId, TaskRef};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A source of work for a [`WorkerExecutor`](super::WorkerExecutor).
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: TaskRef);

    fn dequeue(&self) -> Option<TaskRef>;

    /// Remove `task` if it is still pending. Returns whether it was found.
    fn erase(&self, task: &TaskRef) -> bool;

    fn clear(&self);

    fn contains(&self, task: &TaskRef) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plain FIFO queue. A task is held at most once.
#[derive(Debug, Default)]
pub struct FifoQueue {
    tasks: Mutex<VecDeque<TaskRef>>,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    fn position(tasks: &VecDeque<TaskRef>, id: TaskId) -> Option<usize> {
        tasks.iter().position(|t| t.id() == id)
    }
}

impl TaskQueue for FifoQueue {
    fn enqueue(&self, task: TaskRef) {
        let mut tasks = self.tasks.lock();
        if Self::position(&tasks, task.id()).is_none() {
            tasks.push_back(task);
        }
    }

    fn dequeue(&self) -> Option<TaskRef> {
        self.tasks.lock().pop_front()
    }

    fn erase(&self, task: &TaskRef) -> bool {
        let mut tasks = self.tasks.lock();
        match Self::position(&tasks, task.id()) {
            Some(idx) => tasks.remove(idx).is_some(),
            None => false,
        }
    }

    fn clear(&self) {
        self.tasks.lock().clear();
    }

    fn contains(&self, task: &TaskRef) -> bool {
        Self::position(&self.tasks.lock(), task.id()).is_some()
    }

    fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}
