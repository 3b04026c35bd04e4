//! Task execution infrastructure.
//!
//! This module provides the task capability, task queues, single-thread
//! worker executors and the fixed-size thread pool built from them.

pub mod queue;
pub mod task;
pub mod thread_pool;
pub mod worker;

pub use queue::{FifoQueue, TaskQueue};
pub use task::{Task, TaskId, TaskRef, TaskState};
pub use thread_pool::ThreadPool;
pub use worker::WorkerExecutor;

pub(crate) use task::Admitted;
