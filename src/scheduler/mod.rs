//! Task scheduling.
//!
//! Two schedulers sit on top of the executor layer: the bounded
//! spawn-per-task [`TaskManager`] and the period-bucketed
//! [`PeriodicTaskManager`].

pub mod periodic;
pub mod task_manager;

pub use periodic::{PeriodicTask, PeriodicTaskManager, PeriodicTaskPool};
pub use task_manager::TaskManager;
