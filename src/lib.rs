//! Task execution engine
//!
//! An embeddable library for running background work on OS threads without
//! an async runtime: fixed-size worker pools, a bounded spawn-per-task
//! manager, period-bucketed repeating schedules, and timers built on top.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use task_engine::prelude::*;
//!
//! struct Report {
//!     state: TaskState,
//! }
//!
//! impl Task for Report {
//!     fn state(&self) -> &TaskState {
//!         &self.state
//!     }
//!
//!     fn on_run(&self) {
//!         for _slice in 0..100 {
//!             if self.is_cancelled() {
//!                 return;
//!             }
//!             // one bounded slice of work
//!         }
//!     }
//! }
//!
//! let manager = TaskManager::new(4)?;
//! manager.add_task(Arc::new(Report { state: TaskState::new() }));
//! manager.execute_all_tasks()?;
//! manager.stop_all_tasks();
//! # Ok::<(), task_engine::Error>(())
//! ```
//!
//! # Components
//!
//! - **Task**: the run/cancel capability every unit of work implements
//! - **ThreadPool**: fixed workers pulling from one shared FIFO queue
//! - **TaskManager**: one thread per admitted task, capped at a concurrency
//!   limit and refilled automatically as tasks finish
//! - **PeriodicTaskManager**: one thread per distinct period, running every
//!   task registered under that period once per tick
//! - **Timer**: delayed or repeating execution of a single task
//!
//! Cancellation is cooperative throughout: task bodies must poll
//! [`Task::is_cancelled`] at bounded intervals, since nothing here can
//! preempt running code.

// Lint configuration
#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod scheduler;
pub mod telemetry;
pub mod timer;
pub mod util;

// Re-export key types at crate root
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use executor::{Task, TaskId, TaskRef, TaskState, ThreadPool};
pub use scheduler::{PeriodicTaskManager, TaskManager};
pub use timer::{Timer, TimerContext};
