pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::executor::{Task, TaskId, TaskRef, TaskState, ThreadPool};
pub use crate::scheduler::{PeriodicTask, PeriodicTaskManager, TaskManager};
pub use crate::telemetry::{Metrics, MetricsSnapshot};
pub use crate::timer::{Timer, TimerContext};
