//! Telemetry and observability.
//!
//! Counters and a latency histogram shared by pools, managers and periodic
//! buckets. Log output goes through `tracing`; installing a subscriber is up
//! to the embedding application.

pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
