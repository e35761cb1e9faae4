// Counters for the refresh coordinator

mod collector;

pub use collector::{MetricsSnapshot, RefreshMetrics};
