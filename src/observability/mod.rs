pub mod metrics;

pub use metrics::{DirectionMetrics, RunMetrics, RunMetricsSnapshot};
