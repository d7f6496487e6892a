pub mod collector;

pub use collector::{MetricsCollector, ModelStats, StreamingMetricsTracker};
