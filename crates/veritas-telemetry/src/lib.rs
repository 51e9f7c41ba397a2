//! C2 Telemetry Store, C3 Telemetry Query, and C7 Metrics Aggregator.

pub mod metrics;
pub mod query;
pub mod store;

pub use metrics::{MetricsAggregator, Period};
pub use query::{QueryParams, TelemetryQuery};
pub use store::{TelemetryConfig, TelemetryStore};
