//! Observability: counters, gauges, histograms, structured logging, and
//! the health/metrics HTTP endpoint shared by both binaries.

pub mod http;
pub mod logging;
pub mod metrics;

pub use http::{spawn_server, HealthState};
pub use metrics::MetricsCollector;
