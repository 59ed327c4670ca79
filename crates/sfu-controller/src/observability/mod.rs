//! Health endpoints and Prometheus metrics.

pub mod health;
pub mod metrics;

pub use health::{health_router, stats_router, HealthState, StatsResponse, StatsSources};
