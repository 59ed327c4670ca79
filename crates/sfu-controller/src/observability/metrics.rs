//! Metrics definitions for the SFU controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `event`: client event names (~20 values)
//! - `outcome`: `ok` or `error`
//! - `reason`: removal and worker-death reasons (under 5 values each)
//! - `lock`: `room` or `participant`
//!
//! Room ids, uids and worker ids are never used as labels, except
//! `worker_id` on the memory gauge, which is bounded by the pool size.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle that renders
/// `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // lock waits are usually sub-millisecond; long tails mean a slow
        // engine call inside a critical section
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_lock_wait".to_string()),
            &[
                0.0001, 0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.000, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set lock wait buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_event_duration".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set event duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Pool & Room Gauges
// ============================================================================

/// Set the number of live workers.
///
/// Metric: `sfu_workers_active`
/// Labels: none
pub fn set_workers_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_workers_active").set(count as f64);
}

/// Set the number of routers in the directory.
///
/// Metric: `sfu_routers_active`
/// Labels: none
pub fn set_routers_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_routers_active").set(count as f64);
}

/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Metric: `sfu_participants_active`
pub fn set_participants_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_participants_active").set(count as f64);
}

/// Set the last sampled peak memory of a worker.
///
/// Metric: `sfu_worker_memory_mb`
/// Labels: `worker_id`
///
/// Cardinality: bounded by pool size plus respawns.
pub fn set_worker_memory_mb(worker_id: u32, memory_mb: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_worker_memory_mb", "worker_id" => worker_id.to_string()).set(memory_mb as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Record an unexpected worker exit.
///
/// Metric: `sfu_worker_deaths_total`
/// Labels: `recovery` (`respawn`, `fatal`)
pub fn record_worker_death(recovery: &str) {
    counter!("sfu_worker_deaths_total", "recovery" => recovery.to_string()).increment(1);
}

/// Record a participant removal.
///
/// Metric: `sfu_participants_removed_total`
/// Labels: `reason` (`leave`, `leave_prepare`, `grace_expired`, `heartbeat_timeout`)
pub fn record_participant_removed(reason: &str) {
    counter!("sfu_participants_removed_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Latency
// ============================================================================

/// Record one handled client event.
///
/// Metrics: `sfu_events_total` (counter), `sfu_event_duration_seconds`
/// (histogram)
/// Labels: `event`, `outcome`
///
/// Cardinality: ~20 events x 2 outcomes
pub fn record_event(event: &str, outcome: &str, duration: Duration) {
    counter!(
        "sfu_events_total",
        "event" => event.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("sfu_event_duration_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

/// Record how long a room or participant lock took to acquire.
///
/// Metric: `sfu_lock_wait_seconds`
/// Labels: `lock` (`room`, `participant`)
pub fn record_lock_wait(lock: &str, waited: Duration) {
    histogram!("sfu_lock_wait_seconds", "lock" => lock.to_string()).record(waited.as_secs_f64());
}
