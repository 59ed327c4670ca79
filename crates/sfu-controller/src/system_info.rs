//! Host resource information for pool statistics.
//!
//! Reported alongside worker distribution on the `/stats` endpoint so that
//! pool sizing can be compared with the machine it runs on.

use serde::Serialize;
use sysinfo::System;

/// Host resource usage.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemInfo {
    /// Logical CPU cores visible to the process.
    pub cpu_cores: usize,
    /// CPU usage as a percentage (0-100).
    pub cpu_percent: u32,
    /// Memory usage as a percentage (0-100).
    pub memory_percent: u32,
}

/// Gather current host resource usage.
///
/// CPU usage may read 0 on a fresh `System` because sysinfo computes it from
/// deltas; callers sampling periodically get accurate values from the second
/// sample on.
#[must_use]
pub fn gather_system_info() -> SystemInfo {
    let mut sys = System::new_all();
    sys.refresh_all();

    let cpu_cores = sys.cpus().len().max(1);
    let cpu_percent = sys.global_cpu_info().cpu_usage() as u32;

    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let memory_percent = if total_memory > 0 {
        ((used_memory as f64 / total_memory as f64) * 100.0) as u32
    } else {
        0
    };

    SystemInfo {
        cpu_cores,
        cpu_percent: cpu_percent.min(100),
        memory_percent: memory_percent.min(100),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_system_info_returns_valid_range() {
        let info = gather_system_info();

        assert!(info.cpu_cores >= 1);
        assert!(info.cpu_percent <= 100, "CPU percent should be <= 100");
        assert!(
            info.memory_percent <= 100,
            "Memory percent should be <= 100"
        );
    }

    #[test]
    fn test_system_info_serializes() {
        let info = SystemInfo {
            cpu_cores: 8,
            cpu_percent: 12,
            memory_percent: 40,
        };
        let value = serde_json::to_value(info).unwrap();
        assert_eq!(value["cpu_cores"], 8);
        assert_eq!(value["memory_percent"], 40);
    }
}
