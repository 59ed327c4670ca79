//! SFU controller configuration.
//!
//! Configuration is loaded from `SFU_*` environment variables with
//! defaults for everything; invalid values are rejected rather than ignored.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3016";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default lower bound of the worker RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;

/// Default upper bound of the worker RTC port range.
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default media engine worker log level.
pub const DEFAULT_WORKER_LOG_LEVEL: &str = "warn";

/// Default delay before a dead worker is replaced (recovery mode only).
pub const DEFAULT_WORKER_RESPAWN_BACKOFF_MS: u64 = 2000;

/// Default worker resource sampling interval.
pub const DEFAULT_WORKER_SAMPLE_INTERVAL_SECONDS: u64 = 30;

/// Default memory threshold (MB) above which a worker is reported.
pub const DEFAULT_WORKER_MEMORY_WARN_MB: u64 = 512;

/// Default CPU threshold (percent) above which a worker is reported.
pub const DEFAULT_WORKER_CPU_WARN_PERCENT: f64 = 80.0;

/// Default number of routers a single worker may host.
pub const DEFAULT_MAX_ROUTERS_PER_WORKER: u32 = 50;

/// Default silence after the last heartbeat before removal.
pub const DEFAULT_HEARTBEAT_GRACE_SECONDS: u64 = 15;

/// Default grace window after a raw connection drop.
pub const DEFAULT_DISCONNECT_GRACE_SECONDS: u64 = 10;

/// Default period of the lock-handle sweep.
pub const DEFAULT_LOCK_SWEEP_INTERVAL_SECONDS: u64 = 300;

/// What happens when a media worker dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRecovery {
    /// Worker death is fatal to the process.
    Fatal,
    /// A single replacement worker is created after the backoff.
    Respawn,
}

impl FromStr for WorkerRecovery {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fatal" => Ok(WorkerRecovery::Fatal),
            "respawn" => Ok(WorkerRecovery::Respawn),
            other => Err(ConfigError::InvalidValue(format!(
                "SFU_WORKER_RECOVERY must be 'fatal' or 'respawn', got '{other}'"
            ))),
        }
    }
}

/// SFU controller configuration.
#[derive(Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3016").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Number of media workers (default: available CPU cores).
    pub num_workers: usize,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Log level passed to the media engine workers.
    pub worker_log_level: String,

    /// Behaviour on worker death (default: fatal).
    pub worker_recovery: WorkerRecovery,

    pub worker_respawn_backoff: Duration,
    pub worker_sample_interval: Duration,
    pub worker_memory_warn_mb: u64,
    pub worker_cpu_warn_percent: f64,

    /// Saturation limit used by least-loaded selection.
    pub max_routers_per_worker: u32,

    /// Silence after the last heartbeat before removal (default: 15s).
    pub heartbeat_grace: Duration,

    /// Grace window after a raw disconnect (default: 10s).
    pub disconnect_grace: Duration,

    pub lock_sweep_interval: Duration,

    /// Public IP announced in ICE candidates. Unset means the listen IP is used.
    pub announced_ip: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("num_workers", &self.num_workers)
            .field(
                "rtc_port_range",
                &format_args!("{}-{}", self.rtc_min_port, self.rtc_max_port),
            )
            .field("worker_log_level", &self.worker_log_level)
            .field("worker_recovery", &self.worker_recovery)
            .field("worker_respawn_backoff", &self.worker_respawn_backoff)
            .field("worker_sample_interval", &self.worker_sample_interval)
            .field("worker_memory_warn_mb", &self.worker_memory_warn_mb)
            .field("worker_cpu_warn_percent", &self.worker_cpu_warn_percent)
            .field("max_routers_per_worker", &self.max_routers_per_worker)
            .field("heartbeat_grace", &self.heartbeat_grace)
            .field("disconnect_grace", &self.disconnect_grace)
            .field("lock_sweep_interval", &self.lock_sweep_interval)
            .field("announced_ip", &self.announced_ip)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, rejecting values that fail to parse.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{name} has an unparseable value '{raw}'"))
        }),
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let num_workers = parse_var(vars, "SFU_NUM_WORKERS", default_worker_count())?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        let rtc_min_port = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) exceeds SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let worker_log_level = vars
            .get("SFU_WORKER_LOG_LEVEL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_WORKER_LOG_LEVEL.to_string());

        let worker_recovery = match vars.get("SFU_WORKER_RECOVERY") {
            Some(raw) => raw.parse()?,
            None => WorkerRecovery::Fatal,
        };

        let worker_respawn_backoff = Duration::from_millis(parse_var(
            vars,
            "SFU_WORKER_RESPAWN_BACKOFF_MS",
            DEFAULT_WORKER_RESPAWN_BACKOFF_MS,
        )?);

        let sample_seconds = parse_var(
            vars,
            "SFU_WORKER_SAMPLE_INTERVAL_SECONDS",
            DEFAULT_WORKER_SAMPLE_INTERVAL_SECONDS,
        )?;
        if sample_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_WORKER_SAMPLE_INTERVAL_SECONDS must be positive".to_string(),
            ));
        }

        let worker_memory_warn_mb = parse_var(
            vars,
            "SFU_WORKER_MEMORY_WARN_MB",
            DEFAULT_WORKER_MEMORY_WARN_MB,
        )?;

        let worker_cpu_warn_percent = parse_var(
            vars,
            "SFU_WORKER_CPU_WARN_PERCENT",
            DEFAULT_WORKER_CPU_WARN_PERCENT,
        )?;

        let max_routers_per_worker = parse_var(
            vars,
            "SFU_MAX_ROUTERS_PER_WORKER",
            DEFAULT_MAX_ROUTERS_PER_WORKER,
        )?;
        if max_routers_per_worker == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_MAX_ROUTERS_PER_WORKER must be at least 1".to_string(),
            ));
        }

        let heartbeat_grace = Duration::from_secs(parse_var(
            vars,
            "SFU_HEARTBEAT_GRACE_SECONDS",
            DEFAULT_HEARTBEAT_GRACE_SECONDS,
        )?);

        let disconnect_grace = Duration::from_secs(parse_var(
            vars,
            "SFU_DISCONNECT_GRACE_SECONDS",
            DEFAULT_DISCONNECT_GRACE_SECONDS,
        )?);

        let lock_sweep_seconds = parse_var(
            vars,
            "SFU_LOCK_SWEEP_INTERVAL_SECONDS",
            DEFAULT_LOCK_SWEEP_INTERVAL_SECONDS,
        )?;
        if lock_sweep_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_LOCK_SWEEP_INTERVAL_SECONDS must be positive".to_string(),
            ));
        }

        let announced_ip = vars
            .get("SFU_ANNOUNCED_IP")
            .filter(|ip| !ip.trim().is_empty())
            .cloned();

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            num_workers,
            rtc_min_port,
            rtc_max_port,
            worker_log_level,
            worker_recovery,
            worker_respawn_backoff,
            worker_sample_interval: Duration::from_secs(sample_seconds),
            worker_memory_warn_mb,
            worker_cpu_warn_percent,
            max_routers_per_worker,
            heartbeat_grace,
            disconnect_grace,
            lock_sweep_interval: Duration::from_secs(lock_sweep_seconds),
            announced_ip,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_from_empty_environment() {
        let config = Config::from_vars(&HashMap::new()).unwrap();

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert!(config.num_workers >= 1);
        assert_eq!(config.rtc_min_port, 40000);
        assert_eq!(config.rtc_max_port, 49999);
        assert_eq!(config.worker_recovery, WorkerRecovery::Fatal);
        assert_eq!(config.worker_respawn_backoff, Duration::from_millis(2000));
        assert_eq!(config.worker_sample_interval, Duration::from_secs(30));
        assert_eq!(config.worker_memory_warn_mb, 512);
        assert_eq!(config.max_routers_per_worker, 50);
        assert_eq!(config.heartbeat_grace, Duration::from_secs(15));
        assert_eq!(config.disconnect_grace, Duration::from_secs(10));
        assert_eq!(config.lock_sweep_interval, Duration::from_secs(300));
        assert!(config.announced_ip.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_vars(&vars(&[
            ("SFU_NUM_WORKERS", "3"),
            ("SFU_WORKER_RECOVERY", "Respawn"),
            ("SFU_HEARTBEAT_GRACE_SECONDS", "20"),
            ("SFU_DISCONNECT_GRACE_SECONDS", "5"),
            ("SFU_ANNOUNCED_IP", "203.0.113.9"),
            ("SFU_WORKER_CPU_WARN_PERCENT", "65.5"),
        ]))
        .unwrap();

        assert_eq!(config.num_workers, 3);
        assert_eq!(config.worker_recovery, WorkerRecovery::Respawn);
        assert_eq!(config.heartbeat_grace, Duration::from_secs(20));
        assert_eq!(config.disconnect_grace, Duration::from_secs(5));
        assert_eq!(config.announced_ip.as_deref(), Some("203.0.113.9"));
        assert!((config.worker_cpu_warn_percent - 65.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = Config::from_vars(&vars(&[("SFU_NUM_WORKERS", "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_unparseable_number_rejected() {
        let result = Config::from_vars(&vars(&[("SFU_RTC_MIN_PORT", "forty")]));
        let err = result.expect_err("port must be numeric");
        assert!(matches!(err, ConfigError::InvalidValue(ref msg) if msg.contains("SFU_RTC_MIN_PORT")));
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let result = Config::from_vars(&vars(&[
            ("SFU_RTC_MIN_PORT", "50000"),
            ("SFU_RTC_MAX_PORT", "40000"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_unknown_recovery_mode_rejected() {
        let result = Config::from_vars(&vars(&[("SFU_WORKER_RECOVERY", "retry")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_blank_announced_ip_treated_as_unset() {
        let config = Config::from_vars(&vars(&[("SFU_ANNOUNCED_IP", "  ")])).unwrap();
        assert!(config.announced_ip.is_none());
    }

    #[test]
    fn test_debug_output_lists_port_range() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        let debug = format!("{config:?}");
        assert!(debug.contains("40000-49999"));
    }
}
