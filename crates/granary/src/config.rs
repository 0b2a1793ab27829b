//! Process configuration, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::instance::monitor::DispatchedMonitorConfig;
use crate::instance::InstanceConfig;
use crate::worker::WorkerConfig;

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default_millis: u64) -> Duration {
    Duration::from_millis(env_parse(name, default_millis))
}

/// Frontend shard configuration.
///
/// - `GRANARY_DATABASE_URL`: PostgreSQL backplane; in-memory when unset
/// - `GRANARY_INSTANCE_NAME`: instance scope prefix (default empty)
/// - `GRANARY_MONITOR_INTERVAL_MS`: dispatched monitor sweep (default 1000)
/// - `GRANARY_TRANSFORM_CONCURRENCY`: in-flight queue transforms (default 256)
/// - `GRANARY_WATCHER_TTL_MS`: watcher expiry policy (default 10000)
/// - `GRANARY_COMPLETED_RETENTION`: completed operations kept (default 10000)
#[derive(Clone, Debug)]
pub struct FrontendProcessConfig {
    pub database_url: Option<String>,
    pub instance: InstanceConfig,
    pub monitor: DispatchedMonitorConfig,
}

impl FrontendProcessConfig {
    pub fn from_env() -> FrontendProcessConfig {
        let defaults = InstanceConfig::default();
        FrontendProcessConfig {
            database_url: std::env::var("GRANARY_DATABASE_URL").ok(),
            instance: InstanceConfig {
                name: env_string("GRANARY_INSTANCE_NAME", ""),
                watcher_ttl: env_millis("GRANARY_WATCHER_TTL_MS", 10_000),
                transform_concurrency: env_parse(
                    "GRANARY_TRANSFORM_CONCURRENCY",
                    defaults.transform_concurrency,
                ),
                completed_retention: env_parse(
                    "GRANARY_COMPLETED_RETENTION",
                    defaults.completed_retention,
                ),
                ..defaults
            },
            monitor: DispatchedMonitorConfig {
                interval: env_millis("GRANARY_MONITOR_INTERVAL_MS", 1_000),
            },
        }
    }
}

/// Worker process configuration.
///
/// - `GRANARY_DATABASE_URL`: PostgreSQL backplane; in-memory when unset
/// - `GRANARY_WORKER_NAME`: this worker's public name (default host:8981)
/// - `GRANARY_CAS_ROOT`: cache root (default /var/cache/granary/cas)
/// - `GRANARY_EXEC_ROOT`: exec dir root (default /var/cache/granary/exec)
/// - `GRANARY_CAS_MAX_SIZE_BYTES`: cache budget (default 2 GiB)
/// - `GRANARY_LINK_INPUT_DIRECTORIES`: symlink unchanged input dirs (default true)
/// - `GRANARY_INPUT_FETCH_WIDTH` / `GRANARY_EXECUTE_WIDTH` /
///   `GRANARY_REPORT_WIDTH`: stage widths
/// - `GRANARY_OPERATION_POLL_PERIOD_MS`: claim heartbeat (default 10000)
#[derive(Clone, Debug)]
pub struct WorkerProcessConfig {
    pub database_url: Option<String>,
    pub cas_root: PathBuf,
    pub exec_root: PathBuf,
    pub cas_max_size_bytes: i64,
    pub link_input_directories: bool,
    pub worker: WorkerConfig,
}

impl WorkerProcessConfig {
    pub fn from_env() -> WorkerProcessConfig {
        let defaults = WorkerConfig::default();
        WorkerProcessConfig {
            database_url: std::env::var("GRANARY_DATABASE_URL").ok(),
            cas_root: PathBuf::from(env_string("GRANARY_CAS_ROOT", "/var/cache/granary/cas")),
            exec_root: PathBuf::from(env_string("GRANARY_EXEC_ROOT", "/var/cache/granary/exec")),
            cas_max_size_bytes: env_parse("GRANARY_CAS_MAX_SIZE_BYTES", 2 << 30),
            link_input_directories: env_parse("GRANARY_LINK_INPUT_DIRECTORIES", true),
            worker: WorkerConfig {
                name: env_string("GRANARY_WORKER_NAME", &defaults.name),
                input_fetch_width: env_parse(
                    "GRANARY_INPUT_FETCH_WIDTH",
                    defaults.input_fetch_width,
                ),
                execute_width: env_parse("GRANARY_EXECUTE_WIDTH", defaults.execute_width),
                report_width: env_parse("GRANARY_REPORT_WIDTH", defaults.report_width),
                operation_poll_period: env_millis("GRANARY_OPERATION_POLL_PERIOD_MS", 10_000),
                ..defaults
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_environment() {
        let config = WorkerProcessConfig::from_env();
        assert!(config.cas_max_size_bytes > 0);
        assert!(config.worker.input_fetch_width > 0);
    }
}
