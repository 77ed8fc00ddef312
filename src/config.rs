//! Process configuration.
//!
//! Corresponds to spec.md §6.4 and the §9 REDESIGN FLAGS entry "dynamic,
//! duck-typed config objects → explicit configuration record with an
//! enumerated set of fields and defaults". Every field here is sourced
//! from an environment variable with a contractual name; unset variables
//! fall back to the documented default.

use std::time::Duration;

use crate::error::ConfigError;

/// Transport selectable at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
}

/// Policy applied when `start_crew` would exceed the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaturationPolicy {
    Queue,
    Fail,
}

/// Full process configuration, sourced from environment at boot.
///
/// A subset (see [`Config::apply_reloadable`]) can be changed at runtime
/// via the `reload_config` tool; the rest requires a restart.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub data_root: std::path::PathBuf,

    pub worker_pool_size: usize,
    pub max_concurrent_workflows: usize,
    pub saturation_policy: SaturationPolicy,

    pub default_tool_deadline: Duration,

    pub rate_limit_per_hour: u32,
    pub rate_limit_per_minute: u32,
    pub rate_limit_block_duration: Duration,

    pub evolution_sweep_interval: Duration,
    pub min_evolution_interval: Duration,
    pub instruction_expirer_interval: Duration,
    pub instruction_ttl: Duration,
    pub workflow_reaper_interval: Duration,
    pub max_workflow_duration: Duration,
    pub health_probe_interval: Duration,

    pub instruction_intake_poll_interval: Duration,
    pub emergency_stop_deadline: Duration,

    pub max_string_len: usize,
    pub max_json_depth: usize,

    pub admin_bootstrap_key: Option<String>,

    /// Credential the stdio transport uses for every request on this
    /// connection — conveyed out-of-band at boot, per spec.md §6.1,
    /// rather than per-request like the HTTP transport's header.
    pub stdio_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_or("CREW_FORGE_HOST", "127.0.0.1".to_string());
        let port = env_parse("CREW_FORGE_PORT", 8765u16)?;
        let transport = match env_or("CREW_FORGE_TRANSPORT", "stdio".to_string()).as_str() {
            "stdio" => TransportKind::Stdio,
            "http" => TransportKind::Http,
            other => {
                return Err(ConfigError(format!(
                    "CREW_FORGE_TRANSPORT must be 'stdio' or 'http', got '{other}'"
                )))
            }
        };
        let data_root = std::path::PathBuf::from(env_or(
            "CREW_FORGE_DATA_ROOT",
            "./data".to_string(),
        ));

        let worker_pool_size = env_parse(
            "CREW_FORGE_WORKER_POOL_SIZE",
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        )?;
        let max_concurrent_workflows =
            env_parse("CREW_FORGE_MAX_CONCURRENT_WORKFLOWS", worker_pool_size)?;
        let saturation_policy = match env_or("CREW_FORGE_SATURATION_POLICY", "queue".to_string())
            .as_str()
        {
            "queue" => SaturationPolicy::Queue,
            "fail" => SaturationPolicy::Fail,
            other => {
                return Err(ConfigError(format!(
                    "CREW_FORGE_SATURATION_POLICY must be 'queue' or 'fail', got '{other}'"
                )))
            }
        };

        let default_tool_deadline =
            Duration::from_secs(env_parse("CREW_FORGE_TOOL_DEADLINE_SECS", 30u64)?);

        let rate_limit_per_hour = env_parse("CREW_FORGE_RATE_LIMIT_PER_HOUR", 100u32)?;
        let rate_limit_per_minute = env_parse("CREW_FORGE_RATE_LIMIT_PER_MINUTE", 10u32)?;
        let rate_limit_block_duration =
            Duration::from_secs(env_parse("CREW_FORGE_RATE_LIMIT_BLOCK_SECS", 3600u64)?);

        let evolution_sweep_interval =
            Duration::from_secs(env_parse("CREW_FORGE_EVOLUTION_SWEEP_SECS", 3600u64)?);
        let min_evolution_interval =
            Duration::from_secs(env_parse("CREW_FORGE_MIN_EVOLUTION_INTERVAL_SECS", 6 * 3600u64)?);
        let instruction_expirer_interval =
            Duration::from_secs(env_parse("CREW_FORGE_INSTRUCTION_EXPIRER_SECS", 60u64)?);
        let instruction_ttl = Duration::from_secs(env_parse("CREW_FORGE_INSTRUCTION_TTL_SECS", 3600u64)?);
        let workflow_reaper_interval =
            Duration::from_secs(env_parse("CREW_FORGE_WORKFLOW_REAPER_SECS", 30u64)?);
        let max_workflow_duration =
            Duration::from_secs(env_parse("CREW_FORGE_MAX_WORKFLOW_DURATION_SECS", 3600u64)?);
        let health_probe_interval =
            Duration::from_secs(env_parse("CREW_FORGE_HEALTH_PROBE_SECS", 30u64)?);

        let instruction_intake_poll_interval =
            Duration::from_secs(env_parse("CREW_FORGE_INTAKE_POLL_SECS", 2u64)?);
        let emergency_stop_deadline =
            Duration::from_secs(env_parse("CREW_FORGE_ESTOP_DEADLINE_SECS", 15u64)?);

        let max_string_len = env_parse("CREW_FORGE_MAX_STRING_LEN", 10_000usize)?;
        let max_json_depth = env_parse("CREW_FORGE_MAX_JSON_DEPTH", 16usize)?;

        let admin_bootstrap_key = std::env::var("CREW_FORGE_ADMIN_KEY").ok();
        let stdio_api_key = std::env::var("CREW_FORGE_STDIO_API_KEY").ok();

        Ok(Self {
            host,
            port,
            transport,
            data_root,
            worker_pool_size,
            max_concurrent_workflows,
            saturation_policy,
            default_tool_deadline,
            rate_limit_per_hour,
            rate_limit_per_minute,
            rate_limit_block_duration,
            evolution_sweep_interval,
            min_evolution_interval,
            instruction_expirer_interval,
            instruction_ttl,
            workflow_reaper_interval,
            max_workflow_duration,
            health_probe_interval,
            instruction_intake_poll_interval,
            emergency_stop_deadline,
            max_string_len,
            max_json_depth,
            admin_bootstrap_key,
            stdio_api_key,
        })
    }

    /// Fields that `reload_config` is permitted to change without a
    /// restart. Anything not listed here (bind address, transport,
    /// data root, worker pool size) is reported back as unchanged.
    pub fn apply_reloadable(&mut self, fresh: &Config) {
        self.rate_limit_per_hour = fresh.rate_limit_per_hour;
        self.rate_limit_per_minute = fresh.rate_limit_per_minute;
        self.rate_limit_block_duration = fresh.rate_limit_block_duration;
        self.evolution_sweep_interval = fresh.evolution_sweep_interval;
        self.min_evolution_interval = fresh.min_evolution_interval;
        self.instruction_ttl = fresh.instruction_ttl;
        self.max_workflow_duration = fresh.max_workflow_duration;
        self.default_tool_deadline = fresh.default_tool_deadline;
    }

    /// Names of fields that require a restart, for `reload_config`'s
    /// response payload.
    pub fn restart_required_fields() -> &'static [&'static str] {
        &[
            "host",
            "port",
            "transport",
            "data_root",
            "worker_pool_size",
            "max_concurrent_workflows",
        ]
    }

    /// Sanitized snapshot for `get_server_config` — never includes
    /// `admin_bootstrap_key`.
    pub fn sanitized_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "host": self.host,
            "port": self.port,
            "transport": match self.transport {
                TransportKind::Stdio => "stdio",
                TransportKind::Http => "http",
            },
            "data_root": self.data_root.to_string_lossy(),
            "worker_pool_size": self.worker_pool_size,
            "max_concurrent_workflows": self.max_concurrent_workflows,
            "saturation_policy": match self.saturation_policy {
                SaturationPolicy::Queue => "queue",
                SaturationPolicy::Fail => "fail",
            },
            "default_tool_deadline_secs": self.default_tool_deadline.as_secs(),
            "rate_limit_per_hour": self.rate_limit_per_hour,
            "rate_limit_per_minute": self.rate_limit_per_minute,
            "evolution_sweep_interval_secs": self.evolution_sweep_interval.as_secs(),
            "min_evolution_interval_secs": self.min_evolution_interval.as_secs(),
            "instruction_ttl_secs": self.instruction_ttl.as_secs(),
            "max_workflow_duration_secs": self.max_workflow_duration.as_secs(),
        })
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError(format!("{name} has an invalid value: '{raw}'"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_any_env() {
        // Use a throwaway prefix so this doesn't depend on the running
        // environment leaking unrelated variables into the test.
        let cfg = Config::from_env().expect("defaults must parse");
        assert!(cfg.port > 0);
        assert!(cfg.worker_pool_size >= 1);
        assert_eq!(cfg.rate_limit_per_minute, 10);
        assert_eq!(cfg.rate_limit_per_hour, 100);
    }
}
