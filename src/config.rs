//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Pool sizing and timing, fixed at construction.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of compute workers.
    pub max_workers: usize,
    /// Maximum lifetime of a non-terminal job.
    pub job_ttl: Duration,
    /// Maximum number of jobs waiting for a worker.
    pub max_queue_size: usize,
    /// How often the TTL reaper sweeps.
    pub cleanup_interval: Duration,
    /// How long `terminate` waits for in-flight jobs.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            job_ttl: Duration::from_secs(300), // 5 minutes
            max_queue_size: 100,
            cleanup_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.job_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "job_ttl".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "cleanup_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Serving process configuration, read from the environment by the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub pool: PoolConfig,
}

impl ServerConfig {
    /// Load from `HOST`, `PORT`, `WORKERS`, `JOB_TTL_SECS`, `MAX_QUEUE_SIZE`,
    /// `CLEANUP_INTERVAL_MS` and `SHUTDOWN_GRACE_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PoolConfig::default();

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_var(&lookup, "PORT")?.unwrap_or(3000);

        let pool = PoolConfig {
            max_workers: parse_var(&lookup, "WORKERS")?.unwrap_or(defaults.max_workers),
            job_ttl: parse_var(&lookup, "JOB_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_ttl),
            max_queue_size: parse_var(&lookup, "MAX_QUEUE_SIZE")?
                .unwrap_or(defaults.max_queue_size),
            cleanup_interval: parse_var(&lookup, "CLEANUP_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.cleanup_interval),
            shutdown_grace: parse_var(&lookup, "SHUTDOWN_GRACE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        };
        pool.validate()?;

        Ok(Self { host, port, pool })
    }

    /// `host:port` suitable for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::ParseError {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}
