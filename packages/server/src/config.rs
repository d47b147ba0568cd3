use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Number of workers the manager starts.
    pub worker_count: usize,
    /// Concurrent jobs per worker.
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Interval of the per-worker watchdog (progress timeouts + cancel poll).
    pub watchdog_interval: Duration,
    /// A worker whose heartbeat is older than this is considered dead.
    pub worker_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    /// Binary used to run user code (a Deno-compatible runtime).
    pub runtime_binary: String,
    /// When true, a subprocess that exits 0 without a result marker fails
    /// instead of falling back to plain-text result parsing.
    pub strict_results: bool,
    /// Base URL handed to user code for the embedded client SDK.
    pub api_base_url: Option<String>,
    /// Service token handed to user code for the embedded client SDK.
    pub service_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_count: env::var("JOB_WORKER_COUNT")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("JOB_WORKER_COUNT must be a valid number")?,
            max_concurrent_jobs: env::var("JOB_MAX_CONCURRENT_JOBS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("JOB_MAX_CONCURRENT_JOBS must be a valid number")?,
            poll_interval: duration_from_env_ms("JOB_POLL_INTERVAL_MS", 1_000)?,
            heartbeat_interval: duration_from_env_secs("JOB_HEARTBEAT_INTERVAL_SECS", 10)?,
            watchdog_interval: duration_from_env_secs("JOB_WATCHDOG_INTERVAL_SECS", 30)?,
            worker_timeout: duration_from_env_secs("JOB_WORKER_TIMEOUT_SECS", 60)?,
            graceful_shutdown_timeout: duration_from_env_secs("JOB_SHUTDOWN_TIMEOUT_SECS", 30)?,
            runtime_binary: env::var("JOB_RUNTIME_BINARY").unwrap_or_else(|_| "deno".to_string()),
            strict_results: env::var("JOB_STRICT_RESULTS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            api_base_url: env::var("FLUXBASE_URL").ok(),
            service_token: env::var("FLUXBASE_SERVICE_TOKEN").ok(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            worker_count: 1,
            max_concurrent_jobs: 5,
            poll_interval: Duration::from_millis(1_000),
            heartbeat_interval: Duration::from_secs(10),
            watchdog_interval: Duration::from_secs(30),
            worker_timeout: Duration::from_secs(60),
            graceful_shutdown_timeout: Duration::from_secs(30),
            runtime_binary: "deno".to_string(),
            strict_results: false,
            api_base_url: None,
            service_token: None,
        }
    }
}

fn duration_from_env_ms(var: &str, default_ms: u64) -> Result<Duration> {
    let ms = match env::var(var) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{var} must be a valid number of milliseconds"))?,
        Err(_) => default_ms,
    };
    Ok(Duration::from_millis(ms))
}

fn duration_from_env_secs(var: &str, default_secs: u64) -> Result<Duration> {
    let secs = match env::var(var) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{var} must be a valid number of seconds"))?,
        Err(_) => default_secs,
    };
    Ok(Duration::from_secs(secs))
}
