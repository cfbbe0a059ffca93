use faas_common::{FaasError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What `enqueue` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Backpressure {
    /// Fail immediately with `QueueFull`.
    #[default]
    Reject,
    /// Wait up to `timeout` for a slot, then fail with `QueueFull`.
    Block { timeout: Duration },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
    pub backpressure: Backpressure,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            backpressure: Backpressure::Reject,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_per_signature: usize,
    pub max_total: usize,
    pub idle_ttl: Duration,
    pub reap_interval: Duration,
    /// Bounded wait for a slot when a cap is reached and nothing can be evicted.
    pub acquire_wait: Duration,
    /// Retire a container after this many executions.
    pub max_use_count: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_signature: 4,
            max_total: 16,
            idle_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            acquire_wait: Duration::from_secs(2),
            max_use_count: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub workers: usize,
    pub max_acquire_retries: u32,
    pub retry_backoff: Duration,
    pub default_timeout: Duration,
    pub store_timeout: Duration,
    /// Terminal job snapshots kept in memory for `get_status`.
    pub job_retention: usize,
}

impl WorkerConfig {
    pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

    /// Backoff before retry `attempt` (1-based), doubling and capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(factor)
            .min(Self::MAX_BACKOFF)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_acquire_retries: 3,
            retry_backoff: Duration::from_millis(200),
            default_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(2),
            job_retention: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub runsc_path: String,
    /// Runtime name registered with the Docker daemon for gVisor.
    pub sandbox_runtime_name: String,
    /// Untrusted functions never fall back to the standard backend.
    pub enforce_sandbox: bool,
    pub network_disabled: bool,
    pub keepalive_command: Vec<String>,
    /// Interpreter invoked inside the container for each execution.
    pub interpreter: Vec<String>,
    pub max_output_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runsc_path: "/usr/local/bin/runsc".to_string(),
            sandbox_runtime_name: "runsc".to_string(),
            enforce_sandbox: true,
            network_disabled: true,
            keepalive_command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "while true; do sleep 30; done".to_string(),
            ],
            interpreter: vec!["python3".to_string(), "-u".to_string(), "-c".to_string()],
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    /// Defaults overlaid with `FAAS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("FAAS_QUEUE_CAPACITY") {
            config.queue.capacity = parse("FAAS_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("FAAS_QUEUE_BLOCK_MS") {
            let ms: u64 = parse("FAAS_QUEUE_BLOCK_MS", &v)?;
            config.queue.backpressure = if ms == 0 {
                Backpressure::Reject
            } else {
                Backpressure::Block {
                    timeout: Duration::from_millis(ms),
                }
            };
        }

        if let Some(v) = lookup("FAAS_POOL_MAX_PER_SIGNATURE") {
            config.pool.max_per_signature = parse("FAAS_POOL_MAX_PER_SIGNATURE", &v)?;
        }
        if let Some(v) = lookup("FAAS_POOL_MAX_TOTAL") {
            config.pool.max_total = parse("FAAS_POOL_MAX_TOTAL", &v)?;
        }
        if let Some(v) = lookup("FAAS_POOL_IDLE_TTL_SECS") {
            config.pool.idle_ttl = Duration::from_secs(parse("FAAS_POOL_IDLE_TTL_SECS", &v)?);
        }
        if let Some(v) = lookup("FAAS_POOL_REAP_INTERVAL_SECS") {
            config.pool.reap_interval =
                Duration::from_secs(parse("FAAS_POOL_REAP_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("FAAS_POOL_ACQUIRE_WAIT_MS") {
            config.pool.acquire_wait =
                Duration::from_millis(parse("FAAS_POOL_ACQUIRE_WAIT_MS", &v)?);
        }

        if let Some(v) = lookup("FAAS_WORKERS") {
            config.worker.workers = parse("FAAS_WORKERS", &v)?;
        }
        if let Some(v) = lookup("FAAS_MAX_ACQUIRE_RETRIES") {
            config.worker.max_acquire_retries = parse("FAAS_MAX_ACQUIRE_RETRIES", &v)?;
        }
        if let Some(v) = lookup("FAAS_JOB_RETENTION") {
            config.worker.job_retention = parse("FAAS_JOB_RETENTION", &v)?;
        }
        if let Some(v) = lookup("FAAS_DEFAULT_TIMEOUT_SECS") {
            config.worker.default_timeout =
                Duration::from_secs(parse("FAAS_DEFAULT_TIMEOUT_SECS", &v)?);
        }

        if let Some(v) = lookup("FAAS_RUNSC_PATH") {
            config.runtime.runsc_path = v;
        }
        if let Some(v) = lookup("FAAS_SANDBOX_RUNTIME") {
            config.runtime.sandbox_runtime_name = v;
        }
        if let Some(v) = lookup("FAAS_ENFORCE_SANDBOX") {
            config.runtime.enforce_sandbox = parse_bool("FAAS_ENFORCE_SANDBOX", &v)?;
        }
        if let Some(v) = lookup("FAAS_NETWORK_DISABLED") {
            config.runtime.network_disabled = parse_bool("FAAS_NETWORK_DISABLED", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(FaasError::Config("queue.capacity must be > 0".into()));
        }
        if self.worker.workers == 0 {
            return Err(FaasError::Config("worker.workers must be > 0".into()));
        }
        if self.pool.max_total == 0 || self.pool.max_per_signature == 0 {
            return Err(FaasError::Config("pool caps must be > 0".into()));
        }
        if self.pool.max_per_signature > self.pool.max_total {
            return Err(FaasError::Config(format!(
                "pool.max_per_signature ({}) exceeds pool.max_total ({})",
                self.pool.max_per_signature, self.pool.max_total
            )));
        }
        if self.worker.job_retention == 0 {
            return Err(FaasError::Config("worker.job_retention must be > 0".into()));
        }
        if self.worker.default_timeout.is_zero() {
            return Err(FaasError::Config("worker.default_timeout must be > 0".into()));
        }
        if self.runtime.interpreter.is_empty() {
            return Err(FaasError::Config("runtime.interpreter is empty".into()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FaasError::Config(format!("{key}: cannot parse {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(FaasError::Config(format!("{key}: not a boolean: {value:?}"))),
    }
}
