use std::time::Duration;

use crate::config::helpers::{parse_duration_secs_env, parse_list_env, parse_optional_env};
use crate::error::ConfigError;

/// Dispatch loop, worker pool and background sweep settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How often the dispatch loop polls for pending jobs.
    pub poll_interval: Duration,
    /// Pending jobs taken per tick.
    pub batch_size: usize,
    /// Jobs of one batch dispatched concurrently.
    pub concurrency: usize,
    /// Candidate worker base URLs, probed in order.
    pub worker_urls: Vec<String>,
    /// Timeout of a worker availability probe.
    pub worker_probe_timeout: Duration,
    /// Timeout of a job submission to a worker.
    pub worker_submit_timeout: Duration,
    /// Retries for the final status write of a dispatch attempt.
    pub store_write_retries: u32,
    pub reaper_interval: Duration,
    /// Age after which an uncompleted sandbox is reclaimed.
    pub sandbox_max_age: Duration,
    pub metrics_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            concurrency: 4,
            worker_urls: Vec::new(),
            worker_probe_timeout: Duration::from_secs(2),
            worker_submit_timeout: Duration::from_secs(30),
            store_write_retries: 3,
            reaper_interval: Duration::from_secs(120),
            sandbox_max_age: Duration::from_secs(600),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl DispatchConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let d = Self::default();

        let concurrency = parse_optional_env("DISPATCH_CONCURRENCY", d.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DISPATCH_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let worker_urls: Vec<String> = parse_list_env("WORKER_URLS")?
            .into_iter()
            .map(|u| u.trim_end_matches('/').to_string())
            .collect();
        if worker_urls.is_empty() {
            tracing::warn!("WORKER_URLS is empty; every dispatch will fail with no available worker");
        }

        Ok(Self {
            poll_interval: parse_duration_secs_env("POLL_INTERVAL_SECS", d.poll_interval)?,
            batch_size: parse_optional_env("DISPATCH_BATCH_SIZE", d.batch_size)?,
            concurrency,
            worker_urls,
            worker_probe_timeout: parse_duration_secs_env(
                "WORKER_PROBE_TIMEOUT_SECS",
                d.worker_probe_timeout,
            )?,
            worker_submit_timeout: parse_duration_secs_env("WORKER_TIMEOUT", d.worker_submit_timeout)?,
            store_write_retries: parse_optional_env("STORE_WRITE_RETRIES", d.store_write_retries)?,
            reaper_interval: parse_duration_secs_env("REAPER_INTERVAL_SECS", d.reaper_interval)?,
            sandbox_max_age: parse_duration_secs_env("SANDBOX_MAX_AGE_SECS", d.sandbox_max_age)?,
            metrics_interval: parse_duration_secs_env("METRICS_INTERVAL_SECS", d.metrics_interval)?,
        })
    }
}
