//! Configuration for the orchestrator.
//!
//! Settings are loaded with priority: env var > mounted file > default.
//! A `.env` in the working directory is loaded first via dotenvy (it never
//! overrides variables already set). Mounted files come from
//! `/etc/secrets` and `/etc/config` unless `CONFIG_MOUNT_DIRS` says otherwise.

mod api;
mod codes;
mod database;
mod dispatch;
pub(crate) mod helpers;
mod sandbox;

use std::time::Duration;

use crate::error::ConfigError;

pub use self::api::ApiConfig;
pub use self::codes::{CodeArbiterConfig, ValkeyConfig, secret_env_key};
pub use self::database::DatabaseConfig;
pub use self::dispatch::DispatchConfig;
pub use self::sandbox::{SandboxBackend, SandboxConfig};

/// Headroom on top of the computed dispatch deadline.
const DISPATCH_SLACK: Duration = Duration::from_secs(60);

/// Main configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub valkey: ValkeyConfig,
    pub codes: CodeArbiterConfig,
    pub sandbox: SandboxConfig,
    pub dispatch: DispatchConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from the environment (and mounted files).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::build()
    }

    /// Longest one dispatch attempt can take with every wait and retry
    /// exhausted. A job still `dispatching` after this was abandoned.
    pub fn dispatch_deadline(&self) -> Duration {
        let codes = self.codes.window * self.codes.max_attempts;
        // Two creates, status reads and teardown, each with retries.
        let sandbox = self.sandbox.api_timeout * 8
            + self.sandbox.ready_timeout
            + (self.sandbox.health_timeout + self.sandbox.health_interval)
                * self.sandbox.health_attempts;
        let workers = self.dispatch.worker_probe_timeout * self.dispatch.worker_urls.len() as u32
            + self.dispatch.worker_submit_timeout * 3;
        codes + sandbox + workers + DISPATCH_SLACK
    }

    fn build() -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve()?,
            valkey: ValkeyConfig::resolve()?,
            codes: CodeArbiterConfig::resolve()?,
            sandbox: SandboxConfig::resolve()?,
            dispatch: DispatchConfig::resolve()?,
            api: ApiConfig::resolve()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_deadline_covers_every_wait() {
        let mut config = Config {
            database: DatabaseConfig {
                url: None,
                pool_size: 1,
            },
            valkey: ValkeyConfig::default(),
            codes: CodeArbiterConfig::default(),
            sandbox: SandboxConfig::default(),
            dispatch: DispatchConfig::default(),
            api: ApiConfig::default(),
        };
        let base = config.dispatch_deadline();
        assert!(base > config.sandbox.ready_timeout + config.codes.window * config.codes.max_attempts);
        assert!(base > config.dispatch.worker_submit_timeout);

        config.dispatch.worker_urls = vec!["http://w1".to_string(), "http://w2".to_string()];
        assert_eq!(
            config.dispatch_deadline(),
            base + config.dispatch.worker_probe_timeout * 2
        );
    }
}
