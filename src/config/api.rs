use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_duration_secs_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Callback listener and external notification settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Base URL workers use to reach this process.
    pub public_url: String,
    /// Shared bearer token workers must present on callbacks.
    pub callback_token: Option<SecretString>,
    /// Where completion reports are forwarded, if anywhere.
    pub notify_endpoint: Option<String>,
    pub notify_token: Option<SecretString>,
    pub notify_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8620,
            public_url: "http://rpa-orchestrator:8620".to_string(),
            callback_token: None,
            notify_endpoint: None,
            notify_token: None,
            notify_timeout: Duration::from_secs(10),
        }
    }
}

impl ApiConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let d = Self::default();
        let port = parse_optional_env("ORCHESTRATOR_PORT", d.port)?;
        let default_url = format!("http://rpa-orchestrator:{}", port);

        Ok(Self {
            host: parse_string_env("ORCHESTRATOR_HOST", d.host)?,
            port,
            public_url: parse_string_env("ORCHESTRATOR_URL", default_url)?
                .trim_end_matches('/')
                .to_string(),
            callback_token: optional_env("WORKER_CALLBACK_TOKEN")?.map(SecretString::from),
            notify_endpoint: optional_env("CALLBACK_ENDPOINT")?,
            notify_token: optional_env("CALLBACK_AUTH_TOKEN")?.map(SecretString::from),
            notify_timeout: parse_duration_secs_env("CALLBACK_TIMEOUT", d.notify_timeout)?,
        })
    }

    /// Callback address handed to workers in every job payload.
    pub fn callback_url(&self) -> String {
        format!("{}/callbacks/job-complete", self.public_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_url_appends_route() {
        let cfg = ApiConfig {
            public_url: "http://orch.rpa-system:8620".to_string(),
            ..Default::default()
        };
        assert_eq!(
            cfg.callback_url(),
            "http://orch.rpa-system:8620/callbacks/job-complete"
        );
    }
}
