use std::collections::HashMap;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{
    optional_env, parse_duration_secs_env, parse_list_env, parse_optional_env, parse_string_env,
};
use crate::error::ConfigError;

/// Connection settings for the Valkey (Redis protocol) reservation store.
#[derive(Debug, Clone)]
pub struct ValkeyConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<SecretString>,
    pub db: i64,
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            host: "valkey-service".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl ValkeyConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: parse_string_env("VALKEY_HOST", defaults.host)?,
            port: parse_optional_env("VALKEY_PORT", defaults.port)?,
            password: optional_env("VALKEY_PASSWORD")?.map(SecretString::from),
            db: parse_optional_env("VALKEY_DB", defaults.db)?,
        })
    }

    /// Connection URL. Contains the password, so it is wrapped as a secret.
    pub fn url(&self) -> SecretString {
        let auth = match self.password {
            Some(ref pw) => format!(":{}@", pw.expose_secret()),
            None => String::new(),
        };
        SecretString::from(format!(
            "redis://{}{}:{}/{}",
            auth, self.host, self.port, self.db
        ))
    }
}

/// One-time code arbitration settings.
#[derive(Debug, Clone)]
pub struct CodeArbiterConfig {
    /// Providers whose jobs need a one-time code (lowercase).
    pub code_providers: Vec<String>,
    /// Loaded base32 secrets keyed by lowercase family name.
    pub secrets: HashMap<String, SecretString>,
    /// Code validity window.
    pub window: Duration,
    /// How long a reservation blocks reuse of a code value.
    pub reservation_ttl: Duration,
    /// Acquisition attempts (one per window) before giving up.
    pub max_attempts: u32,
    /// How long a consumption record is kept.
    pub consumption_ttl: Duration,
    /// Cap on the per-family recency log.
    pub recent_log_cap: usize,
}

impl Default for CodeArbiterConfig {
    fn default() -> Self {
        Self {
            code_providers: vec!["octotel".to_string()],
            secrets: HashMap::new(),
            window: Duration::from_secs(30),
            reservation_ttl: Duration::from_secs(60),
            max_attempts: 3,
            consumption_ttl: Duration::from_secs(3600),
            recent_log_cap: 1000,
        }
    }
}

impl CodeArbiterConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut code_providers: Vec<String> = parse_list_env("CODE_PROVIDERS")?
            .into_iter()
            .map(|p| p.to_lowercase())
            .collect();
        if code_providers.is_empty() {
            code_providers = defaults.code_providers;
        }

        let mut secrets = HashMap::new();
        for family in &code_providers {
            let key = secret_env_key(family);
            match optional_env(&key)? {
                Some(secret) => {
                    secrets.insert(family.clone(), SecretString::from(secret));
                }
                None => tracing::warn!("No one-time code secret configured for '{}' ({})", family, key),
            }
        }

        let max_attempts = parse_optional_env("CODE_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CODE_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let window = parse_duration_secs_env("CODE_WINDOW_SECS", defaults.window)?;
        if window.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "CODE_WINDOW_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            code_providers,
            secrets,
            window,
            reservation_ttl: parse_duration_secs_env(
                "CODE_RESERVATION_TTL_SECS",
                defaults.reservation_ttl,
            )?,
            max_attempts,
            consumption_ttl: parse_duration_secs_env(
                "CODE_CONSUMPTION_TTL_SECS",
                defaults.consumption_ttl,
            )?,
            recent_log_cap: parse_optional_env("CODE_RECENT_LOG_CAP", defaults.recent_log_cap)?,
        })
    }
}

/// Env key holding a family's shared secret: `octotel` -> `OCTOTEL_TOTP_SECRET`.
pub fn secret_env_key(family: &str) -> String {
    format!("{}_TOTP_SECRET", family.to_uppercase().replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    fn clear_code_env() {
        // SAFETY: Only called under ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("CODE_PROVIDERS");
            std::env::remove_var("CODE_MAX_ATTEMPTS");
            std::env::remove_var("CODE_WINDOW_SECS");
            std::env::remove_var("OCTOTEL_TOTP_SECRET");
            std::env::remove_var("EVOTEL_TOTP_SECRET");
        }
    }

    #[test]
    fn defaults_match_window_and_ttl() {
        let cfg = CodeArbiterConfig::default();
        assert_eq!(cfg.window, Duration::from_secs(30));
        assert_eq!(cfg.reservation_ttl, Duration::from_secs(60));
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.code_providers, vec!["octotel"]);
    }

    #[test]
    fn secrets_loaded_per_family() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_code_env();
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("CODE_PROVIDERS", "Octotel,evotel");
            std::env::set_var("OCTOTEL_TOTP_SECRET", "JBSWY3DPEHPK3PXP");
        }

        let cfg = CodeArbiterConfig::resolve().expect("resolve should succeed");
        assert_eq!(cfg.code_providers, vec!["octotel", "evotel"]);
        assert!(cfg.secrets.contains_key("octotel"));
        assert!(!cfg.secrets.contains_key("evotel"));

        clear_code_env();
    }

    #[test]
    fn zero_attempts_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_code_env();
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("CODE_MAX_ATTEMPTS", "0");
        }

        assert!(CodeArbiterConfig::resolve().is_err());

        clear_code_env();
    }

    #[test]
    fn valkey_url_includes_password_and_db() {
        let cfg = ValkeyConfig {
            password: Some(SecretString::from("pw".to_string())),
            db: 2,
            ..Default::default()
        };
        assert_eq!(cfg.url().expose_secret(), "redis://:pw@valkey-service:6379/2");
        assert_eq!(
            ValkeyConfig::default().url().expose_secret(),
            "redis://valkey-service:6379/0"
        );
    }

    #[test]
    fn secret_key_naming() {
        assert_eq!(secret_env_key("octotel"), "OCTOTEL_TOTP_SECRET");
        assert_eq!(secret_env_key("my-isp"), "MY_ISP_TOTP_SECRET");
    }
}
