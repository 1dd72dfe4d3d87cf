use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// PostgreSQL job store settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `None` means run with the in-memory job store.
    pub url: Option<SecretString>,
    pub pool_size: usize,
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            url: optional_env("DATABASE_URL")?.map(SecretString::from),
            pool_size: parse_optional_env("DATABASE_POOL_SIZE", 10)?,
        })
    }
}
