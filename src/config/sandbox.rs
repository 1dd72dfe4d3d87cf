use std::time::Duration;

use crate::config::helpers::{
    parse_bool_env, parse_duration_secs_env, parse_optional_env, parse_string_env,
};
use crate::error::ConfigError;

/// Which control plane hosts browser sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    Kubernetes,
    Docker,
}

impl std::str::FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "kubernetes" | "k8s" | "openshift" => Ok(Self::Kubernetes),
            "docker" => Ok(Self::Docker),
            other => Err(format!(
                "unknown sandbox backend '{}', expected 'kubernetes' or 'docker'",
                other
            )),
        }
    }
}

impl std::fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kubernetes => write!(f, "kubernetes"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// Browser sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Namespace for pods and services (Kubernetes only).
    pub namespace: String,
    /// Browser image.
    pub image: String,
    /// Prefix of generated sandbox ids.
    pub id_prefix: String,
    /// Port the browser service listens on inside the sandbox.
    pub port: u16,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    /// Service account for sandbox pods (Kubernetes only).
    pub service_account: String,
    /// User-defined network sandboxes join (Docker only).
    pub docker_network: String,
    pub readiness_path: String,
    pub liveness_path: String,
    /// Upper bound on waiting for the compute unit to report ready.
    pub ready_timeout: Duration,
    /// Interval between compute unit status reads.
    pub poll_interval: Duration,
    /// Application-level health check attempts once the unit is ready.
    pub health_attempts: u32,
    pub health_interval: Duration,
    /// Per-request timeout of a single health check.
    pub health_timeout: Duration,
    /// Per-call timeout for control plane requests.
    pub api_timeout: Duration,
    /// Terminate every active sandbox on shutdown.
    pub cleanup_on_shutdown: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Kubernetes,
            namespace: "rpa-system".to_string(),
            image: "rpa-browser:v2.0-enhanced".to_string(),
            id_prefix: "browser".to_string(),
            port: 8080,
            cpu_request: "500m".to_string(),
            cpu_limit: "2".to_string(),
            memory_request: "1Gi".to_string(),
            memory_limit: "4Gi".to_string(),
            service_account: "rpa-browser-sa".to_string(),
            docker_network: "rpa-net".to_string(),
            readiness_path: "/health/ready".to_string(),
            liveness_path: "/health/live".to_string(),
            ready_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            health_attempts: 10,
            health_interval: Duration::from_secs(2),
            health_timeout: Duration::from_secs(3),
            api_timeout: Duration::from_secs(15),
            cleanup_on_shutdown: false,
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let d = Self::default();

        let backend = parse_string_env("SANDBOX_BACKEND", d.backend.to_string())?
            .parse()
            .map_err(|message| ConfigError::InvalidValue {
                key: "SANDBOX_BACKEND".to_string(),
                message,
            })?;

        let health_attempts = parse_optional_env("SANDBOX_HEALTH_ATTEMPTS", d.health_attempts)?;
        if health_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_HEALTH_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            backend,
            namespace: parse_string_env("NAMESPACE", d.namespace)?,
            image: parse_string_env("BROWSER_IMAGE", d.image)?,
            id_prefix: parse_string_env("SANDBOX_ID_PREFIX", d.id_prefix)?,
            port: parse_optional_env("SANDBOX_PORT", d.port)?,
            cpu_request: parse_string_env("SANDBOX_CPU_REQUEST", d.cpu_request)?,
            cpu_limit: parse_string_env("SANDBOX_CPU_LIMIT", d.cpu_limit)?,
            memory_request: parse_string_env("SANDBOX_MEMORY_REQUEST", d.memory_request)?,
            memory_limit: parse_string_env("SANDBOX_MEMORY_LIMIT", d.memory_limit)?,
            service_account: parse_string_env("SANDBOX_SERVICE_ACCOUNT", d.service_account)?,
            docker_network: parse_string_env("SANDBOX_DOCKER_NETWORK", d.docker_network)?,
            readiness_path: parse_string_env("SANDBOX_READINESS_PATH", d.readiness_path)?,
            liveness_path: parse_string_env("SANDBOX_LIVENESS_PATH", d.liveness_path)?,
            ready_timeout: parse_duration_secs_env("SANDBOX_READY_TIMEOUT_SECS", d.ready_timeout)?,
            poll_interval: parse_duration_secs_env("SANDBOX_POLL_INTERVAL_SECS", d.poll_interval)?,
            health_attempts,
            health_interval: parse_duration_secs_env(
                "SANDBOX_HEALTH_INTERVAL_SECS",
                d.health_interval,
            )?,
            health_timeout: parse_duration_secs_env(
                "SANDBOX_HEALTH_TIMEOUT_SECS",
                d.health_timeout,
            )?,
            api_timeout: parse_duration_secs_env("SANDBOX_API_TIMEOUT_SECS", d.api_timeout)?,
            cleanup_on_shutdown: parse_bool_env(
                "SANDBOX_CLEANUP_ON_SHUTDOWN",
                d.cleanup_on_shutdown,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    #[test]
    fn backend_parsing() {
        assert_eq!("k8s".parse::<SandboxBackend>().unwrap(), SandboxBackend::Kubernetes);
        assert_eq!("OpenShift".parse::<SandboxBackend>().unwrap(), SandboxBackend::Kubernetes);
        assert_eq!("docker".parse::<SandboxBackend>().unwrap(), SandboxBackend::Docker);
        assert!("podman".parse::<SandboxBackend>().is_err());
    }

    #[test]
    fn resolve_overrides_defaults() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("SANDBOX_BACKEND", "docker");
            std::env::set_var("SANDBOX_READY_TIMEOUT_SECS", "45");
            std::env::set_var("NAMESPACE", "automation");
        }

        let cfg = SandboxConfig::resolve().expect("resolve should succeed");
        assert_eq!(cfg.backend, SandboxBackend::Docker);
        assert_eq!(cfg.ready_timeout, Duration::from_secs(45));
        assert_eq!(cfg.namespace, "automation");
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.health_attempts, 10);

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("SANDBOX_BACKEND");
            std::env::remove_var("SANDBOX_READY_TIMEOUT_SECS");
            std::env::remove_var("NAMESPACE");
        }
    }
}
