//! Shared env-lookup helpers for the `resolve()` functions.
//!
//! Lookup order is: process env, then values mounted as files (Kubernetes
//! secrets/config maps), then the caller's default. Empty values count as
//! unset.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::ConfigError;

/// Serializes tests that mutate process env.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Directories scanned for mounted values when `CONFIG_MOUNT_DIRS` is unset.
const DEFAULT_MOUNT_DIRS: &[&str] = &["/etc/secrets", "/etc/config"];

/// Values read from mounted files, loaded once on first lookup.
static MOUNTED_VARS: OnceLock<HashMap<String, String>> = OnceLock::new();

fn mounted_vars() -> &'static HashMap<String, String> {
    MOUNTED_VARS.get_or_init(|| {
        let dirs: Vec<PathBuf> = match std::env::var("CONFIG_MOUNT_DIRS") {
            Ok(v) if !v.trim().is_empty() => v
                .split(',')
                .map(|d| PathBuf::from(d.trim()))
                .filter(|p| !p.as_os_str().is_empty())
                .collect(),
            _ => DEFAULT_MOUNT_DIRS.iter().map(PathBuf::from).collect(),
        };
        load_mounted_values(&dirs)
    })
}

/// Map a mounted file name to its env key: `valkey-password` -> `VALKEY_PASSWORD`.
pub(crate) fn mounted_key(file_name: &str) -> String {
    file_name.to_uppercase().replace(['-', '.'], "_")
}

/// Read every regular file in `dirs` into a key/value map.
///
/// Earlier directories win on key collisions. Hidden files (the `..data`
/// symlinks Kubernetes creates) are skipped.
pub(crate) fn load_mounted_values(dirs: &[PathBuf]) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match read_trimmed(&path) {
                Some(value) => {
                    values.entry(mounted_key(&name)).or_insert(value);
                }
                None => tracing::debug!("Skipping unreadable mounted value {}", path.display()),
            }
        }
    }
    values
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Look up a value in the process env, then in mounted files.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => return Ok(Some(val)),
        Ok(_) | Err(std::env::VarError::NotPresent) => {}
        Err(std::env::VarError::NotUnicode(_)) => {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "value is not valid UTF-8".to_string(),
            });
        }
    }
    Ok(mounted_vars().get(key).cloned())
}

/// Parse a value with `FromStr`, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(default),
    }
}

/// Parse a boolean, accepting the usual on/off spellings.
pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{}'", raw),
        }),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" | "enabled" => Some(true),
        "false" | "no" | "0" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_string_env(
    key: &str,
    default: impl Into<String>,
) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.into()))
}

/// Parse a list given either as `a,b,c` or as a JSON array of strings.
pub(crate) fn parse_list_env(key: &str) -> Result<Vec<String>, ConfigError> {
    match optional_env(key)? {
        Some(raw) => parse_list(&raw).map_err(|message| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        }),
        None => Ok(Vec::new()),
    }
}

fn parse_list(raw: &str) -> Result<Vec<String>, String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        let items: Vec<String> =
            serde_json::from_str(trimmed).map_err(|e| format!("invalid JSON list: {}", e))?;
        return Ok(items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect());
    }
    Ok(trimmed
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Parse a whole number of seconds into a `Duration`.
pub(crate) fn parse_duration_secs_env(
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_optional_env(key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_spellings() {
        for raw in ["true", "YES", "1", "on", "Enabled"] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["false", "no", "0", "OFF", "disabled"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn list_accepts_csv_and_json() {
        assert_eq!(
            parse_list("http://a:8621, http://b:8621,").unwrap(),
            vec!["http://a:8621", "http://b:8621"]
        );
        assert_eq!(
            parse_list(r#"["http://a:8621", "http://b:8621"]"#).unwrap(),
            vec!["http://a:8621", "http://b:8621"]
        );
        assert!(parse_list("[not json").is_err());
    }

    #[test]
    fn env_wins_and_empty_is_unset() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("RPA_TEST_HELPER_VALUE", "42");
            std::env::set_var("RPA_TEST_HELPER_EMPTY", "  ");
        }

        assert_eq!(parse_optional_env("RPA_TEST_HELPER_VALUE", 7u32).unwrap(), 42);
        assert_eq!(parse_optional_env("RPA_TEST_HELPER_EMPTY", 7u32).unwrap(), 7);
        assert_eq!(
            parse_duration_secs_env("RPA_TEST_HELPER_VALUE", Duration::from_secs(1)).unwrap(),
            Duration::from_secs(42)
        );

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("RPA_TEST_HELPER_VALUE", "forty-two");
        }
        let err = parse_optional_env("RPA_TEST_HELPER_VALUE", 7u32).unwrap_err();
        assert!(err.to_string().contains("RPA_TEST_HELPER_VALUE"));

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("RPA_TEST_HELPER_VALUE");
            std::env::remove_var("RPA_TEST_HELPER_EMPTY");
        }
    }

    #[test]
    fn mounted_files_map_to_env_keys() {
        let secrets = tempfile::tempdir().unwrap();
        let config = tempfile::tempdir().unwrap();
        std::fs::write(secrets.path().join("valkey-password"), "s3cret\n").unwrap();
        std::fs::write(secrets.path().join("..data"), "ignored").unwrap();
        std::fs::write(config.path().join("valkey-password"), "shadowed").unwrap();
        std::fs::write(config.path().join("worker.urls"), "http://w1:8621").unwrap();
        std::fs::write(config.path().join("EMPTY"), "   ").unwrap();

        let values = load_mounted_values(&[
            secrets.path().to_path_buf(),
            config.path().to_path_buf(),
        ]);

        assert_eq!(values.get("VALKEY_PASSWORD").map(String::as_str), Some("s3cret"));
        assert_eq!(values.get("WORKER_URLS").map(String::as_str), Some("http://w1:8621"));
        assert!(!values.contains_key("EMPTY"));
        assert!(!values.contains_key(".._DATA"));
        assert_eq!(values.len(), 2);
    }
}
