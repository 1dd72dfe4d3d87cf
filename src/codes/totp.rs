//! RFC 6238 time-based one-time codes (HMAC-SHA1).

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;

use crate::error::CodeError;

const DIGITS: u32 = 6;

/// Generates codes for one family from its shared base32 secret.
pub struct TotpGenerator {
    /// Keyed HMAC state; cloned per code so the raw key is not kept around.
    mac: Hmac<Sha1>,
    step: Duration,
}

impl std::fmt::Debug for TotpGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TotpGenerator")
            .field("key", &"[REDACTED]")
            .field("step", &self.step)
            .finish()
    }
}

impl TotpGenerator {
    /// Decode a base32 secret. Lowercase, spaces and `=` padding are tolerated.
    pub fn from_base32(family: &str, secret: &SecretString, step: Duration) -> Result<Self, CodeError> {
        let normalized: String = secret
            .expose_secret()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '=' && *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if normalized.is_empty() {
            return Err(CodeError::InvalidSecret {
                family: family.to_string(),
                reason: "secret is empty".to_string(),
            });
        }
        let key = data_encoding::BASE32_NOPAD
            .decode(normalized.as_bytes())
            .map_err(|e| CodeError::InvalidSecret {
                family: family.to_string(),
                reason: e.to_string(),
            })?;
        if step.as_secs() == 0 {
            return Err(CodeError::InvalidSecret {
                family: family.to_string(),
                reason: "window must be at least one second".to_string(),
            });
        }
        let mac = Hmac::<Sha1>::new_from_slice(&key).map_err(|e| CodeError::InvalidSecret {
            family: family.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { mac, step })
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Index of the window containing `at`.
    pub fn window_index(&self, at: DateTime<Utc>) -> u64 {
        (at.timestamp().max(0) as u64) / self.step.as_secs()
    }

    /// Code valid in the window containing `at`.
    pub fn code_at(&self, at: DateTime<Utc>) -> String {
        self.code_for_counter(self.window_index(at))
    }

    fn code_for_counter(&self, counter: u64) -> String {
        let mut mac = self.mac.clone();
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        format!("{:0width$}", binary % 10u32.pow(DIGITS), width = DIGITS as usize)
    }

    /// Time from `at` until one second into the next window.
    pub fn until_next_window(&self, at: DateTime<Utc>) -> Duration {
        let step = self.step.as_secs();
        let into = (at.timestamp().max(0) as u64) % step;
        Duration::from_secs(step - into + 1)
    }
}
