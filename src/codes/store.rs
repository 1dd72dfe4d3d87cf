//! Key/value primitives the code arbiter builds on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Shared store for reservations, counters and recency logs.
///
/// `reserve` must be a single atomic set-if-absent-with-expiry; the
/// single-use guarantee rests on it.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Set `key` to `value` with `ttl` only if no live value exists.
    async fn reserve(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key` only if it still holds `expected`.
    async fn release(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Increment a counter, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Counter value, zero if absent.
    async fn counter(&self, key: &str) -> Result<i64, StoreError>;

    /// Add `member` at `score` to a log capped at the newest `cap` entries.
    async fn push_recent(&self, key: &str, member: &str, score: f64, cap: usize)
    -> Result<(), StoreError>;

    /// Newest `limit` entries of a log, newest first.
    async fn recent(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StoreError>;

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

struct Expiring {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    values: HashMap<String, Expiring>,
    counters: HashMap<String, i64>,
    logs: HashMap<String, Vec<(String, f64)>>,
}

/// In-process store with clock-driven expiry.
pub struct InMemoryReservationStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn live<'a>(values: &'a HashMap<String, Expiring>, key: &str, now: DateTime<Utc>) -> Option<&'a Expiring> {
        values.get(key).filter(|e| e.expires_at > now)
    }
}

impl Default for InMemoryReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn reserve(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if Self::live(&state.values, key, now).is_some() {
            return Ok(false);
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Query(format!("invalid ttl: {}", e)))?;
        state.values.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        Ok(Self::live(&state.values, key, now).is_some())
    }

    async fn release(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let held = Self::live(&state.values, key, now).is_some_and(|e| e.value == expected);
        if held {
            state.values.remove(key);
        }
        Ok(held)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn counter(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.counters.get(key).copied().unwrap_or(0))
    }

    async fn push_recent(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cap: usize,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let log = state.logs.entry(key.to_string()).or_default();
        log.retain(|(m, _)| m != member);
        log.push((member.to_string(), score));
        log.sort_by(|a, b| a.1.total_cmp(&b.1));
        if log.len() > cap {
            let excess = log.len() - cap;
            log.drain(..excess);
        }
        Ok(())
    }

    async fn recent(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .get(key)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for key in keys {
            state.values.remove(key);
            state.counters.remove(key);
            state.logs.remove(key);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
