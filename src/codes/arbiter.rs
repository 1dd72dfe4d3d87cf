//! Single-use arbitration of time-windowed codes across concurrent jobs.
//!
//! A code value may be handed to at most one job while its reservation is
//! live. Reservations are a set-if-absent-with-expiry on
//! `otp:reserved:{family}:{code}`, so two dispatchers racing for the same
//! window resolve in the store, not in this process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};

use crate::clock::{Clock, elapsed};
use crate::codes::store::ReservationStore;
use crate::codes::totp::TotpGenerator;
use crate::config::CodeArbiterConfig;
use crate::error::CodeError;

const RECENT_JOBS_IN_METRICS: usize = 10;

fn reserved_key(family: &str, code: &str) -> String {
    format!("otp:reserved:{}:{}", family, code)
}

fn consumed_key(family: &str, job_id: i64) -> String {
    format!("otp:consumed:{}:{}", family, job_id)
}

fn generated_key(family: &str) -> String {
    format!("otp:generated:{}", family)
}

fn outcome_key(family: &str, success: bool) -> String {
    let outcome = if success { "success" } else { "failure" };
    format!("otp:outcome:{}:{}", family, outcome)
}

fn timeline_key(family: &str) -> String {
    format!("otp:timeline:{}", family)
}

/// A reservation this process made and may still release.
#[derive(Debug, Clone)]
struct HeldReservation {
    family: String,
    key: String,
    value: String,
    reserved_at: DateTime<Utc>,
}

/// Per-family usage numbers.
#[derive(Debug, Clone, Serialize)]
pub struct CodeMetrics {
    pub family: String,
    pub generated: i64,
    pub consumed: i64,
    pub successes: i64,
    pub failures: i64,
    /// Percentage of consumed codes that succeeded.
    pub success_rate: f64,
    pub recent: Vec<RecentIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentIssue {
    pub job_id: String,
    pub issued_at: DateTime<Utc>,
}

pub struct CodeArbiter {
    store: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    generators: HashMap<String, TotpGenerator>,
    code_providers: HashSet<String>,
    reservation_ttl: Duration,
    consumption_ttl: Duration,
    recent_log_cap: usize,
    held: Mutex<HashMap<i64, HeldReservation>>,
    shutdown: watch::Receiver<bool>,
}

impl CodeArbiter {
    /// Build generators for every configured secret. Families whose secret
    /// does not decode are logged and left out.
    pub fn new(
        config: &CodeArbiterConfig,
        store: Arc<dyn ReservationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut generators = HashMap::new();
        for (family, secret) in &config.secrets {
            let family = family.to_lowercase();
            match TotpGenerator::from_base32(&family, secret, config.window) {
                Ok(g) => {
                    generators.insert(family, g);
                }
                Err(e) => tracing::error!("Skipping code family: {}", e),
            }
        }

        let (_never, shutdown) = watch::channel(false);
        Self {
            store,
            clock,
            generators,
            code_providers: config
                .code_providers
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            reservation_ttl: config.reservation_ttl,
            consumption_ttl: config.consumption_ttl,
            recent_log_cap: config.recent_log_cap,
            held: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Abort next-window waits when `shutdown` flips to true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn provider_requires_code(&self, provider: &str) -> bool {
        self.code_providers.contains(&provider.to_lowercase())
    }

    /// Families with a usable secret, sorted.
    pub fn loaded_families(&self) -> Vec<String> {
        let mut families: Vec<String> = self.generators.keys().cloned().collect();
        families.sort();
        families
    }

    /// Reserve the current window's code for `job_id`.
    ///
    /// On a collision, waits for the next window and tries again, up to
    /// `max_attempts` windows in total.
    pub async fn acquire_code(
        &self,
        family: &str,
        job_id: i64,
        max_attempts: u32,
    ) -> Result<String, CodeError> {
        let family = family.to_lowercase();
        let generator = self
            .generators
            .get(&family)
            .ok_or_else(|| CodeError::UnknownFamily {
                family: family.clone(),
            })?;

        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            let now = self.clock.now();
            let code = generator.code_at(now);
            let key = reserved_key(&family, &code);
            let value = serde_json::json!({
                "job_id": job_id,
                "reserved_at": now.to_rfc3339(),
                "provider": family,
            })
            .to_string();

            match self.store.reserve(&key, &value, self.reservation_ttl).await {
                Ok(true) => {
                    self.remember(job_id, &family, key, value, now).await;
                    self.record_issue(&family, job_id, now).await;
                    tracing::info!(
                        job_id = job_id,
                        family = %family,
                        attempt = attempt,
                        "Reserved one-time code"
                    );
                    return Ok(code);
                }
                Ok(false) => {
                    tracing::debug!(
                        job_id = job_id,
                        family = %family,
                        attempt = attempt,
                        "Current code already reserved by another job"
                    );
                }
                Err(e) => {
                    // Treated as a collision: never hand out an unreserved code.
                    tracing::warn!(
                        job_id = job_id,
                        family = %family,
                        attempt = attempt,
                        error = %e,
                        "Reservation store error, assuming code in use"
                    );
                }
            }

            if attempt < attempts {
                let wait = generator.until_next_window(self.clock.now());
                tracing::info!(
                    job_id = job_id,
                    family = %family,
                    wait_secs = wait.as_secs(),
                    "Waiting for next code window"
                );
                if !self.wait_or_shutdown(wait).await {
                    return Err(CodeError::Cancelled { family });
                }
            }
        }

        tracing::error!(job_id = job_id, family = %family, attempts = attempts, "Code acquisition exhausted");
        Err(CodeError::Exhausted { family, attempts })
    }

    /// Sleep for `wait`; returns false if shutdown fired first.
    async fn wait_or_shutdown(&self, wait: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            biased;
            stopped = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => {
                if stopped {
                    false
                } else {
                    // Sender gone: no shutdown can arrive any more.
                    self.clock.sleep(wait).await;
                    true
                }
            }
            _ = self.clock.sleep(wait) => true,
        }
    }

    async fn remember(
        &self,
        job_id: i64,
        family: &str,
        key: String,
        value: String,
        now: DateTime<Utc>,
    ) {
        let mut held = self.held.lock().await;
        let ttl = self.reservation_ttl;
        held.retain(|_, h| elapsed(h.reserved_at, now) < ttl);
        held.insert(
            job_id,
            HeldReservation {
                family: family.to_string(),
                key,
                value,
                reserved_at: now,
            },
        );
    }

    async fn record_issue(&self, family: &str, job_id: i64, now: DateTime<Utc>) {
        if let Err(e) = self.store.incr(&generated_key(family)).await {
            tracing::warn!(family = %family, error = %e, "Failed to bump generation counter");
        }
        if let Err(e) = self
            .store
            .push_recent(
                &timeline_key(family),
                &job_id.to_string(),
                now.timestamp() as f64,
                self.recent_log_cap,
            )
            .await
        {
            tracing::warn!(family = %family, error = %e, "Failed to append to code timeline");
        }
    }

    /// Drop this job's reservation early. Only for codes that never left
    /// the orchestrator; the TTL covers everything else.
    pub async fn release(&self, family: &str, job_id: i64) -> bool {
        let family = family.to_lowercase();
        let held = {
            let mut held = self.held.lock().await;
            match held.get(&job_id) {
                Some(h) if h.family == family => held.remove(&job_id),
                _ => None,
            }
        };
        let Some(held) = held else {
            return false;
        };

        match self.store.release(&held.key, &held.value).await {
            Ok(released) => {
                tracing::debug!(job_id = job_id, family = %family, released, "Released code reservation");
                released
            }
            Err(e) => {
                tracing::warn!(job_id = job_id, family = %family, error = %e, "Failed to release code reservation; it will expire");
                false
            }
        }
    }

    /// Record the outcome of a code use. Idempotent per (family, job); never fails.
    pub async fn mark_consumed(&self, family: &str, job_id: i64, success: bool) {
        let family = family.to_lowercase();
        self.held.lock().await.remove(&job_id);

        let now = self.clock.now();
        let record = serde_json::json!({
            "job_id": job_id,
            "success": success,
            "consumed_at": now.to_rfc3339(),
        })
        .to_string();

        match self
            .store
            .reserve(&consumed_key(&family, job_id), &record, self.consumption_ttl)
            .await
        {
            Ok(true) => {
                if let Err(e) = self.store.incr(&outcome_key(&family, success)).await {
                    tracing::warn!(job_id = job_id, family = %family, error = %e, "Failed to record code outcome");
                }
                tracing::info!(job_id = job_id, family = %family, success, "Marked code consumed");
            }
            Ok(false) => {
                tracing::debug!(job_id = job_id, family = %family, "Code consumption already recorded");
            }
            Err(e) => {
                tracing::warn!(job_id = job_id, family = %family, error = %e, "Failed to mark code consumed");
            }
        }
    }

    /// Store reachable and at least one family usable.
    pub async fn health(&self) -> bool {
        if self.generators.is_empty() {
            return false;
        }
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Reservation store health check failed");
                false
            }
        }
    }

    pub async fn metrics(&self, family: &str) -> Result<CodeMetrics, CodeError> {
        let family = family.to_lowercase();
        let generated = self.store.counter(&generated_key(&family)).await?;
        let successes = self.store.counter(&outcome_key(&family, true)).await?;
        let failures = self.store.counter(&outcome_key(&family, false)).await?;
        let consumed = successes + failures;
        let success_rate = if consumed > 0 {
            (successes as f64 / consumed as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        let recent = self
            .store
            .recent(&timeline_key(&family), RECENT_JOBS_IN_METRICS)
            .await?
            .into_iter()
            .map(|(job_id, score)| RecentIssue {
                job_id,
                issued_at: Utc
                    .timestamp_opt(score as i64, 0)
                    .single()
                    .unwrap_or_default(),
            })
            .collect();

        Ok(CodeMetrics {
            family,
            generated,
            consumed,
            successes,
            failures,
            success_rate,
            recent,
        })
    }

    /// Clear counters and the timeline. Live reservations are untouched.
    pub async fn reset_metrics(&self, family: &str) -> Result<(), CodeError> {
        let family = family.to_lowercase();
        self.store
            .delete(&[
                generated_key(&family),
                outcome_key(&family, true),
                outcome_key(&family, false),
                timeline_key(&family),
            ])
            .await?;
        tracing::info!(family = %family, "Reset code metrics");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::store::InMemoryReservationStore;
    use crate::testing::ManualClock;
    use secrecy::SecretString;

    const SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    fn config() -> CodeArbiterConfig {
        let mut cfg = CodeArbiterConfig::default();
        cfg.secrets
            .insert("octotel".to_string(), SecretString::from(SECRET.to_string()));
        cfg
    }

    fn arbiter(clock: Arc<ManualClock>) -> (CodeArbiter, Arc<InMemoryReservationStore>) {
        let store = Arc::new(InMemoryReservationStore::with_clock(clock.clone()));
        (CodeArbiter::new(&config(), store.clone(), clock), store)
    }

    #[test]
    fn provider_lookup_is_case_insensitive() {
        let (arbiter, _) = arbiter(Arc::new(ManualClock::new()));
        assert!(arbiter.provider_requires_code("octotel"));
        assert!(arbiter.provider_requires_code("OCTOTEL"));
        assert!(!arbiter.provider_requires_code("mfn"));
    }

    #[tokio::test]
    async fn uncontended_acquire_returns_six_digits_first_try() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_030));
        let (arbiter, store) = arbiter(clock.clone());

        let code = arbiter.acquire_code("octotel", 1, 3).await.unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert!(clock.sleeps().is_empty());
        assert!(store.exists(&reserved_key("octotel", &code)).await.unwrap());

        // Reservation outlives the 30s window but not the 60s TTL.
        clock.advance(Duration::from_secs(59));
        assert!(store.exists(&reserved_key("octotel", &code)).await.unwrap());
        clock.advance(Duration::from_secs(1));
        assert!(!store.exists(&reserved_key("octotel", &code)).await.unwrap());
    }

    #[tokio::test]
    async fn second_job_in_same_window_waits_for_rollover() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_030));
        let (arbiter, _) = arbiter(clock.clone());

        let first = arbiter.acquire_code("octotel", 1, 3).await.unwrap();
        let second = arbiter.acquire_code("octotel", 2, 3).await.unwrap();

        assert_ne!(first, second);
        // 1_700_000_030 is 20s into its window: wait 10s + 1.
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(11)]);
    }

    #[tokio::test]
    async fn exhausted_after_max_attempts() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_030));
        let (arbiter, store) = arbiter(clock.clone());

        // Pre-reserve the next three windows' codes for other jobs.
        let generator = TotpGenerator::from_base32(
            "octotel",
            &SecretString::from(SECRET.to_string()),
            Duration::from_secs(30),
        )
        .unwrap();
        for window in 0..3 {
            let at = clock.now() + chrono::Duration::seconds(30 * window);
            let code = generator.code_at(at);
            store
                .reserve(&reserved_key("octotel", &code), "other", Duration::from_secs(600))
                .await
                .unwrap();
        }

        let err = arbiter.acquire_code("octotel", 7, 3).await.unwrap_err();
        assert!(matches!(err, CodeError::Exhausted { attempts: 3, .. }));
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn unknown_family_fails_without_waiting() {
        let clock = Arc::new(ManualClock::new());
        let (arbiter, _) = arbiter(clock.clone());

        let err = arbiter.acquire_code("evotel", 1, 3).await.unwrap_err();
        assert!(matches!(err, CodeError::UnknownFamily { .. }));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_window_wait() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_030));
        let (tx, rx) = watch::channel(false);
        let store = Arc::new(InMemoryReservationStore::with_clock(clock.clone()));
        let arbiter = CodeArbiter::new(&config(), store, clock.clone()).with_shutdown(rx);

        arbiter.acquire_code("octotel", 1, 3).await.unwrap();
        tx.send(true).unwrap();

        let err = arbiter.acquire_code("octotel", 2, 3).await.unwrap_err();
        assert!(matches!(err, CodeError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn release_frees_code_for_another_job() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_030));
        let (arbiter, _) = arbiter(clock.clone());

        let first = arbiter.acquire_code("octotel", 1, 3).await.unwrap();
        assert!(!arbiter.release("octotel", 2).await);
        assert!(arbiter.release("octotel", 1).await);

        let again = arbiter.acquire_code("octotel", 2, 1).await.unwrap();
        assert_eq!(first, again);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn mark_consumed_counts_once() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_030));
        let (arbiter, _) = arbiter(clock.clone());

        arbiter.acquire_code("octotel", 1, 3).await.unwrap();
        arbiter.mark_consumed("octotel", 1, true).await;
        arbiter.mark_consumed("octotel", 1, true).await;
        arbiter.acquire_code("octotel", 2, 3).await.unwrap();
        arbiter.mark_consumed("octotel", 2, false).await;

        let metrics = arbiter.metrics("octotel").await.unwrap();
        assert_eq!(metrics.generated, 2);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.consumed, 2);
        assert_eq!(metrics.success_rate, 50.0);
        let recent: Vec<&str> = metrics.recent.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(recent, vec!["2", "1"]);

        arbiter.reset_metrics("octotel").await.unwrap();
        let metrics = arbiter.metrics("octotel").await.unwrap();
        assert_eq!(metrics.generated, 0);
        assert!(metrics.recent.is_empty());
    }

    #[tokio::test]
    async fn health_requires_a_loaded_family() {
        let clock = Arc::new(ManualClock::new());
        let (arbiter, _) = arbiter(clock.clone());
        assert!(arbiter.health().await);

        let empty = CodeArbiter::new(
            &CodeArbiterConfig::default(),
            Arc::new(InMemoryReservationStore::new()),
            clock,
        );
        assert!(!empty.health().await);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_share_a_code() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let (arbiter, _) = arbiter(clock.clone());
        let arbiter = Arc::new(arbiter);

        let mut handles = Vec::new();
        for job_id in 1..=4 {
            let arbiter = Arc::clone(&arbiter);
            handles.push(tokio::spawn(async move {
                arbiter.acquire_code("octotel", job_id, 1).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(CodeError::Exhausted { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
    }
}
