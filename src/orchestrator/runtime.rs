//! Composition root: builds every component from config and runs the loops.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::clock::{Clock, SystemClock};
use crate::codes::{CodeArbiter, InMemoryReservationStore, ReservationStore, ValkeyReservationStore};
use crate::config::{Config, SandboxBackend};
use crate::error::OrchestratorError;
use crate::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use crate::observability::MetricsReporter;
use crate::orchestrator::api::{CallbackApi, CallbackState};
use crate::orchestrator::auth::CallbackAuth;
use crate::orchestrator::completion::CompletionHandler;
use crate::orchestrator::dispatcher::{DispatchSettings, JobDispatcher};
use crate::orchestrator::notify::CompletionNotifier;
use crate::orchestrator::reaper::IdleReaper;
use crate::orchestrator::reconcile::Reconciler;
use crate::sandbox::{
    ComputeControlPlane, DockerControlPlane, HttpReadinessProbe, KubernetesControlPlane,
    ReadinessProbe, SandboxProvisioner,
};
use crate::worker::{HttpWorkerClient, HttpWorkerLocator, WorkerClient, WorkerLocator};

/// The collaborators the orchestrator is built on.
pub struct Components {
    pub jobs: Arc<dyn JobStore>,
    pub reservations: Arc<dyn ReservationStore>,
    pub plane: Arc<dyn ComputeControlPlane>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub locator: Arc<dyn WorkerLocator>,
    pub client: Arc<dyn WorkerClient>,
    pub clock: Arc<dyn Clock>,
}

impl Components {
    /// Connect the real backends named by `config`.
    ///
    /// With `memory_store` the job and reservation stores live in process
    /// memory; the job store also falls back to memory when no
    /// `DATABASE_URL` is configured.
    pub async fn production(config: &Config, memory_store: bool) -> Result<Self, OrchestratorError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let jobs: Arc<dyn JobStore> = if memory_store || config.database.url.is_none() {
            if !memory_store {
                tracing::warn!("DATABASE_URL not set, using the in-memory job store");
            }
            Arc::new(InMemoryJobStore::with_clock(clock.clone()))
        } else {
            let store = PostgresJobStore::connect(&config.database)?;
            store.run_migrations().await?;
            tracing::info!("Job store connected and migrations applied");
            Arc::new(store)
        };

        let reservations: Arc<dyn ReservationStore> = if memory_store {
            Arc::new(InMemoryReservationStore::with_clock(clock.clone()))
        } else {
            Arc::new(ValkeyReservationStore::connect(&config.valkey).await?)
        };

        let plane: Arc<dyn ComputeControlPlane> = match config.sandbox.backend {
            SandboxBackend::Kubernetes => {
                Arc::new(KubernetesControlPlane::connect(&config.sandbox).await?)
            }
            SandboxBackend::Docker => Arc::new(DockerControlPlane::new(&config.sandbox)),
        };
        tracing::info!(backend = plane.name(), "Sandbox control plane ready");

        if config.dispatch.worker_urls.is_empty() {
            tracing::warn!("WORKER_URLS is empty, every dispatch will fail at worker lookup");
        }

        Ok(Self {
            jobs,
            reservations,
            plane,
            probe: Arc::new(HttpReadinessProbe::new(
                config.sandbox.readiness_path.clone(),
                config.sandbox.health_timeout,
            )?),
            locator: Arc::new(HttpWorkerLocator::new(
                &config.dispatch.worker_urls,
                config.dispatch.worker_probe_timeout,
            )?),
            client: Arc::new(HttpWorkerClient::new(config.dispatch.worker_submit_timeout)?),
            clock,
        })
    }
}

/// Every long-lived component, wired together.
pub struct Orchestrator {
    config: Config,
    jobs: Arc<dyn JobStore>,
    codes: Arc<CodeArbiter>,
    sandboxes: Arc<SandboxProvisioner>,
    dispatcher: Arc<JobDispatcher>,
    completion: Arc<CompletionHandler>,
    reaper: Arc<IdleReaper>,
    metrics: Arc<MetricsReporter>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn assemble(config: Config, components: Components) -> Result<Self, OrchestratorError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let Components {
            jobs,
            reservations,
            plane,
            probe,
            locator,
            client,
            clock,
        } = components;

        let codes = Arc::new(
            CodeArbiter::new(&config.codes, reservations, clock.clone()).with_shutdown(shutdown_rx),
        );
        let sandboxes = Arc::new(SandboxProvisioner::new(
            config.sandbox.clone(),
            plane,
            probe,
            clock.clone(),
        ));
        let dispatcher = Arc::new(JobDispatcher::new(
            jobs.clone(),
            codes.clone(),
            sandboxes.clone(),
            locator,
            client,
            clock.clone(),
            DispatchSettings::from_config(&config.dispatch, &config.codes, &config.api),
        ));
        let notifier = CompletionNotifier::from_config(&config.api)?.map(Arc::new);
        let completion = Arc::new(
            CompletionHandler::new(jobs.clone(), codes.clone(), sandboxes.clone(), clock.clone())
                .with_notifier(notifier),
        );
        let reaper = Arc::new(
            IdleReaper::new(sandboxes.clone(), config.dispatch.sandbox_max_age)
                .with_stalled_recovery(
                    Reconciler::new(jobs.clone(), sandboxes.clone()),
                    clock,
                    config.dispatch_deadline(),
                ),
        );
        let metrics = Arc::new(MetricsReporter::new(
            jobs.clone(),
            sandboxes.clone(),
            codes.clone(),
        ));

        Ok(Self {
            config,
            jobs,
            codes,
            sandboxes,
            dispatcher,
            completion,
            reaper,
            metrics,
            shutdown_tx,
        })
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn codes(&self) -> &Arc<CodeArbiter> {
        &self.codes
    }

    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    pub fn reaper(&self) -> &Arc<IdleReaper> {
        &self.reaper
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.jobs.clone(), self.sandboxes.clone())
    }

    pub fn callback_state(&self) -> CallbackState {
        CallbackState {
            completion: self.completion.clone(),
            auth: CallbackAuth::new(self.config.api.callback_token.clone()),
        }
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<(), OrchestratorError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Reconcile, then run the loops and the callback listener until `stop`
    /// resolves or the listener dies.
    pub async fn run_until<F>(self, stop: F) -> Result<(), OrchestratorError>
    where
        F: Future<Output = ()>,
    {
        let addr: SocketAddr = format!("{}:{}", self.config.api.host, self.config.api.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| OrchestratorError::ApiStartup {
                addr: format!("{}:{}", self.config.api.host, self.config.api.port),
                reason: e.to_string(),
            })?;

        if let Err(e) = self.reconciler().run().await {
            tracing::error!(error = %e, "Startup reconciliation failed, continuing");
        }

        let mut loops = JoinSet::new();

        let dispatcher = self.dispatcher.clone();
        loops.spawn(every(
            "dispatch",
            self.config.dispatch.poll_interval,
            self.shutdown_tx.subscribe(),
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    if let Err(e) = dispatcher.run_once().await {
                        tracing::error!(error = %e, "Dispatch tick could not list pending jobs");
                    }
                }
            },
        ));

        let reaper = self.reaper.clone();
        loops.spawn(every(
            "reaper",
            self.config.dispatch.reaper_interval,
            self.shutdown_tx.subscribe(),
            move || {
                let reaper = reaper.clone();
                async move {
                    reaper.sweep().await;
                }
            },
        ));

        let metrics = self.metrics.clone();
        loops.spawn(every(
            "metrics",
            self.config.dispatch.metrics_interval,
            self.shutdown_tx.subscribe(),
            move || {
                let metrics = metrics.clone();
                async move {
                    metrics.report().await;
                }
            },
        ));

        let mut api = tokio::spawn(CallbackApi::start(
            self.callback_state(),
            addr,
            self.shutdown_tx.subscribe(),
        ));

        let api_result = tokio::select! {
            _ = stop => {
                tracing::info!("Shutdown requested");
                None
            }
            res = &mut api => Some(res),
        };

        let _ = self.shutdown_tx.send(true);
        while let Some(res) = loops.join_next().await {
            if let Err(e) = res {
                tracing::error!("Background loop panicked: {}", e);
            }
        }

        let api_result = match api_result {
            Some(res) => res,
            None => api.await,
        };

        if self.config.sandbox.cleanup_on_shutdown {
            let removed = self.sandboxes.cleanup_all().await;
            tracing::info!(removed, "Terminated active sandboxes on shutdown");
        }

        tracing::info!("Orchestrator stopped");
        match api_result {
            Ok(result) => result,
            Err(e) => Err(OrchestratorError::ApiStartup {
                addr: addr.to_string(),
                reason: format!("listener task failed: {}", e),
            }),
        }
    }
}

/// Run `tick` every `period` until shutdown. A tick in progress finishes
/// before the loop exits.
async fn every<F, Fut>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!(loop_name = name, period_secs = period.as_secs(), "Loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = interval.tick() => {}
        }
        tick().await;
    }

    tracing::debug!(loop_name = name, "Loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ApiConfig, CodeArbiterConfig, DatabaseConfig, DispatchConfig, SandboxConfig, ValkeyConfig,
    };
    use crate::jobs::{JobStatus, NewJob};
    use crate::testing::{
        FakeControlPlane, RecordingWorkerClient, ScriptedProbe, StaticWorkerLocator, WorkerReply,
        manual_clock,
    };

    fn config() -> Config {
        Config {
            database: DatabaseConfig {
                url: None,
                pool_size: 1,
            },
            valkey: ValkeyConfig::default(),
            codes: CodeArbiterConfig::default(),
            sandbox: SandboxConfig {
                cleanup_on_shutdown: true,
                ..Default::default()
            },
            dispatch: DispatchConfig {
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                ..Default::default()
            },
        }
    }

    fn components(jobs: Arc<InMemoryJobStore>) -> Components {
        let clock = manual_clock();
        Components {
            jobs,
            reservations: Arc::new(InMemoryReservationStore::with_clock(clock.clone())),
            plane: Arc::new(FakeControlPlane::ready()),
            probe: Arc::new(ScriptedProbe::healthy()),
            locator: Arc::new(StaticWorkerLocator::available("http://worker-1:8621")),
            client: Arc::new(RecordingWorkerClient::new(WorkerReply::Accept)),
            clock,
        }
    }

    #[tokio::test]
    async fn loops_dispatch_until_stopped() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let job = jobs.create(NewJob::new("mfn", "validation")).await.unwrap();
        let orchestrator = Orchestrator::assemble(config(), components(jobs.clone())).unwrap();
        let sandboxes = orchestrator.sandboxes.clone();

        let watched = jobs.clone();
        let stop = async move {
            loop {
                let current = watched.get(job.id).await.unwrap().unwrap();
                if current.status == JobStatus::Running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        tokio::time::timeout(Duration::from_secs(10), orchestrator.run_until(stop))
            .await
            .expect("orchestrator did not stop")
            .unwrap();

        assert_eq!(
            jobs.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
        // cleanup_on_shutdown tore the sandbox down.
        assert!(sandboxes.active().await.is_empty());
    }

    #[tokio::test]
    async fn bad_listen_address_fails_fast() {
        let mut config = config();
        config.api.host = "not an address".to_string();
        let orchestrator =
            Orchestrator::assemble(config, components(Arc::new(InMemoryJobStore::new()))).unwrap();

        let err = orchestrator.run_until(async {}).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ApiStartup { .. }));
    }

    #[tokio::test]
    async fn assembles_with_notifier_configured() {
        let mut config = config();
        config.api.notify_endpoint = Some("http://notify.local/done".to_string());
        let orchestrator =
            Orchestrator::assemble(config, components(Arc::new(InMemoryJobStore::new()))).unwrap();
        assert!(orchestrator.dispatcher().run_once().await.unwrap().total() == 0);
    }

    #[tokio::test]
    async fn every_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let ticks = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = ticks.clone();
        let handle = tokio::spawn(every("test", Duration::from_millis(5), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }
}
