//! rpa-orchestrator - main entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use rpa_orchestrator::{
    config::Config,
    orchestrator::{Components, Orchestrator},
};

#[derive(Parser, Debug)]
#[command(name = "rpa-orchestrator")]
#[command(about = "Dispatches browser automation jobs into per-job sandboxes")]
#[command(version)]
struct Args {
    /// Keep jobs and code reservations in process memory instead of
    /// PostgreSQL and Valkey
    #[arg(long, global = true, env = "MEMORY_STORE")]
    memory_store: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatch, reaper and metrics loops and the callback API until Ctrl-C
    Run,
    /// Reconcile running sandboxes against the job store once
    Reconcile,
    /// Dispatch one batch of pending jobs
    DispatchOnce,
    /// Terminate sandboxes older than the configured max age
    Sweep,
    /// Print one code family's metrics as JSON
    CodeMetrics {
        /// Code family, e.g. octotel
        family: String,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rpa_orchestrator=info,tower_http=info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = Config::from_env()?;
    tracing::info!(
        backend = %config.sandbox.backend,
        code_families = config.codes.secrets.len(),
        workers = config.dispatch.worker_urls.len(),
        "Loaded configuration"
    );

    let components = Components::production(&config, args.memory_store).await?;
    let orchestrator = Orchestrator::assemble(config, components)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!("Starting rpa-orchestrator");
            orchestrator.run().await?;
        }
        Command::Reconcile => {
            let report = orchestrator.reconciler().run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::DispatchOnce => {
            let summary = orchestrator.dispatcher().run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Sweep => {
            let terminated = orchestrator.reaper().sweep().await;
            println!("{}", serde_json::json!({ "terminated": terminated }));
        }
        Command::CodeMetrics { family } => {
            let metrics = orchestrator.codes().metrics(&family).await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
    }

    Ok(())
}
