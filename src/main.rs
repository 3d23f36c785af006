use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeflow::config::Config;
use pipeflow::controller::RunController;
use pipeflow::fs::LocalFs;
use pipeflow::image::DirectImageHandler;
use pipeflow::job::LocalBackend;
use pipeflow::runtime::RuntimeRegistry;
use pipeflow::shutdown::ShutdownCoordinator;
use pipeflow::storage::SqliteStorage;

#[derive(Parser)]
#[command(name = "pipeflow")]
#[command(about = "Pipeline orchestration service", long_about = None)]
#[command(version)]
struct Cli {
    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Clean up jobs of terminal runs
    #[arg(long = "is-clean-job")]
    is_clean_job: bool,

    /// Keep failed jobs when cleaning
    #[arg(long = "is-skip-clean-failed-job")]
    is_skip_clean_failed_job: bool,

    /// Seconds a terminal run's jobs are kept before reclamation
    #[arg(long = "job-ttl-seconds")]
    job_ttl_seconds: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pipeflow=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load();
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.is_clean_job {
        config.reclaim.clean_job = true;
    }
    if cli.is_skip_clean_failed_job {
        config.reclaim.skip_clean_failed_job = true;
    }
    if let Some(ttl) = cli.job_ttl_seconds {
        config.reclaim.job_ttl_seconds = ttl;
    }

    let database_path = config.database_path();
    if let Some(parent) = database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let storage = SqliteStorage::open(&database_path)?;
    let registry = RuntimeRegistry::new();
    let controller = RunController::new(
        storage,
        registry.clone(),
        Arc::new(LocalFs::new(config.fs.root.clone())),
        Arc::new(DirectImageHandler::new()),
        Arc::new(LocalBackend::new()),
        config.fs.clone(),
    );

    // Reconstruct runtimes for every run that was active when the process
    // last stopped; failures are logged per run and never abort startup.
    controller.init_and_resume().await?;

    info!(
        host = %config.server.host,
        port = config.server.port,
        "pipeflow server ready"
    );

    // On a termination signal, live runtimes get a grace period to finish
    // before the registry is cleared.
    let shutdown = ShutdownCoordinator::new(registry);
    shutdown.run_until_shutdown(SHUTDOWN_GRACE).await;
    info!("pipeflow server stopped");
    Ok(())
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
