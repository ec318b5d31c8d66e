//! Lendbridge worker
//!
//! Runs migrations and the scheduled repayment sweeps against the engine
//! database until Ctrl+C or SIGTERM.

use anyhow::Context;
use tokio::signal;

use lendbridge::config::Config;
use lendbridge::{db, jobs, Engine};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!(
        environment = config.environment.as_str(),
        database = %config.database_url_masked(),
        "Starting lendbridge worker"
    );

    if let Err(e) = run(config).await {
        tracing::error!(error = %format!("{:#}", e), "Worker failed");
        std::process::exit(1);
    }

    tracing::info!("Worker shutdown complete");
}

async fn run(config: Config) -> anyhow::Result<()> {
    let db_pool = db::create_pool(&config)
        .await
        .context("creating database pool")?;
    db::check_health(&db_pool)
        .await
        .context("database is not reachable")?;
    db::run_migrations(&db_pool)
        .await
        .context("running migrations")?;

    let engine = Engine::new(db_pool.clone(), config.engine.clone());
    let mut scheduler = jobs::start_scheduler(engine)
        .await
        .context("starting sweep scheduler")?;

    shutdown_signal().await;

    if let Err(e) = scheduler.shutdown().await {
        tracing::error!(error = %e, "Scheduler did not shut down cleanly");
    }
    db_pool.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
