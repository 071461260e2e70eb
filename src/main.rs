//! sienge-sync - Rate-limited synchronization engine for the Sienge ERP API
//!
//! This is the main entry point for the sienge-sync application.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use sienge_sync::cache::ValidationCache;
use sienge_sync::config::Config;
use sienge_sync::database::SqliteDatabase;
use sienge_sync::otel::{init_tracing, Metrics, OtelProvider};
use sienge_sync::server::{AppState, Server};
use sienge_sync::sync::{entities, HttpClientWithRateLimit, Orchestrator, SiengeClient};
use sienge_sync::vault::{generate_master_key, Vault};

/// sienge-sync - Rate-limited synchronization engine for the Sienge ERP API
#[derive(Parser, Debug)]
#[command(name = "sienge-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "SIENGE_SYNC_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control API (default)
    Serve,

    /// Run one synchronization in the foreground
    Sync {
        /// Entities to synchronize, e.g. companies customers
        #[arg(required = true)]
        entities: Vec<String>,

        /// Also synchronize the entities the requested ones depend on
        #[arg(long)]
        with_dependencies: bool,
    },

    /// Validate and store upstream credentials
    SetCredentials {
        #[arg(long)]
        subdomain: String,

        #[arg(long)]
        username: String,

        #[arg(long, env = "SIENGE_SYNC_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Print the latest sync run
    Status,

    /// Cancel the sync run in progress
    Cancel,

    /// Print a fresh master encryption key
    GenerateKey,
}

type Engine = Orchestrator<SqliteDatabase, SiengeClient<SqliteDatabase>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Serve);
    if let Command::GenerateKey = command {
        println!("{}", generate_master_key());
        return Ok(());
    }

    let config = load_config(args.config.as_deref())?;

    let otel_provider = OtelProvider::new(&config.otel)?;
    init_tracing(&otel_provider, &config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.environment,
        "Starting sienge-sync"
    );

    let database = Arc::new(SqliteDatabase::new(&config.database.path).await?);
    info!(path = %config.database.path, "Database initialized");

    let metrics = Arc::new(Metrics::new(&otel_provider.meter()));
    let (cache, sweeper) = ValidationCache::start(&config);
    let http = Arc::new(
        HttpClientWithRateLimit::from_config(&config)?.with_metrics(Arc::clone(&metrics)),
    );
    let client = Arc::new(
        SiengeClient::with_components(
            &config,
            http,
            Arc::clone(&database),
            Vault::from_config(&config),
            Arc::clone(&cache),
        )
        .with_metrics(Arc::clone(&metrics)),
    );
    let orchestrator = Arc::new(
        Orchestrator::new(Arc::clone(&database), client).with_metrics(Arc::clone(&metrics)),
    );

    let result = match command {
        Command::Serve => serve(&config, orchestrator).await,
        Command::Sync {
            entities: requested,
            with_dependencies,
        } => {
            let requested = if with_dependencies {
                entities::with_dependencies(requested.as_slice())
            } else {
                requested
            };
            run_foreground(&orchestrator, &requested).await
        }
        Command::SetCredentials {
            subdomain,
            username,
            password,
        } => {
            let outcome = orchestrator
                .fetcher()
                .save_credentials(&subdomain, &username, &password)
                .await?;
            println!("Credentials for '{}' saved ({:?})", subdomain.trim(), outcome);
            Ok(())
        }
        Command::Status => {
            let latest = orchestrator.latest_run().await?;
            println!("{}", serde_json::to_string_pretty(&latest)?);
            Ok(())
        }
        Command::Cancel => {
            match orchestrator.cancel_active_run().await? {
                Some(run_id) => println!("Cancelled run {}", run_id),
                None => println!("No sync run in progress"),
            }
            Ok(())
        }
        Command::GenerateKey => Ok(()),
    };

    sweeper.shutdown().await;

    if let Err(e) = otel_provider.shutdown() {
        error!(error = %e, "Failed to shutdown OpenTelemetry");
    }

    info!("sienge-sync shutdown complete");
    result
}

/// Serve the control API until a shutdown signal arrives
///
/// The serving process owns the run store: runs a previous process left in
/// progress are closed at startup, and a run still going at shutdown is
/// cancelled.
async fn serve(config: &Config, orchestrator: Arc<Engine>) -> anyhow::Result<()> {
    orchestrator.recover_interrupted_runs().await?;

    let server = Server::new(config.server.clone(), AppState::new(Arc::clone(&orchestrator)));
    info!(
        host = %config.server.host,
        port = %config.server.port,
        "Starting HTTP server"
    );
    let result = server.run(shutdown_signal()).await;

    match orchestrator.cancel_active_run().await {
        Ok(Some(run_id)) => info!(run_id, "Cancelled sync run still in progress at shutdown"),
        Ok(None) => {}
        Err(e) => error!(error = %e, "Failed to cancel run at shutdown"),
    }
    result.map_err(Into::into)
}

/// Run a sync to completion, cancelling it on Ctrl+C
async fn run_foreground(orchestrator: &Arc<Engine>, requested: &[String]) -> anyhow::Result<()> {
    let run = orchestrator.begin_run(requested).await?;

    let canceller = {
        let orchestrator = Arc::clone(orchestrator);
        tokio::spawn(async move {
            shutdown_signal().await;
            if let Err(e) = orchestrator.cancel_active_run().await {
                error!(error = %e, "Failed to cancel run");
            }
        })
    };

    let run = orchestrator.execute_run(run).await;
    canceller.abort();
    let run = run?;

    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

/// Load configuration from file or environment
fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
