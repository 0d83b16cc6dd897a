//! Binary entry point for the Cumulus metric store daemon.
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cumulus::archive::{run_cleanup, Cleaner};
use cumulus::checkpoint::Checkpointer;
use cumulus::config::Config;
use cumulus::error::Result;
use cumulus::lifecycle::{run_checkpointer, run_memory_tracker, run_retention, MemoryTracker, Retention};
use cumulus::nats::run_subscription;
use cumulus::server::{serve, ServerState};
use cumulus::store::{self, MemoryStore};

#[derive(Parser, Debug)]
#[command(
    name = "cumulus",
    version,
    about = "In-memory time-series metric store for HPC cluster monitoring"
)]
struct Cli {
    #[arg(long, default_value = "config.json", help = "Path to the JSON configuration")]
    config: PathBuf,

    #[arg(long, help = "Override the configured HTTP listen address")]
    listen: Option<String>,

    #[arg(
        long,
        default_value = "info",
        help = "Log filter (overridden by RUST_LOG when set)"
    )]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_file(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let store = Arc::new(MemoryStore::new(&config.metrics)?);
    store::init_global(Arc::clone(&store))?;

    let checkpointer = Arc::new(Checkpointer::new(
        Arc::clone(&store),
        config.checkpoints.clone(),
        config.worker_count(),
    )?);
    let restored = checkpointer.restore()?;
    info!(restored, "startup restore finished");

    let retention = Arc::new(Retention::new(
        Arc::clone(&store),
        config.retention_in_memory,
        None,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    workers.push(tokio::spawn(run_retention(
        Arc::clone(&retention),
        shutdown_rx.clone(),
    )));
    workers.push(tokio::spawn(run_checkpointer(
        Arc::clone(&checkpointer),
        config.checkpoints.interval,
        shutdown_rx.clone(),
    )));
    workers.push(tokio::spawn(run_cleanup(
        Arc::new(Cleaner::new(
            &config.cleanup,
            config.checkpoints.directory.clone(),
        )),
        shutdown_rx.clone(),
    )));
    if let Some(cap) = config.memory_cap_bytes() {
        let tracker = Arc::new(MemoryTracker::new(
            Arc::clone(&store),
            Arc::clone(&retention),
            cap,
        ));
        workers.push(tokio::spawn(run_memory_tracker(
            tracker,
            shutdown_rx.clone(),
        )));
    }

    let staging = checkpointer.staging();
    for subscription in &config.nats_subscriptions {
        workers.push(tokio::spawn(run_subscription(
            Arc::clone(&store),
            subscription.clone(),
            staging.clone(),
            shutdown_rx.clone(),
        )));
    }
    drop(staging);

    let state = Arc::new(ServerState::new(
        Arc::clone(&store),
        checkpointer.staging(),
    ));
    let server = tokio::spawn(serve(state, config.listen.clone(), shutdown_rx));

    wait_for_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    for worker in workers {
        let _ = worker.await;
    }
    let _ = server.await;

    // Final synchronous snapshot after every producer has stopped.
    let cp = Arc::clone(&checkpointer);
    tokio::task::spawn_blocking(move || cp.shutdown())
        .await
        .ok();

    info!("clean shutdown");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(%err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
