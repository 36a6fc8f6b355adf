use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use beach_relay_server::{
    app::{self, AppState},
    config::{Cli, Command, ServerConfig},
    coordinator::Coordinator,
    engine::{local::LocalEngine, MediaEngine, WorkerHealth},
    probe, telemetry,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(Command::Probe(args)) = cli.command {
        telemetry::init_tracing()?;
        return probe::run(args).await;
    }

    let telemetry = telemetry::Telemetry::init()?;
    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        rtc_min_port = config.engine.rtc_min_port,
        rtc_max_port = config.engine.rtc_max_port,
        codecs = config.media_codecs.len(),
        "starting beach-relay server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let engine = LocalEngine::new(config.engine);
    let router = engine
        .create_router(config.media_codecs.clone())
        .await
        .context("failed to create media router")?;
    let worker_watch = tokio::spawn(watch_worker(
        engine.worker_health(),
        config.worker_exit_delay,
    ));

    let coordinator = Coordinator::new(router, config.transport.clone());
    let state = Arc::new(AppState::new(coordinator, metrics));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    app::serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    worker_watch.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

/// A dead media worker takes every transport with it, so the process exits
/// and leaves restarting to the supervisor.
async fn watch_worker(mut health: watch::Receiver<WorkerHealth>, exit_delay: Duration) {
    let reason = loop {
        let died = match &*health.borrow_and_update() {
            WorkerHealth::Died { reason } => Some(reason.clone()),
            WorkerHealth::Running => None,
        };
        if let Some(reason) = died {
            break reason;
        }
        if health.changed().await.is_err() {
            return;
        }
    };

    error!(
        reason = %reason,
        exit_delay_ms = exit_delay.as_millis() as u64,
        "media worker died; exiting"
    );
    tokio::time::sleep(exit_delay).await;
    std::process::exit(1);
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
