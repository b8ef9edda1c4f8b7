use clap::Parser;
use kari_lib::{api, config, telemetry, Engine, EngineOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Kári multi-port traffic generator & impairment engine")]
struct Cli {
    /// Path to a JSON configuration snapshot to load at startup
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Control API listen address
    #[arg(short, long, value_name = "ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let engine = match Engine::new(EngineOptions::default()) {
        Ok(engine) => engine,
        Err(err) => {
            error!(%err, "engine initialization failed");
            std::process::exit(1);
        }
    };

    if let Some(path) = &cli.config {
        match config::load_from_path(path) {
            Ok(snapshot) => {
                info!(
                    interfaces = snapshot.interfaces.len(),
                    profiles = snapshot.traffic_profiles.len(),
                    "configuration loaded"
                );
                if let Err(err) = engine.restore(snapshot) {
                    error!(%err, "failed to apply configuration");
                    std::process::exit(1);
                }
            }
            Err(err) => {
                error!(%err, "failed to load configuration");
                std::process::exit(1);
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api_engine = Arc::clone(&engine);
    let server = tokio::spawn(async move { api::serve(api_engine, cli.listen, shutdown_rx).await });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, shutting down"),
        Err(err) => warn!(%err, "signal handler failed, shutting down"),
    }
    let _ = shutdown_tx.send(true);
    engine.shutdown().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%err, "control api exited with error"),
        Err(err) => error!(%err, "control api task failed"),
    }
}
