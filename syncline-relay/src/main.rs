//! Syncline relay binary.

use std::path::PathBuf;

use clap::Parser;
use syncline_relay::{RelayConfig, RelayServer};

#[derive(Parser)]
#[command(name = "server", about = "Syncline sync relay", version)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 3030)]
    port: u16,

    /// SQLite database file
    #[arg(long, default_value = "./syncline.db")]
    db_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let server = RelayServer::open(RelayConfig {
        port: args.port,
        db_path: args.db_path,
        ..RelayConfig::default()
    })?;

    tokio::select! {
        result = server.run() => result?,
        _ = shutdown_signal() => log::info!("shutdown signal received"),
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
