//! Snippet relay server. Runs the session relay on `PORT` (default 8080).
//!
//! Logging follows `RUST_LOG` and defaults to `info`.

use std::time::Duration;

use clap::Parser;
use log::info;
use snippet_relay::server::DEFAULT_PORT;
use snippet_relay::{RelayServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "snippet-server", about = "Real-time code snippet session relay", version)]
struct Cli {
    /// Port to listen on (all interfaces)
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum session age in seconds before eviction
    #[arg(long, env = "RELAY_SESSION_TTL_SECS", default_value_t = 24 * 60 * 60)]
    session_ttl_secs: u64,

    /// Seconds between expiry sweeps
    #[arg(
        long,
        env = "RELAY_SWEEP_INTERVAL_SECS",
        default_value_t = 60 * 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    sweep_interval_secs: u64,
}

impl Cli {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("0.0.0.0:{}", self.port),
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().to_config();
    info!(
        "Starting relay on {} (session TTL {}s, sweep every {}s)",
        config.bind_addr,
        config.session_ttl.as_secs(),
        config.sweep_interval.as_secs()
    );

    RelayServer::new(config).run_until(shutdown_signal()).await?;
    info!("Server closed");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
