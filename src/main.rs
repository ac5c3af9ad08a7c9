//! ShadowProxy - Entry Point
//!
//! Loads configuration, starts the TLS proxy listener and waits for a
//! shutdown signal.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shadowproxy::config::{Config, LogConfig};
use shadowproxy::proxy::ProxyServer;
use shadowproxy::tls;

#[derive(Debug, Parser)]
#[command(name = "shadowproxy", version, about = "Probe-resistant TLS forward proxy")]
struct Cli {
    /// YAML configuration file; the environment is used when omitted
    #[arg(short = 'c', long = "config", env = "SHADOWPROXY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    init_tracing(&config.log);
    info!("Starting ShadowProxy");

    config.validate()?;
    info!("Configuration loaded");

    let acceptor = tls::acceptor(&config.cert_file, &config.key_file)
        .context("failed to set up TLS")?;
    let proxy_server = ProxyServer::new(&config, acceptor)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!(
        listen = %config.listen_address,
        decoy = %config.decoy_host,
        probe_resist = config.probe_resist_domain().is_some(),
        "Server started"
    );

    let server_exited = tokio::select! {
        _ = shutdown_signal() => false,
        result = &mut proxy_task => {
            if let Err(e) = result {
                error!("Proxy task failed: {}", e);
            }
            true
        }
    };

    if !server_exited {
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
        let _ = proxy_task.await;
    }

    info!("ShadowProxy stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("shadowproxy={}", log.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if log.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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
