//! tetherfi proxy
//!
//! Runs the tethering proxy on the host network.
//!
//! This binary:
//! - Binds the HTTP proxy (TCP) and the datagram relay (UDP)
//! - Logs every connection and error event as JSON
//! - Forgets clients that have gone quiet
//! - Stops cleanly on Ctrl-C

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tetherfi_proxy::config::Config;
use tetherfi_proxy::{Collaborators, SharedProxy, StatusBroadcaster, STALE_CLIENT_AGE};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TETHERFI_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tetherfi proxy");
    info!(
        host = %config.host,
        port = config.port,
        udp_port = config.udp_port,
        udp_enabled = config.udp_enabled,
        proxy_debug = config.proxy_debug,
        socket_timeout_ms = config.socket_timeout.map_or(0, |t| t.as_millis() as u64),
        "Configuration loaded"
    );

    let status = StatusBroadcaster::with_refresh_hook(|status| {
        info!(status = %status, "Proxy status");
    });
    let proxy = Arc::new(SharedProxy::with_status(
        config.proxy_options(),
        Collaborators::permissive(config.host),
        status,
    ));

    let connections = tokio::spawn({
        let log = Arc::clone(proxy.connections());
        async move {
            log.on_log_event(|event| match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "Connection event"),
                Err(e) => error!(error = %e, "Failed to encode connection event"),
            })
            .await;
        }
    });
    let errors = tokio::spawn({
        let log = Arc::clone(proxy.errors());
        async move {
            log.on_log_event(|event| match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "Error event"),
                Err(e) => error!(error = %e, "Failed to encode error event"),
            })
            .await;
        }
    });

    let purge = tokio::spawn({
        let clients = Arc::clone(proxy.clients());
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let purged = clients.purge_stale(STALE_CLIENT_AGE);
                if purged > 0 {
                    debug!(purged, "Forgot stale clients");
                }
            }
        }
    });

    proxy.start().await.context("Failed to start proxy")?;
    for (kind, addr) in proxy.local_addrs().await {
        info!(kind = %kind, bind_addr = %addr, "Proxy bound");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    proxy.stop().await;
    connections.abort();
    errors.abort();
    purge.abort();

    Ok(())
}
