use std::io;
use std::sync::Arc;

use cdp_core::ProxyConfig;
use cdp_observe::{BodyStore, EventBus};
use cdp_proxy::{DevtoolsServer, NetworkTracer, ProxyServer};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ProxyConfig::from_env();
    if let Err(error) = config.validate() {
        tracing::error!(%error, "invalid configuration");
        return Err(io::Error::new(io::ErrorKind::InvalidInput, error.to_string()));
    }

    let bus = EventBus::new();
    let body_store = Arc::new(BodyStore::new());
    let tracer = Arc::new(NetworkTracer::new(
        bus.clone(),
        config.verbose_prefixes.clone(),
    ));

    let devtools = DevtoolsServer::new(&config, bus, Arc::clone(&body_store));
    let proxy = ProxyServer::new(&config, tracer);

    // Bind up front so a busy port is fatal before any traffic is accepted.
    let devtools_listener = devtools.bind_listener().await?;
    let proxy_listener = proxy.bind_listener().await?;
    tracing::info!(addr = %config.cdp_listen_addr, "devtools endpoint listening");
    tracing::info!(addr = %config.proxy_listen_addr, "http proxy listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let devtools_task =
        tokio::spawn(devtools.run_with_listener(devtools_listener, shutdown_rx.clone()));
    let proxy_task = tokio::spawn(proxy.run_with_listener(proxy_listener, shutdown_rx));

    wait_for_shutdown_signal().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = devtools_task.await;
    let _ = proxy_task.await;
    Ok(())
}

async fn wait_for_shutdown_signal() -> io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}
