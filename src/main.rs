use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use heatbus_gateway::api::{self, AppState};
use heatbus_gateway::cache::ParameterCache;
use heatbus_gateway::config::{self, Settings};
use heatbus_gateway::cycling::CompressorMonitor;
use heatbus_gateway::handler::BusHandler;
use heatbus_gateway::transport::{BusPort, SerialLink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) Settings come from GATEWAY_* environment variables, with CLI
    //    flags on top; then logging.
    let settings = Settings::parse();
    config::init_logging(&settings.log_level);
    info!("starting heatbus-gateway v{}", env!("CARGO_PKG_VERSION"));

    // 2) Shared pieces: the cache the API reads, the cycling monitor, and
    //    the serial link to the bus.
    let cache = Arc::new(ParameterCache::new());
    let monitor = Arc::new(CompressorMonitor::new());
    let link = Arc::new(SerialLink::new(
        &settings.serial_port,
        settings.serial_baud,
    ));

    // 3) First connection attempt; the reconnect loop keeps retrying in
    //    the background, so startup succeeds with the cable unplugged.
    if !link.connect().await {
        warn!(
            "could not open {}, will keep retrying in the background",
            settings.serial_port
        );
    }
    let reconnect = link.start_reconnect_loop();

    // 4) The bus engine and its supervisor task.
    let port: Arc<dyn BusPort> = link.clone();
    let handler = Arc::new(BusHandler::new(
        port,
        Arc::clone(&cache),
        settings.handler_options(),
        Some(Arc::clone(&monitor)),
    ));
    handler.start();

    // 5) REST surface, served until ctrl-c.
    let state = AppState {
        cache,
        handler: Arc::clone(&handler),
        monitor,
    };
    let addr = format!("{}:{}", settings.api_host, settings.api_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("REST API listening on {addr}");
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("REST server failed")?;

    // 6) Orderly teardown: stop the supervisor first so a held bus token
    //    goes back to the panel, then drop the serial link.
    info!("shutting down");
    handler.stop().await;
    reconnect.abort();
    link.disconnect().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
