//! streamkinect - discoverable depth stream server
//!
//! Advertises itself over mDNS, answers PING/WHO control requests and
//! publishes LZ4-compressed depth frames for each attached device.

use std::sync::Arc;
use streamkinect_core::{default_device, Device};
use streamkinect_server::{Config, MdnsAdvertiser, Server, ServerEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if STREAMKINECT_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("STREAMKINECT_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    let advertiser = match MdnsAdvertiser::new() {
        Ok(a) => Arc::new(a),
        Err(e) => {
            tracing::error!("Service discovery unavailable: {}", e);
            return Err(e.into());
        }
    };

    let server = Server::new(config.server_config())?;

    tracing::info!("Starting streamkinect server");
    tracing::info!("  Name: {}", server.name());
    tracing::info!("  Control bind: {}", config.server.bind_addr);
    match config.server.discovery_timeout() {
        Some(timeout) => tracing::info!("  Discovery timeout: {:?}", timeout),
        None => tracing::info!("  Discovery timeout: disabled"),
    }
    tracing::info!(
        "  Pipeline: max_in_flight={}, dispose_timeout={}ms",
        config.pipeline.max_in_flight,
        config.pipeline.dispose_timeout_ms
    );

    match default_device(&config.device_config()) {
        Some(device) => {
            tracing::info!("  Device: {}", device.unique_id());
            server.add_device(device)?;
        }
        None => tracing::warn!("No depth device available, serving control requests only"),
    }

    let mut events = server.subscribe_events();
    server.start(advertiser)?;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(ServerEvent::Started) => {
                        tracing::info!(
                            "Server running on {}:{}",
                            server.hostname().unwrap_or_default(),
                            server.control_port().unwrap_or_default()
                        );
                    }
                    Ok(ServerEvent::StartFailed { reason }) => {
                        tracing::error!("Server failed to start: {}", reason);
                        return Err(reason.into());
                    }
                    Ok(ServerEvent::Stopped) => break,
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, stopping server...");
                if let Err(e) = server.stop().await {
                    tracing::warn!("Stop failed: {}", e);
                }
                break;
            }
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}
