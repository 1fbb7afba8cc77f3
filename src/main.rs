#![forbid(unsafe_code)]

mod auth;
mod config;
mod host;
mod media;
mod metrics;
mod room;
mod rtmp;
mod signaling;
mod turn;
mod validate;

use anyhow::Result;
use config::ServerConfig;
use media::{MediaConfig, MediaServer};
use metrics::ServerMetrics;
use room::presenter::PresenterRegistry;
use room::RoomRegistry;
use rtmp::RtmpCoordinator;
use signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turn::TurnConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("huddle - starting conference server");

    let server_config = Arc::new(ServerConfig::from_env());

    let mut media_config = MediaConfig::default();

    // Announced IP is required for ICE candidates to reach past NAT;
    // fall back to loopback for local testing.
    if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
        info!("Using ANNOUNCE_IP={}", ip);
        let addr = ip
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid ANNOUNCE_IP: {ip}"))?;
        media_config.webrtc_transport = media_config.webrtc_transport.with_announced_ip(addr);
    } else {
        let default_ip: std::net::IpAddr = "127.0.0.1".parse()?;
        info!("No ANNOUNCE_IP set, using {}", default_ip);
        media_config.webrtc_transport = media_config.webrtc_transport.with_announced_ip(default_ip);
    }

    let metrics = ServerMetrics::new();
    let media = Arc::new(MediaServer::new(media_config, metrics.clone()).await?);
    info!("Media server initialized ({} workers)", media.pool().worker_count());

    let presenters = PresenterRegistry::new(server_config.presenters.clone());
    let rtmp = Arc::new(RtmpCoordinator::new(server_config.rtmp.clone()));
    let registry = Arc::new(RoomRegistry::new(
        media.clone(),
        presenters,
        rtmp,
        metrics.clone(),
        server_config.room_capacity,
    ));

    let turn_config = TurnConfig::from_env();
    if let Some(ref tc) = turn_config {
        info!("TURN configured: {} URL(s), TTL {}s", tc.urls.len(), tc.ttl_secs);
    } else {
        info!("No TURN configured (set TURN_URLS and TURN_SECRET to enable)");
    }

    let port = server_config.port;
    let signaling = SignalingServer::new(registry.clone(), server_config, turn_config, metrics);

    info!("Starting signaling server on port {}", port);

    tokio::select! {
        result = signaling.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            registry.shutdown().await;
            media.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
