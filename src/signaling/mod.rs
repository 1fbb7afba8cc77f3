#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;

use crate::config::ServerConfig;
use crate::host::HostGrants;
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use crate::turn::TurnConfig;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Shared state handed to every connection handler.
pub struct SignalingContext {
    pub registry: Arc<RoomRegistry>,
    pub config: Arc<ServerConfig>,
    pub turn: Option<Arc<TurnConfig>>,
    pub host_grants: HostGrants,
    pub metrics: ServerMetrics,
}

/// The signaling server: WebSocket endpoint plus health and metrics routes.
#[derive(Clone)]
pub struct SignalingServer {
    ctx: Arc<SignalingContext>,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    pub fn new(
        registry: Arc<RoomRegistry>,
        config: Arc<ServerConfig>,
        turn: Option<TurnConfig>,
        metrics: ServerMetrics,
    ) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("Max connections: {}", max_connections);

        Self {
            ctx: Arc::new(SignalingContext {
                registry,
                config,
                turn: turn.map(Arc::new),
                host_grants: HostGrants::new(),
                metrics,
            }),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub fn context(&self) -> &Arc<SignalingContext> {
        &self.ctx
    }

    /// Creates the axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds and serves until the process is stopped.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.ctx.registry.room_count();
    let peers = server.ctx.registry.total_peer_count();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "peers": peers,
    }))
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.ctx.registry.room_count();
    let peers = server.ctx.registry.total_peer_count();
    let body = server.ctx.metrics.render_prometheus(rooms, peers);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let client_ip = connection::client_ip_from_headers(&headers, "unknown");

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.ctx.clone(), client_ip, permit)
        })
}
