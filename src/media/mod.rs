#![forbid(unsafe_code)]

// Media module - mediasoup worker pool, per-room routers, and per-peer
// transport/producer/consumer sessions.

pub mod config;
pub mod router_manager;
pub mod transport_manager;
pub mod types;
pub mod worker_pool;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use router_manager::RouterManager;
pub use transport_manager::TransportManager;
pub use types::{ConsumerParams, MediaError, MediaResult, PeerMedia, TransportParams};
pub use worker_pool::WorkerPool;

use crate::metrics::ServerMetrics;
use anyhow::Result;
use mediasoup::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

/// Facade over the media engine: pool, routers, and peer sessions.
pub struct MediaServer {
    pool: Arc<WorkerPool>,
    routers: Arc<RouterManager>,
    transports: Arc<TransportManager>,
    config: Arc<MediaConfig>,
}

impl MediaServer {
    pub async fn new(config: MediaConfig, metrics: ServerMetrics) -> Result<Self> {
        info!("Initializing media server with {} workers", config.worker.num_workers);

        let config = Arc::new(config);
        let pool = Arc::new(WorkerPool::new(config.clone(), metrics).await?);
        let routers = Arc::new(RouterManager::new(pool.clone()));
        let transports = Arc::new(TransportManager::new());

        Ok(Self {
            pool,
            routers,
            transports,
            config,
        })
    }

    /// Allocates a router for a new room on the next pool worker.
    pub async fn create_room_router(&self, room_id: &str) -> MediaResult<Router> {
        debug!("Creating router for room: {}", room_id);
        self.routers.create_router(room_id, &self.config.router).await
    }

    /// Releases a room's router when the room is destroyed.
    pub fn remove_room_router(&self, room_id: &str) {
        debug!("Removing router for room: {}", room_id);
        self.routers.remove_router(room_id);
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn routers(&self) -> &Arc<RouterManager> {
        &self.routers
    }

    pub fn transports(&self) -> &Arc<TransportManager> {
        &self.transports
    }

    pub fn config(&self) -> &Arc<MediaConfig> {
        &self.config
    }

    /// Tears down peers, routers, and workers in dependency order.
    pub async fn shutdown(&self) {
        info!("Shutting down media server");
        self.transports.close_all().await;
        self.routers.close_all();
        self.pool.shutdown();
        info!("Media server shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn media_server_creation() {
        let mut config = MediaConfig::default();
        config.worker.num_workers = 1;
        config.worker.usage_snapshot_interval = None;
        let server = MediaServer::new(config, ServerMetrics::new()).await;
        assert!(server.is_ok());
    }
}
