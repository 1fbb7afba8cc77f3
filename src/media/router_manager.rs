#![forbid(unsafe_code)]

// Router management: one router per room, created on the worker the pool
// assigns and removed when the room dies.

use crate::media::config::RouterConfig;
use crate::media::types::{MediaError, MediaResult};
use crate::media::worker_pool::WorkerPool;
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct RouterInfo {
    router: Router,
    worker_id: WorkerId,
}

pub struct RouterManager {
    routers: StdRwLock<HashMap<String, RouterInfo>>,
    pool: Arc<WorkerPool>,
}

impl RouterManager {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            routers: StdRwLock::new(HashMap::new()),
            pool,
        }
    }

    /// Creates a router for a room on the next pool worker.
    ///
    /// # Errors
    /// `NoCapacity` when the pool is empty; `RouterError` if the room already
    /// has a router or the engine call fails.
    pub async fn create_router(&self, room_id: &str, config: &RouterConfig) -> MediaResult<Router> {
        {
            let routers = self.routers.read().unwrap_or_else(|e| e.into_inner());
            if routers.contains_key(room_id) {
                return Err(MediaError::RouterError(format!(
                    "Router already exists for room: {room_id}"
                )));
            }
        }

        let worker = self.pool.assign()?;
        let worker_id = worker.id();

        let router = match worker.create_router(config.to_router_options()).await {
            Ok(router) => router,
            Err(e) => {
                self.pool.release(worker_id);
                return Err(MediaError::RouterError(format!("Failed to create router: {e}")));
            }
        };

        info!("Created router {} for room {} on worker {}", router.id(), room_id, worker_id);
        self.setup_router_handlers(&router, room_id);

        let mut routers = self.routers.write().unwrap_or_else(|e| e.into_inner());
        // A concurrent create may have won the race while the engine call was
        // in flight; keep the existing router and release ours.
        if let Some(existing) = routers.get(room_id) {
            self.pool.release(worker_id);
            return Ok(existing.router.clone());
        }
        routers.insert(
            room_id.to_string(),
            RouterInfo {
                router: router.clone(),
                worker_id,
            },
        );

        Ok(router)
    }

    /// Gets a room's router.
    ///
    /// # Errors
    /// `RoomNotFound` if no router exists for the room.
    pub fn get_router(&self, room_id: &str) -> MediaResult<Router> {
        let routers = self.routers.read().unwrap_or_else(|e| e.into_inner());
        routers
            .get(room_id)
            .map(|info| info.router.clone())
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))
    }

    pub fn worker_id_for(&self, room_id: &str) -> MediaResult<WorkerId> {
        let routers = self.routers.read().unwrap_or_else(|e| e.into_inner());
        routers
            .get(room_id)
            .map(|info| info.worker_id)
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))
    }

    /// Removes a room's router. Absent routers are a no-op — the room may
    /// already be gone by the time teardown runs.
    pub fn remove_router(&self, room_id: &str) {
        let removed = {
            let mut routers = self.routers.write().unwrap_or_else(|e| e.into_inner());
            routers.remove(room_id)
        };

        if let Some(info) = removed {
            self.pool.release(info.worker_id);
            info!("Removed router for room {} from worker {}", room_id, info.worker_id);
        } else {
            debug!("remove_router: no router for room {}", room_id);
        }
    }

    pub fn has_router(&self, room_id: &str) -> bool {
        self.routers.read().unwrap_or_else(|e| e.into_inner()).contains_key(room_id)
    }

    pub fn router_count(&self) -> usize {
        self.routers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn setup_router_handlers(&self, router: &Router, room_id: &str) {
        let room_id = room_id.to_string();

        router
            .on_worker_close({
                let room_id = room_id.clone();
                move || {
                    warn!("Worker closed under router for room: {}", room_id);
                }
            })
            .detach();

        router
            .on_close({
                move || {
                    debug!("Router closed for room: {}", room_id);
                }
            })
            .detach();
    }

    /// Drops every router (rooms are already gone at shutdown).
    pub fn close_all(&self) {
        let mut routers = self.routers.write().unwrap_or_else(|e| e.into_inner());
        for (room_id, info) in routers.drain() {
            self.pool.release(info.worker_id);
            debug!("Closed router for room: {}", room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::MediaConfig;
    use crate::media::worker_pool::WorkerPool;
    use crate::metrics::ServerMetrics;

    #[tokio::test]
    async fn router_lifecycle() {
        let mut config = MediaConfig::default();
        config.worker.num_workers = 1;
        config.worker.usage_snapshot_interval = None;
        let config = Arc::new(config);

        let pool = Arc::new(WorkerPool::new(config.clone(), ServerMetrics::new()).await.unwrap());
        let manager = RouterManager::new(pool.clone());

        manager.create_router("orbit", &config.router).await.unwrap();
        assert!(manager.has_router("orbit"));
        assert!(manager.get_router("orbit").is_ok());

        manager.remove_router("orbit");
        assert!(!manager.has_router("orbit"));
        assert!(matches!(
            manager.get_router("orbit"),
            Err(MediaError::RoomNotFound(_))
        ));

        // Second removal is a benign no-op
        manager.remove_router("orbit");
    }
}
