#![forbid(unsafe_code)]

// Worker pool: a fixed set of mediasoup workers handed out round-robin.
//
// A worker that dies is removed from rotation on the death notification and a
// freshly started replacement is appended to the pool after a short recovery
// delay. Assignment never blocks and never hands out a dead worker; an empty
// pool yields NoCapacity and no room may be created without a worker.

use crate::media::config::MediaConfig;
use crate::media::types::{MediaError, MediaResult};
use crate::metrics::ServerMetrics;
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use anyhow::Result;

pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    workers: StdRwLock<Vec<Worker>>,
    /// Rooms currently assigned to each worker
    room_counts: StdRwLock<HashMap<WorkerId, usize>>,
    /// Round-robin cursor, advanced once per assignment
    cursor: AtomicUsize,
    config: Arc<MediaConfig>,
    manager: mediasoup::worker_manager::WorkerManager,
    death_tx: mpsc::UnboundedSender<WorkerId>,
    metrics: ServerMetrics,
}

impl WorkerPool {
    /// Creates the pool and starts its supervision tasks.
    ///
    /// # Errors
    /// Returns an error if any initial worker fails to start.
    pub async fn new(config: Arc<MediaConfig>, metrics: ServerMetrics) -> Result<Self> {
        let num_workers = config.worker.num_workers;
        info!("Creating worker pool with {} workers", num_workers);

        let manager = mediasoup::worker_manager::WorkerManager::new();
        let (death_tx, death_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(PoolInner {
            workers: StdRwLock::new(Vec::with_capacity(num_workers)),
            room_counts: StdRwLock::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
            config,
            manager,
            death_tx,
            metrics,
        });

        for i in 0..num_workers {
            let worker = inner.start_worker().await?;
            info!("Created worker {} (index {})", worker.id(), i);
            inner.register_worker(worker);
        }

        tokio::spawn(PoolInner::death_supervisor(Arc::downgrade(&inner), death_rx));

        if let Some(interval) = inner.config.worker.usage_snapshot_interval {
            tokio::spawn(PoolInner::usage_snapshot_task(Arc::downgrade(&inner), interval));
        }

        Ok(Self { inner })
    }

    /// Hands out the next worker in round-robin order, wrapping at the end.
    ///
    /// # Errors
    /// Returns `MediaError::NoCapacity` if no live worker is available.
    pub fn assign(&self) -> MediaResult<Worker> {
        let workers = self.inner.workers.read().unwrap_or_else(|e| e.into_inner());
        if workers.is_empty() {
            return Err(MediaError::NoCapacity);
        }

        // A dead worker leaves rotation on its death notification; until that
        // lands, skip over it rather than hand it out.
        for _ in 0..workers.len() {
            let idx = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % workers.len();
            let worker = &workers[idx];
            if !worker.closed() {
                let mut counts = self.inner.room_counts.write().unwrap_or_else(|e| e.into_inner());
                *counts.entry(worker.id()).or_insert(0) += 1;
                debug!("Assigned worker {} (index {})", worker.id(), idx);
                return Ok(worker.clone());
            }
        }

        Err(MediaError::NoCapacity)
    }

    /// Releases one room assignment from a worker (called on router removal).
    pub fn release(&self, worker_id: WorkerId) {
        let mut counts = self.inner.room_counts.write().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(&worker_id) {
            *count = count.saturating_sub(1);
            debug!("Released worker {} (now {} rooms)", worker_id, *count);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_alive(&self, worker_id: WorkerId) -> bool {
        let workers = self.inner.workers.read().unwrap_or_else(|e| e.into_inner());
        workers.iter().any(|w| w.id() == worker_id && !w.closed())
    }

    /// Room-count distribution across the pool.
    pub fn room_counts(&self) -> HashMap<WorkerId, usize> {
        self.inner.room_counts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drops every worker; they close when the last handle goes away.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool");
        self.inner.workers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.inner.room_counts.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl PoolInner {
    async fn start_worker(&self) -> Result<Worker> {
        let settings = self.config.worker.to_worker_settings();
        let worker = self
            .manager
            .create_worker(settings)
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;
        Ok(worker)
    }

    fn register_worker(&self, worker: Worker) {
        let worker_id = worker.id();

        let death_tx = self.death_tx.clone();
        worker
            .on_dead(move |reason| {
                error!("Worker {} died: {:?}", worker_id, reason);
                let _ = death_tx.send(worker_id);
            })
            .detach();

        self.room_counts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker_id, 0);
        self.workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker);
    }

    /// Receives death notifications, removes the dead handle from rotation,
    /// and appends a replacement after the recovery delay.
    async fn death_supervisor(
        weak: Weak<PoolInner>,
        mut death_rx: mpsc::UnboundedReceiver<WorkerId>,
    ) {
        while let Some(dead_id) = death_rx.recv().await {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => break,
            };

            {
                let mut workers = inner.workers.write().unwrap_or_else(|e| e.into_inner());
                if let Some(pos) = workers.iter().position(|w| w.id() == dead_id) {
                    workers.remove(pos);
                    warn!("Removed dead worker {} from rotation", dead_id);
                }
                inner
                    .room_counts
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&dead_id);
            }

            tokio::time::sleep(inner.config.worker.recovery_delay).await;

            match inner.start_worker().await {
                Ok(replacement) => {
                    info!("Started replacement worker {} for dead worker {}", replacement.id(), dead_id);
                    inner.register_worker(replacement);
                    inner.metrics.inc_workers_replaced();
                }
                Err(e) => {
                    error!("Failed to start replacement worker for {}: {}", dead_id, e);
                }
            }
        }
        debug!("Worker pool death supervisor finished");
    }

    /// Periodically logs each worker's dump for operational visibility.
    async fn usage_snapshot_task(weak: Weak<PoolInner>, interval: std::time::Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let workers: Vec<Worker> = match weak.upgrade() {
                Some(inner) => inner
                    .workers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone(),
                None => break,
            };
            for worker in workers {
                match worker.dump().await {
                    Ok(dump) => info!("Worker {} usage snapshot: {:?}", worker.id(), dump),
                    Err(e) => debug!("Worker {} dump failed: {}", worker.id(), e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(num_workers: usize) -> Arc<MediaConfig> {
        let mut config = MediaConfig::default();
        config.worker.num_workers = num_workers;
        config.worker.usage_snapshot_interval = None;
        Arc::new(config)
    }

    #[tokio::test]
    async fn empty_pool_has_no_capacity() {
        let pool = WorkerPool::new(pool_config(0), ServerMetrics::new())
            .await
            .unwrap();
        assert!(matches!(pool.assign(), Err(MediaError::NoCapacity)));
    }

    #[tokio::test]
    async fn assignment_is_round_robin() {
        let pool = WorkerPool::new(pool_config(2), ServerMetrics::new())
            .await
            .unwrap();

        let a = pool.assign().unwrap().id();
        let b = pool.assign().unwrap().id();
        let c = pool.assign().unwrap().id();
        let d = pool.assign().unwrap().id();

        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(b, d);

        let counts = pool.room_counts();
        assert_eq!(counts.get(&a), Some(&2));
        assert_eq!(counts.get(&b), Some(&2));
    }

    #[tokio::test]
    async fn release_decrements_room_count() {
        let pool = WorkerPool::new(pool_config(1), ServerMetrics::new())
            .await
            .unwrap();

        let worker = pool.assign().unwrap();
        assert_eq!(pool.room_counts().get(&worker.id()), Some(&1));

        pool.release(worker.id());
        assert_eq!(pool.room_counts().get(&worker.id()), Some(&0));

        // Releasing below zero saturates
        pool.release(worker.id());
        assert_eq!(pool.room_counts().get(&worker.id()), Some(&0));
    }
}
