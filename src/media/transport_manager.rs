#![forbid(unsafe_code)]

// Per-peer media sessions: transports, producers, and consumers keyed by id.
//
// Uses per-peer locking: the outer HashMap is protected by a std::sync::RwLock
// (held only for brief lookups, never across await points), while each peer's
// media state is protected by its own tokio::sync::Mutex (held across engine
// IPC but only blocking that specific peer).

use crate::media::config::WebRtcTransportConfig;
use crate::media::types::{ConsumerParams, MediaError, MediaResult, PeerMedia, TransportParams};
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

pub struct TransportManager {
    peers: StdRwLock<HashMap<String, Arc<TokioMutex<PeerMedia>>>>,
}

impl TransportManager {
    pub fn new() -> Self {
        Self {
            peers: StdRwLock::new(HashMap::new()),
        }
    }

    /// Gets or creates a peer entry (brief outer lock, no await)
    fn get_or_create_peer(&self, peer_id: &str) -> Arc<TokioMutex<PeerMedia>> {
        {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(p) = peers.get(peer_id) {
                return Arc::clone(p);
            }
        }
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(PeerMedia::new(peer_id.to_string()))))
            .clone()
    }

    /// Gets an existing peer's lock (brief outer read lock, no await)
    fn get_peer_lock(&self, peer_id: &str) -> MediaResult<Arc<TokioMutex<PeerMedia>>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(peer_id)
            .cloned()
            .ok_or_else(|| MediaError::PeerNotFound(peer_id.to_string()))
    }

    /// Creates a WebRTC transport on the room's router and records it in the
    /// owning peer's collection.
    pub async fn create_transport(
        &self,
        peer_id: &str,
        router: &Router,
        config: &WebRtcTransportConfig,
    ) -> MediaResult<TransportParams> {
        // Engine call without any lock held
        let transport = router
            .create_webrtc_transport(config.to_transport_options())
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create transport: {e}")))?;

        let params = TransportParams::from(&transport);
        self.setup_transport_handlers(&transport, peer_id);

        let peer_lock = self.get_or_create_peer(peer_id);
        let mut peer = peer_lock.lock().await;
        peer.transports.insert(params.id.clone(), transport);

        info!("Created transport {} for peer {}", params.id, peer_id);
        Ok(params)
    }

    /// Connects a transport with the remote DTLS parameters.
    pub async fn connect_transport(
        &self,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        let peer_lock = self.get_peer_lock(peer_id)?;
        let peer = peer_lock.lock().await;

        let transport = peer
            .transports
            .get(transport_id)
            .ok_or_else(|| MediaError::TransportError(format!("Transport not found: {transport_id}")))?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))?;

        info!("Connected transport {} for peer {}", transport_id, peer_id);
        Ok(())
    }

    /// Creates a producer on one of the peer's transports.
    pub async fn produce(
        &self,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> MediaResult<Producer> {
        let peer_lock = self.get_peer_lock(peer_id)?;
        let mut peer = peer_lock.lock().await;

        let transport = peer
            .transports
            .get(transport_id)
            .ok_or_else(|| MediaError::TransportError(format!("Transport not found: {transport_id}")))?;

        let producer = transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        let producer_id = producer.id().to_string();
        self.setup_producer_handlers(&producer, peer_id);
        peer.producers.insert(producer_id.clone(), producer.clone());

        info!("Created {:?} producer {} for peer {}", kind, producer_id, peer_id);
        Ok(producer)
    }

    /// Creates a consumer on one of the peer's transports, subscribed to
    /// another peer's producer.
    ///
    /// The consumer starts paused — media must not flow before the consumer's
    /// downstream is ready, and a consumer closed early must never have
    /// emitted a packet; the caller resumes explicitly. Layered (simulcast)
    /// producers get the lowest spatial/temporal layer as the initial
    /// preference; adaptive switching is left to the caller.
    pub async fn consume(
        &self,
        peer_id: &str,
        transport_id: &str,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<ConsumerParams> {
        // Look up the producer before locking the consuming peer — it belongs
        // to a different peer.
        let (producer_paused, layered) = match self.find_producer(producer_id).await {
            Some(producer) => (
                producer.paused(),
                producer.rtp_parameters().encodings.len() > 1,
            ),
            None => {
                return Err(MediaError::ProducerError(format!(
                    "Producer not found: {producer_id}"
                )))
            }
        };

        let peer_lock = self.get_peer_lock(peer_id)?;
        let mut peer = peer_lock.lock().await;

        let transport = peer
            .transports
            .get(transport_id)
            .ok_or_else(|| MediaError::TransportError(format!("Transport not found: {transport_id}")))?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = true;

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

        if layered {
            // Lowest layer first; the client upgrades once it has bandwidth
            // headroom.
            if let Err(e) = consumer
                .set_preferred_layers(ConsumerLayers {
                    spatial_layer: 0,
                    temporal_layer: Some(0),
                })
                .await
            {
                debug!("set_preferred_layers failed for consumer {}: {}", consumer.id(), e);
            }
        }

        let consumer_id = consumer.id().to_string();
        self.setup_consumer_handlers(&consumer, peer_id);

        let params = ConsumerParams::from_consumer(&consumer, producer_paused);
        peer.consumers.insert(consumer_id.clone(), consumer);

        info!("Created consumer {} of producer {} for peer {}", consumer_id, producer_id, peer_id);
        Ok(params)
    }

    /// Finds a producer by id across all peers.
    pub async fn find_producer(&self, producer_id: ProducerId) -> Option<Producer> {
        let all_locks: Vec<Arc<TokioMutex<PeerMedia>>> = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.values().cloned().collect()
        };

        for lock in all_locks {
            let peer = lock.lock().await;
            for producer in peer.producers.values() {
                if producer.id() == producer_id {
                    return Some(producer.clone());
                }
            }
        }
        None
    }

    pub async fn pause_producer(&self, peer_id: &str, producer_id: &str) -> MediaResult<()> {
        let peer_lock = self.get_peer_lock(peer_id)?;
        let peer = peer_lock.lock().await;

        let producer = peer
            .producers
            .get(producer_id)
            .ok_or_else(|| MediaError::ProducerError(format!("Producer not found: {producer_id}")))?;

        producer
            .pause()
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to pause producer: {e}")))?;

        debug!("Paused producer {} for peer {}", producer_id, peer_id);
        Ok(())
    }

    pub async fn resume_producer(&self, peer_id: &str, producer_id: &str) -> MediaResult<()> {
        let peer_lock = self.get_peer_lock(peer_id)?;
        let peer = peer_lock.lock().await;

        let producer = peer
            .producers
            .get(producer_id)
            .ok_or_else(|| MediaError::ProducerError(format!("Producer not found: {producer_id}")))?;

        producer
            .resume()
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to resume producer: {e}")))?;

        debug!("Resumed producer {} for peer {}", producer_id, peer_id);
        Ok(())
    }

    pub async fn resume_consumer(&self, peer_id: &str, consumer_id: &str) -> MediaResult<()> {
        let peer_lock = self.get_peer_lock(peer_id)?;
        let peer = peer_lock.lock().await;

        let consumer = peer
            .consumers
            .get(consumer_id)
            .ok_or_else(|| MediaError::ConsumerError(format!("Consumer not found: {consumer_id}")))?;

        consumer
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))?;

        debug!("Resumed consumer {} for peer {}", consumer_id, peer_id);
        Ok(())
    }

    pub async fn pause_consumer(&self, peer_id: &str, consumer_id: &str) -> MediaResult<()> {
        let peer_lock = self.get_peer_lock(peer_id)?;
        let peer = peer_lock.lock().await;

        let consumer = peer
            .consumers
            .get(consumer_id)
            .ok_or_else(|| MediaError::ConsumerError(format!("Consumer not found: {consumer_id}")))?;

        consumer
            .pause()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to pause consumer: {e}")))?;

        debug!("Paused consumer {} for peer {}", consumer_id, peer_id);
        Ok(())
    }

    /// Restarts ICE on a transport, returning the new ICE parameters.
    pub async fn restart_ice(&self, peer_id: &str, transport_id: &str) -> MediaResult<IceParameters> {
        let peer_lock = self.get_peer_lock(peer_id)?;
        let peer = peer_lock.lock().await;

        let transport = peer
            .transports
            .get(transport_id)
            .ok_or_else(|| MediaError::TransportError(format!("Transport not found: {transport_id}")))?;

        let ice_parameters = transport
            .restart_ice()
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to restart ICE: {e}")))?;

        info!("Restarted ICE on transport {} for peer {}", transport_id, peer_id);
        Ok(ice_parameters)
    }

    /// Closes a producer. Unknown peer or producer ids are no-ops — an
    /// engine-side close can race an explicit close request.
    pub async fn close_producer(&self, peer_id: &str, producer_id: &str) {
        let peer_lock = match self.get_peer_lock(peer_id) {
            Ok(lock) => lock,
            Err(_) => {
                debug!("close_producer: peer {} already gone", peer_id);
                return;
            }
        };
        let mut peer = peer_lock.lock().await;
        if peer.producers.remove(producer_id).is_some() {
            info!("Closed producer {} for peer {}", producer_id, peer_id);
        } else {
            debug!("close_producer: producer {} already closed", producer_id);
        }
    }

    /// Closes a consumer. Idempotent like `close_producer`.
    pub async fn close_consumer(&self, peer_id: &str, consumer_id: &str) {
        let peer_lock = match self.get_peer_lock(peer_id) {
            Ok(lock) => lock,
            Err(_) => {
                debug!("close_consumer: peer {} already gone", peer_id);
                return;
            }
        };
        let mut peer = peer_lock.lock().await;
        if peer.consumers.remove(consumer_id).is_some() {
            info!("Closed consumer {} for peer {}", consumer_id, peer_id);
        } else {
            debug!("close_consumer: consumer {} already closed", consumer_id);
        }
    }

    /// Closes a transport. Idempotent like `close_producer`.
    pub async fn close_transport(&self, peer_id: &str, transport_id: &str) {
        let peer_lock = match self.get_peer_lock(peer_id) {
            Ok(lock) => lock,
            Err(_) => {
                debug!("close_transport: peer {} already gone", peer_id);
                return;
            }
        };
        let mut peer = peer_lock.lock().await;
        if peer.transports.remove(transport_id).is_some() {
            info!("Closed transport {} for peer {}", transport_id, peer_id);
        } else {
            debug!("close_transport: transport {} already closed", transport_id);
        }
    }

    /// Counts of a peer's live primitives (transports, producers, consumers).
    pub async fn peer_primitive_counts(&self, peer_id: &str) -> (usize, usize, usize) {
        match self.get_peer_lock(peer_id) {
            Ok(lock) => {
                let peer = lock.lock().await;
                (peer.transports.len(), peer.producers.len(), peer.consumers.len())
            }
            Err(_) => (0, 0, 0),
        }
    }

    /// Removes a peer and closes all three collections. Removing an unknown
    /// peer is a no-op: disconnect cleanup may run after an explicit exit
    /// already tore everything down.
    pub async fn remove_peer(&self, peer_id: &str) {
        let peer_lock = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.remove(peer_id)
        };

        if let Some(lock) = peer_lock {
            let mut peer = lock.lock().await;
            peer.close_all();
            info!("Removed peer {} and closed all media resources", peer_id);
        } else {
            debug!("remove_peer: peer {} already gone", peer_id);
        }
    }

    /// Closes everything for all peers (process shutdown).
    pub async fn close_all(&self) {
        let all_peers: Vec<(String, Arc<TokioMutex<PeerMedia>>)> = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.drain().collect()
        };

        for (peer_id, lock) in all_peers {
            let mut peer = lock.lock().await;
            peer.close_all();
            debug!("Closed all media for peer: {}", peer_id);
        }
    }

    /// Handlers are detached so they persist for the primitive's lifetime.
    fn setup_transport_handlers(&self, transport: &WebRtcTransport, peer_id: &str) {
        let peer_id = peer_id.to_string();
        let transport_id = transport.id().to_string();

        transport
            .on_close({
                let peer_id = peer_id.clone();
                let transport_id = transport_id.clone();
                Box::new(move || {
                    debug!("Transport {} closed for peer {}", transport_id, peer_id);
                })
            })
            .detach();

        transport
            .on_ice_state_change({
                let peer_id = peer_id.clone();
                let transport_id = transport_id.clone();
                move |ice_state| {
                    debug!("ICE state {:?} on transport {} (peer {})", ice_state, transport_id, peer_id);
                }
            })
            .detach();

        transport
            .on_dtls_state_change({
                move |dtls_state| {
                    debug!("DTLS state {:?} on transport {} (peer {})", dtls_state, transport_id, peer_id);
                }
            })
            .detach();
    }

    fn setup_producer_handlers(&self, producer: &Producer, peer_id: &str) {
        let peer_id = peer_id.to_string();
        let producer_id = producer.id().to_string();

        producer
            .on_pause({
                let peer_id = peer_id.clone();
                let producer_id = producer_id.clone();
                move || {
                    debug!("Producer {} paused for peer {}", producer_id, peer_id);
                }
            })
            .detach();

        producer
            .on_resume({
                let peer_id = peer_id.clone();
                let producer_id = producer_id.clone();
                move || {
                    debug!("Producer {} resumed for peer {}", producer_id, peer_id);
                }
            })
            .detach();

        // Fires both on explicit close and when the owning transport closes;
        // the id-keyed maps tolerate either ordering.
        producer
            .on_close({
                move || {
                    debug!("Producer {} closed for peer {}", producer_id, peer_id);
                }
            })
            .detach();
    }

    fn setup_consumer_handlers(&self, consumer: &Consumer, peer_id: &str) {
        let peer_id = peer_id.to_string();
        let consumer_id = consumer.id().to_string();

        consumer
            .on_producer_pause({
                let peer_id = peer_id.clone();
                let consumer_id = consumer_id.clone();
                move || {
                    debug!("Producer paused for consumer {} of peer {}", consumer_id, peer_id);
                }
            })
            .detach();

        consumer
            .on_producer_resume({
                let peer_id = peer_id.clone();
                let consumer_id = consumer_id.clone();
                move || {
                    debug!("Producer resumed for consumer {} of peer {}", consumer_id, peer_id);
                }
            })
            .detach();

        consumer
            .on_close({
                move || {
                    debug!("Consumer {} closed for peer {}", consumer_id, peer_id);
                }
            })
            .detach();
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::MediaConfig;
    use crate::media::router_manager::RouterManager;
    use crate::media::worker_pool::WorkerPool;
    use crate::metrics::ServerMetrics;

    async fn setup() -> (Arc<MediaConfig>, Router, TransportManager) {
        let mut config = MediaConfig::default();
        config.worker.num_workers = 1;
        config.worker.usage_snapshot_interval = None;
        let config = Arc::new(config);

        let pool = Arc::new(WorkerPool::new(config.clone(), ServerMetrics::new()).await.unwrap());
        let routers = RouterManager::new(pool);
        let router = routers.create_router("test-room", &config.router).await.unwrap();
        (config, router, TransportManager::new())
    }

    #[tokio::test]
    async fn transport_create_and_close() {
        let (config, router, manager) = setup().await;

        let params = manager
            .create_transport("peer-a", &router, &config.webrtc_transport)
            .await
            .unwrap();

        let (transports, _, _) = manager.peer_primitive_counts("peer-a").await;
        assert_eq!(transports, 1);

        manager.close_transport("peer-a", &params.id).await;
        let (transports, _, _) = manager.peer_primitive_counts("peer-a").await;
        assert_eq!(transports, 0);

        // Double close is a no-op, not an error
        manager.close_transport("peer-a", &params.id).await;
    }

    #[tokio::test]
    async fn close_consumer_is_idempotent_for_unknown_ids() {
        let (_config, _router, manager) = setup().await;
        // Neither the peer nor the consumer exists; both closes are no-ops
        manager.close_consumer("ghost", "no-such-consumer").await;
        manager.close_consumer("ghost", "no-such-consumer").await;
    }

    #[tokio::test]
    async fn remove_peer_clears_everything() {
        let (config, router, manager) = setup().await;

        manager
            .create_transport("peer-b", &router, &config.webrtc_transport)
            .await
            .unwrap();
        manager.remove_peer("peer-b").await;

        let (transports, producers, consumers) = manager.peer_primitive_counts("peer-b").await;
        assert_eq!((transports, producers, consumers), (0, 0, 0));

        // Removing again is a no-op
        manager.remove_peer("peer-b").await;
    }
}
