#![forbid(unsafe_code)]

// Room module - per-conference state machine and the registry orchestrating
// room lifecycle against the media engine.

pub mod moderation;
pub mod peer;
pub mod polls;
pub mod presenter;

use crate::media::types::{ConsumerParams, MediaError, MediaResult, TransportParams};
use crate::media::MediaServer;
use crate::metrics::ServerMetrics;
use crate::room::moderation::ModeratorPolicy;
use crate::room::peer::{Peer, PeerInfo, ProducerAnnounce, ProducerTag};
use crate::room::polls::{PollSet, PollView};
use crate::room::presenter::PresenterRegistry;
use crate::rtmp::RtmpCoordinator;
use crate::signaling::protocol::{AudioLevelEntry, ServerEvent};
use mediasoup::active_speaker_observer::ActiveSpeakerObserverOptions;
use mediasoup::audio_level_observer::AudioLevelObserverOptions;
use mediasoup::prelude::*;
use mediasoup::producer::ProducerId;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Room already exists: {0}")]
    AlreadyExists(String),

    #[error("Room not found: {0}")]
    NotFound(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Peer is banned: {0}")]
    Banned(String),

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Serializable snapshot of a room, returned on join and getRoomInfo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    pub peer_count: usize,
    pub peers: Vec<PeerInfo>,
    pub locked: bool,
    pub lobby_enabled: bool,
    pub broadcasting: bool,
    pub host_only_recording: bool,
    pub moderator: ModeratorPolicy,
    pub polls: Vec<PollView>,
}

/// Outcome of a join attempt that passed boundary validation.
#[derive(Debug)]
pub enum JoinOutcome {
    Joined(Box<RoomSnapshot>),
    Full,
    Banned,
    Locked,
    Lobby,
}

/// Arguments for registering a new peer in a room.
pub struct NewPeer {
    pub conn_id: String,
    pub uuid: String,
    pub name: String,
    pub audio: bool,
    pub video: bool,
    pub video_privacy: bool,
    pub hand: bool,
    pub recording: bool,
    pub sender: mpsc::Sender<Arc<String>>,
    /// Presenter status asserted by a validated signed token, bypassing
    /// allow-list / first-joiner resolution.
    pub presenter_claim: Option<bool>,
}

/// Summary handed back to the signaling handler after a peer leaves.
#[derive(Debug)]
pub struct ExitSummary {
    pub peer_name: String,
    pub was_presenter: bool,
    pub room_destroyed: bool,
    pub remaining: usize,
}

/// Per-conference state. Pure in-memory state machine: media primitives live
/// in the transport manager, keyed by the same connection ids.
pub struct Room {
    pub id: String,
    capacity: usize,
    locked: bool,
    password: Option<String>,
    lobby_enabled: bool,
    broadcasting: bool,
    host_only_recording: bool,
    moderator: ModeratorPolicy,
    polls: PollSet,
    banned_uuids: HashSet<String>,
    peers: HashMap<String, Peer>,
    /// audio producer id -> connection id, for observer lookups
    producer_to_peer: HashMap<String, String>,
}

impl Room {
    pub fn new(id: String, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            locked: false,
            password: None,
            lobby_enabled: false,
            broadcasting: false,
            host_only_recording: false,
            moderator: ModeratorPolicy::default(),
            polls: PollSet::new(),
            banned_uuids: HashSet::new(),
            peers: HashMap::new(),
            producer_to_peer: HashMap::new(),
        }
    }

    // --- membership ---

    pub fn can_add_peer(&self) -> bool {
        self.peers.len() < self.capacity
    }

    pub fn add_peer(&mut self, peer: Peer) -> Result<(), RoomError> {
        if self.banned_uuids.contains(&peer.uuid) {
            return Err(RoomError::Banned(peer.uuid.clone()));
        }
        self.peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    pub fn remove_peer(&mut self, conn_id: &str) -> Option<Peer> {
        let peer = self.peers.remove(conn_id)?;
        for producer_id in peer.producers.keys() {
            self.producer_to_peer.remove(producer_id);
        }
        Some(peer)
    }

    pub fn get_peer(&self, conn_id: &str) -> Option<&Peer> {
        self.peers.get(conn_id)
    }

    pub fn get_peer_mut(&mut self, conn_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(conn_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    // --- ban list (scoped to this Room's lifetime) ---

    pub fn is_banned(&self, uuid: &str) -> bool {
        self.banned_uuids.contains(uuid)
    }

    pub fn add_banned_peer(&mut self, uuid: &str) {
        self.banned_uuids.insert(uuid.to_string());
    }

    // --- policy flags, each independently idempotent ---

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool, password: Option<String>) {
        self.locked = locked;
        self.password = if locked { password } else { None };
    }

    pub fn check_password(&self, password: &str) -> bool {
        self.password.as_deref() == Some(password)
    }

    pub fn is_lobby_enabled(&self) -> bool {
        self.lobby_enabled
    }

    pub fn set_lobby_enabled(&mut self, enabled: bool) {
        self.lobby_enabled = enabled;
    }

    pub fn is_broadcasting(&self) -> bool {
        self.broadcasting
    }

    pub fn set_broadcasting(&mut self, broadcasting: bool) {
        self.broadcasting = broadcasting;
    }

    pub fn is_host_only_recording(&self) -> bool {
        self.host_only_recording
    }

    pub fn set_host_only_recording(&mut self, enabled: bool) {
        self.host_only_recording = enabled;
    }

    pub fn moderator(&self) -> &ModeratorPolicy {
        &self.moderator
    }

    pub fn moderator_mut(&mut self) -> &mut ModeratorPolicy {
        &mut self.moderator
    }

    pub fn polls(&self) -> &PollSet {
        &self.polls
    }

    pub fn polls_mut(&mut self) -> &mut PollSet {
        &mut self.polls
    }

    // --- delivery: fire-and-forget, absent or gone targets are no-ops ---

    /// Delivers to every peer except the sender.
    pub fn broadcast(&self, sender_id: &str, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast event: {}", e);
                return;
            }
        };
        for (id, peer) in &self.peers {
            if id != sender_id {
                Self::try_deliver(&self.id, id, &peer.sender, json.clone());
            }
        }
    }

    /// Delivers to every peer including the sender.
    pub fn send_to_all(&self, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize event: {}", e);
                return;
            }
        };
        for (id, peer) in &self.peers {
            Self::try_deliver(&self.id, id, &peer.sender, json.clone());
        }
    }

    /// Delivers to one peer.
    pub fn send_to(&self, conn_id: &str, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize event: {}", e);
                return;
            }
        };
        if let Some(peer) = self.peers.get(conn_id) {
            Self::try_deliver(&self.id, conn_id, &peer.sender, json);
        }
    }

    fn try_deliver(room_id: &str, conn_id: &str, sender: &mpsc::Sender<Arc<String>>, json: Arc<String>) {
        match sender.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for peer {} in room {}, dropping event", conn_id, room_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for peer {} in room {} (disconnected)", conn_id, room_id);
            }
        }
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            peer_count: self.peers.len(),
            peers: self.peers.values().map(Peer::snapshot).collect(),
            locked: self.locked,
            lobby_enabled: self.lobby_enabled,
            broadcasting: self.broadcasting,
            host_only_recording: self.host_only_recording,
            moderator: self.moderator,
            polls: self.polls.views(),
        }
    }
}

/// Audio observer handles for one room.
struct RoomObservers {
    active_speaker: Option<mediasoup::active_speaker_observer::ActiveSpeakerObserver>,
    audio_level: Option<mediasoup::audio_level_observer::AudioLevelObserver>,
}

/// Events forwarded from observer callbacks (sync Fn) to an async task.
enum ObserverEvent {
    ActiveSpeaker { producer_id: ProducerId },
    AudioLevels { volumes: Vec<(ProducerId, i8)> },
}

/// Registry of all rooms; orchestrates lifecycle against the media engine.
///
/// The outer HashMap is protected by a std::sync::RwLock held only for brief
/// lookups/inserts, never across await points; each room has its own
/// tokio::sync::RwLock held across engine IPC.
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    observers: StdRwLock<HashMap<String, RoomObservers>>,
    media: Arc<MediaServer>,
    presenters: PresenterRegistry,
    rtmp: Arc<RtmpCoordinator>,
    metrics: ServerMetrics,
    room_capacity: usize,
}

impl RoomRegistry {
    pub fn new(
        media: Arc<MediaServer>,
        presenters: PresenterRegistry,
        rtmp: Arc<RtmpCoordinator>,
        metrics: ServerMetrics,
        room_capacity: usize,
    ) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            observers: StdRwLock::new(HashMap::new()),
            media,
            presenters,
            rtmp,
            metrics,
            room_capacity,
        }
    }

    pub fn presenters(&self) -> &PresenterRegistry {
        &self.presenters
    }

    pub fn rtmp(&self) -> &Arc<RtmpCoordinator> {
        &self.rtmp
    }

    pub fn media(&self) -> &Arc<MediaServer> {
        &self.media
    }

    /// Gets a room lock by id (brief outer read lock, no await).
    fn get_room(&self, room_id: &str) -> Result<Arc<TokioRwLock<Room>>, RoomError> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).contains_key(room_id)
    }

    /// Creates a room with a router on the next pool worker.
    ///
    /// # Errors
    /// `AlreadyExists` if the id is taken; `Media(NoCapacity)` if the worker
    /// pool is empty — no room may be created without a worker.
    pub async fn create_room(&self, room_id: &str) -> Result<(), RoomError> {
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if rooms.contains_key(room_id) {
                return Err(RoomError::AlreadyExists(room_id.to_string()));
            }
        }

        let router = self.media.create_room_router(room_id).await?;
        self.metrics.inc_rooms_created();

        let (observer_tx, observer_rx) = mpsc::channel::<ObserverEvent>(16);

        let active_speaker = match router
            .create_active_speaker_observer(ActiveSpeakerObserverOptions::default())
            .await
        {
            Ok(obs) => Some(obs),
            Err(e) => {
                warn!("Failed to create active speaker observer for room {}: {}", room_id, e);
                None
            }
        };

        let audio_level = {
            let mut opts = AudioLevelObserverOptions::default();
            opts.threshold = -50;
            opts.interval = 800;
            match router.create_audio_level_observer(opts).await {
                Ok(obs) => Some(obs),
                Err(e) => {
                    warn!("Failed to create audio level observer for room {}: {}", room_id, e);
                    None
                }
            }
        };

        if let Some(obs) = &active_speaker {
            let tx = observer_tx.clone();
            obs.on_dominant_speaker(move |speaker| {
                let _ = tx.try_send(ObserverEvent::ActiveSpeaker {
                    producer_id: speaker.producer.id(),
                });
            })
            .detach();
        }

        if let Some(obs) = &audio_level {
            let tx = observer_tx.clone();
            obs.on_volumes(move |volumes| {
                let entries: Vec<_> = volumes.iter().map(|v| (v.producer.id(), v.volume)).collect();
                let _ = tx.try_send(ObserverEvent::AudioLevels { volumes: entries });
            })
            .detach();
        }
        drop(observer_tx); // only the callback clones remain

        let room_arc = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if rooms.contains_key(room_id) {
                // Lost a creation race while the engine call was in flight;
                // the winner's router stays, ours is shared via the manager.
                return Err(RoomError::AlreadyExists(room_id.to_string()));
            }
            let room = Arc::new(TokioRwLock::new(Room::new(
                room_id.to_string(),
                self.room_capacity,
            )));
            rooms.insert(room_id.to_string(), room.clone());
            room
        };

        self.observers.write().unwrap_or_else(|e| e.into_inner()).insert(
            room_id.to_string(),
            RoomObservers {
                active_speaker,
                audio_level,
            },
        );

        tokio::spawn(Self::observer_broadcast_task(observer_rx, Arc::downgrade(&room_arc)));

        info!("Created room {}", room_id);
        Ok(())
    }

    /// Forwards observer events to room peers. Exits when the room is gone.
    async fn observer_broadcast_task(
        mut rx: mpsc::Receiver<ObserverEvent>,
        weak_room: Weak<TokioRwLock<Room>>,
    ) {
        while let Some(event) = rx.recv().await {
            let room_arc = match weak_room.upgrade() {
                Some(r) => r,
                None => break,
            };

            let room = room_arc.read().await;
            match event {
                ObserverEvent::ActiveSpeaker { producer_id } => {
                    if let Some(conn_id) = room.producer_to_peer.get(&producer_id.to_string()) {
                        room.send_to_all(&ServerEvent::ActiveSpeaker {
                            peer_id: conn_id.clone(),
                        });
                    }
                }
                ObserverEvent::AudioLevels { volumes } => {
                    let levels: Vec<AudioLevelEntry> = volumes
                        .iter()
                        .filter_map(|(pid, vol)| {
                            room.producer_to_peer.get(&pid.to_string()).map(|conn_id| {
                                AudioLevelEntry {
                                    peer_id: conn_id.clone(),
                                    volume: *vol,
                                }
                            })
                        })
                        .collect();
                    if !levels.is_empty() {
                        room.send_to_all(&ServerEvent::AudioLevels { levels });
                    }
                }
            }
        }
    }

    /// Runs the join state machine for a validated peer.
    ///
    /// Order: capacity, ban list, presenter registration/resolution, lock,
    /// lobby — then the peer is registered and the room snapshot returned.
    pub async fn join(&self, room_id: &str, new_peer: NewPeer) -> Result<JoinOutcome, RoomError> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;

        if !room.can_add_peer() {
            return Ok(JoinOutcome::Full);
        }

        if room.is_banned(&new_peer.uuid) {
            info!("Join rejected: peer {} is banned from room {}", new_peer.uuid, room_id);
            return Ok(JoinOutcome::Banned);
        }

        // Presenter records are registered before the lock/lobby gates so a
        // reconnecting presenter can pass them.
        self.presenters
            .register_join(room_id, &new_peer.conn_id, &new_peer.name, &new_peer.uuid);

        let is_presenter = match new_peer.presenter_claim {
            Some(true) => {
                // Record the claim-asserted presenter so later privileged
                // actions resolve without the token.
                self.presenters
                    .register_claim(room_id, &new_peer.conn_id, &new_peer.name, &new_peer.uuid);
                true
            }
            Some(false) => false,
            None => self
                .presenters
                .resolve(room_id, &new_peer.conn_id, &new_peer.name, &new_peer.uuid),
        };

        if room.is_locked() && !is_presenter {
            debug!("Join rejected: room {} locked and peer is not presenter", room_id);
            return Ok(JoinOutcome::Locked);
        }

        if room.is_lobby_enabled() && !is_presenter {
            room.broadcast(
                &new_peer.conn_id,
                &ServerEvent::RoomLobby {
                    peer_id: new_peer.conn_id.clone(),
                    peer_name: new_peer.name.clone(),
                    lobby_status: "waiting".to_string(),
                },
            );
            debug!("Peer {} waiting in lobby of room {}", new_peer.conn_id, room_id);
            return Ok(JoinOutcome::Lobby);
        }

        let mut peer = Peer::new(
            new_peer.conn_id.clone(),
            new_peer.uuid,
            new_peer.name,
            new_peer.sender,
        );
        peer.audio = new_peer.audio;
        peer.video = new_peer.video;
        peer.video_privacy = new_peer.video && new_peer.video_privacy;
        peer.hand = new_peer.hand;
        peer.recording = new_peer.recording;
        peer.presenter = is_presenter;

        room.add_peer(peer)?;
        self.metrics.inc_joins();

        info!(
            "Peer {} joined room {} (presenter: {}, peers: {})",
            new_peer.conn_id,
            room_id,
            is_presenter,
            room.peer_count()
        );

        Ok(JoinOutcome::Joined(Box::new(room.snapshot())))
    }

    /// Removes a peer, closes its media, broadcasts `removeMe`, and destroys
    /// the room when the registry becomes empty. Tolerates the room or peer
    /// being gone already.
    pub async fn exit(&self, room_id: &str, conn_id: &str) -> Result<ExitSummary, RoomError> {
        let room_lock = self.get_room(room_id)?;

        let (peer, remaining, room_destroyed) = {
            let mut room = room_lock.write().await;
            let peer = room
                .remove_peer(conn_id)
                .ok_or_else(|| RoomError::PeerNotFound(conn_id.to_string()))?;

            let remaining = room.peer_count();
            room.broadcast(
                conn_id,
                &ServerEvent::RemoveMe {
                    room_id: room_id.to_string(),
                    peer_id: conn_id.to_string(),
                    peer_name: peer.name.clone(),
                    peer_counts: remaining,
                    is_presenter: peer.presenter,
                },
            );

            (peer, remaining, remaining == 0)
        }; // per-room lock released

        self.metrics.inc_leaves();

        // Remove this peer's audio producers from the observers before the
        // media teardown closes them.
        let audio_producers: Vec<String> = peer
            .producers
            .iter()
            .filter(|(_, tag)| tag.kind == MediaKind::Audio)
            .map(|(id, _)| id.clone())
            .collect();
        self.remove_producers_from_observers(room_id, &audio_producers).await;

        // Close transports, producers, consumers — releases engine resources.
        self.media.transports().remove_peer(conn_id).await;

        if room_destroyed {
            self.destroy_room(room_id, peer.presenter).await;
        }

        info!("Peer {} ({}) left room {} ({} remaining)", conn_id, peer.name, room_id, remaining);

        Ok(ExitSummary {
            peer_name: peer.name,
            was_presenter: peer.presenter,
            room_destroyed,
            remaining,
        })
    }

    /// The registry, not the Room, deletes the entry — callers may still hold
    /// the room lock mid-operation.
    async fn destroy_room(&self, room_id: &str, last_was_presenter: bool) {
        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if let Some(room_lock) = rooms.get(room_id) {
                let still_empty = room_lock
                    .try_read()
                    .map(|room| room.peer_count() == 0)
                    .unwrap_or(false);
                if !still_empty {
                    return; // a join raced the destruction
                }
                rooms.remove(room_id);
            } else {
                return;
            }
        }

        self.observers.write().unwrap_or_else(|e| e.into_inner()).remove(room_id);
        self.presenters.remove_room(room_id);
        self.rtmp.stop_room(room_id, last_was_presenter);
        self.media.remove_room_router(room_id);

        info!("Room {} is empty, destroyed", room_id);
    }

    // --- media delegation, all keyed by room id ---

    pub async fn rtp_capabilities(&self, room_id: &str) -> Result<RtpCapabilitiesFinalized, RoomError> {
        let router = self.media.routers().get_router(room_id)?;
        Ok(router.rtp_capabilities().clone())
    }

    pub async fn create_transport(&self, room_id: &str, conn_id: &str) -> Result<TransportParams, RoomError> {
        self.get_room(room_id)?; // revalidate room existence
        let router = self.media.routers().get_router(room_id)?;
        let params = self
            .media
            .transports()
            .create_transport(conn_id, &router, &self.media.config().webrtc_transport)
            .await?;
        Ok(params)
    }

    pub async fn connect_transport(
        &self,
        room_id: &str,
        conn_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RoomError> {
        self.get_room(room_id)?;
        self.media
            .transports()
            .connect_transport(conn_id, transport_id, dtls_parameters)
            .await?;
        Ok(())
    }

    /// Creates a producer, records its tag on the owning peer, wires audio
    /// observers, and announces it to the rest of the room.
    pub async fn produce(
        &self,
        room_id: &str,
        conn_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        media_type: Option<String>,
    ) -> Result<String, RoomError> {
        self.get_room(room_id)?;

        let producer = self
            .media
            .transports()
            .produce(conn_id, transport_id, kind, rtp_parameters)
            .await?;
        let producer_id = producer.id().to_string();
        self.metrics.inc_producers_created();

        // Re-validate after the engine call: the peer may have disconnected
        // while produce was in flight, making this a record-and-announce no-op.
        let announce = {
            let room_lock = match self.get_room(room_id) {
                Ok(lock) => lock,
                Err(_) => return Ok(producer_id),
            };
            let mut room = room_lock.write().await;

            let announce = match room.get_peer_mut(conn_id) {
                Some(peer) => {
                    peer.producers.insert(
                        producer_id.clone(),
                        ProducerTag {
                            kind,
                            media_type: media_type.clone(),
                        },
                    );
                    Some(ProducerAnnounce {
                        producer_id: producer_id.clone(),
                        producer_peer_id: conn_id.to_string(),
                        peer_name: peer.name.clone(),
                        kind,
                        media_type,
                    })
                }
                None => None,
            };

            if kind == MediaKind::Audio {
                room.producer_to_peer
                    .insert(producer_id.clone(), conn_id.to_string());
            }

            if let Some(announce) = &announce {
                room.broadcast(
                    conn_id,
                    &ServerEvent::NewProducers {
                        producers: vec![announce.clone()],
                    },
                );
            }
            announce
        }; // room lock released

        if kind == MediaKind::Audio && announce.is_some() {
            self.add_producer_to_observers(room_id, producer.id()).await;
        }

        info!("Peer {} produced {:?} {} in room {}", conn_id, kind, producer_id, room_id);
        Ok(producer_id)
    }

    pub async fn consume(
        &self,
        room_id: &str,
        conn_id: &str,
        transport_id: &str,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams, RoomError> {
        self.get_room(room_id)?;
        let params = self
            .media
            .transports()
            .consume(conn_id, transport_id, producer_id, rtp_capabilities)
            .await?;
        self.metrics.inc_consumers_created();
        Ok(params)
    }

    /// Closes a producer. Benign on unknown ids — engine-side closes race
    /// explicit requests.
    pub async fn close_producer(&self, room_id: &str, conn_id: &str, producer_id: &str) {
        self.media.transports().close_producer(conn_id, producer_id).await;

        if let Ok(room_lock) = self.get_room(room_id) {
            let mut room = room_lock.write().await;
            if let Some(peer) = room.get_peer_mut(conn_id) {
                peer.producers.remove(producer_id);
            }
            let was_audio = room.producer_to_peer.remove(producer_id).is_some();
            room.broadcast(
                conn_id,
                &ServerEvent::ProducerClosed {
                    producer_id: producer_id.to_string(),
                },
            );
            drop(room);

            if was_audio {
                if let Ok(pid) = producer_id.parse::<ProducerId>() {
                    self.remove_producer_from_observers(room_id, pid).await;
                }
            }
        }
    }

    pub async fn pause_producer(&self, room_id: &str, conn_id: &str, producer_id: &str) -> Result<(), RoomError> {
        self.get_room(room_id)?;
        self.media.transports().pause_producer(conn_id, producer_id).await?;
        Ok(())
    }

    pub async fn resume_producer(&self, room_id: &str, conn_id: &str, producer_id: &str) -> Result<(), RoomError> {
        self.get_room(room_id)?;
        self.media.transports().resume_producer(conn_id, producer_id).await?;
        Ok(())
    }

    pub async fn resume_consumer(&self, room_id: &str, conn_id: &str, consumer_id: &str) -> Result<(), RoomError> {
        self.get_room(room_id)?;
        self.media.transports().resume_consumer(conn_id, consumer_id).await?;
        Ok(())
    }

    pub async fn restart_ice(
        &self,
        room_id: &str,
        conn_id: &str,
        transport_id: &str,
    ) -> Result<IceParameters, RoomError> {
        self.get_room(room_id)?;
        let params = self.media.transports().restart_ice(conn_id, transport_id).await?;
        Ok(params)
    }

    /// Producer announcements for everyone except the requesting peer, so a
    /// late joiner can consume the streams already in the room.
    pub async fn producer_list_for(&self, room_id: &str, conn_id: &str) -> Result<Vec<ProducerAnnounce>, RoomError> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        Ok(room
            .peers()
            .filter(|p| p.id != conn_id)
            .flat_map(|p| p.producer_announcements())
            .collect())
    }

    // --- observer bookkeeping ---

    async fn add_producer_to_observers(&self, room_id: &str, producer_id: ProducerId) {
        let (active, level) = self.observer_handles(room_id);
        if let Some(obs) = active {
            let _ = obs.add_producer(RtpObserverAddProducerOptions::new(producer_id)).await;
        }
        if let Some(obs) = level {
            let _ = obs.add_producer(RtpObserverAddProducerOptions::new(producer_id)).await;
        }
    }

    async fn remove_producer_from_observers(&self, room_id: &str, producer_id: ProducerId) {
        let (active, level) = self.observer_handles(room_id);
        if let Some(obs) = active {
            let _ = obs.remove_producer(producer_id).await;
        }
        if let Some(obs) = level {
            let _ = obs.remove_producer(producer_id).await;
        }
    }

    async fn remove_producers_from_observers(&self, room_id: &str, producer_ids: &[String]) {
        for id in producer_ids {
            if let Ok(pid) = id.parse::<ProducerId>() {
                self.remove_producer_from_observers(room_id, pid).await;
            }
        }
    }

    fn observer_handles(
        &self,
        room_id: &str,
    ) -> (
        Option<mediasoup::active_speaker_observer::ActiveSpeakerObserver>,
        Option<mediasoup::audio_level_observer::AudioLevelObserver>,
    ) {
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
        match observers.get(room_id) {
            Some(o) => (o.active_speaker.clone(), o.audio_level.clone()),
            None => (None, None),
        }
    }

    // --- room-scoped helpers for the signaling handler ---

    /// Runs a closure with shared access to a room. `RoomNotFound` maps to a
    /// benign error for the handler to surface.
    pub async fn with_room<R>(
        &self,
        room_id: &str,
        f: impl FnOnce(&Room) -> R,
    ) -> Result<R, RoomError> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        Ok(f(&room))
    }

    /// Runs a closure with exclusive access to a room.
    pub async fn with_room_mut<R>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut Room) -> R,
    ) -> Result<R, RoomError> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        Ok(f(&mut room))
    }

    // --- stats ---

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn total_peer_count(&self) -> usize {
        let locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        locks
            .iter()
            .filter_map(|lock| lock.try_read().ok().map(|room| room.peer_count()))
            .sum()
    }

    /// Tears down every room at process shutdown.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");

        let all_rooms: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (room_id, room_lock) in &all_rooms {
            let conn_ids: Vec<String> = {
                let room = room_lock.read().await;
                room.peers().map(|p| p.id.clone()).collect()
            };
            for conn_id in &conn_ids {
                self.media.transports().remove_peer(conn_id).await;
            }
            self.observers.write().unwrap_or_else(|e| e.into_inner()).remove(room_id);
            self.presenters.remove_room(room_id);
            self.rtmp.stop_room(room_id, true);
            self.media.remove_room_router(room_id);
            info!("Shut down room {} ({} peers)", room_id, conn_ids.len());
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sender() -> mpsc::Sender<Arc<String>> {
        mpsc::channel(8).0
    }

    fn peer(id: &str, uuid: &str, name: &str) -> Peer {
        Peer::new(id.into(), uuid.into(), name.into(), sender())
    }

    #[test]
    fn capacity_bounds_can_add_peer() {
        let mut room = Room::new("r".into(), 2);
        assert!(room.can_add_peer());

        room.add_peer(peer("a", "ua", "A")).unwrap();
        assert!(room.can_add_peer());

        room.add_peer(peer("b", "ub", "B")).unwrap();
        assert!(!room.can_add_peer());
        assert_eq!(room.peer_count(), 2);

        room.remove_peer("a");
        assert!(room.can_add_peer());
        assert_eq!(room.peer_count(), 1);

        // Removing an unknown peer never goes negative
        assert!(room.remove_peer("ghost").is_none());
        assert_eq!(room.peer_count(), 1);
    }

    #[test]
    fn banned_peer_cannot_be_added() {
        let mut room = Room::new("r".into(), 8);
        room.add_banned_peer("u1");

        assert!(room.is_banned("u1"));
        assert!(room.add_peer(peer("c1", "u1", "spammer")).is_err());
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn lock_password_round_trip() {
        let mut room = Room::new("r".into(), 8);
        room.set_locked(true, Some("p".into()));

        assert!(room.is_locked());
        assert!(room.check_password("p"));
        assert!(!room.check_password("wrong"));

        room.set_locked(false, None);
        assert!(!room.is_locked());
        assert!(!room.check_password("p"));
    }

    #[test]
    fn double_lock_is_idempotent() {
        let mut room = Room::new("r".into(), 8);
        room.set_locked(true, Some("p".into()));
        let snapshot_once = room.snapshot();

        room.set_locked(true, Some("p".into()));
        let snapshot_twice = room.snapshot();

        assert_eq!(snapshot_once.locked, snapshot_twice.locked);
        assert!(room.check_password("p"));
    }

    #[test]
    fn policy_flags_toggle() {
        let mut room = Room::new("r".into(), 8);

        room.set_lobby_enabled(true);
        room.set_broadcasting(true);
        room.set_host_only_recording(true);

        let snap = room.snapshot();
        assert!(snap.lobby_enabled && snap.broadcasting && snap.host_only_recording);

        room.set_lobby_enabled(false);
        assert!(!room.is_lobby_enabled());
    }

    #[test]
    fn removing_peer_clears_its_producer_mappings() {
        let mut room = Room::new("r".into(), 8);
        let mut p = peer("a", "ua", "A");
        p.producers.insert(
            "prod-1".into(),
            ProducerTag {
                kind: MediaKind::Audio,
                media_type: Some("audio".into()),
            },
        );
        room.add_peer(p).unwrap();
        room.producer_to_peer.insert("prod-1".into(), "a".into());

        room.remove_peer("a");
        assert!(room.producer_to_peer.is_empty());
    }

    #[test]
    fn send_to_missing_peer_is_noop() {
        let room = Room::new("r".into(), 8);
        // No peers registered; must not panic or error
        room.send_to(
            "ghost",
            &ServerEvent::ProducerClosed {
                producer_id: "x".into(),
            },
        );
    }

    #[test]
    fn snapshot_contains_peers_and_polls() {
        let mut room = Room::new("r".into(), 8);
        room.add_peer(peer("a", "ua", "A")).unwrap();
        room.polls_mut().add("q?".into(), vec!["yes".into(), "no".into()]);

        let snap = room.snapshot();
        assert_eq!(snap.peer_count, 1);
        assert_eq!(snap.peers.len(), 1);
        assert_eq!(snap.polls.len(), 1);
        assert_eq!(snap.room_id, "r");
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::config::{PresenterPolicy, RtmpConfig};
    use crate::media::MediaConfig;
    use tokio::sync::mpsc;

    async fn test_registry(capacity: usize) -> Arc<RoomRegistry> {
        let mut media_config = MediaConfig::default();
        media_config.worker.num_workers = 1;
        media_config.worker.usage_snapshot_interval = None;

        let metrics = ServerMetrics::new();
        let media = Arc::new(MediaServer::new(media_config, metrics.clone()).await.unwrap());
        let presenters = PresenterRegistry::new(PresenterPolicy {
            list: vec![],
            join_first: true,
        });
        let rtmp = Arc::new(RtmpCoordinator::new(RtmpConfig {
            enabled: true,
            max_streams: 2,
        }));

        Arc::new(RoomRegistry::new(media, presenters, rtmp, metrics, capacity))
    }

    fn new_peer(conn_id: &str, uuid: &str, name: &str) -> NewPeer {
        let (tx, _rx) = mpsc::channel(8);
        NewPeer {
            conn_id: conn_id.into(),
            uuid: uuid.into(),
            name: name.into(),
            audio: false,
            video: false,
            video_privacy: false,
            hand: false,
            recording: false,
            sender: tx,
            presenter_claim: None,
        }
    }

    #[tokio::test]
    async fn join_requires_existing_room() {
        let registry = test_registry(4).await;
        let result = registry.join("nowhere", new_peer("c1", "u1", "A")).await;
        assert!(matches!(result, Err(RoomError::NotFound(_))));
    }

    #[tokio::test]
    async fn capacity_two_scenario() {
        let registry = test_registry(2).await;
        registry.create_room("standup").await.unwrap();

        assert!(matches!(
            registry.join("standup", new_peer("a", "ua", "A")).await.unwrap(),
            JoinOutcome::Joined(_)
        ));
        assert!(matches!(
            registry.join("standup", new_peer("b", "ub", "B")).await.unwrap(),
            JoinOutcome::Joined(_)
        ));
        assert!(matches!(
            registry.join("standup", new_peer("c", "uc", "C")).await.unwrap(),
            JoinOutcome::Full
        ));

        let summary = registry.exit("standup", "a").await.unwrap();
        assert!(!summary.room_destroyed);
        assert_eq!(summary.remaining, 1);

        assert!(matches!(
            registry.join("standup", new_peer("c", "uc", "C")).await.unwrap(),
            JoinOutcome::Joined(_)
        ));
    }

    #[tokio::test]
    async fn banned_uuid_cannot_rejoin() {
        let registry = test_registry(8).await;
        registry.create_room("mod").await.unwrap();
        registry.join("mod", new_peer("host", "u-host", "Host")).await.unwrap();

        registry
            .with_room_mut("mod", |room| room.add_banned_peer("u-spammer"))
            .await
            .unwrap();

        let outcome = registry.join("mod", new_peer("s", "u-spammer", "Spammer")).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Banned));

        // The peer map is unchanged by the rejected join
        let count = registry.with_room("mod", |room| room.peer_count()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn locked_room_rejects_non_presenters() {
        let registry = test_registry(8).await;
        registry.create_room("locked").await.unwrap();

        // First joiner becomes presenter under join_first
        registry.join("locked", new_peer("host", "u-host", "Host")).await.unwrap();
        registry
            .with_room_mut("locked", |room| room.set_locked(true, Some("pw".into())))
            .await
            .unwrap();

        let outcome = registry.join("locked", new_peer("guest", "u-g", "Guest")).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Locked));

        // A reconnecting presenter (same uuid, new connection id) passes the lock
        let outcome = registry.join("locked", new_peer("host2", "u-host", "Host")).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Joined(_)));
    }

    #[tokio::test]
    async fn lobby_yields_waiting_outcome() {
        let registry = test_registry(8).await;
        registry.create_room("lobby").await.unwrap();
        registry.join("lobby", new_peer("host", "u-host", "Host")).await.unwrap();
        registry
            .with_room_mut("lobby", |room| room.set_lobby_enabled(true))
            .await
            .unwrap();

        let outcome = registry.join("lobby", new_peer("guest", "u-g", "Guest")).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Lobby));

        // The waiting peer was not registered
        let count = registry.with_room("lobby", |room| room.peer_count()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn last_peer_leaving_destroys_room() {
        let registry = test_registry(8).await;
        registry.create_room("ephemeral").await.unwrap();
        registry.join("ephemeral", new_peer("a", "ua", "A")).await.unwrap();

        registry
            .with_room_mut("ephemeral", |room| room.add_banned_peer("u-banned"))
            .await
            .unwrap();

        let summary = registry.exit("ephemeral", "a").await.unwrap();
        assert!(summary.room_destroyed);
        assert!(!registry.room_exists("ephemeral"));
        assert_eq!(registry.room_count(), 0);

        // A new room under the same id starts with fresh state: the ban list
        // died with the old room.
        registry.create_room("ephemeral").await.unwrap();
        let outcome = registry
            .join("ephemeral", new_peer("b", "u-banned", "B"))
            .await
            .unwrap();
        assert!(matches!(outcome, JoinOutcome::Joined(_)));
    }

    #[tokio::test]
    async fn duplicate_room_creation_is_rejected() {
        let registry = test_registry(8).await;
        registry.create_room("dup").await.unwrap();
        assert!(matches!(
            registry.create_room("dup").await,
            Err(RoomError::AlreadyExists(_))
        ));
    }
}
