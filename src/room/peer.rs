#![forbid(unsafe_code)]

// Peer state: identity, capability flags, and producer metadata.

use mediasoup::prelude::MediaKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A typed capability update, as carried by `updatePeerInfo` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerUpdateKind {
    Audio,
    AudioType,
    Video,
    VideoType,
    Screen,
    ScreenType,
    Hand,
    Privacy,
    Presenter,
    Recording,
}

/// Tag kept for each producer a peer announces: media kind plus the logical
/// source (camera / screen / audio).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerTag {
    pub kind: MediaKind,
    #[serde(default)]
    pub media_type: Option<String>,
}

/// Serializable snapshot of a peer for room snapshots and announcements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub peer_uuid: String,
    pub peer_name: String,
    pub peer_audio: bool,
    pub peer_video: bool,
    pub peer_video_privacy: bool,
    pub peer_screen: bool,
    pub peer_hand: bool,
    pub peer_presenter: bool,
    pub peer_recording: bool,
    pub producers: Vec<ProducerAnnounce>,
}

/// One producer announcement entry, as delivered in `newProducers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAnnounce {
    pub producer_id: String,
    pub producer_peer_id: String,
    pub peer_name: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub media_type: Option<String>,
}

/// Per-connection peer state inside a room.
///
/// `id` is the transient connection id (one per live socket); `uuid` is the
/// stable identity that survives reconnects within a session. All
/// cross-reconnect logic (presenter resolution, ban checks) keys on `uuid`.
#[derive(Clone)]
pub struct Peer {
    pub id: String,
    pub uuid: String,
    pub name: String,
    pub audio: bool,
    pub video: bool,
    pub video_privacy: bool,
    pub screen: bool,
    pub hand: bool,
    pub presenter: bool,
    pub recording: bool,
    pub sender: mpsc::Sender<Arc<String>>,
    /// producer id -> tag, for announcements and observer bookkeeping
    pub producers: HashMap<String, ProducerTag>,
}

impl Peer {
    pub fn new(
        id: String,
        uuid: String,
        name: String,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Self {
        Self {
            id,
            uuid,
            name,
            audio: false,
            video: false,
            video_privacy: false,
            screen: false,
            hand: false,
            presenter: false,
            recording: false,
            sender,
            producers: HashMap::new(),
        }
    }

    /// Applies a typed capability update. Turning video off also clears the
    /// privacy flag — a video-off peer has nothing to blur.
    pub fn update_info(&mut self, kind: PeerUpdateKind, status: bool) {
        match kind {
            PeerUpdateKind::Audio | PeerUpdateKind::AudioType => self.audio = status,
            PeerUpdateKind::Video | PeerUpdateKind::VideoType => {
                self.video = status;
                if !status {
                    self.video_privacy = false;
                }
            }
            PeerUpdateKind::Screen | PeerUpdateKind::ScreenType => self.screen = status,
            PeerUpdateKind::Hand => self.hand = status,
            PeerUpdateKind::Privacy => self.video_privacy = status,
            PeerUpdateKind::Presenter => self.presenter = status,
            PeerUpdateKind::Recording => self.recording = status,
        }
    }

    pub fn snapshot(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.id.clone(),
            peer_uuid: self.uuid.clone(),
            peer_name: self.name.clone(),
            peer_audio: self.audio,
            peer_video: self.video,
            peer_video_privacy: self.video_privacy,
            peer_screen: self.screen,
            peer_hand: self.hand,
            peer_presenter: self.presenter,
            peer_recording: self.recording,
            producers: self.producer_announcements(),
        }
    }

    pub fn producer_announcements(&self) -> Vec<ProducerAnnounce> {
        self.producers
            .iter()
            .map(|(producer_id, tag)| ProducerAnnounce {
                producer_id: producer_id.clone(),
                producer_peer_id: self.id.clone(),
                peer_name: self.name.clone(),
                kind: tag.kind,
                media_type: tag.media_type.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> Peer {
        let (tx, _rx) = mpsc::channel(4);
        Peer::new("conn-1".into(), "uuid-1".into(), "alice".into(), tx)
    }

    #[test]
    fn video_off_clears_privacy() {
        let mut peer = test_peer();
        peer.update_info(PeerUpdateKind::Video, true);
        peer.update_info(PeerUpdateKind::Privacy, true);
        assert!(peer.video && peer.video_privacy);

        peer.update_info(PeerUpdateKind::Video, false);
        assert!(!peer.video);
        assert!(!peer.video_privacy);
    }

    #[test]
    fn privacy_survives_audio_updates() {
        let mut peer = test_peer();
        peer.update_info(PeerUpdateKind::Video, true);
        peer.update_info(PeerUpdateKind::Privacy, true);
        peer.update_info(PeerUpdateKind::Audio, false);
        assert!(peer.video_privacy);
    }

    #[test]
    fn snapshot_reflects_flags() {
        let mut peer = test_peer();
        peer.update_info(PeerUpdateKind::Hand, true);
        peer.update_info(PeerUpdateKind::Presenter, true);

        let info = peer.snapshot();
        assert_eq!(info.peer_name, "alice");
        assert!(info.peer_hand);
        assert!(info.peer_presenter);
        assert!(!info.peer_audio);
    }
}
