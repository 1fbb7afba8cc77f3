#![forbid(unsafe_code)]

// Signaling protocol - tagged request/response/notification types.
//
// Every client request receives exactly one acknowledgement event; requests
// are applied at most once per delivered frame. Payloads are validated here,
// at the boundary, before any room or peer logic runs.

use crate::media::types::{ConsumerParams, TransportParams};
use crate::room::moderation::{ModeratorPolicy, ModeratorPolicyKind};
use crate::room::peer::{PeerUpdateKind, ProducerAnnounce};
use crate::room::polls::PollView;
use crate::room::RoomSnapshot;
use crate::turn::IceServer;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};

/// Peer identity and initial capability flags presented on join.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPeerInfo {
    pub peer_uuid: String,
    pub peer_name: String,
    #[serde(default)]
    pub peer_audio: bool,
    #[serde(default)]
    pub peer_video: bool,
    #[serde(default)]
    pub peer_video_privacy: bool,
    #[serde(default)]
    pub peer_hand: bool,
    #[serde(default)]
    pub peer_recording: bool,
    #[serde(default)]
    pub peer_token: Option<String>,
}

/// A typed capability update: which flag, and its new value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfoUpdate {
    pub kind: PeerUpdateKind,
    pub status: bool,
}

/// Privileged room-level actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomActionKind {
    Lock,
    Unlock,
    CheckPassword,
    LobbyOn,
    LobbyOff,
    Broadcasting,
    HostOnlyRecordingOn,
    HostOnlyRecordingOff,
    IsBanned,
}

/// Peer-targeted actions; the privileged subset is presenter-gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerActionKind {
    Mute,
    Unmute,
    Hide,
    Unhide,
    Stop,
    Start,
    Eject,
    Ban,
    RaiseHand,
    LowerHand,
}

impl PeerActionKind {
    /// Actions only a presenter may apply to another peer.
    pub fn is_privileged(self) -> bool {
        matches!(
            self,
            PeerActionKind::Mute
                | PeerActionKind::Unmute
                | PeerActionKind::Hide
                | PeerActionKind::Unhide
                | PeerActionKind::Stop
                | PeerActionKind::Start
                | PeerActionKind::Eject
                | PeerActionKind::Ban
        )
    }
}

/// Distinguished join rejection outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinRejectReason {
    FullCapacity,
    Invalid,
    Unauthorized,
    NotAllowed,
    IsBanned,
    IsLocked,
    IsLobby,
}

/// Client-to-server requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    CreateRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        peer_info: JoinPeerInfo,
    },
    GetRouterRtpCapabilities,
    CreateWebRtcTransport,
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        media_type: Option<String>, // "camera", "screen", "audio"
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        #[serde(default)]
        update: Option<PeerInfoUpdate>,
    },
    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    RestartIce { transport_id: String },
    GetProducers,
    GetPeerCounts,
    GetRoomInfo,
    RefreshParticipantsCount,
    #[serde(rename_all = "camelCase")]
    RoomAction {
        action: RoomActionKind,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        broadcasting: Option<bool>,
        #[serde(default)]
        peer_uuid: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PeerAction {
        action: PeerActionKind,
        #[serde(default)]
        to_peer_id: Option<String>,
        #[serde(default)]
        to_peer_uuid: Option<String>,
        #[serde(default)]
        broadcast: bool,
    },
    #[serde(rename_all = "camelCase")]
    UpdatePeerInfo {
        update: PeerInfoUpdate,
        #[serde(default)]
        broadcast: bool,
    },
    #[serde(rename_all = "camelCase")]
    UpdateRoomModerator {
        kind: ModeratorPolicyKind,
        status: bool,
    },
    #[serde(rename_all = "camelCase")]
    UpdateRoomModeratorAll { policy: ModeratorPolicy },
    #[serde(rename_all = "camelCase")]
    Cmd {
        payload: serde_json::Value,
        #[serde(default)]
        broadcast: bool,
        #[serde(default)]
        to_peer_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        peer_name: String,
        message: String,
        #[serde(default)]
        to_peer_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileInfo {
        file_name: String,
        #[serde(default)]
        file_size: Option<u64>,
        #[serde(default)]
        broadcast: bool,
        #[serde(default)]
        to_peer_id: Option<String>,
    },
    FileAbort,
    #[serde(rename_all = "camelCase")]
    ShareVideoAction {
        action: String,
        #[serde(default)]
        video_url: Option<String>,
        #[serde(default)]
        to_peer_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CreatePoll {
        question: String,
        options: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Vote { poll_index: usize, option: String },
    #[serde(rename_all = "camelCase")]
    EditPoll {
        poll_index: usize,
        question: String,
        options: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeletePoll { poll_index: usize },
    UpdatePoll,
    #[serde(rename_all = "camelCase")]
    StartRtmp { file: String },
    StopRtmp,
    #[serde(rename_all = "camelCase")]
    StartRtmpFromUrl { input_video_url: String },
    StopRtmpFromUrl,
    ExitRoom,
}

/// Server-to-client acknowledgements and notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    RoomCreated { room_id: String },
    Error { message: String },
    Ack,
    #[serde(rename_all = "camelCase")]
    JoinRejected { reason: JoinRejectReason },
    Joined { room: Box<RoomSnapshot> },
    #[serde(rename_all = "camelCase")]
    RouterRtpCapabilities {
        rtp_capabilities: RtpCapabilitiesFinalized,
    },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport: TransportParams,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ice_servers: Vec<IceServer>,
    },
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },
    #[serde(rename_all = "camelCase")]
    Produced { producer_id: String },
    Consumed { consumer: Box<ConsumerParams> },
    #[serde(rename_all = "camelCase")]
    IceRestarted {
        transport_id: String,
        ice_parameters: IceParameters,
    },
    #[serde(rename_all = "camelCase")]
    RoomPassword {
        status: String, // "OK" | "KO"
        room: Option<Box<RoomSnapshot>>,
    },
    #[serde(rename_all = "camelCase")]
    RoomAction {
        peer_name: String,
        action: RoomActionKind,
    },
    #[serde(rename_all = "camelCase")]
    RoomLobby {
        peer_id: String,
        peer_name: String,
        lobby_status: String,
    },
    #[serde(rename_all = "camelCase")]
    PeerAction {
        from_peer_id: String,
        from_peer_name: String,
        action: PeerActionKind,
    },
    #[serde(rename_all = "camelCase")]
    UpdatePeerInfo {
        peer_id: String,
        kind: PeerUpdateKind,
        status: bool,
    },
    #[serde(rename_all = "camelCase")]
    UpdateRoomModerator {
        kind: ModeratorPolicyKind,
        status: bool,
    },
    #[serde(rename_all = "camelCase")]
    UpdateRoomModeratorAll { policy: ModeratorPolicy },
    #[serde(rename_all = "camelCase")]
    NewProducers { producers: Vec<ProducerAnnounce> },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
    #[serde(rename_all = "camelCase")]
    Cmd {
        from_peer_id: String,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        from_peer_id: String,
        from_peer_name: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    FileInfo {
        from_peer_id: String,
        file_name: String,
        #[serde(default)]
        file_size: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    FileAbort { from_peer_id: String },
    #[serde(rename_all = "camelCase")]
    ShareVideoAction {
        from_peer_id: String,
        action: String,
        #[serde(default)]
        video_url: Option<String>,
    },
    UpdatePolls { polls: Vec<PollView> },
    #[serde(rename_all = "camelCase")]
    PeerCounts { peer_counts: usize },
    RoomInfo { room: Box<RoomSnapshot> },
    #[serde(rename_all = "camelCase")]
    RefreshParticipantsCount {
        room_id: String,
        peer_counts: usize,
    },
    #[serde(rename_all = "camelCase")]
    RemoveMe {
        room_id: String,
        peer_id: String,
        peer_name: String,
        peer_counts: usize,
        is_presenter: bool,
    },
    RtmpUrl { url: Option<String> },
    #[serde(rename_all = "camelCase")]
    ActiveSpeaker { peer_id: String },
    AudioLevels { levels: Vec<AudioLevelEntry> },
}

/// Audio level entry for a speaking peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevelEntry {
    pub peer_id: String,
    pub volume: i8, // dBov (0 = loudest, -127 = silence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_request_parses() {
        let json = r#"{
            "type": "join",
            "roomId": "standup",
            "peerInfo": {
                "peerUuid": "u-1",
                "peerName": "alice",
                "peerAudio": true
            }
        }"#;
        let req: ClientRequest = serde_json::from_str(json).unwrap();
        match req {
            ClientRequest::Join { room_id, peer_info } => {
                assert_eq!(room_id, "standup");
                assert_eq!(peer_info.peer_name, "alice");
                assert!(peer_info.peer_audio);
                assert!(!peer_info.peer_video);
                assert!(peer_info.peer_token.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn room_action_parses() {
        let json = r#"{"type":"roomAction","action":"lock","password":"s3cret"}"#;
        let req: ClientRequest = serde_json::from_str(json).unwrap();
        match req {
            ClientRequest::RoomAction { action, password, .. } => {
                assert_eq!(action, RoomActionKind::Lock);
                assert_eq!(password.as_deref(), Some("s3cret"));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn join_reject_reason_uses_wire_names() {
        let json = serde_json::to_string(&ServerEvent::JoinRejected {
            reason: JoinRejectReason::FullCapacity,
        })
        .unwrap();
        assert!(json.contains(r#""reason":"fullCapacity""#));

        let json = serde_json::to_string(&JoinRejectReason::IsBanned).unwrap();
        assert_eq!(json, r#""isBanned""#);
    }

    #[test]
    fn privileged_peer_actions() {
        assert!(PeerActionKind::Eject.is_privileged());
        assert!(PeerActionKind::Ban.is_privileged());
        assert!(!PeerActionKind::RaiseHand.is_privileged());
        assert!(!PeerActionKind::LowerHand.is_privileged());
    }

    #[test]
    fn unknown_request_type_is_rejected() {
        let err = serde_json::from_str::<ClientRequest>(r#"{"type":"dropTables"}"#);
        assert!(err.is_err());
    }
}
