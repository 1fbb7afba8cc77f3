#![forbid(unsafe_code)]

// WebSocket connection handler: the per-connection request dispatcher.
//
// Connection lifecycle: Unbound -> Joining -> Joined -> Left/Disconnected.
// Every request receives exactly one acknowledgement event and is applied at
// most once per delivered frame; redelivery is the transport's concern, not
// ours. Privileged actions that fail authorization are acknowledged without
// effect and without broadcast.

use super::protocol::{
    ClientRequest, JoinRejectReason, PeerActionKind, RoomActionKind, ServerEvent,
};
use super::SignalingContext;
use crate::auth;
use crate::media::types::MediaError;
use crate::room::peer::PeerUpdateKind;
use crate::room::{JoinOutcome, NewPeer, RoomError};
use crate::validate;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client; events beyond this are stale and
/// dropped early.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if nothing arrives within this window.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: burst capacity and refill rate per second.
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
const RATE_LIMIT_REFILL_RATE: u64 = 100;
const TOKEN_US: u64 = 1_000_000;
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Connection-local state for the request dispatcher.
struct ConnState {
    conn_id: String,
    client_ip: String,
    /// Bound by createRoom or join; cleared on exit.
    room_id: Option<String>,
    /// True only between a successful join and exit/disconnect.
    joined: bool,
    peer_name: String,
    peer_uuid: String,
}

impl ConnState {
    fn new(client_ip: String) -> Self {
        Self {
            conn_id: Uuid::new_v4().to_string(),
            client_ip,
            room_id: None,
            joined: false,
            peer_name: String::new(),
            peer_uuid: String::new(),
        }
    }

    fn room(&self) -> Option<&str> {
        self.room_id.as_deref()
    }
}

/// Serialize an event and push it down the connection's channel.
fn send_event(sender: &mpsc::Sender<Arc<String>>, event: &ServerEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = sender.try_send(Arc::new(json));
        }
        Err(e) => warn!("Failed to serialize server event: {}", e),
    }
}

fn error_event(message: impl Into<String>) -> ServerEvent {
    ServerEvent::Error {
        message: message.into(),
    }
}

/// Handles a single WebSocket connection until it closes.
pub async fn handle_connection(
    socket: WebSocket,
    ctx: Arc<SignalingContext>,
    client_ip: String,
    _permit: OwnedSemaphorePermit,
) {
    let mut state = ConnState::new(client_ip);
    info!("New signaling connection: {} ({})", state.conn_id, state.client_ip);

    ctx.metrics.inc_connections_total();
    let _conn_guard = ctx.metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_metrics = ctx.metrics.clone();
    let send_conn_id = state.conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_notifications();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", send_conn_id);
    });

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for connection {}", state.conn_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                ctx.metrics.inc_requests();

                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", state.conn_id);
                        send_event(&tx, &error_event(format!(
                            "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} requests/second"
                        )));
                    }
                    continue;
                }

                match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => {
                        let start = Instant::now();
                        let ack = handle_request(&request, &mut state, &tx, &ctx).await;
                        ctx.metrics.observe_request_handling(start.elapsed());
                        if matches!(ack, ServerEvent::Error { .. }) {
                            ctx.metrics.inc_errors();
                        }
                        if tx.is_closed() {
                            break;
                        }
                        send_event(&tx, &ack);
                    }
                    Err(e) => {
                        warn!("Invalid request format from {}: {}", state.conn_id, e);
                        ctx.metrics.inc_errors();
                        send_event(&tx, &error_event(format!("Invalid request format: {e}")));
                    }
                }
            }
            Message::Close(_) => {
                info!("Connection {} closed by client", state.conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("Unexpected message type from connection {}", state.conn_id);
            }
        }
    }

    // Disconnect teardown: a peer vanishing mid-negotiation must leave no
    // orphaned room or engine state behind.
    if state.joined {
        if let Some(room_id) = state.room_id.clone() {
            match ctx.registry.exit(&room_id, &state.conn_id).await {
                Ok(summary) => {
                    if summary.was_presenter && ctx.config.host.protected {
                        ctx.host_grants.revoke(&state.client_ip);
                    }
                }
                Err(e) => debug!("Disconnect cleanup for {}: {}", state.conn_id, e),
            }
        }
    }

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished: {}", state.conn_id);
}

/// Maps one request to one acknowledgement, applying side effects at most
/// once. Room existence is validated on entry and re-validated inside the
/// registry after every suspension point.
async fn handle_request(
    request: &ClientRequest,
    state: &mut ConnState,
    tx: &mpsc::Sender<Arc<String>>,
    ctx: &Arc<SignalingContext>,
) -> ServerEvent {
    match request {
        ClientRequest::CreateRoom { room_id } => {
            if !validate::is_valid_room_name(room_id) {
                return error_event("Invalid room name");
            }
            match ctx.registry.create_room(room_id).await {
                Ok(()) => {
                    state.room_id = Some(room_id.clone());
                    ServerEvent::RoomCreated {
                        room_id: room_id.clone(),
                    }
                }
                Err(RoomError::AlreadyExists(_)) => {
                    // Binding still moves to the existing room so the client
                    // can join it.
                    state.room_id = Some(room_id.clone());
                    error_event("already exists")
                }
                Err(RoomError::Media(MediaError::NoCapacity)) => {
                    error_event("No media workers available, try again later")
                }
                Err(e) => {
                    error!("createRoom {} failed: {}", room_id, e);
                    error_event("Failed to create room")
                }
            }
        }

        ClientRequest::Join { room_id, peer_info } => {
            handle_join(room_id, peer_info, state, tx, ctx).await
        }

        ClientRequest::GetRouterRtpCapabilities => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            match ctx.registry.rtp_capabilities(room_id).await {
                Ok(rtp_capabilities) => ServerEvent::RouterRtpCapabilities { rtp_capabilities },
                Err(e) => {
                    debug!("getRouterRtpCapabilities: {}", e);
                    error_event("Room not found")
                }
            }
        }

        ClientRequest::CreateWebRtcTransport => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            match ctx.registry.create_transport(room_id, &state.conn_id).await {
                Ok(transport) => {
                    let ice_servers = ctx
                        .turn
                        .as_ref()
                        .map(|t| t.ice_servers_for(&state.conn_id))
                        .unwrap_or_default();
                    ServerEvent::TransportCreated {
                        transport,
                        ice_servers,
                    }
                }
                Err(e) => {
                    error!("createWebRtcTransport failed for {}: {}", state.conn_id, e);
                    error_event("Failed to create transport")
                }
            }
        }

        ClientRequest::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            match ctx
                .registry
                .connect_transport(room_id, &state.conn_id, transport_id, dtls_parameters.clone())
                .await
            {
                Ok(()) => ServerEvent::TransportConnected {
                    transport_id: transport_id.clone(),
                },
                Err(e) => {
                    warn!("connectTransport {} failed: {}", transport_id, e);
                    error_event("Failed to connect transport")
                }
            }
        }

        ClientRequest::Produce {
            transport_id,
            kind,
            rtp_parameters,
            media_type,
        } => {
            let Some(room_id) = state.room().map(String::from) else {
                return error_event("Room not found");
            };

            // Producing flips the matching capability flag on.
            if let Some(update_kind) = media_type_to_update(media_type.as_deref(), *kind) {
                let conn_id = state.conn_id.clone();
                let _ = ctx
                    .registry
                    .with_room_mut(&room_id, |room| {
                        if let Some(peer) = room.get_peer_mut(&conn_id) {
                            peer.update_info(update_kind, true);
                        }
                    })
                    .await;
            }

            match ctx
                .registry
                .produce(
                    &room_id,
                    &state.conn_id,
                    transport_id,
                    *kind,
                    rtp_parameters.clone(),
                    media_type.clone(),
                )
                .await
            {
                Ok(producer_id) => ServerEvent::Produced { producer_id },
                Err(e) => {
                    error!("produce failed for {}: {}", state.conn_id, e);
                    error_event("Failed to produce")
                }
            }
        }

        ClientRequest::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            let producer_id = match producer_id.parse() {
                Ok(id) => id,
                Err(_) => return error_event("Invalid producer id"),
            };
            match ctx
                .registry
                .consume(
                    room_id,
                    &state.conn_id,
                    transport_id,
                    producer_id,
                    rtp_capabilities.clone(),
                )
                .await
            {
                Ok(consumer) => ServerEvent::Consumed {
                    consumer: Box::new(consumer),
                },
                Err(e) => {
                    error!("consume failed for {}: {}", state.conn_id, e);
                    error_event("Failed to consume")
                }
            }
        }

        ClientRequest::ProducerClosed { producer_id, update } => {
            let Some(room_id) = state.room().map(String::from) else {
                return ServerEvent::Ack; // teardown paths tolerate absence
            };
            if let Some(update) = update {
                let conn_id = state.conn_id.clone();
                let (kind, status) = (update.kind, update.status);
                let _ = ctx
                    .registry
                    .with_room_mut(&room_id, |room| {
                        if let Some(peer) = room.get_peer_mut(&conn_id) {
                            peer.update_info(kind, status);
                        }
                    })
                    .await;
            }
            ctx.registry
                .close_producer(&room_id, &state.conn_id, producer_id)
                .await;
            ServerEvent::Ack
        }

        ClientRequest::PauseProducer { producer_id } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            match ctx
                .registry
                .pause_producer(room_id, &state.conn_id, producer_id)
                .await
            {
                Ok(()) => ServerEvent::Ack,
                Err(e) => error_event(format!("Failed to pause producer: {e}")),
            }
        }

        ClientRequest::ResumeProducer { producer_id } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            match ctx
                .registry
                .resume_producer(room_id, &state.conn_id, producer_id)
                .await
            {
                Ok(()) => ServerEvent::Ack,
                Err(e) => error_event(format!("Failed to resume producer: {e}")),
            }
        }

        ClientRequest::ResumeConsumer { consumer_id } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            match ctx
                .registry
                .resume_consumer(room_id, &state.conn_id, consumer_id)
                .await
            {
                Ok(()) => ServerEvent::Ack,
                Err(e) => error_event(format!("Failed to resume consumer: {e}")),
            }
        }

        ClientRequest::RestartIce { transport_id } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            match ctx
                .registry
                .restart_ice(room_id, &state.conn_id, transport_id)
                .await
            {
                Ok(ice_parameters) => ServerEvent::IceRestarted {
                    transport_id: transport_id.clone(),
                    ice_parameters,
                },
                Err(e) => {
                    warn!("restartIce {} failed: {}", transport_id, e);
                    error_event("Failed to restart ICE")
                }
            }
        }

        ClientRequest::GetProducers => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            match ctx.registry.producer_list_for(room_id, &state.conn_id).await {
                Ok(producers) => ServerEvent::NewProducers { producers },
                Err(_) => error_event("Room not found"),
            }
        }

        ClientRequest::GetPeerCounts => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            match ctx.registry.with_room(room_id, |room| room.peer_count()).await {
                Ok(peer_counts) => ServerEvent::PeerCounts { peer_counts },
                Err(_) => error_event("Room not found"),
            }
        }

        ClientRequest::GetRoomInfo => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            match ctx.registry.with_room(room_id, |room| room.snapshot()).await {
                Ok(snapshot) => ServerEvent::RoomInfo {
                    room: Box::new(snapshot),
                },
                Err(_) => error_event("Room not found"),
            }
        }

        ClientRequest::RefreshParticipantsCount => {
            let Some(room_id) = state.room().map(String::from) else {
                return error_event("Room not found");
            };
            let conn_id = state.conn_id.clone();
            let _ = ctx
                .registry
                .with_room(&room_id, |room| {
                    room.broadcast(
                        &conn_id,
                        &ServerEvent::RefreshParticipantsCount {
                            room_id: room_id.clone(),
                            peer_counts: room.peer_count(),
                        },
                    );
                })
                .await;
            ServerEvent::Ack
        }

        ClientRequest::RoomAction {
            action,
            password,
            broadcasting,
            peer_uuid,
        } => handle_room_action(*action, password, *broadcasting, peer_uuid.as_deref(), state, ctx).await,

        ClientRequest::PeerAction {
            action,
            to_peer_id,
            to_peer_uuid,
            broadcast,
        } => {
            handle_peer_action(
                *action,
                to_peer_id.as_deref(),
                to_peer_uuid.as_deref(),
                *broadcast,
                state,
                ctx,
            )
            .await
        }

        ClientRequest::UpdatePeerInfo { update, broadcast } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            let conn_id = state.conn_id.clone();
            let (kind, status) = (update.kind, update.status);
            let do_broadcast = *broadcast;
            let _ = ctx
                .registry
                .with_room_mut(room_id, |room| {
                    if let Some(peer) = room.get_peer_mut(&conn_id) {
                        peer.update_info(kind, status);
                    }
                    if do_broadcast {
                        room.broadcast(
                            &conn_id,
                            &ServerEvent::UpdatePeerInfo {
                                peer_id: conn_id.clone(),
                                kind,
                                status,
                            },
                        );
                    }
                })
                .await;
            ServerEvent::Ack
        }

        ClientRequest::UpdateRoomModerator { kind, status } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            if !self_is_presenter(state, ctx) {
                return ServerEvent::Ack; // silent for non-presenters
            }
            let conn_id = state.conn_id.clone();
            let (kind, status) = (*kind, *status);
            let _ = ctx
                .registry
                .with_room_mut(room_id, |room| {
                    room.moderator_mut().set(kind, status);
                    room.broadcast(&conn_id, &ServerEvent::UpdateRoomModerator { kind, status });
                })
                .await;
            ServerEvent::Ack
        }

        ClientRequest::UpdateRoomModeratorAll { policy } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            if !self_is_presenter(state, ctx) {
                return ServerEvent::Ack;
            }
            let conn_id = state.conn_id.clone();
            let policy = *policy;
            let _ = ctx
                .registry
                .with_room_mut(room_id, |room| {
                    room.moderator_mut().set_all(policy);
                    room.broadcast(&conn_id, &ServerEvent::UpdateRoomModeratorAll { policy });
                })
                .await;
            ServerEvent::Ack
        }

        ClientRequest::Cmd {
            payload,
            broadcast,
            to_peer_id,
        } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            let event = ServerEvent::Cmd {
                from_peer_id: state.conn_id.clone(),
                payload: payload.clone(),
            };
            relay(ctx, room_id, &state.conn_id, *broadcast, to_peer_id.as_deref(), &event).await;
            ServerEvent::Ack
        }

        ClientRequest::ChatMessage {
            peer_name,
            message,
            to_peer_id,
        } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            // Reject messages whose claimed sender does not match the
            // registered peer.
            let conn_id = state.conn_id.clone();
            let claimed = peer_name.clone();
            let real = ctx
                .registry
                .with_room(room_id, |room| {
                    room.get_peer(&conn_id).map(|p| p.name == claimed).unwrap_or(false)
                })
                .await
                .unwrap_or(false);
            if !real {
                debug!("Fake chat sender detected on connection {}", state.conn_id);
                return ServerEvent::Ack;
            }

            let event = ServerEvent::ChatMessage {
                from_peer_id: state.conn_id.clone(),
                from_peer_name: peer_name.clone(),
                message: message.clone(),
            };
            let broadcast = to_peer_id.is_none();
            relay(ctx, room_id, &state.conn_id, broadcast, to_peer_id.as_deref(), &event).await;
            ServerEvent::Ack
        }

        ClientRequest::FileInfo {
            file_name,
            file_size,
            broadcast,
            to_peer_id,
        } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            if !validate::is_valid_file_name(file_name) {
                debug!("Invalid file name on connection {}", state.conn_id);
                return ServerEvent::Ack;
            }
            let event = ServerEvent::FileInfo {
                from_peer_id: state.conn_id.clone(),
                file_name: file_name.clone(),
                file_size: *file_size,
            };
            relay(ctx, room_id, &state.conn_id, *broadcast, to_peer_id.as_deref(), &event).await;
            ServerEvent::Ack
        }

        ClientRequest::FileAbort => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            let event = ServerEvent::FileAbort {
                from_peer_id: state.conn_id.clone(),
            };
            relay(ctx, room_id, &state.conn_id, true, None, &event).await;
            ServerEvent::Ack
        }

        ClientRequest::ShareVideoAction {
            action,
            video_url,
            to_peer_id,
        } => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            if action == "open" {
                let ok = video_url
                    .as_deref()
                    .map(validate::is_valid_http_url)
                    .unwrap_or(false);
                if !ok {
                    debug!("Invalid share video url on connection {}", state.conn_id);
                    return ServerEvent::Ack;
                }
            }
            let event = ServerEvent::ShareVideoAction {
                from_peer_id: state.conn_id.clone(),
                action: action.clone(),
                video_url: video_url.clone(),
            };
            let broadcast = to_peer_id.is_none();
            relay(ctx, room_id, &state.conn_id, broadcast, to_peer_id.as_deref(), &event).await;
            ServerEvent::Ack
        }

        ClientRequest::CreatePoll { question, options } => {
            poll_mutation(state, ctx, |polls| {
                polls.add(question.clone(), options.clone());
            })
            .await
        }

        ClientRequest::Vote { poll_index, option } => {
            let voter = state.peer_uuid.clone();
            poll_mutation(state, ctx, |polls| {
                polls.vote(*poll_index, &voter, option.clone());
            })
            .await
        }

        ClientRequest::EditPoll {
            poll_index,
            question,
            options,
        } => {
            poll_mutation(state, ctx, |polls| {
                polls.edit(*poll_index, question.clone(), options.clone());
            })
            .await
        }

        ClientRequest::DeletePoll { poll_index } => {
            poll_mutation(state, ctx, |polls| {
                polls.delete(*poll_index);
            })
            .await
        }

        ClientRequest::UpdatePoll => {
            let Some(room_id) = state.room() else {
                return error_event("Room not found");
            };
            let _ = ctx
                .registry
                .with_room(room_id, |room| {
                    if !room.polls().is_empty() {
                        room.send_to_all(&ServerEvent::UpdatePolls {
                            polls: room.polls().views(),
                        });
                    }
                })
                .await;
            ServerEvent::Ack
        }

        ClientRequest::StartRtmp { file } => {
            let Some(room_id) = state.room() else {
                return ServerEvent::RtmpUrl { url: None };
            };
            if !self_is_presenter(state, ctx) || !validate::is_valid_file_name(file) {
                return ServerEvent::RtmpUrl { url: None };
            }
            let host = rtmp_host();
            match ctx.registry.rtmp().start_file(room_id, &host, 1935, file) {
                Ok(url) => {
                    ctx.metrics.inc_rtmp_sessions();
                    ServerEvent::RtmpUrl { url: Some(url) }
                }
                Err(e) => {
                    warn!("startRtmp failed for room {}: {}", room_id, e);
                    ServerEvent::RtmpUrl { url: None }
                }
            }
        }

        ClientRequest::StopRtmp => {
            if let Some(room_id) = state.room() {
                ctx.registry.rtmp().stop_file(room_id);
            }
            ServerEvent::Ack
        }

        ClientRequest::StartRtmpFromUrl { input_video_url } => {
            let Some(room_id) = state.room() else {
                return ServerEvent::RtmpUrl { url: None };
            };
            if !self_is_presenter(state, ctx) || !validate::is_valid_http_url(input_video_url) {
                return ServerEvent::RtmpUrl { url: None };
            }
            let host = rtmp_host();
            match ctx
                .registry
                .rtmp()
                .start_url(room_id, &host, 1935, input_video_url)
            {
                Ok(url) => {
                    ctx.metrics.inc_rtmp_sessions();
                    ServerEvent::RtmpUrl { url: Some(url) }
                }
                Err(e) => {
                    warn!("startRtmpFromUrl failed for room {}: {}", room_id, e);
                    ServerEvent::RtmpUrl { url: None }
                }
            }
        }

        ClientRequest::StopRtmpFromUrl => {
            if let Some(room_id) = state.room() {
                ctx.registry.rtmp().stop_url(room_id);
            }
            ServerEvent::Ack
        }

        ClientRequest::ExitRoom => {
            let Some(room_id) = state.room().map(String::from) else {
                return error_event("Not currently in a room");
            };
            if !state.joined {
                state.room_id = None;
                return error_event("Not currently in a room");
            }
            match ctx.registry.exit(&room_id, &state.conn_id).await {
                Ok(summary) => {
                    if summary.was_presenter && ctx.config.host.protected {
                        ctx.host_grants.revoke(&state.client_ip);
                    }
                    state.joined = false;
                    state.room_id = None;
                    ServerEvent::Ack
                }
                Err(e) => {
                    debug!("exitRoom for {}: {}", state.conn_id, e);
                    state.joined = false;
                    state.room_id = None;
                    ServerEvent::Ack
                }
            }
        }
    }
}

/// The join gate: validation, auth, ban, lock, lobby — in that order.
async fn handle_join(
    room_id: &str,
    peer_info: &super::protocol::JoinPeerInfo,
    state: &mut ConnState,
    tx: &mpsc::Sender<Arc<String>>,
    ctx: &Arc<SignalingContext>,
) -> ServerEvent {
    if !validate::is_valid_room_name(room_id) {
        warn!("Join rejected: invalid room name {:?}", room_id);
        return ServerEvent::JoinRejected {
            reason: JoinRejectReason::Invalid,
        };
    }

    if !ctx.registry.room_exists(room_id) {
        return error_event("Room does not exist");
    }

    // Auth gate: required when the deployment demands it or a token is
    // presented.
    let mut presenter_claim: Option<bool> = None;
    if ctx.config.host.user_auth || peer_info.peer_token.is_some() {
        let Some(token) = peer_info.peer_token.as_deref() else {
            return ServerEvent::JoinRejected {
                reason: JoinRejectReason::Unauthorized,
            };
        };
        let claims = match auth::decode_token(token, &ctx.config.jwt_secret) {
            Ok(claims) => claims,
            Err(e) => {
                warn!("Join token rejected: {}", e);
                return ServerEvent::JoinRejected {
                    reason: JoinRejectReason::Unauthorized,
                };
            }
        };
        if !auth::is_auth_peer(&ctx.config.host.users, &claims.username, &claims.password) {
            return ServerEvent::JoinRejected {
                reason: JoinRejectReason::Unauthorized,
            };
        }
        if claims.presenter {
            // A token-asserted presenter is still subject to the allow-list
            // when the deployment restricts who may run rooms.
            let list = &ctx.registry.presenters().policy().list;
            if (ctx.config.host.protected || ctx.config.host.user_auth)
                && !list.is_empty()
                && !list.iter().any(|n| n == &peer_info.peer_name)
            {
                return ServerEvent::JoinRejected {
                    reason: JoinRejectReason::NotAllowed,
                };
            }
            presenter_claim = Some(true);
        }
    }

    let new_peer = NewPeer {
        conn_id: state.conn_id.clone(),
        uuid: peer_info.peer_uuid.clone(),
        name: peer_info.peer_name.clone(),
        audio: peer_info.peer_audio,
        video: peer_info.peer_video,
        video_privacy: peer_info.peer_video_privacy,
        hand: peer_info.peer_hand,
        recording: peer_info.peer_recording,
        sender: tx.clone(),
        presenter_claim,
    };

    match ctx.registry.join(room_id, new_peer).await {
        Ok(JoinOutcome::Joined(room)) => {
            state.room_id = Some(room_id.to_string());
            state.joined = true;
            state.peer_name = peer_info.peer_name.clone();
            state.peer_uuid = peer_info.peer_uuid.clone();

            if ctx.config.host.protected && self_is_presenter(state, ctx) {
                ctx.host_grants.authorize(&state.client_ip);
            }

            ServerEvent::Joined { room }
        }
        Ok(JoinOutcome::Full) => ServerEvent::JoinRejected {
            reason: JoinRejectReason::FullCapacity,
        },
        Ok(JoinOutcome::Banned) => ServerEvent::JoinRejected {
            reason: JoinRejectReason::IsBanned,
        },
        Ok(JoinOutcome::Locked) => ServerEvent::JoinRejected {
            reason: JoinRejectReason::IsLocked,
        },
        Ok(JoinOutcome::Lobby) => {
            // Remember identity so a later presenter admit can correlate.
            state.peer_name = peer_info.peer_name.clone();
            state.peer_uuid = peer_info.peer_uuid.clone();
            ServerEvent::JoinRejected {
                reason: JoinRejectReason::IsLobby,
            }
        }
        Err(RoomError::NotFound(_)) => error_event("Room does not exist"),
        Err(e) => {
            error!("join failed for {}: {}", state.conn_id, e);
            error_event("Failed to join room")
        }
    }
}

/// Privileged room-level actions. Unauthorized callers are acknowledged with
/// no effect and no broadcast.
async fn handle_room_action(
    action: RoomActionKind,
    password: &Option<String>,
    broadcasting: Option<bool>,
    peer_uuid: Option<&str>,
    state: &mut ConnState,
    ctx: &Arc<SignalingContext>,
) -> ServerEvent {
    let Some(room_id) = state.room().map(String::from) else {
        return error_event("Room not found");
    };

    // checkPassword is the one unprivileged roomAction.
    if action == RoomActionKind::CheckPassword {
        let provided = password.clone().unwrap_or_default();
        let result = ctx
            .registry
            .with_room(&room_id, |room| {
                if room.check_password(&provided) {
                    ("OK".to_string(), Some(Box::new(room.snapshot())))
                } else {
                    ("KO".to_string(), None)
                }
            })
            .await;
        return match result {
            Ok((status, room)) => ServerEvent::RoomPassword { status, room },
            Err(_) => error_event("Room not found"),
        };
    }

    if !self_is_presenter(state, ctx) {
        debug!("Unauthorized roomAction {:?} from {}", action, state.conn_id);
        return ServerEvent::Ack;
    }

    let conn_id = state.conn_id.clone();
    let peer_name = state.peer_name.clone();
    let password = password.clone();
    let banned_uuid = peer_uuid.map(String::from);

    let result = ctx
        .registry
        .with_room_mut(&room_id, move |room| {
            let mut notify = true;
            match action {
                RoomActionKind::Lock => {
                    // Second lock in a race is idempotent by value; the
                    // losing caller is not notified of the no-op.
                    if room.is_locked() {
                        notify = false;
                    } else {
                        room.set_locked(true, password);
                    }
                }
                RoomActionKind::Unlock => room.set_locked(false, None),
                RoomActionKind::LobbyOn => room.set_lobby_enabled(true),
                RoomActionKind::LobbyOff => room.set_lobby_enabled(false),
                RoomActionKind::Broadcasting => {
                    room.set_broadcasting(broadcasting.unwrap_or(false))
                }
                RoomActionKind::HostOnlyRecordingOn => room.set_host_only_recording(true),
                RoomActionKind::HostOnlyRecordingOff => room.set_host_only_recording(false),
                RoomActionKind::IsBanned => {
                    if let Some(uuid) = banned_uuid {
                        info!("Peer uuid {} banned from room {}", uuid, room.id);
                        room.add_banned_peer(&uuid);
                    }
                    notify = false;
                }
                // handled before the privilege gate
                RoomActionKind::CheckPassword => notify = false,
            }
            if notify {
                room.broadcast(&conn_id, &ServerEvent::RoomAction { peer_name, action });
            }
            debug!(
                "Room {} status: locked={} lobby={} broadcasting={} hostOnlyRecording={}",
                room.id,
                room.is_locked(),
                room.is_lobby_enabled(),
                room.is_broadcasting(),
                room.is_host_only_recording()
            );
        })
        .await;

    match result {
        Ok(()) => ServerEvent::Ack,
        Err(_) => error_event("Room not found"),
    }
}

/// Peer-targeted actions; the privileged subset requires presenter status.
async fn handle_peer_action(
    action: PeerActionKind,
    to_peer_id: Option<&str>,
    to_peer_uuid: Option<&str>,
    broadcast: bool,
    state: &mut ConnState,
    ctx: &Arc<SignalingContext>,
) -> ServerEvent {
    let Some(room_id) = state.room().map(String::from) else {
        return error_event("Room not found");
    };

    if action.is_privileged() && !self_is_presenter(state, ctx) {
        debug!("Unauthorized peerAction {:?} from {}", action, state.conn_id);
        return ServerEvent::Ack;
    }

    if action == PeerActionKind::Ban {
        if let Some(uuid) = to_peer_uuid {
            let uuid = uuid.to_string();
            let _ = ctx
                .registry
                .with_room_mut(&room_id, |room| {
                    info!("Peer uuid {} banned from room {}", uuid, room.id);
                    room.add_banned_peer(&uuid);
                })
                .await;
        }
    }

    let event = ServerEvent::PeerAction {
        from_peer_id: state.conn_id.clone(),
        from_peer_name: state.peer_name.clone(),
        action,
    };
    relay(ctx, &room_id, &state.conn_id, broadcast, to_peer_id, &event).await;
    ServerEvent::Ack
}

/// Broadcast-or-targeted delivery used by the relay commands. Absent rooms
/// and absent targets are no-ops.
async fn relay(
    ctx: &Arc<SignalingContext>,
    room_id: &str,
    sender_id: &str,
    broadcast: bool,
    to_peer_id: Option<&str>,
    event: &ServerEvent,
) {
    let _ = ctx
        .registry
        .with_room(room_id, |room| {
            if broadcast || to_peer_id.is_none() {
                room.broadcast(sender_id, event);
            } else if let Some(target) = to_peer_id {
                room.send_to(target, event);
            }
        })
        .await;
}

/// Poll mutations all follow the same shape: mutate, then push the updated
/// poll list to everyone.
async fn poll_mutation(
    state: &ConnState,
    ctx: &Arc<SignalingContext>,
    mutate: impl FnOnce(&mut crate::room::polls::PollSet),
) -> ServerEvent {
    let Some(room_id) = state.room() else {
        return error_event("Room not found");
    };
    let result = ctx
        .registry
        .with_room_mut(room_id, |room| {
            mutate(room.polls_mut());
            room.send_to_all(&ServerEvent::UpdatePolls {
                polls: room.polls().views(),
            });
        })
        .await;
    match result {
        Ok(()) => ServerEvent::Ack,
        Err(_) => error_event("Room not found"),
    }
}

/// Presenter privilege is re-evaluated fresh on every privileged action.
fn self_is_presenter(state: &ConnState, ctx: &Arc<SignalingContext>) -> bool {
    match state.room() {
        Some(room_id) => ctx.registry.presenters().resolve(
            room_id,
            &state.conn_id,
            &state.peer_name,
            &state.peer_uuid,
        ),
        None => false,
    }
}

/// Maps a logical produce source to the capability flag it switches on.
fn media_type_to_update(media_type: Option<&str>, kind: mediasoup::prelude::MediaKind) -> Option<PeerUpdateKind> {
    match media_type {
        Some("audio") => Some(PeerUpdateKind::Audio),
        Some("camera") | Some("video") => Some(PeerUpdateKind::Video),
        Some("screen") => Some(PeerUpdateKind::Screen),
        None => match kind {
            mediasoup::prelude::MediaKind::Audio => Some(PeerUpdateKind::Audio),
            mediasoup::prelude::MediaKind::Video => Some(PeerUpdateKind::Video),
        },
        _ => None,
    }
}

/// Best-effort client address for host grants: proxy header first, socket
/// address as fallback.
pub fn client_ip_from_headers(headers: &axum::http::HeaderMap, fallback: &str) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn rtmp_host() -> String {
    std::env::var("RTMP_HOST").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip_from_headers(&headers, "127.0.0.1"), "203.0.113.7");

        let empty = HeaderMap::new();
        assert_eq!(client_ip_from_headers(&empty, "127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn media_type_maps_to_capability_flags() {
        use mediasoup::prelude::MediaKind;
        assert_eq!(
            media_type_to_update(Some("camera"), MediaKind::Video),
            Some(PeerUpdateKind::Video)
        );
        assert_eq!(
            media_type_to_update(Some("screen"), MediaKind::Video),
            Some(PeerUpdateKind::Screen)
        );
        assert_eq!(
            media_type_to_update(None, MediaKind::Audio),
            Some(PeerUpdateKind::Audio)
        );
        assert_eq!(media_type_to_update(Some("whiteboard"), MediaKind::Video), None);
    }
}
