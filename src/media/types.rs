#![forbid(unsafe_code)]

// Common types and error handling for the media module

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Error taxonomy for media-engine operations.
///
/// NotFound variants are benign in teardown paths (callers treat them as
/// no-ops) and real errors in creation/lookup paths.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No media workers available")]
    NoCapacity,

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Transport parameters returned to the signaling client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl From<&WebRtcTransport> for TransportParams {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

/// Consumer parameters returned to the signaling client.
///
/// Consumers are created paused; `producer_paused` tells the client whether
/// the upstream producer was paused at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub producer_paused: bool,
}

impl ConsumerParams {
    pub fn from_consumer(consumer: &Consumer, producer_paused: bool) -> Self {
        Self {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            paused: consumer.paused(),
            producer_paused,
        }
    }
}

/// One peer's owned media primitives, all keyed by id.
///
/// Every transport, producer, and consumer is owned by exactly one peer;
/// dropping this struct closes them all in the engine.
#[derive(Debug, Clone)]
pub struct PeerMedia {
    pub id: String,
    pub transports: HashMap<String, WebRtcTransport>,
    pub producers: HashMap<String, Producer>,
    pub consumers: HashMap<String, Consumer>,
}

impl PeerMedia {
    pub fn new(id: String) -> Self {
        Self {
            id,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// Closes all media resources for this peer. Consumers first, then
    /// producers, then transports — engine handles close on drop.
    pub fn close_all(&mut self) {
        self.consumers.clear();
        self.producers.clear();
        self.transports.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }
}
