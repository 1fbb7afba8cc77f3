#![forbid(unsafe_code)]

// huddle library - mediasoup-based conference orchestration server

pub mod auth;
pub mod config;
pub mod host;
pub mod media;
pub mod metrics;
pub mod room;
pub mod rtmp;
pub mod signaling;
pub mod turn;
pub mod validate;
