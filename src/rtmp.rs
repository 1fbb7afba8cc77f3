#![forbid(unsafe_code)]

// RTMP relay coordination: tracks active outbound restreaming sessions and
// enforces global and per-room limits. The encoding pipeline itself is an
// external process; this layer only decides whether a session may start and
// hands out the relay URL.

use crate::config::RtmpConfig;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RtmpError {
    #[error("RTMP relay is disabled")]
    Disabled,

    #[error("Maximum number of RTMP streams reached")]
    LimitReached,

    #[error("Room already has an active RTMP stream of this kind")]
    AlreadyActive,
}

/// The media a relay session is fed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtmpSource {
    File(String),
    Url(String),
}

#[derive(Debug, Clone)]
pub struct RtmpSession {
    pub stream_key: String,
    pub source: RtmpSource,
}

#[derive(Default)]
struct Sessions {
    /// room id -> active file-fed session
    file: HashMap<String, RtmpSession>,
    /// room id -> active URL-fed session
    url: HashMap<String, RtmpSession>,
}

pub struct RtmpCoordinator {
    config: RtmpConfig,
    sessions: StdRwLock<Sessions>,
}

impl RtmpCoordinator {
    pub fn new(config: RtmpConfig) -> Self {
        Self {
            config,
            sessions: StdRwLock::new(Sessions::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Starts a file-fed relay for a room, returning the relay URL.
    pub fn start_file(&self, room_id: &str, host: &str, port: u16, file: &str) -> Result<String, RtmpError> {
        self.start(room_id, host, port, RtmpSource::File(file.to_string()))
    }

    /// Starts a URL-fed relay for a room, returning the relay URL.
    pub fn start_url(&self, room_id: &str, host: &str, port: u16, input_url: &str) -> Result<String, RtmpError> {
        self.start(room_id, host, port, RtmpSource::Url(input_url.to_string()))
    }

    fn start(&self, room_id: &str, host: &str, port: u16, source: RtmpSource) -> Result<String, RtmpError> {
        if !self.config.enabled {
            return Err(RtmpError::Disabled);
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let map = match source {
            RtmpSource::File(_) => &mut sessions.file,
            RtmpSource::Url(_) => &mut sessions.url,
        };

        if map.len() >= self.config.max_streams {
            warn!("RTMP stream limit reached ({} active)", map.len());
            return Err(RtmpError::LimitReached);
        }
        if map.contains_key(room_id) {
            return Err(RtmpError::AlreadyActive);
        }

        let stream_key = Uuid::new_v4().to_string();
        let rtmp_url = format!("rtmp://{host}:{port}/live/{stream_key}");

        map.insert(
            room_id.to_string(),
            RtmpSession {
                stream_key,
                source,
            },
        );

        info!("Started RTMP relay for room {} -> {}", room_id, rtmp_url);
        Ok(rtmp_url)
    }

    /// Stops the room's file-fed relay. Idempotent.
    pub fn stop_file(&self, room_id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let stopped = sessions.file.remove(room_id).is_some();
        if stopped {
            info!("Stopped RTMP file relay for room {}", room_id);
        } else {
            debug!("stop_file: no active file relay for room {}", room_id);
        }
        stopped
    }

    /// Stops the room's URL-fed relay. Idempotent.
    pub fn stop_url(&self, room_id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let stopped = sessions.url.remove(room_id).is_some();
        if stopped {
            info!("Stopped RTMP URL relay for room {}", room_id);
        } else {
            debug!("stop_url: no active URL relay for room {}", room_id);
        }
        stopped
    }

    /// Stops everything a room still has running. Called on room destruction;
    /// only a presenter's departure takes its streams down with it.
    pub fn stop_room(&self, room_id: &str, was_presenter: bool) {
        if !was_presenter {
            return;
        }
        self.stop_file(room_id);
        self.stop_url(room_id);
    }

    pub fn active_counts(&self) -> (usize, usize) {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        (sessions.file.len(), sessions.url.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(max_streams: usize) -> RtmpCoordinator {
        RtmpCoordinator::new(RtmpConfig {
            enabled: true,
            max_streams,
        })
    }

    #[test]
    fn disabled_coordinator_rejects() {
        let rtmp = RtmpCoordinator::new(RtmpConfig {
            enabled: false,
            max_streams: 4,
        });
        assert_eq!(
            rtmp.start_file("r1", "example.com", 1935, "talk.mp4"),
            Err(RtmpError::Disabled)
        );
    }

    #[test]
    fn global_limit_is_enforced() {
        let rtmp = coordinator(1);

        let url = rtmp.start_file("r1", "example.com", 1935, "a.mp4").unwrap();
        assert!(url.starts_with("rtmp://example.com:1935/live/"));

        assert_eq!(
            rtmp.start_file("r2", "example.com", 1935, "b.mp4"),
            Err(RtmpError::LimitReached)
        );

        // File and URL relays have independent caps
        assert!(rtmp.start_url("r2", "example.com", 1935, "https://feed").is_ok());

        rtmp.stop_file("r1");
        assert!(rtmp.start_file("r2", "example.com", 1935, "b.mp4").is_ok());
    }

    #[test]
    fn one_stream_of_each_kind_per_room() {
        let rtmp = coordinator(4);
        rtmp.start_file("r1", "example.com", 1935, "a.mp4").unwrap();
        assert_eq!(
            rtmp.start_file("r1", "example.com", 1935, "b.mp4"),
            Err(RtmpError::AlreadyActive)
        );
    }

    #[test]
    fn stop_is_idempotent() {
        let rtmp = coordinator(4);
        rtmp.start_file("r1", "example.com", 1935, "a.mp4").unwrap();

        assert!(rtmp.stop_file("r1"));
        assert!(!rtmp.stop_file("r1"));
        assert_eq!(rtmp.active_counts(), (0, 0));
    }

    #[test]
    fn presenter_departure_stops_room_streams() {
        let rtmp = coordinator(4);
        rtmp.start_file("r1", "example.com", 1935, "a.mp4").unwrap();
        rtmp.start_url("r1", "example.com", 1935, "https://feed").unwrap();

        // Non-presenter leaving does not take streams down
        rtmp.stop_room("r1", false);
        assert_eq!(rtmp.active_counts(), (1, 1));

        rtmp.stop_room("r1", true);
        assert_eq!(rtmp.active_counts(), (0, 0));
    }
}
