#![forbid(unsafe_code)]

// ICE server lists for transport answers, with coturn time-limited
// credentials (HMAC-SHA1 per the TURN REST API convention).

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// TURN server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// TURN/STUN URLs (e.g. ["stun:turn.example.com:3478", "turn:turn.example.com:3478"])
    pub urls: Vec<String>,
    /// Shared secret for time-limited credentials
    pub secret: String,
    /// Credential TTL in seconds
    pub ttl_secs: u64,
}

/// ICE server entry delivered with every created transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TurnConfig {
    /// Load from environment variables. Returns None if TURN_URLS is unset,
    /// in which case clients fall back to host candidates only.
    pub fn from_env() -> Option<Self> {
        let urls_str = std::env::var("TURN_URLS").ok()?;
        let secret = std::env::var("TURN_SECRET").ok()?;
        let ttl_secs = std::env::var("TURN_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(86400);

        let urls: Vec<String> = urls_str.split(',').map(|s| s.trim().to_string()).collect();

        Some(Self { urls, secret, ttl_secs })
    }

    /// Generate credentials bound to a peer's connection id.
    ///
    /// coturn format: username = "expiry_timestamp:peer_id",
    /// credential = base64(HMAC-SHA1(secret, username)).
    pub fn ice_servers_for(&self, peer_id: &str) -> Vec<IceServer> {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + self.ttl_secs;

        let username = format!("{expiry}:{peer_id}");

        let credential = HmacSha1::new_from_slice(self.secret.as_bytes())
            .ok()
            .map(|mut mac| {
                mac.update(username.as_bytes());
                base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
            });

        vec![IceServer {
            urls: self.urls.clone(),
            username: credential.is_some().then_some(username),
            credential,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_bound_to_peer() {
        let cfg = TurnConfig {
            urls: vec!["turn:turn.example.com:3478".into()],
            secret: "shared".into(),
            ttl_secs: 60,
        };
        let servers = cfg.ice_servers_for("peer-1");
        assert_eq!(servers.len(), 1);
        let username = servers[0].username.as_deref().unwrap();
        assert!(username.ends_with(":peer-1"));
        assert!(servers[0].credential.is_some());
    }
}
