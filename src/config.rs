#![forbid(unsafe_code)]

// Server configuration, loaded from environment variables.

use serde::Deserialize;

/// Default per-room participant limit when ROOM_CAPACITY is not set.
const DEFAULT_ROOM_CAPACITY: usize = 64;

/// A statically configured user allowed to authenticate with a join token.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StaticUser {
    pub username: String,
    pub password: String,
}

/// Presenter election policy.
#[derive(Debug, Clone, Default)]
pub struct PresenterPolicy {
    /// Display names that resolve as presenter unconditionally.
    pub list: Vec<String>,
    /// When true, the first peer to join a room becomes its presenter.
    pub join_first: bool,
}

/// Host protection settings. When `protected` or `user_auth` is on, joins
/// require a valid signed token and presenters receive an IP grant on login.
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub protected: bool,
    pub user_auth: bool,
    pub users: Vec<StaticUser>,
}

/// RTMP relay limits.
#[derive(Debug, Clone)]
pub struct RtmpConfig {
    pub enabled: bool,
    /// Global cap on concurrently active relay sessions of each kind.
    pub max_streams: usize,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_streams: 1,
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub room_capacity: usize,
    pub presenters: PresenterPolicy,
    pub host: HostConfig,
    pub jwt_secret: String,
    pub jwt_exp_secs: u64,
    pub rtmp: RtmpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            room_capacity: DEFAULT_ROOM_CAPACITY,
            presenters: PresenterPolicy::default(),
            host: HostConfig::default(),
            jwt_secret: "huddle_jwt_secret".to_string(),
            jwt_exp_secs: 3600,
            rtmp: RtmpConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// HOST_USERS is a JSON array of `{"username": ..., "password": ...}`
    /// entries; PRESENTER_LIST is a comma-separated list of display names.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let users = std::env::var("HOST_USERS")
            .ok()
            .and_then(|v| serde_json::from_str::<Vec<StaticUser>>(&v).ok())
            .unwrap_or_default();

        let presenter_list = std::env::var("PRESENTER_LIST")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            port: env_parse("PORT", defaults.port),
            room_capacity: env_parse("ROOM_CAPACITY", defaults.room_capacity),
            presenters: PresenterPolicy {
                list: presenter_list,
                join_first: env_parse("PRESENTER_JOIN_FIRST", true),
            },
            host: HostConfig {
                protected: env_parse("HOST_PROTECTED", false),
                user_auth: env_parse("HOST_USER_AUTH", false),
                users,
            },
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_exp_secs: env_parse("JWT_EXP_SECS", defaults.jwt_exp_secs),
            rtmp: RtmpConfig {
                enabled: env_parse("RTMP_ENABLED", false),
                max_streams: env_parse("RTMP_MAX_STREAMS", defaults.rtmp.max_streams),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_open() {
        let cfg = ServerConfig::default();
        assert!(!cfg.host.protected);
        assert!(!cfg.host.user_auth);
        assert_eq!(cfg.room_capacity, DEFAULT_ROOM_CAPACITY);
        assert!(!cfg.rtmp.enabled);
    }

    #[test]
    fn static_users_parse_from_json() {
        let users: Vec<StaticUser> =
            serde_json::from_str(r#"[{"username":"alice","password":"p1"}]"#).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username, "alice");
    }
}
