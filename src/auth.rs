#![forbid(unsafe_code)]

// Signed join tokens and static-user authentication.

use crate::config::StaticUser;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("clock error")]
    ClockError,
}

/// Claims carried by a join token. A token may assert presenter status
/// directly; the signaling handler still applies the room allow-list check
/// for restricted deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinClaims {
    pub username: String,
    pub password: String,
    pub presenter: bool,
    pub exp: usize,
}

pub fn encode_token(
    username: &str,
    password: &str,
    presenter: bool,
    secret: &str,
    exp_secs: u64,
) -> Result<String, AuthError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| AuthError::ClockError)?;

    let claims = JoinClaims {
        username: username.to_string(),
        password: password.to_string(),
        presenter,
        exp: (now.as_secs() + exp_secs) as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::InvalidToken)
}

pub fn decode_token(token: &str, secret: &str) -> Result<JoinClaims, AuthError> {
    let data = decode::<JoinClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })?;

    Ok(data.claims)
}

/// Check credentials against the statically configured user list.
pub fn is_auth_peer(users: &[StaticUser], username: &str, password: &str) -> bool {
    users
        .iter()
        .any(|u| u.username == username && u.password == password)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-at-least-32-bytes-long!!";

    #[test]
    fn token_round_trip() {
        let token = encode_token("alice", "pw", true, SECRET, 3600).unwrap();
        let claims = decode_token(&token, SECRET).unwrap();
        assert_eq!(claims.username, "alice");
        assert!(claims.presenter);
    }

    #[test]
    fn wrong_secret_rejects() {
        let token = encode_token("alice", "pw", false, "secret-1", 3600).unwrap();
        assert_eq!(decode_token(&token, "secret-2"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn garbage_token_rejects() {
        assert_eq!(decode_token("not.a.jwt", SECRET), Err(AuthError::InvalidToken));
    }

    #[test]
    fn static_user_check() {
        let users = vec![StaticUser {
            username: "alice".into(),
            password: "pw".into(),
        }];
        assert!(is_auth_peer(&users, "alice", "pw"));
        assert!(!is_auth_peer(&users, "alice", "wrong"));
        assert!(!is_auth_peer(&users, "bob", "pw"));
    }
}
