//! Bearer-token auth for the HTTP and WebSocket surface.
//!
//! A long-lived token is generated once and stored in `auth.json` (0600).
//! `COMPANION_AUTH_TOKEN` overrides the file when set. Loopback peers may
//! fetch the token via `/auth/auto`; everything else presents
//! `Authorization: Bearer <token>` or `?token=` on WebSocket upgrades.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::paths;
use crate::persist::read_json_or_empty;

const TOKEN_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthFile {
    token: String,
    created_at: String,
}

/// Load the bearer token, generating and persisting one on first run.
pub fn load_or_create_token() -> anyhow::Result<String> {
    if let Ok(env_token) = std::env::var("COMPANION_AUTH_TOKEN") {
        let trimmed = env_token.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let path = paths::auth_path();
    if let Some(existing) = read_json_or_empty::<AuthFile>(&path) {
        if !existing.token.is_empty() {
            return Ok(existing.token);
        }
    }

    let rng = SystemRandom::new();
    let mut bytes = [0u8; TOKEN_LEN];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("failed to generate auth token"))?;
    let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

    let file = AuthFile {
        token: token.clone(),
        created_at: companion_protocol::unix_now_z(),
    };
    let json = serde_json::to_vec_pretty(&file)?;
    // 0600 from creation - the token never exists world-readable
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    f.write_all(&json)?;
    f.sync_all()?;

    info!(
        component = "auth",
        event = "auth.token_generated",
        path = %path.display(),
        "Generated bearer token"
    );
    Ok(token)
}

pub fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

/// Check a presented token against the expected one.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    // Constant-time-ish comparison; tokens are same-length hex in practice.
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .bytes()
        .zip(presented.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Axum middleware enforcing the bearer token.
///
/// `/health` and the `/auth/*` routes stay unauthenticated; loopback peers
/// bypass the check entirely.
pub async fn auth_middleware(
    State(expected_token): State<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    if path == "/health" || path.starts_with("/auth/") {
        return Ok(next.run(req).await);
    }

    if is_loopback(&addr) {
        return Ok(next.run(req).await);
    }

    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(value) = auth_header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if token_matches(&expected_token, token) {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    // ?token= query param (WebSocket upgrades can't set headers)
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if token_matches(&expected_token, token) {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    Err(StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_matches_rejects_length_mismatch() {
        assert!(!token_matches("abcd", "abc"));
        assert!(!token_matches("abcd", "abce"));
        assert!(token_matches("abcd", "abcd"));
    }

    #[test]
    fn loopback_detection() {
        let v4: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let v6: SocketAddr = "[::1]:8080".parse().unwrap();
        let remote: SocketAddr = "192.168.1.5:8080".parse().unwrap();
        assert!(is_loopback(&v4));
        assert!(is_loopback(&v6));
        assert!(!is_loopback(&remote));
    }
}
