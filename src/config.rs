use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;

use crate::error::ConfigError;
use crate::models::LocalUser;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:2052";
const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:2052/ws";
const DEFAULT_TLS_CERT: &str = "ssl/room/certificate.pem";
const DEFAULT_TLS_KEY: &str = "ssl/room/private.key";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Upper bound for every transport call; expiry counts as a failure.
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let request_timeout = match read("VIBE_REQUEST_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(parse("VIBE_REQUEST_TIMEOUT_MS", &raw)?),
            None => Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        };
        Ok(SyncConfig { request_timeout })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_raw = read("VIBE_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        Ok(RelayConfig {
            bind_addr: parse("VIBE_BIND_ADDR", &bind_raw)?,
            tls_cert: read("VIBE_TLS_CERT").map_or_else(|| PathBuf::from(DEFAULT_TLS_CERT), PathBuf::from),
            tls_key: read("VIBE_TLS_KEY").map_or_else(|| PathBuf::from(DEFAULT_TLS_KEY), PathBuf::from),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub relay_url: String,
    /// Shared secret for sealing message text; plain text when unset.
    pub channel_secret: Option<String>,
    pub user: LocalUser,
    pub sync: SyncConfig,
}

impl ClientConfig {
    /// Environment first; `user_id`/`username` override `VIBE_USER_ID`/`VIBE_USERNAME`.
    pub fn from_env(user_id: Option<String>, username: Option<String>) -> Result<Self, ConfigError> {
        let id = user_id
            .or_else(|| read("VIBE_USER_ID"))
            .ok_or(ConfigError::Missing("VIBE_USER_ID"))?;
        let username = username
            .or_else(|| read("VIBE_USERNAME"))
            .unwrap_or_else(|| id.clone());

        let mut user = LocalUser::new(id, username);
        user.avatar_url = read("VIBE_AVATAR_URL");

        Ok(ClientConfig {
            relay_url: read("VIBE_RELAY_URL").unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            channel_secret: read("VIBE_CHANNEL_SECRET"),
            user,
            sync: SyncConfig::from_env()?,
        })
    }
}

/// Loads `.env` if present. Missing files are fine; malformed ones are reported.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(e) if e.not_found() => {}
        Err(e) => warn!("Ignoring malformed .env: {}", e),
    }
}

fn read(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}
