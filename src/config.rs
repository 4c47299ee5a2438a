//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;

/// Search radii a client may pick, in meters.
pub const ALLOWED_RADII: [u32; 4] = [500, 1000, 3000, 5000];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `BIND_ADDR`, default `0.0.0.0:3001`.
    pub bind_addr: SocketAddr,

    /// Radius used when `join_grid` carries none.
    /// Env: `LOCATION_RADIUS`, default `1000`.
    pub location_radius: u32,

    /// Room inactivity timeout.
    /// Env: `CHAT_TIMEOUT_MINUTES`, default `10`.
    pub chat_timeout: Duration,

    /// Env: `SCAN_INTERVAL_MS`, default `1000`.
    pub scan_interval: Duration,

    /// Content classifier credential. `None` keeps moderation regex-only.
    /// Env: `GEMINI_API_KEY`.
    pub gemini_api_key: Option<String>,

    /// Env: `GEMINI_MODEL`, default `gemini-2.5-flash`.
    pub gemini_model: String,

    /// redb file backing the durable store. `None` runs memory-only.
    /// Env: `STORE_PATH`.
    pub store_path: Option<PathBuf>,

    /// Env: `ABUSE_SALT`.
    pub abuse_salt: String,

    /// Env: `FRONTEND_URL`, default `http://localhost:3000`.
    pub frontend_url: String,

    /// Env: `TLS_CERT_PATH`.
    pub tls_cert_path: Option<PathBuf>,

    /// Env: `TLS_KEY_PATH`.
    pub tls_key_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 3001).into(),
            location_radius: 1000,
            chat_timeout: Duration::from_secs(10 * 60),
            scan_interval: Duration::from_millis(1000),
            gemini_api_key: None,
            gemini_model: "gemini-2.5-flash".to_string(),
            store_path: None,
            abuse_salt: "abuse_salt".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.bind_addr = parsed,
                Err(_) => warn!("Invalid BIND_ADDR {addr:?}, using default"),
            }
        }

        if let Some(radius) = lookup("LOCATION_RADIUS") {
            match radius.parse::<u32>() {
                Ok(r) if r > 0 => config.location_radius = r,
                _ => warn!("Invalid LOCATION_RADIUS {radius:?}, using default"),
            }
        }

        if let Some(minutes) = lookup("CHAT_TIMEOUT_MINUTES") {
            match minutes.parse::<u64>() {
                Ok(m) if m > 0 => config.chat_timeout = Duration::from_secs(m * 60),
                _ => warn!("Invalid CHAT_TIMEOUT_MINUTES {minutes:?}, using default"),
            }
        }

        if let Some(ms) = lookup("SCAN_INTERVAL_MS") {
            match ms.parse::<u64>() {
                Ok(ms) if ms > 0 => config.scan_interval = Duration::from_millis(ms),
                _ => warn!("Invalid SCAN_INTERVAL_MS {ms:?}, using default"),
            }
        }

        config.gemini_api_key = lookup("GEMINI_API_KEY").filter(|key| !key.trim().is_empty());

        if let Some(model) = lookup("GEMINI_MODEL").filter(|m| !m.is_empty()) {
            config.gemini_model = model;
        }

        config.store_path = lookup("STORE_PATH")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        if let Some(salt) = lookup("ABUSE_SALT").filter(|s| !s.is_empty()) {
            config.abuse_salt = salt;
        }

        if let Some(url) = lookup("FRONTEND_URL").filter(|u| !u.is_empty()) {
            config.frontend_url = url.trim_end_matches('/').to_string();
        }

        config.tls_cert_path = lookup("TLS_CERT_PATH").map(PathBuf::from);
        config.tls_key_path = lookup("TLS_KEY_PATH").map(PathBuf::from);

        config
    }
}
