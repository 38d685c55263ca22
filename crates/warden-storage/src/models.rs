//! Data models for storage.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default proxy listener port.
pub const DEFAULT_PROXY_PORT: u16 = 9008;

/// A configuration key-value pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration key.
    pub key: String,
    /// Configuration value (JSON).
    pub value: serde_json::Value,
}

/// Persistent application settings.
///
/// Each field lives under its own key in the `config` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding the database, logs, CA and captured content.
    pub data_dir: PathBuf,
    /// Port the proxy listens on.
    pub proxy_port: u16,
    /// Whether the listener accepts connections from other hosts.
    pub listen_non_local: bool,
    /// Whether transparent redirect rules are installed on rooted hosts.
    pub transparent: bool,
    /// Whether exchanges are recorded.
    pub capture_data: bool,
}

impl Settings {
    /// Key holding the data directory.
    pub const DATA_DIR: &'static str = "data_dir";
    /// Key holding the listener port.
    pub const PROXY_PORT: &'static str = "proxy_port";
    /// Key holding the non-local listen flag.
    pub const LISTEN_NON_LOCAL: &'static str = "listen_non_local";
    /// Key holding the transparent mode flag.
    pub const TRANSPARENT: &'static str = "transparent";
    /// Key holding the capture flag.
    pub const CAPTURE_DATA: &'static str = "capture_data";

    /// Returns the default settings rooted at `data_dir`.
    pub fn defaults(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            proxy_port: DEFAULT_PROXY_PORT,
            listen_non_local: true,
            transparent: true,
            capture_data: true,
        }
    }

    /// Directory where captured bodies are written.
    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join("content")
    }
}

/// A named store attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Namespace the proxy attached under.
    pub namespace: String,
    /// Opaque credentials, empty when none.
    pub credentials: String,
    /// When the attachment was made.
    pub attached_at: DateTime<Utc>,
}

/// A recorded HTTP exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    /// Unique identifier.
    pub id: i64,
    /// Request method.
    pub method: String,
    /// Full request URI.
    pub url: String,
    /// Target host, if known.
    pub host: Option<String>,
    /// Response status, if a response was seen.
    pub status: Option<u16>,
    /// Request body size in bytes.
    pub request_size: i64,
    /// Response body size in bytes.
    pub response_size: i64,
    /// SHA-256 of the response body.
    pub body_hash: Option<String>,
    /// File holding the response body.
    pub content_path: Option<PathBuf>,
    /// Uid of the local process that made the request.
    pub client_uid: Option<u32>,
    /// Timestamp.
    pub created_at: DateTime<Utc>,
}

/// Parameters for recording a new exchange.
#[derive(Debug, Clone, Default)]
pub struct NewCapture {
    /// Request method.
    pub method: String,
    /// Full request URI.
    pub url: String,
    /// Target host, if known.
    pub host: Option<String>,
    /// Response status.
    pub status: Option<u16>,
    /// Request body size in bytes.
    pub request_size: i64,
    /// Response body size in bytes.
    pub response_size: i64,
    /// SHA-256 of the response body.
    pub body_hash: Option<String>,
    /// File holding the response body.
    pub content_path: Option<PathBuf>,
    /// Uid of the local process that made the request.
    pub client_uid: Option<u32>,
}
