//! High-level database interface.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tracing::info;

use crate::error::{Result, StorageError};
use crate::models::{Capture, Config, NewCapture, Session, Settings};
use crate::pool::ConnectionPool;
use crate::repository::{CapturesRepo, ConfigRepo, SessionsRepo};

/// File name of the database inside the data directory.
pub const DATABASE_FILE: &str = "warden.db";

/// High-level database interface for Warden.
#[derive(Clone, Debug)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Opens the database inside `data_dir`, creating the directory if needed.
    pub fn open_in(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_path(data_dir.as_ref().join(DATABASE_FILE))
    }

    /// Opens a database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Platform data directory for Warden.
    pub fn default_data_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "warden", "warden").ok_or_else(|| {
            StorageError::Unavailable("Could not determine app data directory".into())
        })?;

        Ok(proj_dirs.data_dir().to_path_buf())
    }

    // === Settings ===

    /// Writes any missing setting from `defaults`, then returns the stored settings.
    pub fn init_settings(&self, defaults: &Settings) -> Result<Settings> {
        let conn = self.pool.get()?;
        let written = ConfigRepo::init_settings(&conn, defaults)?;
        if written > 0 {
            info!("Initialised {} default settings", written);
        }
        ConfigRepo::load_settings(&conn, defaults)
    }

    /// Reads the settings without writing anything.
    pub fn load_settings(&self, defaults: &Settings) -> Result<Settings> {
        let conn = self.pool.get()?;
        ConfigRepo::load_settings(&conn, defaults)
    }

    /// Get a configuration value.
    pub fn get_config(&self, key: &str) -> Result<Option<Config>> {
        let conn = self.pool.get()?;
        ConfigRepo::get(&conn, key)
    }

    /// Set a configuration value.
    pub fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.pool.get()?;
        ConfigRepo::set(&conn, key, value)
    }

    // === Sessions ===

    /// Records that the proxy attached this store under `namespace`.
    pub fn attach_session(&self, namespace: &str, credentials: &str) -> Result<()> {
        let conn = self.pool.get()?;
        SessionsRepo::attach(&conn, namespace, credentials)
    }

    /// Looks up an attachment.
    pub fn get_session(&self, namespace: &str) -> Result<Option<Session>> {
        let conn = self.pool.get()?;
        SessionsRepo::get(&conn, namespace)
    }

    // === Captures ===

    /// Records an exchange.
    pub fn record_capture(&self, capture: NewCapture) -> Result<i64> {
        let conn = self.pool.get()?;
        CapturesRepo::insert(&conn, capture)
    }

    /// Get a capture by ID.
    pub fn get_capture(&self, id: i64) -> Result<Option<Capture>> {
        let conn = self.pool.get()?;
        CapturesRepo::get_by_id(&conn, id)
    }

    /// Most recent captures first.
    pub fn recent_captures(&self, limit: i64, offset: i64) -> Result<Vec<Capture>> {
        let conn = self.pool.get()?;
        CapturesRepo::get_recent(&conn, limit, offset)
    }

    /// Count recorded captures.
    pub fn count_captures(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        CapturesRepo::count(&conn)
    }

    /// Every content file referenced by a capture.
    pub fn capture_content_paths(&self) -> Result<Vec<PathBuf>> {
        let conn = self.pool.get()?;
        CapturesRepo::content_paths(&conn)
    }

    /// Deletes every capture.
    pub fn clear_captures(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let deleted = CapturesRepo::clear(&conn)?;
        info!("Deleted {} captures", deleted);
        Ok(deleted)
    }
}
