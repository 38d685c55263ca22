//! Warden Storage - SQLite persistence layer.
//!
//! This crate holds everything Warden keeps on disk besides logs and the CA:
//!
//! - Settings (JSON values in a key-value `config` table)
//! - Store attachments made by the proxy (`sessions`)
//! - Captured exchanges (`captures`)
//!
//! # Example
//!
//! ```no_run
//! use warden_storage::{Database, Settings};
//!
//! let db = Database::open_in("/tmp/warden").unwrap();
//! let settings = db.init_settings(&Settings::defaults("/tmp/warden")).unwrap();
//! assert_eq!(settings.proxy_port, 9008);
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;

pub use database::{Database, DATABASE_FILE};
pub use error::{Result, StorageError};
pub use models::{Capture, Config, NewCapture, Session, Settings, DEFAULT_PROXY_PORT};
pub use pool::ConnectionPool;
pub use repository::hash_body;
