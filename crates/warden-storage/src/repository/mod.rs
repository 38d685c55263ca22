//! Database repositories for each table.

use chrono::{DateTime, Utc};

pub mod captures;
pub mod config;
pub mod sessions;

pub use captures::{hash_body, CapturesRepo};
pub use config::ConfigRepo;
pub use sessions::SessionsRepo;

/// Parses a SQLite `datetime('now')` or RFC 3339 timestamp.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}
