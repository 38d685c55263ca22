//! Configuration repository.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::Result;
use crate::models::{Config, Settings};

/// Repository for configuration operations.
pub struct ConfigRepo;

impl ConfigRepo {
    /// Get a configuration value.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Config>> {
        let mut stmt = conn.prepare("SELECT key, value FROM config WHERE key = ?1")?;

        let config = stmt
            .query_row([key], |row| {
                let value_str: String = row.get(1)?;
                Ok(Config {
                    key: row.get(0)?,
                    value: serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null),
                })
            })
            .optional()?;

        Ok(config)
    }

    /// Set a configuration value (insert or update).
    pub fn set(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
        let value_json = serde_json::to_string(value)?;

        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value_json],
        )?;

        Ok(())
    }

    /// Set a value only if the key is absent. Returns true if it was written.
    pub fn set_if_missing(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<bool> {
        let value_json = serde_json::to_string(value)?;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)",
            params![key, value_json],
        )?;

        Ok(inserted > 0)
    }

    /// Delete a configuration value.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Get all configuration values.
    pub fn get_all(conn: &Connection) -> Result<Vec<Config>> {
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;

        let configs = stmt
            .query_map([], |row| {
                let value_str: String = row.get(1)?;
                Ok(Config {
                    key: row.get(0)?,
                    value: serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(configs)
    }

    /// Get a typed configuration value with a default.
    pub fn get_or_default<T: serde::de::DeserializeOwned>(
        conn: &Connection,
        key: &str,
        default: T,
    ) -> Result<T> {
        match Self::get(conn, key)? {
            Some(config) => Ok(serde_json::from_value(config.value).unwrap_or(default)),
            None => Ok(default),
        }
    }

    /// Writes every setting of `defaults` whose key is not stored yet.
    ///
    /// Returns the number of keys written.
    pub fn init_settings(conn: &Connection, defaults: &Settings) -> Result<usize> {
        let entries = [
            (Settings::DATA_DIR, serde_json::to_value(&defaults.data_dir)?),
            (Settings::PROXY_PORT, serde_json::to_value(defaults.proxy_port)?),
            (
                Settings::LISTEN_NON_LOCAL,
                serde_json::to_value(defaults.listen_non_local)?,
            ),
            (Settings::TRANSPARENT, serde_json::to_value(defaults.transparent)?),
            (Settings::CAPTURE_DATA, serde_json::to_value(defaults.capture_data)?),
        ];

        let mut written = 0;
        for (key, value) in entries {
            if Self::set_if_missing(conn, key, &value)? {
                debug!("Initialised setting {} = {}", key, value);
                written += 1;
            }
        }

        Ok(written)
    }

    /// Reads the settings, falling back to `defaults` per missing key.
    pub fn load_settings(conn: &Connection, defaults: &Settings) -> Result<Settings> {
        Ok(Settings {
            data_dir: Self::get_or_default(conn, Settings::DATA_DIR, defaults.data_dir.clone())?,
            proxy_port: Self::get_or_default(conn, Settings::PROXY_PORT, defaults.proxy_port)?,
            listen_non_local: Self::get_or_default(
                conn,
                Settings::LISTEN_NON_LOCAL,
                defaults.listen_non_local,
            )?,
            transparent: Self::get_or_default(conn, Settings::TRANSPARENT, defaults.transparent)?,
            capture_data: Self::get_or_default(
                conn,
                Settings::CAPTURE_DATA,
                defaults.capture_data,
            )?,
        })
    }
}
