//! Captured exchange repository.

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::{Capture, NewCapture};
use crate::repository::parse_datetime;

const SELECT_COLUMNS: &str = "SELECT id, method, url, host, status, request_size, response_size,
        body_hash, content_path, client_uid, created_at
     FROM captures";

/// Repository for captured exchanges.
pub struct CapturesRepo;

impl CapturesRepo {
    /// Records an exchange.
    pub fn insert(conn: &Connection, capture: NewCapture) -> Result<i64> {
        conn.execute(
            "INSERT INTO captures (method, url, host, status, request_size, response_size,
                                   body_hash, content_path, client_uid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                capture.method,
                capture.url,
                capture.host,
                capture.status,
                capture.request_size,
                capture.response_size,
                capture.body_hash,
                capture
                    .content_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                capture.client_uid,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get a capture by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Capture>> {
        let capture = conn
            .query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), [id], map_row)
            .optional()?;
        Ok(capture)
    }

    /// Most recent captures first.
    pub fn get_recent(conn: &Connection, limit: i64, offset: i64) -> Result<Vec<Capture>> {
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            SELECT_COLUMNS
        ))?;

        let captures = stmt
            .query_map([limit, offset], map_row)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(captures)
    }

    /// Count recorded captures.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM captures", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Every content file referenced by a capture.
    pub fn content_paths(conn: &Connection) -> Result<Vec<PathBuf>> {
        let mut stmt =
            conn.prepare("SELECT DISTINCT content_path FROM captures WHERE content_path IS NOT NULL")?;

        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .map(PathBuf::from)
            .collect();

        Ok(paths)
    }

    /// Deletes every capture. Returns the number removed.
    pub fn clear(conn: &Connection) -> Result<usize> {
        let deleted = conn.execute("DELETE FROM captures", [])?;
        Ok(deleted)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Capture> {
    Ok(Capture {
        id: row.get(0)?,
        method: row.get(1)?,
        url: row.get(2)?,
        host: row.get(3)?,
        status: row.get(4)?,
        request_size: row.get(5)?,
        response_size: row.get(6)?,
        body_hash: row.get(7)?,
        content_path: row.get::<_, Option<String>>(8)?.map(PathBuf::from),
        client_uid: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

/// Hex-encoded SHA-256 of a body.
pub fn hash_body(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn sample(url: &str) -> NewCapture {
        NewCapture {
            method: "GET".to_string(),
            url: url.to_string(),
            host: Some("example.com".to_string()),
            status: Some(200),
            request_size: 0,
            response_size: 5,
            body_hash: Some(hash_body(b"hello")),
            content_path: None,
            client_uid: Some(10042),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let conn = setup_db();
        let id = CapturesRepo::insert(&conn, sample("http://example.com/")).unwrap();

        let capture = CapturesRepo::get_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(capture.method, "GET");
        assert_eq!(capture.status, Some(200));
        assert_eq!(capture.client_uid, Some(10042));
        assert_eq!(capture.host.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_get_missing() {
        let conn = setup_db();
        assert!(CapturesRepo::get_by_id(&conn, 99).unwrap().is_none());
    }

    #[test]
    fn test_recent_is_newest_first() {
        let conn = setup_db();
        for i in 0..5 {
            CapturesRepo::insert(&conn, sample(&format!("http://example.com/{}", i))).unwrap();
        }

        let recent = CapturesRepo::get_recent(&conn, 2, 0).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].url, "http://example.com/4");
        assert_eq!(recent[1].url, "http://example.com/3");
    }

    #[test]
    fn test_content_paths_and_clear() {
        let conn = setup_db();
        let mut with_file = sample("http://example.com/a");
        with_file.content_path = Some(PathBuf::from("/data/content/abc"));
        CapturesRepo::insert(&conn, with_file).unwrap();
        CapturesRepo::insert(&conn, sample("http://example.com/b")).unwrap();

        assert_eq!(
            CapturesRepo::content_paths(&conn).unwrap(),
            vec![PathBuf::from("/data/content/abc")]
        );

        assert_eq!(CapturesRepo::clear(&conn).unwrap(), 2);
        assert_eq!(CapturesRepo::count(&conn).unwrap(), 0);
    }

    #[test]
    fn test_hash_body() {
        let hash = hash_body(b"hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_ne!(hash, hash_body(b"world"));
    }
}
