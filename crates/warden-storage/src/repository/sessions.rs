//! Store attachment repository.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::Session;
use crate::repository::parse_datetime;

/// Repository for named store attachments.
pub struct SessionsRepo;

impl SessionsRepo {
    /// Records an attachment, replacing any earlier one under `namespace`.
    pub fn attach(conn: &Connection, namespace: &str, credentials: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO sessions (namespace, credentials) VALUES (?1, ?2)
             ON CONFLICT(namespace) DO UPDATE SET
                credentials = ?2,
                attached_at = datetime('now')",
            params![namespace, credentials],
        )?;
        Ok(())
    }

    /// Looks up an attachment.
    pub fn get(conn: &Connection, namespace: &str) -> Result<Option<Session>> {
        let session = conn
            .query_row(
                "SELECT namespace, credentials, attached_at FROM sessions WHERE namespace = ?1",
                [namespace],
                |row| {
                    Ok(Session {
                        namespace: row.get(0)?,
                        credentials: row.get(1)?,
                        attached_at: parse_datetime(&row.get::<_, String>(2)?),
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    /// Removes an attachment. Returns true if one existed.
    pub fn detach(conn: &Connection, namespace: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM sessions WHERE namespace = ?1", [namespace])?;
        Ok(deleted > 0)
    }
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

    #[test]
    fn test_attach_and_get() {
        let conn = setup_db();
        SessionsRepo::attach(&conn, "Database", "").unwrap();

        let session = SessionsRepo::get(&conn, "Database").unwrap().unwrap();
        assert_eq!(session.namespace, "Database");
        assert_eq!(session.credentials, "");
    }

    #[test]
    fn test_reattach_replaces_credentials() {
        let conn = setup_db();
        SessionsRepo::attach(&conn, "Database", "old").unwrap();
        SessionsRepo::attach(&conn, "Database", "new").unwrap();

        let session = SessionsRepo::get(&conn, "Database").unwrap().unwrap();
        assert_eq!(session.credentials, "new");
    }

    #[test]
    fn test_detach() {
        let conn = setup_db();
        SessionsRepo::attach(&conn, "Database", "").unwrap();

        assert!(SessionsRepo::detach(&conn, "Database").unwrap());
        assert!(!SessionsRepo::detach(&conn, "Database").unwrap());
        assert!(SessionsRepo::get(&conn, "Database").unwrap().is_none());
    }
}
