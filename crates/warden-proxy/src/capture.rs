//! Capture plugin.
//!
//! Records every completed exchange in the store and, when a content
//! directory is set, writes the response body to a file named after its hash.

use std::path::PathBuf;

use warden_storage::{hash_body, Database, NewCapture};

use crate::service::{ProxyPlugin, ResponseInfo};

/// Plugin that records exchanges.
#[derive(Debug, Clone)]
pub struct CapturePlugin {
    store: Database,
    content_dir: Option<PathBuf>,
}

impl CapturePlugin {
    /// Records metadata only.
    pub fn new(store: Database) -> Self {
        Self {
            store,
            content_dir: None,
        }
    }

    /// Also stores response bodies under `dir`.
    pub fn with_content_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.content_dir = Some(dir.into());
        self
    }

    fn write_content(&self, hash: &str, body: &[u8]) -> Option<PathBuf> {
        let dir = self.content_dir.as_ref()?;
        if body.is_empty() {
            return None;
        }

        let path = dir.join(hash);
        if path.exists() {
            return Some(path);
        }

        let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, body));
        match written {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!("Failed to write capture content {:?}: {}", path, e);
                None
            }
        }
    }
}

impl ProxyPlugin for CapturePlugin {
    fn name(&self) -> &str {
        "capture"
    }

    fn on_response(&self, response: &ResponseInfo) {
        let request = &response.request;
        let (hash, content_path) = if response.is_truncated() {
            (None, None)
        } else {
            let hash = hash_body(&response.body);
            let path = self.write_content(&hash, &response.body);
            (Some(hash), path)
        };

        let capture = NewCapture {
            method: request.method.clone(),
            url: request.uri.clone(),
            host: request.host.clone(),
            status: Some(response.status),
            request_size: i64::try_from(request.body_len).unwrap_or(i64::MAX),
            response_size: i64::try_from(response.body_len).unwrap_or(i64::MAX),
            body_hash: hash,
            content_path,
            client_uid: request.client.map(|c| c.uid),
        };

        match self.store.record_capture(capture) {
            Ok(id) => tracing::info!(
                "#{} {} {} -> {} ({} bytes)",
                id,
                request.method,
                request.uri,
                response.status,
                response.body_len
            ),
            Err(e) => tracing::warn!("Failed to record capture of {}: {}", request.uri, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ClientInfo;
    use crate::service::RequestInfo;
    use hyper::body::Bytes;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    fn exchange(body: &'static [u8]) -> ResponseInfo {
        ResponseInfo {
            request: RequestInfo {
                method: "GET".to_string(),
                uri: "http://example.com/index.html".to_string(),
                host: Some("example.com".to_string()),
                body_len: 0,
                peer: SocketAddr::from(([127, 0, 0, 1], 40000)),
                client: Some(ClientInfo { uid: 10042 }),
            },
            status: 200,
            body: Bytes::from_static(body),
            body_len: body.len() as u64,
        }
    }

    #[test]
    fn records_metadata() {
        let db = Database::in_memory().unwrap();
        let plugin = CapturePlugin::new(db.clone());
        assert_eq!(plugin.name(), "capture");

        plugin.on_response(&exchange(b"hello"));

        let captures = db.recent_captures(10, 0).unwrap();
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].status, Some(200));
        assert_eq!(captures[0].response_size, 5);
        assert_eq!(captures[0].client_uid, Some(10042));
        assert_eq!(captures[0].body_hash.as_deref(), Some(hash_body(b"hello").as_str()));
        assert!(captures[0].content_path.is_none());
    }

    #[test]
    fn writes_content_files() {
        let dir = TempDir::new().unwrap();
        let content_dir = dir.path().join("content");
        let db = Database::in_memory().unwrap();
        let plugin = CapturePlugin::new(db.clone()).with_content_dir(&content_dir);

        plugin.on_response(&exchange(b"payload"));
        plugin.on_response(&exchange(b"payload"));

        let paths = db.capture_content_paths().unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"payload");
        assert_eq!(db.count_captures().unwrap(), 2);
    }

    #[test]
    fn empty_body_has_no_content_file() {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().unwrap();
        let plugin = CapturePlugin::new(db.clone()).with_content_dir(dir.path());

        plugin.on_response(&exchange(b""));

        assert!(db.capture_content_paths().unwrap().is_empty());
        assert_eq!(db.count_captures().unwrap(), 1);
    }

    #[test]
    fn unbuffered_body_records_size_only() {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().unwrap();
        let plugin = CapturePlugin::new(db.clone()).with_content_dir(dir.path());

        let mut response = exchange(b"");
        response.body_len = 64 * 1024 * 1024;
        assert!(response.is_truncated());
        plugin.on_response(&response);

        let captures = db.recent_captures(10, 0).unwrap();
        assert_eq!(captures[0].response_size, 64 * 1024 * 1024);
        assert!(captures[0].body_hash.is_none());
        assert!(captures[0].content_path.is_none());
        assert!(db.capture_content_paths().unwrap().is_empty());
    }
}
