//! Deletion of captured data.
//!
//! Removes every capture row, the content files they reference and the
//! content directory itself. Settings and sessions are left alone.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Serialize;
use warden_storage::{Database, Result};

/// What a purge removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Capture rows deleted.
    pub captures: usize,
    /// Content files deleted.
    pub files: usize,
    /// Files or directories that could not be removed.
    pub errors: Vec<String>,
}

impl PurgeReport {
    /// Returns true if nothing failed.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Deletes all captures in `store` and the files under `content_dir`.
///
/// File removal is best effort; failures are collected in the report.
pub fn delete_captured_data(store: &Database, content_dir: &Path) -> Result<PurgeReport> {
    let paths = store.capture_content_paths()?;
    let mut report = PurgeReport {
        captures: store.clear_captures()?,
        ..PurgeReport::default()
    };

    for path in &paths {
        match fs::remove_file(path) {
            Ok(()) => report.files += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => report
                .errors
                .push(format!("Failed to delete {}: {}", path.display(), e)),
        }
    }

    if content_dir.exists() {
        if let Err(e) = fs::remove_dir_all(content_dir) {
            report.errors.push(format!(
                "Failed to delete content directory {}: {}",
                content_dir.display(),
                e
            ));
        }
    }

    tracing::info!(
        "Deleted {} captures and {} content files",
        report.captures,
        report.files
    );
    for error in &report.errors {
        tracing::warn!("{}", error);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use warden_storage::NewCapture;

    fn capture(content_path: Option<std::path::PathBuf>) -> NewCapture {
        NewCapture {
            method: "GET".to_string(),
            url: "http://example.com/".to_string(),
            status: Some(200),
            content_path,
            ..NewCapture::default()
        }
    }

    #[test]
    fn removes_rows_files_and_directory() {
        let dir = TempDir::new().unwrap();
        let content_dir = dir.path().join("content");
        fs::create_dir_all(&content_dir).unwrap();
        let body = content_dir.join("abc123");
        fs::write(&body, b"payload").unwrap();

        let store = Database::in_memory().unwrap();
        store.record_capture(capture(Some(body.clone()))).unwrap();
        store.record_capture(capture(Some(body.clone()))).unwrap();
        store.record_capture(capture(None)).unwrap();

        let report = delete_captured_data(&store, &content_dir).unwrap();

        assert_eq!(report.captures, 3);
        assert_eq!(report.files, 1);
        assert!(report.is_complete());
        assert_eq!(store.count_captures().unwrap(), 0);
        assert!(!content_dir.exists());
    }

    #[test]
    fn missing_files_are_not_errors() {
        let dir = TempDir::new().unwrap();
        let store = Database::in_memory().unwrap();
        store
            .record_capture(capture(Some(dir.path().join("gone"))))
            .unwrap();

        let report = delete_captured_data(&store, &dir.path().join("content")).unwrap();

        assert_eq!(report.captures, 1);
        assert_eq!(report.files, 0);
        assert!(report.is_complete());
    }

    #[test]
    fn settings_survive_purge() {
        let dir = TempDir::new().unwrap();
        let store = Database::in_memory().unwrap();
        store
            .set_config("proxy_port", &serde_json::json!(8080))
            .unwrap();

        delete_captured_data(&store, dir.path()).unwrap();

        assert!(store.get_config("proxy_port").unwrap().is_some());
    }
}
