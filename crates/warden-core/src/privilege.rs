//! Rooted-device detection.
//!
//! Decides whether to attempt the transparent-proxy rules at all. The check
//! looks for a `test-keys` build tag, the legacy Superuser package, or an
//! `su` binary in one of the usual locations. It never fails: unreadable
//! paths simply count as absent.

use std::path::{Path, PathBuf};

/// Directories commonly holding an `su` binary.
pub const SU_DIRECTORIES: &[&str] = &[
    "/sbin/",
    "/system/bin/",
    "/system/xbin/",
    "/data/local/xbin/",
    "/data/local/bin/",
    "/system/sd/xbin/",
    "/system/bin/failsafe/",
    "/data/local/",
];

/// Legacy superuser management package.
pub const SUPERUSER_APK: &str = "/system/app/Superuser.apk";

/// Property file carrying `ro.build.tags`.
pub const BUILD_PROP: &str = "/system/build.prop";

/// Build tag that marks a test-signed (and usually rooted) image.
const TEST_KEYS: &str = "test-keys";

/// Filesystem check for superuser access.
#[derive(Debug, Clone)]
pub struct RootDetector {
    /// Explicit build tags, overriding the property file.
    build_tags: Option<String>,
    /// Property file read when no explicit tags are given.
    build_prop: PathBuf,
    /// Marker files whose presence means rooted.
    markers: Vec<PathBuf>,
    /// Directories searched for `su`.
    su_dirs: Vec<PathBuf>,
}

impl Default for RootDetector {
    fn default() -> Self {
        Self {
            build_tags: None,
            build_prop: PathBuf::from(BUILD_PROP),
            markers: vec![PathBuf::from(SUPERUSER_APK)],
            su_dirs: SU_DIRECTORIES.iter().map(PathBuf::from).collect(),
        }
    }
}

impl RootDetector {
    /// Creates a detector over the standard locations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a detector that checks nothing; extend it with the builder methods.
    pub fn empty() -> Self {
        Self {
            build_tags: None,
            build_prop: PathBuf::new(),
            markers: Vec::new(),
            su_dirs: Vec::new(),
        }
    }

    /// Uses the given build tags instead of reading the property file.
    pub fn with_build_tags(mut self, tags: impl Into<String>) -> Self {
        self.build_tags = Some(tags.into());
        self
    }

    /// Reads build tags from a different property file.
    pub fn with_build_prop(mut self, path: impl Into<PathBuf>) -> Self {
        self.build_prop = path.into();
        self
    }

    /// Adds a marker file.
    pub fn with_marker(mut self, path: impl Into<PathBuf>) -> Self {
        self.markers.push(path.into());
        self
    }

    /// Adds a directory searched for `su`.
    pub fn with_su_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.su_dirs.push(dir.into());
        self
    }

    /// Returns true if the host looks rooted.
    pub fn is_rooted(&self) -> bool {
        if self.has_test_keys() {
            tracing::debug!("Build tags contain {}", TEST_KEYS);
            return true;
        }

        if let Some(marker) = self.markers.iter().find(|p| p.exists()) {
            tracing::debug!("Found superuser marker {:?}", marker);
            return true;
        }

        if let Some(dir) = self.su_dirs.iter().find(|d| d.join("su").exists()) {
            tracing::debug!("Found su in {:?}", dir);
            return true;
        }

        false
    }

    fn has_test_keys(&self) -> bool {
        match &self.build_tags {
            Some(tags) => tags.contains(TEST_KEYS),
            None => read_build_tags(&self.build_prop)
                .map(|tags| tags.contains(TEST_KEYS))
                .unwrap_or(false),
        }
    }
}

/// Extracts `ro.build.tags` from a property file.
fn read_build_tags(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "ro.build.tags").then(|| value.trim().to_string())
    })
}

/// Returns true if the host looks rooted, using the standard locations.
pub fn is_device_rooted() -> bool {
    RootDetector::new().is_rooted()
}
