//! Local cache of compressed hourly archives
//!
//! Layout: `<root>/<date>/<date>-<hour>.json.gz`. Only the cache and the
//! fetcher write below `root`.

use crate::unit::Unit;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct UnitCache {
    root: PathBuf,
}

impl UnitCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, unit: &Unit) -> PathBuf {
        self.root.join(unit.date_str())
    }

    pub fn path(&self, unit: &Unit) -> PathBuf {
        self.dir(unit).join(unit.file_name())
    }

    /// Staging path used while a download is in flight
    pub fn partial_path(&self, unit: &Unit) -> PathBuf {
        self.dir(unit).join(format!("{}.part", unit.file_name()))
    }

    /// Whether a complete payload is cached; I/O errors count as absent
    pub fn exists(&self, unit: &Unit) -> bool {
        match std::fs::metadata(self.path(unit)) {
            Ok(meta) => meta.is_file(),
            Err(_) => false,
        }
    }

    /// Drop the cached payload; a missing file is not an error
    pub fn evict(&self, unit: &Unit) {
        remove_if_present(&self.path(unit));
    }
}

/// Best-effort removal used on every failure path that may leave a file behind
pub(crate) fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed cached file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cached file"),
    }
}
