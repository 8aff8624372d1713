//! Archive sourcing: local cache, remote fetch and decompression
//!
//! - **cache**: deterministic on-disk location of each unit's payload
//! - **fetcher**: streaming HTTP download into the cache, with retries
//! - **lines**: lazy line reader over the gzip payload, run on the blocking pool

pub mod cache;
pub mod fetcher;
pub mod lines;

pub use cache::UnitCache;
pub use fetcher::ArchiveFetcher;
pub use lines::{LineSource, LineStream};

use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::unit::Unit;
use std::time::Duration;
use tracing::{debug, warn};

/// Resolves a unit to a [`LineSource`], fetching it when it is not cached
pub struct ArchiveSource {
    cache: UnitCache,
    fetcher: ArchiveFetcher,
}

impl ArchiveSource {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let cache = UnitCache::new(&config.cache_dir);
        let fetcher = ArchiveFetcher::new(config, cache.clone())?;
        Ok(Self { cache, fetcher })
    }

    /// Shorten the retry backoff, for tests against local mock servers
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.fetcher = self.fetcher.with_backoff_base(base);
        self
    }

    pub fn cache(&self) -> &UnitCache {
        &self.cache
    }

    /// Open the unit's payload, downloading it first if needed
    ///
    /// `None` when the unit is neither cached nor fetchable.
    pub async fn open(&self, unit: &Unit) -> Option<LineSource> {
        if self.cache.exists(unit) {
            debug!(unit = %unit, "Using cached archive");
        } else if !self.fetcher.fetch(unit).await {
            return None;
        }

        let path = self.cache.path(unit);
        match LineSource::open(&path) {
            Ok(source) => Some(source),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open cached archive");
                None
            },
        }
    }
}
