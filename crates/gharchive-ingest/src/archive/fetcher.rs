//! Remote archive downloader
//!
//! Streams `<base_url><date>-<hour>.json.gz` into the unit cache. The body is
//! written chunk by chunk to a `.part` file that is renamed into place only
//! once the last chunk is on disk; every failure path removes the staging
//! file so the cache never holds a partial payload.

use crate::archive::cache::{remove_if_present, UnitCache};
use crate::config::ArchiveConfig;
use crate::error::{FetchError, Result};
use crate::unit::Unit;
use futures::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

const USER_AGENT: &str = concat!("gharchive-ingest/", env!("CARGO_PKG_VERSION"));

/// Downloads unit payloads into a [`UnitCache`]
pub struct ArchiveFetcher {
    client: Client,
    config: ArchiveConfig,
    cache: UnitCache,
    backoff_base: Duration,
}

impl ArchiveFetcher {
    pub fn new(config: &ArchiveConfig, cache: UnitCache) -> Result<Self> {
        config.validate()?;

        // configured headers win over the default user agent
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(config.header_map()?)
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
            cache,
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Base delay of the exponential backoff between attempts
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Download a unit into the cache; `true` only when the whole body is on disk
    #[instrument(skip(self), fields(unit = %unit))]
    pub async fn fetch(&self, unit: &Unit) -> bool {
        let url = self.config.url_for(unit);

        match self.fetch_with_retry(unit, &url).await {
            Ok(bytes) => {
                info!(url = %url, bytes, "Archive downloaded");
                true
            },
            Err(FetchError::Status { url, status }) => {
                warn!(url = %url, status, "Archive server answered with an error status");
                false
            },
            Err(e) => {
                warn!(url = %url, error = %e, "Archive download failed");
                false
            },
        }
    }

    async fn fetch_with_retry(&self, unit: &Unit, url: &str) -> std::result::Result<u64, FetchError> {
        let mut attempt: u32 = 1;

        loop {
            match self.download_once(unit, url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.backoff_base * 2u32.saturating_pow(attempt);
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "Download attempt failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_once(&self, unit: &Unit, url: &str) -> std::result::Result<u64, FetchError> {
        let partial = self.cache.partial_path(unit);
        let target = self.cache.path(unit);

        let written = match self.stream_to(url, &partial).await {
            Ok(written) => written,
            Err(e) => {
                remove_if_present(&partial);
                return Err(e);
            },
        };

        if let Err(source) = tokio::fs::rename(&partial, &target).await {
            remove_if_present(&partial);
            return Err(FetchError::Write {
                path: target.display().to_string(),
                source,
            });
        }

        Ok(written)
    }

    async fn stream_to(&self, url: &str, partial: &Path) -> std::result::Result<u64, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let write = |source| FetchError::Write {
            path: partial.display().to_string(),
            source,
        };

        debug!(url = %url, "Requesting archive");
        let response = self.client.get(url).send().await.map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write)?;
        }
        let mut file = tokio::fs::File::create(partial).await.map_err(write)?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport)?;
            file.write_all(&chunk).await.map_err(write)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(write)?;
        file.sync_all().await.map_err(write)?;

        Ok(written)
    }
}
