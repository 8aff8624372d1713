//! Ingestion configuration
//!
//! Built once at startup and passed down by reference. Sources, lowest
//! precedence first:
//!
//! 1. `DEFAULT_*` constants below
//! 2. the archive token file (`{"url": "...", "headers": {...}}`)
//! 3. environment variables (a local `.env` is loaded through `dotenvy`)
//! 4. command line overrides applied by the binary

use crate::error::{IngestError, Result};
use crate::unit::Unit;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Public GH Archive endpoint; file names are appended verbatim.
pub const DEFAULT_ARCHIVE_BASE_URL: &str = "https://data.gharchive.org/";

/// Default root of the local `.json.gz` cache.
pub const DEFAULT_CACHE_DIR: &str = "./gh_archive";

/// Default archive token file looked up by the binary.
pub const DEFAULT_ARCHIVE_TOKEN_PATH: &str = "gh_archive_token.json";

/// Per-request timeout for archive downloads, in seconds.
pub const DEFAULT_ARCHIVE_TIMEOUT_SECS: u64 = 300;

/// Connect timeout for archive downloads, in seconds.
pub const DEFAULT_ARCHIVE_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Download attempts per unit before giving up.
pub const DEFAULT_ARCHIVE_MAX_RETRIES: u32 = 3;

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/gharchive";

pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_S3_REGION: &str = "us-east-1";

pub const DEFAULT_S3_BUCKET: &str = "gharchive-fallback";

/// Upper bound for any single store operation, in seconds.
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 60;

/// Largest record accepted by the primary store (16 MiB document ceiling).
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Complete ingestion configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    pub archive: ArchiveConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
}

/// Remote archive and local cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Prefix of every archive URL, usually ending in `/`
    pub base_url: String,

    /// Opaque headers attached to every request (user agent, credentials)
    pub headers: BTreeMap<String, String>,

    pub cache_dir: PathBuf,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_retries: u32,
}

/// PostgreSQL connection settings for the ledger, primary and index tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    /// Overrides the user embedded in `url`
    pub user: Option<String>,

    /// Overrides the password embedded in `url`
    #[serde(skip_serializing)]
    pub password: Option<String>,

    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// S3-compatible object storage for fallback blobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub path_style: bool,
}

/// Engine behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub store_timeout_secs: u64,
    pub max_document_bytes: usize,

    /// Purge leftovers of earlier failed attempts before re-ingesting a unit
    pub reconcile_orphans: bool,
}

/// On-disk archive token, `gh_archive_token.json`
#[derive(Debug, Default, Deserialize)]
struct ArchiveToken {
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

// ============================================================================
// Defaults
// ============================================================================

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ARCHIVE_BASE_URL.to_string(),
            headers: BTreeMap::new(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            timeout_secs: DEFAULT_ARCHIVE_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_ARCHIVE_CONNECT_TIMEOUT_SECS,
            max_retries: DEFAULT_ARCHIVE_MAX_RETRIES,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            user: None,
            password: None,
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_S3_REGION.to_string(),
            bucket: DEFAULT_S3_BUCKET.to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout_secs: DEFAULT_STORE_TIMEOUT_SECS,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            reconcile_orphans: true,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl IngestConfig {
    /// Load configuration from defaults, the optional token file and the environment
    pub fn load(token_path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        if let Some(path) = token_path {
            config.apply_token_file(path)?;
        }
        config.apply_vars(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Merge the archive token file; a missing file leaves the config untouched
    pub fn apply_token_file(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No archive token file, using defaults");
            return Ok(());
        }

        let content = std::fs::read_to_string(path)?;
        let token: ArchiveToken = serde_json::from_str(&content).map_err(|e| {
            IngestError::config(format!("invalid token file {}: {}", path.display(), e))
        })?;

        if let Some(url) = token.url {
            self.archive.base_url = url;
        }
        self.archive.headers.extend(token.headers);

        Ok(())
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_vars<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("ARCHIVE_BASE_URL") {
            self.archive.base_url = url;
        }
        if let Some(dir) = var("ARCHIVE_CACHE_DIR") {
            self.archive.cache_dir = PathBuf::from(dir);
        }
        set_parsed(&mut self.archive.timeout_secs, var("ARCHIVE_TIMEOUT_SECS"));
        set_parsed(&mut self.archive.max_retries, var("ARCHIVE_MAX_RETRIES"));

        if let Some(url) = var("DATABASE_URL") {
            self.database.url = url;
        }
        set_parsed(&mut self.database.max_connections, var("DATABASE_MAX_CONNECTIONS"));
        set_parsed(&mut self.database.connect_timeout_secs, var("DATABASE_CONNECT_TIMEOUT"));

        if let Some(endpoint) = var("S3_ENDPOINT") {
            self.storage.endpoint = Some(endpoint);
        }
        if let Some(region) = var("S3_REGION") {
            self.storage.region = region;
        }
        if let Some(bucket) = var("S3_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Some(key) = var("S3_ACCESS_KEY").or_else(|| var("AWS_ACCESS_KEY_ID")) {
            self.storage.access_key = key;
        }
        if let Some(secret) = var("S3_SECRET_KEY").or_else(|| var("AWS_SECRET_ACCESS_KEY")) {
            self.storage.secret_key = secret;
        }
        set_parsed(&mut self.storage.path_style, var("S3_PATH_STYLE"));

        set_parsed(&mut self.engine.store_timeout_secs, var("STORE_TIMEOUT_SECS"));
        set_parsed(&mut self.engine.max_document_bytes, var("MAX_DOCUMENT_BYTES"));
        set_parsed(&mut self.engine.reconcile_orphans, var("RECONCILE_ORPHANS"));
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.archive.validate()?;

        if self.database.url.is_empty() {
            return Err(IngestError::config("database url cannot be empty"));
        }
        // one session stays pinned by the unit claim for a whole attempt
        if self.database.max_connections < 2 {
            return Err(IngestError::config("database max connections must be at least 2"));
        }
        if self.storage.bucket.is_empty() {
            return Err(IngestError::config("storage bucket cannot be empty"));
        }
        if self.engine.store_timeout_secs == 0 {
            return Err(IngestError::config("store timeout must be positive"));
        }
        if self.engine.max_document_bytes == 0 {
            return Err(IngestError::config("max document size must be positive"));
        }

        Ok(())
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, raw: Option<String>) {
    if let Some(value) = raw.and_then(|s| s.trim().parse().ok()) {
        *slot = value;
    }
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(IngestError::config(format!(
                "archive base url must be http(s), got '{}'",
                self.base_url
            )));
        }
        if self.timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(IngestError::config("archive timeouts must be positive"));
        }
        if self.max_retries == 0 {
            return Err(IngestError::config("archive max retries must be at least 1"));
        }
        self.header_map()?;
        Ok(())
    }

    /// Remote location of a unit's payload
    pub fn url_for(&self, unit: &Unit) -> String {
        format!("{}{}", self.base_url, unit.file_name())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Typed header set, rejecting names or values HTTP cannot carry
    pub fn header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| IngestError::config(format!("invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| IngestError::config(format!("invalid value for header {}: {}", name, e)))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

impl EngineConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

impl StorageConfig {
    /// Local MinIO defaults, used by tests and docker-compose setups
    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            bucket: bucket.into(),
            path_style: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.max_document_bytes, 16 * 1024 * 1024);
        assert!(config.engine.reconcile_orphans);
    }

    #[test]
    fn test_url_for_unit() {
        let archive = ArchiveConfig::default();
        let unit = Unit::parse("2015-01-01", 15).unwrap();
        assert_eq!(
            archive.url_for(&unit),
            "https://data.gharchive.org/2015-01-01-15.json.gz"
        );
    }

    #[test]
    fn test_token_file_then_vars() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"url": "http://mirror.test/archive/", "headers": {{"User-Agent": "gharchive-test"}}}}"#
        )
        .unwrap();

        let mut config = IngestConfig::default();
        config.apply_token_file(file.path()).unwrap();
        assert_eq!(config.archive.base_url, "http://mirror.test/archive/");
        assert_eq!(config.archive.headers["User-Agent"], "gharchive-test");

        config.apply_vars(vars(&[
            ("ARCHIVE_BASE_URL", "http://override.test/"),
            ("ARCHIVE_MAX_RETRIES", "5"),
            ("STORE_TIMEOUT_SECS", "not-a-number"),
            ("RECONCILE_ORPHANS", "false"),
            ("S3_BUCKET", "spill"),
        ]));
        assert_eq!(config.archive.base_url, "http://override.test/");
        assert_eq!(config.archive.max_retries, 5);
        assert_eq!(config.engine.store_timeout_secs, DEFAULT_STORE_TIMEOUT_SECS);
        assert!(!config.engine.reconcile_orphans);
        assert_eq!(config.storage.bucket, "spill");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_token_file_is_ignored() {
        let mut config = IngestConfig::default();
        config
            .apply_token_file(Path::new("/nonexistent/gh_archive_token.json"))
            .unwrap();
        assert_eq!(config.archive.base_url, DEFAULT_ARCHIVE_BASE_URL);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = IngestConfig::default();
        config.archive.base_url = "ftp://data.gharchive.org/".to_string();
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.archive.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config
            .archive
            .headers
            .insert("Bad Header".to_string(), "x".to_string());
        assert!(matches!(config.validate(), Err(IngestError::Config(_))));

        let mut config = IngestConfig::default();
        config.engine.max_document_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.database.max_connections = 1;
        assert!(config.validate().is_err());
    }
}
