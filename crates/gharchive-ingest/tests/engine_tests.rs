//! Ingestion engine tests
//!
//! Drives the engine against a wiremock archive server and the in-memory
//! stores, covering:
//! 1. Fallback routing of unparseable and rejected lines
//! 2. All-or-nothing rollback on unit-fatal failures
//! 3. Ledger-based idempotency, unit claims and the orphan sweep
//! 4. Cache reuse and cleanup of truncated or failed downloads

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use gharchive_ingest::archive::ArchiveSource;
use gharchive_ingest::config::{ArchiveConfig, EngineConfig};
use gharchive_ingest::drivers;
use gharchive_ingest::error::StoreError;
use gharchive_ingest::store::memory::{Fault, MemoryFallbackStore, MemoryLedger, MemoryPrimaryStore};
use gharchive_ingest::store::{Ledger, UnitClaim};
use gharchive_ingest::{Ingestor, Outcome, Unit};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const THREE_LINES: &[u8] = b"{\"id\":1}\n{\"id\":\n{\"id\":3}\n";

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gharchive_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn gzip(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

fn unit() -> Unit {
    Unit::parse("2015-01-01", 15).unwrap()
}

fn archive_path(unit: &Unit) -> String {
    format!("/{}", unit.file_name())
}

struct Harness {
    cache_dir: TempDir,
    server: MockServer,
    primary: MemoryPrimaryStore,
    fallback: MemoryFallbackStore,
    ledger: MemoryLedger,
    ingestor: Ingestor,
}

impl Harness {
    async fn new() -> Self {
        Self::with_primary(MemoryPrimaryStore::new(), EngineConfig::default()).await
    }

    async fn with_primary(primary: MemoryPrimaryStore, engine: EngineConfig) -> Self {
        init_tracing();
        let cache_dir = TempDir::new().unwrap();
        let server = MockServer::start().await;
        let fallback = MemoryFallbackStore::new();
        let ledger = MemoryLedger::new();
        let ingestor = build_ingestor(
            &server,
            &cache_dir,
            &primary,
            &fallback,
            Arc::new(ledger.clone()),
            engine,
        );

        Self {
            cache_dir,
            server,
            primary,
            fallback,
            ledger,
            ingestor,
        }
    }

    async fn serve(&self, unit: &Unit, body: Vec<u8>, expected_requests: u64) {
        Mock::given(method("GET"))
            .and(path(archive_path(unit)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .expect(expected_requests)
            .mount(&self.server)
            .await;
    }

    fn cached(&self, unit: &Unit) -> bool {
        self.ingestor.source().cache().exists(unit)
    }
}

fn build_ingestor(
    server: &MockServer,
    cache_dir: &TempDir,
    primary: &MemoryPrimaryStore,
    fallback: &MemoryFallbackStore,
    ledger: Arc<dyn Ledger>,
    engine: EngineConfig,
) -> Ingestor {
    let archive = ArchiveConfig {
        base_url: format!("{}/", server.uri()),
        cache_dir: cache_dir.path().to_path_buf(),
        max_retries: 2,
        ..ArchiveConfig::default()
    };
    let source = ArchiveSource::new(&archive)
        .unwrap()
        .with_backoff_base(Duration::from_millis(1));

    Ingestor::new(
        source,
        Arc::new(primary.clone()),
        Arc::new(fallback.clone()),
        ledger,
        engine,
    )
}

/// Ledger whose commit stalls until the test lets it through
struct GatedLedger {
    inner: MemoryLedger,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Ledger for GatedLedger {
    async fn has(&self, unit: &Unit) -> Result<bool, StoreError> {
        self.inner.has(unit).await
    }

    async fn claim(&self, unit: &Unit) -> Result<Option<UnitClaim>, StoreError> {
        self.inner.claim(unit).await
    }

    async fn commit(&self, unit: &Unit) -> Result<bool, StoreError> {
        self.reached.notify_one();
        self.release.notified().await;
        self.inner.commit(unit).await
    }
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test]
async fn test_mixed_stream_passes_with_fallback_entry() {
    let h = Harness::new().await;
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    let report = h.ingestor.ingest(&unit).await;

    assert_eq!(report.outcome, Outcome::Pass);
    assert_eq!((report.lines, report.primary, report.fallback), (3, 2, 1));
    assert_eq!(
        h.primary.records("2015-01-01"),
        vec![serde_json::json!({"id": 1}), serde_json::json!({"id": 3})]
    );
    assert_eq!(h.fallback.blobs_for(&unit), vec![b"{\"id\":\n".to_vec()]);
    assert_eq!(h.fallback.index_count(), 1);
    assert_eq!(h.ledger.keys(), vec!["2015-01-01-15".to_string()]);
    assert!(h.cached(&unit));
}

#[tokio::test]
async fn test_unacknowledged_insert_rolls_back_everything() {
    let primary = MemoryPrimaryStore::new();
    primary.fail_when(|record| record["id"] == 3, Fault::Unacknowledged);
    let h = Harness::with_primary(primary, EngineConfig::default()).await;
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    let outcome = h.ingestor.ingest_unit(unit.date(), unit.hour()).await;

    assert_eq!(outcome, Outcome::Fail);
    assert_eq!(h.primary.count(), 0);
    assert_eq!(h.fallback.blob_count(), 0);
    assert_eq!(h.fallback.index_count(), 0);
    assert!(h.ledger.keys().is_empty());
    // the archive itself was fine, so it stays cached for the retry
    assert!(h.cached(&unit));
}

#[tokio::test]
async fn test_other_store_error_aborts_remaining_lines() {
    let primary = MemoryPrimaryStore::new();
    primary.fail_when(|record| record["id"] == 2, Fault::Other);
    let h = Harness::with_primary(primary, EngineConfig::default()).await;
    let unit = unit();
    h.serve(&unit, gzip(b"{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n{\"id\":4}\n"), 1)
        .await;

    let report = h.ingestor.ingest(&unit).await;

    assert_eq!(report.outcome, Outcome::Fail);
    assert_eq!(report.lines, 2);
    assert_eq!(h.primary.count(), 0);
    // one insert plus its rollback delete
    assert_eq!(h.primary.mutations(), 2);
}

// ============================================================================
// Fallback routing
// ============================================================================

#[tokio::test]
async fn test_too_large_record_is_stored_verbatim_in_fallback() {
    let primary = MemoryPrimaryStore::new().with_max_document_bytes(64);
    let h = Harness::with_primary(primary, EngineConfig::default()).await;
    let unit = unit();

    let big_line = format!("{{\"id\": 2, \"body\": \"{}\"}}\n", "x".repeat(200));
    let mut payload = b"{\"id\":1}\n".to_vec();
    payload.extend_from_slice(big_line.as_bytes());
    h.serve(&unit, gzip(&payload), 1).await;

    let report = h.ingestor.ingest(&unit).await;

    assert_eq!(report.outcome, Outcome::Pass);
    assert_eq!(h.primary.records("2015-01-01"), vec![serde_json::json!({"id": 1})]);
    // byte-identical, including the original spacing and terminator
    assert_eq!(h.fallback.blobs_for(&unit), vec![big_line.into_bytes()]);
}

#[tokio::test]
async fn test_write_rejected_record_goes_to_fallback() {
    let primary = MemoryPrimaryStore::new();
    primary.fail_when(|record| record["id"] == 1, Fault::WriteRejected);
    let h = Harness::with_primary(primary, EngineConfig::default()).await;
    let unit = unit();
    h.serve(&unit, gzip(b"{\"id\":1}\n{\"id\":2}"), 1).await;

    let report = h.ingestor.ingest(&unit).await;

    assert_eq!(report.outcome, Outcome::Pass);
    assert_eq!(h.primary.records("2015-01-01"), vec![serde_json::json!({"id": 2})]);
    assert_eq!(h.fallback.blobs_for(&unit), vec![b"{\"id\":1}\n".to_vec()]);
}

#[tokio::test]
async fn test_fallback_index_failure_writes_no_blob() {
    let h = Harness::new().await;
    h.fallback.fail_indexing(true);
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    let outcome = h.ingestor.ingest_unit(unit.date(), unit.hour()).await;

    assert_eq!(outcome, Outcome::Fail);
    assert_eq!(h.fallback.puts(), 0);
    assert_eq!(h.fallback.blob_count(), 0);
    assert_eq!(h.primary.count(), 0);
    assert!(h.ledger.keys().is_empty());
}

#[tokio::test]
async fn test_fallback_put_failure_fails_unit() {
    let h = Harness::new().await;
    h.fallback.fail_puts(true);
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    let report = h.ingestor.ingest(&unit).await;

    assert_eq!(report.outcome, Outcome::Fail);
    assert_eq!(report.lines, 2);
    assert_eq!(h.primary.count(), 0);
    // the index row written ahead of the failed upload is rolled back too
    assert_eq!(h.fallback.index_count(), 0);
}

// ============================================================================
// Ledger and idempotency
// ============================================================================

#[tokio::test]
async fn test_ledgered_unit_is_skipped_without_mutations() {
    let h = Harness::new().await;
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 0).await;
    assert!(h.ledger.commit(&unit).await.unwrap());

    let report = h.ingestor.ingest(&unit).await;

    assert_eq!(report.outcome, Outcome::Pass);
    assert_eq!(report.lines, 0);
    assert_eq!(h.primary.mutations(), 0);
    assert_eq!(h.fallback.puts(), 0);
    assert!(!h.cached(&unit));
}

#[tokio::test]
async fn test_second_ingest_is_idempotent() {
    let h = Harness::new().await;
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    assert_eq!(h.ingestor.ingest(&unit).await.outcome, Outcome::Pass);
    let mutations = h.primary.mutations();

    assert_eq!(h.ingestor.ingest(&unit).await.outcome, Outcome::Pass);
    assert_eq!(h.primary.mutations(), mutations);
    assert_eq!(h.primary.count(), 2);
    assert_eq!(h.fallback.blob_count(), 1);
}

#[tokio::test]
async fn test_unacknowledged_commit_rolls_back() {
    let h = Harness::new().await;
    h.ledger.fail_commits(true);
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    let report = h.ingestor.ingest(&unit).await;

    assert_eq!(report.outcome, Outcome::Fail);
    assert_eq!(report.lines, 3);
    assert_eq!(h.primary.count(), 0);
    assert_eq!(h.fallback.blob_count(), 0);
    assert!(!h.ledger.contains(&unit));
}

#[tokio::test]
async fn test_ledger_lookup_failure_fails_before_fetch() {
    let h = Harness::new().await;
    h.ledger.fail_lookups(true);
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 0).await;

    assert_eq!(h.ingestor.ingest(&unit).await.outcome, Outcome::Fail);
    assert_eq!(h.primary.mutations(), 0);
}

#[tokio::test]
async fn test_orphans_of_failed_rollback_are_swept() {
    let h = Harness::new().await;
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    // first attempt: commit refused and the primary deletes are lost
    h.ledger.fail_commits(true);
    h.primary.fail_deletes(true);
    assert_eq!(h.ingestor.ingest(&unit).await.outcome, Outcome::Fail);
    assert_eq!(h.primary.count(), 2);

    h.ledger.fail_commits(false);
    h.primary.fail_deletes(false);
    assert_eq!(h.ingestor.ingest(&unit).await.outcome, Outcome::Pass);

    assert_eq!(
        h.primary.records("2015-01-01"),
        vec![serde_json::json!({"id": 1}), serde_json::json!({"id": 3})]
    );
    assert_eq!(h.fallback.blob_count(), 1);
    assert!(h.ledger.contains(&unit));
}

#[tokio::test]
async fn test_sweep_leaves_other_hours_alone() {
    let h = Harness::new().await;
    let other = Unit::parse("2015-01-01", 14).unwrap();
    let unit = unit();
    h.serve(&other, gzip(b"{\"id\":14}\n"), 1).await;
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    assert_eq!(h.ingestor.ingest(&other).await.outcome, Outcome::Pass);
    assert_eq!(h.ingestor.ingest(&unit).await.outcome, Outcome::Pass);

    assert_eq!(h.primary.records("2015-01-01").len(), 3);
}

#[tokio::test]
async fn test_concurrent_attempt_cannot_sweep_a_live_unit() {
    let h = Harness::new().await;
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    let reached = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gated = GatedLedger {
        inner: h.ledger.clone(),
        reached: Arc::clone(&reached),
        release: Arc::clone(&release),
    };
    let first = Arc::new(build_ingestor(
        &h.server,
        &h.cache_dir,
        &h.primary,
        &h.fallback,
        Arc::new(gated),
        EngineConfig::default(),
    ));

    let running = {
        let first = Arc::clone(&first);
        tokio::spawn(async move { first.ingest(&unit).await })
    };
    // first attempt has drained every line and waits on its commit
    reached.notified().await;
    assert!(h.ledger.is_claimed(&unit));

    let second = h.ingestor.ingest(&unit).await;
    assert_eq!(second.outcome, Outcome::Fail);
    assert_eq!(second.lines, 0);
    assert_eq!(h.primary.count(), 2);
    assert_eq!(h.fallback.blob_count(), 1);

    release.notify_one();
    let first_report = running.await.unwrap();

    assert_eq!(first_report.outcome, Outcome::Pass);
    assert!(h.ledger.contains(&unit));
    assert!(!h.ledger.is_claimed(&unit));
    assert_eq!(
        h.primary.records("2015-01-01"),
        vec![serde_json::json!({"id": 1}), serde_json::json!({"id": 3})]
    );
    assert_eq!(h.fallback.blobs_for(&unit), vec![b"{\"id\":\n".to_vec()]);

    // once the claim is gone a retry sees the ledger entry
    let mutations = h.primary.mutations();
    assert_eq!(h.ingestor.ingest(&unit).await.outcome, Outcome::Pass);
    assert_eq!(h.primary.mutations(), mutations);
}

#[tokio::test]
async fn test_claim_is_released_after_failed_attempt() {
    let primary = MemoryPrimaryStore::new();
    primary.fail_when(|record| record["id"] == 3, Fault::Other);
    let h = Harness::with_primary(primary, EngineConfig::default()).await;
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    assert_eq!(h.ingestor.ingest(&unit).await.outcome, Outcome::Fail);
    assert!(!h.ledger.is_claimed(&unit));
}

// ============================================================================
// Store timeouts
// ============================================================================

#[tokio::test]
async fn test_hung_insert_times_out_and_rolls_back() {
    let primary = MemoryPrimaryStore::new();
    primary.fail_when(|record| record["id"] == 3, Fault::Hang);
    let engine = EngineConfig {
        store_timeout_secs: 1,
        ..EngineConfig::default()
    };
    let h = Harness::with_primary(primary, engine).await;
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    let report = h.ingestor.ingest(&unit).await;

    assert_eq!(report.outcome, Outcome::Fail);
    assert_eq!(h.primary.count(), 0);
    assert_eq!(h.fallback.blob_count(), 0);
}

#[tokio::test]
async fn test_hung_fallback_upload_is_still_rolled_back() {
    let engine = EngineConfig {
        store_timeout_secs: 1,
        ..EngineConfig::default()
    };
    let h = Harness::with_primary(MemoryPrimaryStore::new(), engine).await;
    // the bytes land but the upload never reports back
    h.fallback.hang_puts(true);
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    let report = h.ingestor.ingest(&unit).await;

    assert_eq!(report.outcome, Outcome::Fail);
    assert_eq!(report.fallback, 1);
    assert_eq!(h.fallback.blob_count(), 0);
    assert_eq!(h.fallback.index_count(), 0);
    assert_eq!(h.primary.count(), 0);
}

// ============================================================================
// Sourcing
// ============================================================================

#[tokio::test]
async fn test_cached_archive_is_not_fetched_again() {
    let h = Harness::new().await;
    let unit = unit();
    h.serve(&unit, gzip(THREE_LINES), 1).await;

    assert_eq!(h.ingestor.ingest(&unit).await.outcome, Outcome::Pass);
    assert!(h.cached(&unit));

    // fresh stores, same cache: the unit is re-ingested from disk
    let primary = MemoryPrimaryStore::new();
    let ingestor = build_ingestor(
        &h.server,
        &h.cache_dir,
        &primary,
        &MemoryFallbackStore::new(),
        Arc::new(MemoryLedger::new()),
        EngineConfig::default(),
    );
    assert_eq!(ingestor.ingest(&unit).await.outcome, Outcome::Pass);
    assert_eq!(primary.count(), 2);
}

#[tokio::test]
async fn test_truncated_archive_purges_cache_and_rolls_back() {
    let h = Harness::new().await;
    let unit = unit();
    let payload: Vec<u8> = (0..5000)
        .flat_map(|i| format!("{{\"id\":{},\"pad\":\"{}\"}}\n", i, "y".repeat(i % 41)).into_bytes())
        .collect();
    let compressed = gzip(&payload);
    h.serve(&unit, compressed[..compressed.len() / 2].to_vec(), 1)
        .await;

    let report = h.ingestor.ingest(&unit).await;

    assert_eq!(report.outcome, Outcome::Fail);
    assert!(report.primary > 0);
    assert!(!h.cached(&unit));
    assert_eq!(h.primary.count(), 0);
    assert!(h.ledger.keys().is_empty());
}

#[tokio::test]
async fn test_missing_hour_fails_without_cache_file() {
    let h = Harness::new().await;
    let unit = unit();
    Mock::given(method("GET"))
        .and(path(archive_path(&unit)))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&h.server)
        .await;

    let outcome = h.ingestor.ingest_unit(unit.date(), unit.hour()).await;

    assert_eq!(outcome, Outcome::Fail);
    let cache = h.ingestor.source().cache();
    assert!(!cache.path(&unit).exists());
    assert!(!cache.partial_path(&unit).exists());
    assert_eq!(h.primary.mutations(), 0);
}

#[tokio::test]
async fn test_server_errors_are_retried_then_fail() {
    let h = Harness::new().await;
    let unit = unit();
    Mock::given(method("GET"))
        .and(path(archive_path(&unit)))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&h.server)
        .await;

    assert_eq!(h.ingestor.ingest(&unit).await.outcome, Outcome::Fail);
    assert!(!h.ingestor.source().cache().partial_path(&unit).exists());
    assert!(!h.cached(&unit));
}

#[tokio::test]
async fn test_invalid_hour_fails() {
    let h = Harness::new().await;
    let date = unit().date();

    assert_eq!(h.ingestor.ingest_unit(date, 24).await, Outcome::Fail);
    assert_eq!(h.primary.mutations(), 0);
}

// ============================================================================
// Drivers
// ============================================================================

#[tokio::test]
async fn test_day_driver_emits_one_line_per_hour() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/2015-01-02-([0-9]|1[0-9]|2[0-2])\.json\.gz$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(gzip(b"{\"id\":1}\n")))
        .expect(23)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/2015-01-02-23.json.gz"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h.server)
        .await;

    let date = chrono::NaiveDate::from_ymd_opt(2015, 1, 2).unwrap();
    let mut out = Vec::new();
    let reports = drivers::ingest_day(&h.ingestor, date, &mut out).await.unwrap();

    let lines: Vec<String> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(reports.len(), 24);
    assert_eq!(lines.len(), 24);
    assert_eq!(lines[0], "pass,2015-01-02,0");
    assert_eq!(lines[22], "pass,2015-01-02,22");
    assert_eq!(lines[23], "fail,2015-01-02,23");
    assert_eq!(h.ledger.keys().len(), 23);
    assert_eq!(h.primary.records("2015-01-02").len(), 23);
}
