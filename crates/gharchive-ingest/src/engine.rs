//! Per-unit ingestion engine
//!
//! One call ingests one hour unit all-or-nothing:
//!
//! 1. claim the unit, failing fast when another attempt holds it
//! 2. skip the unit when the ledger already has it
//! 3. resolve the archive through the cache or a fresh download
//! 4. sweep leftovers of earlier failed attempts
//! 5. drain every line into the primary store, diverting unparseable or
//!    rejected lines verbatim to the fallback store
//! 6. commit the ledger entry, or roll back every write of this attempt
//!
//! The claim is held until the commit or the rollback has finished, so a
//! sweep never runs against a live attempt. Decompression runs on the
//! blocking pool. Every store call is bounded by the configured store
//! timeout; an elapsed timeout is treated like any other unrecoverable store
//! error.

use crate::archive::ArchiveSource;
use crate::config::EngineConfig;
use crate::error::{InsertError, SourceError, StoreError};
use crate::store::{
    BlobId, FallbackStore, Ledger, PrimaryStore, RecordId, StoredBlob, UnitClaim,
};
use crate::unit::{Outcome, Unit};
use chrono::NaiveDate;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Summary of one `ingest` call
///
/// `primary` and `fallback` count the entries written by this attempt; on a
/// failed attempt they have been rolled back.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub unit: Unit,
    pub outcome: Outcome,
    pub lines: u64,
    pub primary: u64,
    pub fallback: u64,
    pub duration: Duration,
}

/// Why a unit attempt was abandoned
#[derive(Error, Debug)]
enum UnitFailure {
    #[error("ledger unavailable: {0}")]
    Ledger(#[source] StoreError),

    #[error("another attempt holds the unit")]
    Busy,

    #[error("archive is neither cached nor fetchable")]
    Unavailable,

    #[error("orphan sweep failed: {0}")]
    Sweep(#[source] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("line {line}: {source}")]
    Insert {
        line: u64,
        #[source]
        source: InsertError,
    },

    #[error("line {line}: fallback store failed: {source}")]
    Fallback {
        line: u64,
        #[source]
        source: StoreError,
    },

    #[error("line {line}: fallback index write was not acknowledged")]
    FallbackUnacknowledged { line: u64 },

    #[error("ledger commit was not acknowledged")]
    CommitUnacknowledged,
}

/// Writes made by one attempt, kept for rollback
struct Attempt {
    unit: Unit,
    lines: u64,
    primary: Vec<RecordId>,
    fallback: Vec<BlobId>,
}

impl Attempt {
    fn new(unit: Unit) -> Self {
        Self {
            unit,
            lines: 0,
            primary: Vec::new(),
            fallback: Vec::new(),
        }
    }

    fn has_writes(&self) -> bool {
        !self.primary.is_empty() || !self.fallback.is_empty()
    }
}

/// Drives units from the archive into the stores
pub struct Ingestor {
    source: ArchiveSource,
    primary: Arc<dyn PrimaryStore>,
    fallback: Arc<dyn FallbackStore>,
    ledger: Arc<dyn Ledger>,
    config: EngineConfig,
}

impl Ingestor {
    pub fn new(
        source: ArchiveSource,
        primary: Arc<dyn PrimaryStore>,
        fallback: Arc<dyn FallbackStore>,
        ledger: Arc<dyn Ledger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            primary,
            fallback,
            ledger,
            config,
        }
    }

    pub fn source(&self) -> &ArchiveSource {
        &self.source
    }

    /// Ingest one `(date, hour)` unit
    pub async fn ingest_unit(&self, date: NaiveDate, hour: u8) -> Outcome {
        match Unit::new(date, hour) {
            Ok(unit) => self.ingest(&unit).await.outcome,
            Err(e) => {
                error!(%date, hour, error = %e, "Rejected unit");
                Outcome::Fail
            },
        }
    }

    /// Ingest one unit and report what happened
    #[instrument(skip(self), fields(unit = %unit))]
    pub async fn ingest(&self, unit: &Unit) -> IngestReport {
        let started = Instant::now();
        let mut attempt = Attempt::new(*unit);

        let outcome = match self.claim(unit).await {
            Ok(_claim) => match self.run(&mut attempt).await {
                Ok(()) => Outcome::Pass,
                Err(failure) => self.abandon(&attempt, failure).await,
            },
            Err(failure) => self.abandon(&attempt, failure).await,
        };

        IngestReport {
            unit: *unit,
            outcome,
            lines: attempt.lines,
            primary: attempt.primary.len() as u64,
            fallback: attempt.fallback.len() as u64,
            duration: started.elapsed(),
        }
    }

    async fn claim(&self, unit: &Unit) -> Result<UnitClaim, UnitFailure> {
        self.bounded(self.ledger.claim(unit))
            .await
            .map_err(UnitFailure::Ledger)?
            .ok_or(UnitFailure::Busy)
    }

    async fn abandon(&self, attempt: &Attempt, failure: UnitFailure) -> Outcome {
        warn!(
            error = %failure,
            lines = attempt.lines,
            primary = attempt.primary.len(),
            fallback = attempt.fallback.len(),
            "Unit ingestion failed"
        );
        if attempt.has_writes() {
            self.roll_back(attempt).await;
        }
        Outcome::Fail
    }

    async fn run(&self, attempt: &mut Attempt) -> Result<(), UnitFailure> {
        let unit = attempt.unit;

        if self
            .bounded(self.ledger.has(&unit))
            .await
            .map_err(UnitFailure::Ledger)?
        {
            info!("Unit already ingested, skipping");
            return Ok(());
        }

        let source = self.source.open(&unit).await.ok_or(UnitFailure::Unavailable)?;

        if self.config.reconcile_orphans {
            self.sweep(&unit).await?;
        }

        let mut lines = source.spawn();
        while let Some(line) = lines.next().await {
            let raw = line?;
            attempt.lines += 1;
            self.route(attempt, raw).await?;
        }

        let acknowledged = self
            .bounded(self.ledger.commit(&unit))
            .await
            .map_err(UnitFailure::Ledger)?;
        if !acknowledged {
            return Err(UnitFailure::CommitUnacknowledged);
        }

        info!(
            lines = attempt.lines,
            primary = attempt.primary.len(),
            fallback = attempt.fallback.len(),
            "Unit committed"
        );
        Ok(())
    }

    /// Remove entries left behind by earlier attempts that were never committed
    async fn sweep(&self, unit: &Unit) -> Result<(), UnitFailure> {
        let primary = self
            .bounded(self.primary.purge_unit(unit))
            .await
            .map_err(UnitFailure::Sweep)?;
        let fallback = self
            .bounded(self.fallback.purge_unit(unit))
            .await
            .map_err(UnitFailure::Sweep)?;

        if primary > 0 || fallback > 0 {
            warn!(primary, fallback, "Swept orphaned entries of an earlier attempt");
        }
        Ok(())
    }

    /// Store one raw line in the primary store, or divert it to the fallback store
    async fn route(&self, attempt: &mut Attempt, raw: Vec<u8>) -> Result<(), UnitFailure> {
        let record: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                debug!(line = attempt.lines, error = %e, "Unparseable line, diverting to fallback");
                return self.divert(attempt, &raw).await;
            },
        };

        match self.insert(&attempt.unit, &record).await {
            Ok(id) => {
                attempt.primary.push(id);
                Ok(())
            },
            Err(e) if e.is_recoverable() => {
                debug!(line = attempt.lines, error = %e, "Primary store refused record, diverting to fallback");
                self.divert(attempt, &raw).await
            },
            Err(source) => Err(UnitFailure::Insert {
                line: attempt.lines,
                source,
            }),
        }
    }

    async fn divert(&self, attempt: &mut Attempt, raw: &[u8]) -> Result<(), UnitFailure> {
        let line = attempt.lines;
        let blob = StoredBlob::describe(raw);
        // tracked before any write so rollback reaches it whatever happens next
        attempt.fallback.push(blob.id);
        debug!(line, blob = %blob.id, "Diverting line to fallback");

        let indexed = self
            .bounded(self.fallback.index(&blob, &attempt.unit))
            .await
            .map_err(|source| UnitFailure::Fallback { line, source })?;
        if !indexed {
            return Err(UnitFailure::FallbackUnacknowledged { line });
        }

        self.bounded(self.fallback.put(&blob, raw))
            .await
            .map_err(|source| UnitFailure::Fallback { line, source })
    }

    async fn insert(
        &self,
        unit: &Unit,
        record: &serde_json::Value,
    ) -> Result<RecordId, InsertError> {
        let limit = self.config.store_timeout();
        tokio::time::timeout(limit, self.primary.insert(unit, record))
            .await
            .unwrap_or_else(|_| Err(InsertError::Other(format!("insert timed out after {:?}", limit))))
    }

    /// Best-effort removal of every entry written by a failed attempt
    async fn roll_back(&self, attempt: &Attempt) {
        let collection = attempt.unit.collection();
        let mut leaked = 0usize;

        for id in &attempt.primary {
            match self.bounded(self.primary.delete(&collection, *id)).await {
                Ok(true) => {},
                Ok(false) => {
                    warn!(record = %id, "Primary delete not acknowledged during rollback");
                    leaked += 1;
                },
                Err(e) => {
                    warn!(record = %id, error = %e, "Primary delete failed during rollback");
                    leaked += 1;
                },
            }
        }

        for id in &attempt.fallback {
            match self.bounded(self.fallback.delete(*id)).await {
                Ok(true) => {},
                Ok(false) => {
                    warn!(blob = %id, "Fallback delete not acknowledged during rollback");
                    leaked += 1;
                },
                Err(e) => {
                    warn!(blob = %id, error = %e, "Fallback delete failed during rollback");
                    leaked += 1;
                },
            }
        }

        if leaked > 0 {
            error!(
                leaked,
                reconcile_orphans = self.config.reconcile_orphans,
                "Rollback incomplete, entries remain for an uncommitted unit"
            );
        } else {
            info!(
                primary = attempt.primary.len(),
                fallback = attempt.fallback.len(),
                "Rolled back unit"
            );
        }
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let limit = self.config.store_timeout();
        tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| StoreError::Timeout(limit))?
    }
}
