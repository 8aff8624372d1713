//! Store interfaces used by the ingestion engine
//!
//! The engine only talks to these traits; concrete handles are built once
//! by the caller and injected as `Arc<dyn …>`.
//!
//! - **postgres**: connection pool, primary event table and ledger
//! - **blob**: S3-compatible object storage client
//! - **fallback**: object storage + PostgreSQL index for rejected lines
//! - **memory**: in-process implementations with fault injection

pub mod blob;
pub mod fallback;
pub mod memory;
pub mod postgres;

use crate::error::{InsertError, StoreError};
use crate::unit::Unit;
use async_trait::async_trait;
use gharchive_common::checksum::sha256_hex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use uuid::Uuid;

pub use blob::BlobStorage;
pub use fallback::ObjectFallbackStore;
pub use postgres::{PgLedger, PgPrimaryStore};

/// Store-assigned identity of a primary record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of a fallback blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId(pub Uuid);

impl BlobId {
    pub fn generate() -> Self {
        BlobId(Uuid::new_v4())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity and digest of a fallback blob, fixed before anything is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub id: BlobId,
    pub size: u64,
    pub sha256: String,
}

impl StoredBlob {
    /// Describe `raw` under a fresh id
    pub fn describe(raw: &[u8]) -> Self {
        Self {
            id: BlobId::generate(),
            size: raw.len() as u64,
            sha256: sha256_hex(raw),
        }
    }
}

/// Exclusive hold on one unit, released when dropped
///
/// While a claim is alive no other attempt can claim the same unit, so the
/// orphan sweep and the commit of one attempt never interleave with another.
pub struct UnitClaim {
    _hold: Box<dyn Any + Send>,
}

impl UnitClaim {
    /// Wrap whatever keeps the hold alive (a session, a guard)
    pub fn new<H: Any + Send>(hold: H) -> Self {
        Self { _hold: Box::new(hold) }
    }
}

impl fmt::Debug for UnitClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnitClaim")
    }
}

/// Per-date document collections receiving parsed records
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Insert a record into the collection named after the unit's date
    ///
    /// The collection is created implicitly. Entries are tagged with the
    /// unit's hour so a unit's leftovers can be swept.
    async fn insert(&self, unit: &Unit, record: &serde_json::Value)
        -> Result<RecordId, InsertError>;

    /// Remove one record; `false` when the store did not acknowledge the delete
    async fn delete(&self, collection: &str, id: RecordId) -> Result<bool, StoreError>;

    /// Remove every record tagged with the unit, returning how many were removed
    async fn purge_unit(&self, unit: &Unit) -> Result<u64, StoreError>;
}

/// Holding area for raw lines the primary store cannot take
#[async_trait]
pub trait FallbackStore: Send + Sync {
    /// Link a blob to its unit ahead of its bytes; `false` when not acknowledged
    ///
    /// Indexing first keeps every blob that may exist discoverable by
    /// [`purge_unit`](FallbackStore::purge_unit), even when the upload
    /// outlives its caller.
    async fn index(&self, blob: &StoredBlob, unit: &Unit) -> Result<bool, StoreError>;

    /// Store the raw bytes verbatim under the blob's id
    async fn put(&self, blob: &StoredBlob, raw: &[u8]) -> Result<(), StoreError>;

    /// Remove a blob and its index row; removing an absent blob succeeds
    async fn delete(&self, id: BlobId) -> Result<bool, StoreError>;

    /// Remove every blob indexed under the unit, returning how many were removed
    async fn purge_unit(&self, unit: &Unit) -> Result<u64, StoreError>;
}

/// Completion records, one per fully ingested unit
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn has(&self, unit: &Unit) -> Result<bool, StoreError>;

    /// Take the unit for one attempt; `None` while another attempt holds it
    async fn claim(&self, unit: &Unit) -> Result<Option<UnitClaim>, StoreError>;

    /// Record the unit as done; `false` when not acknowledged (including a
    /// concurrent commit of the same unit)
    async fn commit(&self, unit: &Unit) -> Result<bool, StoreError>;
}
