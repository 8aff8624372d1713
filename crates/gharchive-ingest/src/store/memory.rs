//! In-process store implementations with fault injection
//!
//! Used by the engine tests and handy for dry runs. Every handle is cheap to
//! clone and clones share state, so a test can keep one copy for assertions
//! while the engine owns another.

use crate::error::{InsertError, StoreError};
use crate::store::{BlobId, FallbackStore, Ledger, PrimaryStore, RecordId, StoredBlob, UnitClaim};
use crate::unit::Unit;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Failure injected into [`MemoryPrimaryStore::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unacknowledged,
    TooLarge,
    WriteRejected,
    Other,
    /// Never completes; exercises the engine's store timeout
    Hang,
}

type Predicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Default)]
struct PrimaryState {
    collections: HashMap<String, BTreeMap<i64, (u8, Value)>>,
    next_id: i64,
    mutations: u64,
}

/// Primary store holding records in per-date maps
#[derive(Clone, Default)]
pub struct MemoryPrimaryStore {
    state: Arc<Mutex<PrimaryState>>,
    faults: Arc<Mutex<Vec<(Predicate, Fault)>>>,
    max_document_bytes: Option<usize>,
    fail_delete: Arc<AtomicBool>,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject serialized records above `limit` bytes as too large
    pub fn with_max_document_bytes(mut self, limit: usize) -> Self {
        self.max_document_bytes = Some(limit);
        self
    }

    /// Inject `fault` for every record matching `predicate`
    pub fn fail_when<F>(&self, predicate: F, fault: Fault)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        lock(&self.faults).push((Box::new(predicate), fault));
    }

    /// Make deletes report "not acknowledged"
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Records of a collection in insertion order
    pub fn records(&self, collection: &str) -> Vec<Value> {
        lock(&self.state)
            .collections
            .get(collection)
            .map(|records| records.values().map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }

    /// Records across all collections
    pub fn count(&self) -> usize {
        lock(&self.state).collections.values().map(BTreeMap::len).sum()
    }

    /// Successful inserts plus successful deletes
    pub fn mutations(&self) -> u64 {
        lock(&self.state).mutations
    }

    fn fault_for(&self, record: &Value) -> Option<Fault> {
        lock(&self.faults)
            .iter()
            .find(|(predicate, _)| predicate(record))
            .map(|(_, fault)| *fault)
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn insert(&self, unit: &Unit, record: &Value) -> Result<RecordId, InsertError> {
        let size = serde_json::to_vec(record)
            .map_err(|e| InsertError::Other(e.to_string()))?
            .len();

        if let Some(limit) = self.max_document_bytes {
            if size > limit {
                return Err(InsertError::TooLarge { size, limit });
            }
        }

        match self.fault_for(record) {
            Some(Fault::Unacknowledged) => return Err(InsertError::Unacknowledged),
            Some(Fault::TooLarge) => {
                return Err(InsertError::TooLarge {
                    size,
                    limit: self.max_document_bytes.unwrap_or(size),
                })
            },
            Some(Fault::WriteRejected) => {
                return Err(InsertError::WriteRejected("injected rejection".to_string()))
            },
            Some(Fault::Other) => return Err(InsertError::Other("injected failure".to_string())),
            Some(Fault::Hang) => std::future::pending::<()>().await,
            None => {},
        }

        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state
            .collections
            .entry(unit.collection())
            .or_default()
            .insert(id, (unit.hour(), record.clone()));
        state.mutations += 1;
        Ok(RecordId(id))
    }

    async fn delete(&self, collection: &str, id: RecordId) -> Result<bool, StoreError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut state = lock(&self.state);
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|records| records.remove(&id.0))
            .is_some();
        if removed {
            state.mutations += 1;
        }
        Ok(removed)
    }

    async fn purge_unit(&self, unit: &Unit) -> Result<u64, StoreError> {
        let mut state = lock(&self.state);
        let removed = match state.collections.get_mut(&unit.collection()) {
            Some(records) => {
                let before = records.len();
                records.retain(|_, (hour, _)| *hour != unit.hour());
                (before - records.len()) as u64
            },
            None => 0,
        };
        state.mutations += removed;
        Ok(removed)
    }
}

#[derive(Default)]
struct FallbackState {
    blobs: HashMap<BlobId, Vec<u8>>,
    index: HashMap<BlobId, Unit>,
}

/// Fallback store keeping blobs and their index in memory
#[derive(Clone, Default)]
pub struct MemoryFallbackStore {
    state: Arc<Mutex<FallbackState>>,
    fail_put: Arc<AtomicBool>,
    hang_put: Arc<AtomicBool>,
    fail_index: Arc<AtomicBool>,
    puts: Arc<AtomicU64>,
}

impl MemoryFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `put` fail with a backend error
    pub fn fail_puts(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }

    /// Make `put` store the bytes and then never return
    pub fn hang_puts(&self, hang: bool) {
        self.hang_put.store(hang, Ordering::SeqCst);
    }

    /// Make `index` report "not acknowledged"
    pub fn fail_indexing(&self, fail: bool) {
        self.fail_index.store(fail, Ordering::SeqCst);
    }

    /// Raw bytes of every stored blob, indexed or not
    pub fn blobs(&self) -> Vec<Vec<u8>> {
        lock(&self.state).blobs.values().cloned().collect()
    }

    /// Raw bytes of the blobs indexed under a unit
    pub fn blobs_for(&self, unit: &Unit) -> Vec<Vec<u8>> {
        let state = lock(&self.state);
        state
            .index
            .iter()
            .filter(|(_, indexed)| *indexed == unit)
            .filter_map(|(id, _)| state.blobs.get(id).cloned())
            .collect()
    }

    pub fn blob_count(&self) -> usize {
        lock(&self.state).blobs.len()
    }

    pub fn index_count(&self) -> usize {
        lock(&self.state).index.len()
    }

    /// Number of `put` calls that stored bytes
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FallbackStore for MemoryFallbackStore {
    async fn index(&self, blob: &StoredBlob, unit: &Unit) -> Result<bool, StoreError> {
        if self.fail_index.load(Ordering::SeqCst) {
            return Ok(false);
        }
        lock(&self.state).index.insert(blob.id, *unit);
        Ok(true)
    }

    async fn put(&self, blob: &StoredBlob, raw: &[u8]) -> Result<(), StoreError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StoreError::Object("injected put failure".to_string()));
        }
        if self.hang_put.load(Ordering::SeqCst) {
            // the bytes land even though the caller never hears back
            lock(&self.state).blobs.insert(blob.id, raw.to_vec());
            std::future::pending::<()>().await;
        }
        lock(&self.state).blobs.insert(blob.id, raw.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: BlobId) -> Result<bool, StoreError> {
        let mut state = lock(&self.state);
        state.index.remove(&id);
        state.blobs.remove(&id);
        Ok(true)
    }

    async fn purge_unit(&self, unit: &Unit) -> Result<u64, StoreError> {
        let mut state = lock(&self.state);
        let ids: Vec<BlobId> = state
            .index
            .iter()
            .filter(|(_, indexed)| *indexed == unit)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            state.index.remove(id);
            state.blobs.remove(id);
        }
        Ok(ids.len() as u64)
    }
}

/// Releases a [`MemoryLedger`] claim on drop
struct ClaimHold {
    claims: Arc<Mutex<BTreeSet<String>>>,
    key: String,
}

impl Drop for ClaimHold {
    fn drop(&mut self) {
        lock(&self.claims).remove(&self.key);
    }
}

/// Ledger backed by a set of unit keys
#[derive(Clone, Default)]
pub struct MemoryLedger {
    keys: Arc<Mutex<BTreeSet<String>>>,
    claims: Arc<Mutex<BTreeSet<String>>>,
    fail_commit: Arc<AtomicBool>,
    fail_has: Arc<AtomicBool>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `commit` report "not acknowledged"
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Make `has` fail with a backend error
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_has.store(fail, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.keys).iter().cloned().collect()
    }

    pub fn contains(&self, unit: &Unit) -> bool {
        lock(&self.keys).contains(&unit.key())
    }

    /// Whether an attempt currently holds the unit
    pub fn is_claimed(&self, unit: &Unit) -> bool {
        lock(&self.claims).contains(&unit.key())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn has(&self, unit: &Unit) -> Result<bool, StoreError> {
        if self.fail_has.load(Ordering::SeqCst) {
            return Err(StoreError::Other("injected ledger lookup failure".to_string()));
        }
        Ok(lock(&self.keys).contains(&unit.key()))
    }

    async fn claim(&self, unit: &Unit) -> Result<Option<UnitClaim>, StoreError> {
        let key = unit.key();
        if !lock(&self.claims).insert(key.clone()) {
            return Ok(None);
        }
        Ok(Some(UnitClaim::new(ClaimHold {
            claims: Arc::clone(&self.claims),
            key,
        })))
    }

    async fn commit(&self, unit: &Unit) -> Result<bool, StoreError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(lock(&self.keys).insert(unit.key()))
    }
}
