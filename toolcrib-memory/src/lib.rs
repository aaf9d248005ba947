//! In-memory adapter for toolcrib
//!
//! This crate provides an in-memory implementation of the `ReservationStore`
//! trait from the toolcrib crate, useful for testing and development where
//! persistence is not required.
//!
//! It honors the same transaction contract as a database adapter:
//!
//! - `lock_resource`, `lock_batch` and `next_sequence` take an exclusive hold
//!   on the row that other transactions wait on until commit or rollback;
//! - writes are staged in the transaction and become visible atomically on
//!   commit, or vanish on rollback or drop.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use toolcrib::{
    Batch, BatchId, BatchStatus, ExtensionRecord, HolderRef, Operation, ReferenceNumber,
    ReservationStore, Resource, ResourceId, ResourceStatus, SequenceKey, SequenceNumber,
    StoreError, StoreResult, StoreTransaction,
};

/// Configuration for [`InMemoryReservationStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Longest a transaction waits for another's hold. Unbounded when unset.
    pub lock_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Resource(ResourceId),
    Batch(BatchId),
    Sequence(SequenceKey),
}

#[derive(Debug, Default)]
struct Tables {
    resources: BTreeMap<ResourceId, Resource>,
    batches: HashMap<BatchId, Batch>,
    references: HashMap<String, BatchId>,
    sequences: HashMap<SequenceKey, u32>,
    extensions: Vec<ExtensionRecord>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl Shared {
    fn lock_for(&self, key: &LockKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    // Drops lock entries nobody holds or waits on.
    fn prune_locks(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Thread-safe in-memory reservation store.
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReservationStore {
    shared: Arc<Shared>,
    config: MemoryStoreConfig,
}

impl InMemoryReservationStore {
    /// Create a new empty store with unbounded lock waits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty store with the given configuration.
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            shared: Arc::default(),
            config,
        }
    }

    /// Number of committed batches.
    pub fn batch_count(&self) -> usize {
        self.shared.tables.lock().batches.len()
    }

    /// Last committed value of a sequence counter.
    pub fn sequence_value(&self, key: &SequenceKey) -> Option<u32> {
        self.shared.tables.lock().sequences.get(key).copied()
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.shared.locks.lock().len()
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> StoreResult<Self::Transaction> {
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            lock_timeout: self.config.lock_timeout,
            held: HashMap::new(),
            staged: Staged::default(),
        })
    }

    async fn find_batch(&self, id: BatchId) -> StoreResult<Option<Batch>> {
        Ok(self.shared.tables.lock().batches.get(&id).cloned())
    }

    async fn find_batch_by_reference(
        &self,
        reference: &ReferenceNumber,
    ) -> StoreResult<Option<Batch>> {
        let tables = self.shared.tables.lock();
        Ok(tables
            .references
            .get(&reference.to_string())
            .and_then(|id| tables.batches.get(id))
            .cloned())
    }

    async fn find_resource(&self, id: &ResourceId) -> StoreResult<Option<Resource>> {
        Ok(self.shared.tables.lock().resources.get(id).cloned())
    }

    async fn extension_history(&self, batch: BatchId) -> StoreResult<Vec<ExtensionRecord>> {
        Ok(self
            .shared
            .tables
            .lock()
            .extensions
            .iter()
            .filter(|entry| entry.batch == batch)
            .cloned()
            .collect())
    }

    async fn register_resource(&self, resource: Resource) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        tx.hold(LockKey::Resource(resource.id.clone()), Operation::RegisterResource)
            .await?;
        tx.staged.resources.insert(resource.id.clone(), resource);
        tx.commit().await
    }
}

#[derive(Debug, Default)]
struct Staged {
    resources: HashMap<ResourceId, Resource>,
    batches: HashMap<BatchId, Batch>,
    references: HashMap<String, BatchId>,
    sequences: HashMap<SequenceKey, u32>,
    extensions: Vec<ExtensionRecord>,
}

/// A transaction against [`InMemoryReservationStore`].
///
/// Holds are released and staged writes discarded when dropped uncommitted.
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    lock_timeout: Option<Duration>,
    held: HashMap<LockKey, OwnedMutexGuard<()>>,
    staged: Staged,
}

impl MemoryTransaction {
    async fn hold(&mut self, key: LockKey, operation: Operation) -> StoreResult<()> {
        if self.held.contains_key(&key) {
            return Ok(());
        }
        let lock = self.shared.lock_for(&key);
        let guard = match self.lock_timeout {
            Some(limit) => tokio::time::timeout(limit, lock.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout {
                    operation,
                    waited: Some(limit),
                })?,
            None => lock.lock_owned().await,
        };
        self.held.insert(key, guard);
        Ok(())
    }

    fn current_batch(&self, id: BatchId) -> Option<Batch> {
        self.staged
            .batches
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables.lock().batches.get(&id).cloned())
    }

    fn current_resource(&self, id: &ResourceId) -> Option<Resource> {
        self.staged
            .resources
            .get(id)
            .cloned()
            .or_else(|| self.shared.tables.lock().resources.get(id).cloned())
    }

}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            self.held.clear();
            self.shared.prune_locks();
        }
    }
}

fn holds(batch: &Batch, resource: &ResourceId) -> bool {
    batch.is_open() && batch.references(resource)
}

fn holder_of(batch: &Batch) -> HolderRef {
    HolderRef {
        batch: batch.id,
        reference: batch.reference.clone(),
        status: batch.status,
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    #[instrument(skip(self), fields(resource = %id))]
    async fn lock_resource(&mut self, id: &ResourceId) -> StoreResult<Option<Resource>> {
        self.hold(LockKey::Resource(id.clone()), Operation::LockResource)
            .await?;
        Ok(self.current_resource(id))
    }

    async fn open_holder(&mut self, resource: &ResourceId) -> StoreResult<Option<HolderRef>> {
        if let Some(batch) = self
            .staged
            .batches
            .values()
            .find(|batch| holds(batch, resource))
        {
            return Ok(Some(holder_of(batch)));
        }
        let tables = self.shared.tables.lock();
        Ok(tables
            .batches
            .values()
            .filter(|batch| !self.staged.batches.contains_key(&batch.id))
            .find(|batch| holds(batch, resource))
            .map(holder_of))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn next_sequence(&mut self, key: &SequenceKey) -> StoreResult<SequenceNumber> {
        self.hold(LockKey::Sequence(key.clone()), Operation::NextSequence)
            .await?;
        let last = match self.staged.sequences.get(key) {
            Some(value) => *value,
            None => self
                .shared
                .tables
                .lock()
                .sequences
                .get(key)
                .copied()
                .unwrap_or(0),
        };
        let next = last.checked_add(1).ok_or_else(|| StoreError::Backend {
            operation: Operation::NextSequence,
            detail: format!("sequence {key} exhausted"),
        })?;
        let sequence = SequenceNumber::try_new(next)
            .map_err(|e| StoreError::corrupt(Operation::NextSequence, e))?;
        self.staged.sequences.insert(key.clone(), next);
        debug!(value = next, "[memory.next_sequence] issued");
        Ok(sequence)
    }

    async fn insert_batch(&mut self, batch: &Batch) -> StoreResult<()> {
        self.hold(LockKey::Batch(batch.id), Operation::InsertBatch)
            .await?;
        let reference = batch.reference.to_string();
        let taken = self.staged.references.contains_key(&reference) || {
            let tables = self.shared.tables.lock();
            tables.references.contains_key(&reference) || tables.batches.contains_key(&batch.id)
        };
        if taken || self.staged.batches.contains_key(&batch.id) {
            return Err(StoreError::Duplicate {
                operation: Operation::InsertBatch,
                detail: format!("batch {} / reference {reference} already exists", batch.id),
            });
        }
        self.staged.references.insert(reference, batch.id);
        self.staged.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    #[instrument(skip(self), fields(batch = %id))]
    async fn lock_batch(&mut self, id: BatchId) -> StoreResult<Option<Batch>> {
        self.hold(LockKey::Batch(id), Operation::LockBatch).await?;
        Ok(self.current_batch(id))
    }

    async fn update_batch(&mut self, batch: &Batch, expected: BatchStatus) -> StoreResult<()> {
        self.hold(LockKey::Batch(batch.id), Operation::UpdateBatch)
            .await?;
        let actual = self.current_batch(batch.id).map(|stored| stored.status);
        if actual != Some(expected) {
            return Err(StoreError::StatusMismatch {
                batch: batch.id,
                expected,
                actual,
            });
        }
        self.staged.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn set_resource_status(
        &mut self,
        id: &ResourceId,
        status: ResourceStatus,
    ) -> StoreResult<()> {
        self.hold(LockKey::Resource(id.clone()), Operation::UpdateResource)
            .await?;
        let mut resource = self.current_resource(id).ok_or_else(|| StoreError::Backend {
            operation: Operation::UpdateResource,
            detail: format!("resource {id} does not exist"),
        })?;
        resource.status = status;
        self.staged.resources.insert(id.clone(), resource);
        Ok(())
    }

    async fn record_extension(&mut self, entry: &ExtensionRecord) -> StoreResult<()> {
        self.staged.extensions.push(entry.clone());
        Ok(())
    }

    async fn commit(mut self) -> StoreResult<()> {
        let staged = std::mem::take(&mut self.staged);
        {
            let mut tables = self.shared.tables.lock();
            tables.resources.extend(staged.resources);
            tables.batches.extend(staged.batches);
            tables.references.extend(staged.references);
            tables.sequences.extend(staged.sequences);
            tables.extensions.extend(staged.extensions);
        }
        drop(self);
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        drop(self);
        Ok(())
    }
}
