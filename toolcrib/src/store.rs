//! Storage ports.
//!
//! The workflow runs every mutating operation inside one [`StoreTransaction`].
//! Adapters provide the exclusive holds and the guarded writes; the workflow
//! decides what to hold and what to write.
//!
//! # Contract
//!
//! - Holds taken by [`StoreTransaction::lock_resource`] and
//!   [`StoreTransaction::lock_batch`] last until commit or rollback, and must
//!   exclude every other transaction across process boundaries for a
//!   persistent adapter.
//! - Locking the same row twice in one transaction must not block.
//! - [`StoreTransaction::next_sequence`] is rolled back with the transaction,
//!   and a failure inside it must leave the transaction usable.
//! - Dropping a transaction without committing rolls it back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aggregate::{Batch, BatchStatus, ExtensionRecord};
use crate::errors::StoreResult;
use crate::resource::{Resource, ResourceStatus};
use crate::types::{BatchId, ReferenceNumber, ResourceId, SequenceKey, SequenceNumber};

/// The open batch that currently holds a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderRef {
    /// Holding batch.
    pub batch: BatchId,
    /// Its external reference.
    pub reference: ReferenceNumber,
    /// Its status.
    pub status: BatchStatus,
}

/// A backend that can run reservation transactions.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Transaction handle produced by [`ReservationStore::begin`].
    type Transaction: StoreTransaction;

    /// Opens a transaction.
    async fn begin(&self) -> StoreResult<Self::Transaction>;

    /// Reads a batch with its lines, without locking.
    async fn find_batch(&self, id: BatchId) -> StoreResult<Option<Batch>>;

    /// Reads a batch by its external reference, without locking.
    async fn find_batch_by_reference(
        &self,
        reference: &ReferenceNumber,
    ) -> StoreResult<Option<Batch>>;

    /// Reads a resource, without locking.
    async fn find_resource(&self, id: &ResourceId) -> StoreResult<Option<Resource>>;

    /// Return-date changes recorded for a batch, oldest first.
    async fn extension_history(&self, batch: BatchId) -> StoreResult<Vec<ExtensionRecord>>;

    /// Adds a resource to the pool, or replaces its attributes.
    async fn register_resource(&self, resource: Resource) -> StoreResult<()>;
}

/// One all-or-nothing unit of work.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Reads a resource and holds it exclusively until the transaction ends.
    ///
    /// Blocks while another transaction holds it.
    async fn lock_resource(&mut self, id: &ResourceId) -> StoreResult<Option<Resource>>;

    /// The open batch with any line on `resource`, if any.
    ///
    /// A plain read. Only meaningful once the resource is locked.
    async fn open_holder(&mut self, resource: &ResourceId) -> StoreResult<Option<HolderRef>>;

    /// Increments and returns the counter for `key`, creating it at 1.
    async fn next_sequence(&mut self, key: &SequenceKey) -> StoreResult<SequenceNumber>;

    /// Persists a new batch and all its lines.
    async fn insert_batch(&mut self, batch: &Batch) -> StoreResult<()>;

    /// Reads a batch and holds it exclusively until the transaction ends.
    async fn lock_batch(&mut self, id: BatchId) -> StoreResult<Option<Batch>>;

    /// Writes `batch` only if its stored status is still `expected`.
    ///
    /// Fails with `StoreError::StatusMismatch` otherwise.
    async fn update_batch(&mut self, batch: &Batch, expected: BatchStatus) -> StoreResult<()>;

    /// Changes a locked resource's availability.
    async fn set_resource_status(
        &mut self,
        id: &ResourceId,
        status: ResourceStatus,
    ) -> StoreResult<()>;

    /// Appends an extension history entry.
    async fn record_extension(&mut self, entry: &ExtensionRecord) -> StoreResult<()>;

    /// Makes every write visible and releases every hold.
    async fn commit(self) -> StoreResult<()>;

    /// Discards every write and releases every hold.
    async fn rollback(self) -> StoreResult<()>;
}
