//! Error types for toolcrib.
//!
//! Two layers, mirroring the seam between workflow and storage:
//!
//! - **WorkflowError**: what a caller of the reservation service sees. Every
//!   variant is returned after the enclosing transaction has been rolled back.
//! - **StoreError**: what a storage adapter reports. Adapters classify backend
//!   failures so the service can tell a retryable deadlock from a real fault.
//!
//! # Error Handling Strategy
//!
//! - **Validation**: fix the request and resubmit
//! - **ReservationConflict**: pick other resources or wait for the holder
//! - **InvalidTransition**: refresh the batch; someone else acted first or the
//!   actor lacks the role
//! - **NotFound**: check the identifier
//! - **Persistence**: already retried if transient; log and investigate
//! - **SequenceUnavailable**: only raised when the sequence policy is `Fail`

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::aggregate::BatchStatus;
use crate::resource::ResourceStatus;
use crate::roles::GuardedAction;
use crate::types::{ActorId, BatchId, BatchItemId, PartitionKey, ReferenceNumber, ResourceId};

/// Result alias for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Result alias for storage adapter operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the reservation service.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    /// Malformed input: missing fields, bad dates, empty item list.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A resource cannot be reserved by this request.
    #[error("Reservation conflict: {0}")]
    ReservationConflict(#[from] ConflictReason),

    /// A workflow guard failed.
    #[error("Cannot {action} batch {reference}: {reason}")]
    InvalidTransition {
        /// Batch the transition was attempted on.
        reference: ReferenceNumber,
        /// What was attempted.
        action: GuardedAction,
        /// Why it was refused.
        reason: TransitionDenied,
    },

    /// A batch, item or resource does not exist.
    #[error("Not found: {0}")]
    NotFound(#[from] Missing),

    /// The store failed while reading or committing.
    #[error("Persistence failure: {0}")]
    Persistence(#[source] StoreError),

    /// The sequence counter failed and the policy forbids fallback references.
    #[error("Reference sequence unavailable: {0}")]
    SequenceUnavailable(#[source] StoreError),
}

impl WorkflowError {
    /// Coarse classification used by structured responses and metrics.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::ReservationConflict(_) => ErrorKind::ReservationConflict,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Persistence(_) | Self::SequenceUnavailable(_) => ErrorKind::Persistence,
        }
    }

    /// Whether retrying the whole operation may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(error) if error.is_transient())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<StoreError> for WorkflowError {
    fn from(error: StoreError) -> Self {
        Self::Persistence(error)
    }
}

/// Coarse error classification exposed to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`WorkflowError::Validation`].
    Validation,
    /// See [`WorkflowError::ReservationConflict`].
    ReservationConflict,
    /// See [`WorkflowError::InvalidTransition`].
    InvalidTransition,
    /// See [`WorkflowError::NotFound`].
    NotFound,
    /// See [`WorkflowError::Persistence`].
    Persistence,
}

/// Why a resource could not be reserved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictReason {
    /// Another open batch still holds the resource.
    #[error("resource {resource} is already held by open batch {holder}")]
    AlreadyReserved {
        /// Contended resource.
        resource: ResourceId,
        /// Reference of the batch holding it.
        holder: ReferenceNumber,
    },

    /// The resource is not in the `available` state.
    #[error("resource {resource} is not available (status: {status})")]
    Unavailable {
        /// Contended resource.
        resource: ResourceId,
        /// Its current status.
        status: ResourceStatus,
    },

    /// Items from different projects cannot share a batch.
    #[error("resource {resource} belongs to {found}, but this batch is for {expected}")]
    MixedPartitions {
        /// Offending resource.
        resource: ResourceId,
        /// Partition of the first item.
        expected: PartitionKey,
        /// Partition of this item.
        found: PartitionKey,
    },

    /// Requested quantity below one.
    #[error("quantity {quantity} requested for resource {resource} must be at least 1")]
    InvalidQuantity {
        /// Offending resource.
        resource: ResourceId,
        /// Requested quantity.
        quantity: u32,
    },
}

/// Why a workflow transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionDenied {
    /// The stored status is not a valid pre-state for the action.
    #[error("batch is {actual}")]
    WrongState {
        /// Status found inside the transaction.
        actual: BatchStatus,
    },

    /// The actor holds none of the roles the action requires.
    #[error("actor {actor} lacks a role permitted to {action}")]
    MissingRole {
        /// Who tried.
        actor: ActorId,
        /// What they tried.
        action: GuardedAction,
    },

    /// The same person may not act in two approval stages.
    #[error("actor {actor} already acted on this batch as {stage}")]
    SegregationOfDuties {
        /// Who tried.
        actor: ActorId,
        /// Stage they already filled.
        stage: &'static str,
    },

    /// The status changed between read and write.
    #[error("batch status changed concurrently (expected {expected})")]
    ConcurrentUpdate {
        /// Status the writer expected to replace.
        expected: BatchStatus,
    },
}

/// What could not be found.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Missing {
    /// No batch with this id.
    #[error("batch {0}")]
    Batch(BatchId),
    /// No resource with this id.
    #[error("resource {0}")]
    Resource(ResourceId),
    /// The batch has no such line.
    #[error("item {item} in batch {batch}")]
    Item {
        /// Batch searched.
        batch: BatchId,
        /// Line requested.
        item: BatchItemId,
    },
}

/// Storage operations, for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Opening a transaction.
    BeginTransaction,
    /// Exclusive read of a resource row.
    LockResource,
    /// Looking up the open batch holding a resource.
    FindHolder,
    /// Issuing the next sequence number.
    NextSequence,
    /// Persisting a new batch and its items.
    InsertBatch,
    /// Exclusive read of a batch row.
    LockBatch,
    /// Guarded batch update.
    UpdateBatch,
    /// Changing a resource's availability.
    UpdateResource,
    /// Writing an extension history entry.
    RecordExtension,
    /// Registering a resource in the pool.
    RegisterResource,
    /// Non-transactional read.
    Read,
    /// Committing.
    Commit,
    /// Rolling back.
    Rollback,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeginTransaction => "begin_transaction",
            Self::LockResource => "lock_resource",
            Self::FindHolder => "find_holder",
            Self::NextSequence => "next_sequence",
            Self::InsertBatch => "insert_batch",
            Self::LockBatch => "lock_batch",
            Self::UpdateBatch => "update_batch",
            Self::UpdateResource => "update_resource",
            Self::RecordExtension => "record_extension",
            Self::RegisterResource => "register_resource",
            Self::Read => "read",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Errors reported by storage adapters.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The connection to the store failed or was lost. Lost during commit, the
    /// transaction may or may not have been applied.
    #[error("connection failure during {operation}: {detail}")]
    Connection {
        /// Operation in flight.
        operation: Operation,
        /// Backend message.
        detail: String,
    },

    /// The store's deadlock detector aborted this transaction.
    #[error("deadlock detected during {operation}")]
    Deadlock {
        /// Operation in flight.
        operation: Operation,
    },

    /// Serializable isolation rejected the transaction.
    #[error("serialization failure during {operation}")]
    SerializationFailure {
        /// Operation in flight.
        operation: Operation,
    },

    /// Waiting on another transaction's exclusive hold exceeded the lock timeout.
    #[error("lock wait exceeded {waited:?} during {operation}")]
    LockTimeout {
        /// Operation in flight.
        operation: Operation,
        /// Configured limit, when known.
        waited: Option<Duration>,
    },

    /// The guarded update found a different status than expected.
    #[error("batch {batch} status mismatch: expected {expected}, found {actual:?}")]
    StatusMismatch {
        /// Batch being updated.
        batch: BatchId,
        /// Status the caller expected.
        expected: BatchStatus,
        /// Status actually stored, if the row exists.
        actual: Option<BatchStatus>,
    },

    /// A unique key was violated.
    #[error("duplicate key during {operation}: {detail}")]
    Duplicate {
        /// Operation in flight.
        operation: Operation,
        /// Backend message.
        detail: String,
    },

    /// Stored data could not be decoded into domain types.
    #[error("corrupt data during {operation}: {detail}")]
    Corrupt {
        /// Operation in flight.
        operation: Operation,
        /// What was wrong.
        detail: String,
    },

    /// Any other backend failure.
    #[error("store failure during {operation}: {detail}")]
    Backend {
        /// Operation in flight.
        operation: Operation,
        /// Backend message.
        detail: String,
    },
}

impl StoreError {
    /// Whether the failure is expected to clear on retry.
    ///
    /// A connection lost while committing is not: the store may already have
    /// applied the transaction, and a re-run would trip over its own writes.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } => !self.is_outcome_unknown(),
            Self::Deadlock { .. }
            | Self::SerializationFailure { .. }
            | Self::LockTimeout { .. } => true,
            _ => false,
        }
    }

    /// Whether the commit may or may not have been applied.
    pub const fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            Self::Connection {
                operation: Operation::Commit,
                ..
            }
        )
    }

    /// Builds a [`StoreError::Corrupt`].
    pub fn corrupt(operation: Operation, detail: impl fmt::Display) -> Self {
        Self::Corrupt {
            operation,
            detail: detail.to_string(),
        }
    }
}
