//! `toolcrib` - concurrency-safe reservation of shared equipment
//!
//! A borrower checks out a batch of physical resources from a shared pool.
//! This crate guarantees that:
//!
//! - no resource is held by two open batches at once, even under concurrent
//!   requests (every reservation check runs under an exclusive resource hold,
//!   and holds are always taken in ascending resource order);
//! - reference numbers (`BRW-PROJ1-2025-0001`) are unique and increasing per
//!   project and year, with a recognizable fallback shape when the counter is
//!   unavailable;
//! - every batch walks a maker/verifier/authorizer workflow, or a streamlined
//!   path for trusted, non-critical requests;
//! - partial returns converge to `Returned` only when nothing is outstanding.
//!
//! Storage is pluggable through [`ReservationStore`]; see `toolcrib-memory`
//! and `toolcrib-postgres`.
//!
//! # Example
//!
//! ```rust,ignore
//! use toolcrib::{Actor, CreateBatchRequest, ReservationService, Role, ToolcribConfig};
//!
//! let service = ReservationService::new(store, ToolcribConfig::from_env()?);
//! let batch = service.create_batch(&maker, request).await?;
//! let batch = service.verify(batch.id, &verifier, None).await?;
//! let batch = service.approve(batch.id, &authorizer, None).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod clock;
pub mod config;
pub mod errors;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod resource;
pub mod response;
pub mod retry;
pub mod roles;
pub mod sequence;
pub mod service;
pub mod store;
pub mod types;
pub mod validator;
pub mod workflow;

pub use aggregate::{
    Batch, BatchItem, BatchStatus, BorrowerInfo, ExtensionRecord, ItemReturn, StageLog,
    StageStamp,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, ReferencePrefix, ToolcribConfig};
pub use errors::{
    ConflictReason, ErrorKind, Missing, Operation, StoreError, StoreResult, TransitionDenied,
    WorkflowError, WorkflowResult,
};
pub use lock::{LockedResource, ResourceLock};
pub use metrics::{MetricsSnapshot, ServiceMetrics};
pub use resource::{Resource, ResourceChange, ResourceStatus, UnknownStatus};
pub use response::OperationResponse;
pub use retry::RetryConfig;
pub use roles::{Actor, GuardedAction, Role, RolePolicy};
pub use sequence::{SequenceCounter, SequencePolicy};
pub use service::{CreateBatchRequest, ExtensionOutcome, ReservationService};
pub use store::{HolderRef, ReservationStore, StoreTransaction};
pub use types::{
    ActorId, BatchId, BatchItemId, Money, PartitionKey, ReferenceKind, ReferenceNumber,
    ReferenceParseError, ResourceId, SequenceKey, SequenceNumber,
};
pub use validator::{ItemRequest, ReservationValidator, ValidatedItem, ValidatedReservation};
pub use workflow::{ApprovalPath, BatchDraft, Transition, WorkflowEngine};
