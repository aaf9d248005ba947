//! The transactional reservation service.
//!
//! Every public operation runs as one store transaction: lock, check, write,
//! commit. Any error rolls the transaction back before it is returned, so a
//! caller never observes a partially created batch or a resource reserved by
//! a request that failed. Transactions aborted by the store for transient
//! reasons are re-run from scratch with backoff.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::aggregate::{Batch, BatchItem, BatchStatus, BorrowerInfo, ExtensionRecord, ItemReturn};
use crate::clock::{Clock, SystemClock};
use crate::config::ToolcribConfig;
use crate::errors::{
    Missing, StoreError, TransitionDenied, WorkflowError, WorkflowResult,
};
use crate::lock::ResourceLock;
use crate::metrics::ServiceMetrics;
use crate::resource::{Resource, ResourceChange, ResourceStatus};
use crate::retry::retry_transient;
use crate::roles::{Actor, GuardedAction};
use crate::sequence::SequenceCounter;
use crate::store::{ReservationStore, StoreTransaction};
use crate::types::{BatchId, BatchItemId, ReferenceNumber, ResourceId};
use crate::validator::{ItemRequest, ReservationValidator};
use crate::workflow::{BatchDraft, Transition, WorkflowEngine};

/// A request to reserve a batch of resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBatchRequest {
    /// Who borrows.
    pub borrower: BorrowerInfo,
    /// When everything is due back. Must be in the future.
    pub expected_return: DateTime<Utc>,
    /// Why.
    #[serde(default)]
    pub purpose: Option<String>,
    /// Requested lines. At least one; each resource at most once.
    pub items: Vec<ItemRequest>,
    /// Maker's notes.
    #[serde(default)]
    pub notes: Option<String>,
}

/// Result of a return-date extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionOutcome {
    /// The batch after the extension.
    pub batch: Batch,
    /// One history entry per extended line.
    pub records: Vec<ExtensionRecord>,
}

/// Runs reservation workflows against a store.
#[derive(Debug)]
pub struct ReservationService<S: ReservationStore> {
    store: S,
    config: ToolcribConfig,
    engine: WorkflowEngine,
    validator: ReservationValidator,
    counter: SequenceCounter,
    lock: ResourceLock,
    clock: Arc<dyn Clock>,
    metrics: Arc<ServiceMetrics>,
}

impl<S: ReservationStore> ReservationService<S> {
    /// A service on the wall clock.
    pub fn new(store: S, config: ToolcribConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// A service reading time from `clock`.
    pub fn with_clock(store: S, config: ToolcribConfig, clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(ServiceMetrics::new());
        Self {
            engine: WorkflowEngine::new(config.role_policy.clone(), config.segregation_of_duties),
            validator: ReservationValidator::new(config.critical_threshold),
            counter: SequenceCounter::new(
                config.reference_prefix.as_ref(),
                config.sequence_policy,
                Arc::clone(&metrics),
            ),
            lock: ResourceLock,
            store,
            config,
            clock,
            metrics,
        }
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Configuration in force.
    pub const fn config(&self) -> &ToolcribConfig {
        &self.config
    }

    /// Operational counters.
    pub fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }

    /// Reserves every requested resource and opens a batch.
    ///
    /// Critical batches start at `PendingVerification`. Non-critical batches
    /// created by an actor with a fast-track role start at `Approved`.
    #[instrument(skip(self, actor, request), fields(actor = %actor.id, lines = request.items.len()))]
    pub async fn create_batch(
        &self,
        actor: &Actor,
        request: CreateBatchRequest,
    ) -> WorkflowResult<Batch> {
        let result = match self.check_request(&request) {
            Ok(()) => {
                retry_transient(&self.config.retry, &self.metrics, "create_batch", || {
                    self.create_once(actor, &request)
                })
                .await
            }
            Err(error) => Err(error),
        };

        match &result {
            Ok(batch) => {
                self.metrics.batches_created.increment();
                info!(
                    reference = %batch.reference,
                    status = %batch.status,
                    critical = batch.is_critical,
                    streamlined = batch.streamlined,
                    "[service.create_batch] batch created"
                );
            }
            Err(error) => self.observe_failure("create_batch", error),
        }
        result
    }

    /// PendingVerification -> PendingApproval.
    #[instrument(skip(self, actor, notes), fields(actor = %actor.id))]
    pub async fn verify(
        &self,
        batch_id: BatchId,
        actor: &Actor,
        notes: Option<String>,
    ) -> WorkflowResult<Batch> {
        self.transition(GuardedAction::Verify, batch_id, |batch, now| {
            self.engine.verify(batch, actor, notes.clone(), now)
        })
        .await
        .map(|transition| transition.batch)
    }

    /// PendingApproval -> Approved.
    #[instrument(skip(self, actor, notes), fields(actor = %actor.id))]
    pub async fn approve(
        &self,
        batch_id: BatchId,
        actor: &Actor,
        notes: Option<String>,
    ) -> WorkflowResult<Batch> {
        self.transition(GuardedAction::Approve, batch_id, |batch, now| {
            self.engine.approve(batch, actor, notes.clone(), now)
        })
        .await
        .map(|transition| transition.batch)
    }

    /// Approved -> Released; resources go from reserved to in use.
    #[instrument(skip(self, actor, notes), fields(actor = %actor.id))]
    pub async fn release(
        &self,
        batch_id: BatchId,
        actor: &Actor,
        notes: Option<String>,
    ) -> WorkflowResult<Batch> {
        self.transition(GuardedAction::Release, batch_id, |batch, now| {
            self.engine.release(batch, actor, notes.clone(), now)
        })
        .await
        .map(|transition| transition.batch)
    }

    /// Records returned quantities. Fully returned lines free their resource.
    #[instrument(skip(self, actor, returns, notes), fields(actor = %actor.id, lines = returns.len()))]
    pub async fn return_items(
        &self,
        batch_id: BatchId,
        actor: &Actor,
        returns: Vec<ItemReturn>,
        notes: Option<String>,
    ) -> WorkflowResult<Batch> {
        self.transition(GuardedAction::Return, batch_id, |batch, now| {
            self.engine
                .record_return(batch, actor, &returns, notes.clone(), now)
        })
        .await
        .map(|transition| transition.batch)
    }

    /// Withdraws a batch before release; reserved resources become available.
    #[instrument(skip(self, actor, reason), fields(actor = %actor.id))]
    pub async fn cancel(
        &self,
        batch_id: BatchId,
        actor: &Actor,
        reason: Option<String>,
    ) -> WorkflowResult<Batch> {
        self.transition(GuardedAction::Cancel, batch_id, |batch, now| {
            self.engine.cancel(batch, actor, reason.clone(), now)
        })
        .await
        .map(|transition| transition.batch)
    }

    /// Moves borrowed lines' return date later and records why.
    #[instrument(skip(self, item_ids, reason, actor), fields(actor = %actor.id, lines = item_ids.len()))]
    pub async fn extend_return_date(
        &self,
        batch_id: BatchId,
        item_ids: Vec<BatchItemId>,
        new_date: DateTime<Utc>,
        reason: String,
        actor: &Actor,
    ) -> WorkflowResult<ExtensionOutcome> {
        self.transition(GuardedAction::ExtendReturnDate, batch_id, |batch, now| {
            self.engine
                .extend(batch, actor, &item_ids, new_date, &reason, now)
        })
        .await
        .map(|transition| ExtensionOutcome {
            batch: transition.batch,
            records: transition.extensions,
        })
    }

    /// Reads a batch with its lines.
    pub async fn find_batch(&self, batch_id: BatchId) -> WorkflowResult<Batch> {
        self.store
            .find_batch(batch_id)
            .await?
            .ok_or_else(|| Missing::Batch(batch_id).into())
    }

    /// Reads a batch by its external reference.
    pub async fn find_by_reference(
        &self,
        reference: &ReferenceNumber,
    ) -> WorkflowResult<Option<Batch>> {
        Ok(self.store.find_batch_by_reference(reference).await?)
    }

    /// Reads a resource.
    pub async fn find_resource(&self, id: &ResourceId) -> WorkflowResult<Resource> {
        self.store
            .find_resource(id)
            .await?
            .ok_or_else(|| Missing::Resource(id.clone()).into())
    }

    /// Return-date changes of a batch, oldest first.
    pub async fn extension_history(
        &self,
        batch_id: BatchId,
    ) -> WorkflowResult<Vec<ExtensionRecord>> {
        Ok(self.store.extension_history(batch_id).await?)
    }

    /// Lines of a batch still outstanding past their expected return.
    pub async fn overdue_items(&self, batch_id: BatchId) -> WorkflowResult<Vec<BatchItem>> {
        let batch = self.find_batch(batch_id).await?;
        Ok(batch
            .overdue_items(self.clock.now())
            .into_iter()
            .cloned()
            .collect())
    }

    fn check_request(&self, request: &CreateBatchRequest) -> WorkflowResult<()> {
        if request.borrower.name.trim().is_empty() {
            return Err(WorkflowError::validation("borrower name is required"));
        }
        if request.items.is_empty() {
            return Err(WorkflowError::validation("a batch needs at least one item"));
        }
        let now = self.clock.now();
        if request.expected_return <= now {
            return Err(WorkflowError::validation(format!(
                "expected return {} is not in the future",
                request.expected_return
            )));
        }
        Ok(())
    }

    async fn create_once(&self, actor: &Actor, request: &CreateBatchRequest) -> WorkflowResult<Batch> {
        let mut tx = self.store.begin().await?;
        match self.create_in(&mut tx, actor, request).await {
            Ok(batch) => {
                tx.commit().await?;
                Ok(batch)
            }
            Err(error) => {
                Self::rollback(tx, "create_batch").await;
                Err(error)
            }
        }
    }

    async fn create_in(
        &self,
        tx: &mut S::Transaction,
        actor: &Actor,
        request: &CreateBatchRequest,
    ) -> WorkflowResult<Batch> {
        let now = self.clock.now();
        let mut validated = self.validator.validate(tx, &request.items).await?;
        let reference = self
            .counter
            .issue(tx, &validated.partition, now.year())
            .await?;

        let items = validated
            .items
            .iter()
            .map(|line| BatchItem {
                id: BatchItemId::generate(),
                resource_id: line.locked.id().clone(),
                quantity: line.quantity,
                quantity_returned: 0,
                status: BatchStatus::PendingVerification,
                expected_return: request.expected_return,
                notes: line.notes.clone(),
                return_condition: None,
            })
            .collect();

        let batch = self.engine.open(
            actor,
            BatchDraft {
                reference,
                partition: validated.partition.clone(),
                borrower: request.borrower.clone(),
                purpose: request.purpose.clone(),
                expected_return: request.expected_return,
                is_critical: validated.is_critical,
                items,
                notes: request.notes.clone(),
            },
            now,
        );

        for line in &mut validated.items {
            let change = ResourceChange::new(
                line.locked.id().clone(),
                ResourceStatus::Available,
                ResourceStatus::Reserved,
            );
            self.lock.apply(tx, &mut line.locked, &change).await?;
        }
        tx.insert_batch(&batch).await?;

        debug!(
            reference = %batch.reference,
            total_quantity = validated.total_quantity,
            "[service.create_batch] batch staged"
        );
        Ok(batch)
    }

    async fn transition<F>(
        &self,
        action: GuardedAction,
        batch_id: BatchId,
        plan: F,
    ) -> WorkflowResult<Transition>
    where
        F: Fn(&Batch, DateTime<Utc>) -> WorkflowResult<Transition> + Sync,
    {
        let operation = action.to_string();
        let result = retry_transient(&self.config.retry, &self.metrics, &operation, || {
            self.transition_once(action, batch_id, &plan)
        })
        .await;

        match &result {
            Ok(transition) => info!(
                reference = %transition.batch.reference,
                from = %transition.expected,
                to = %transition.batch.status,
                "[service.{operation}] transition committed"
            ),
            Err(error) => self.observe_failure(&operation, error),
        }
        result
    }

    async fn transition_once<F>(
        &self,
        action: GuardedAction,
        batch_id: BatchId,
        plan: &F,
    ) -> WorkflowResult<Transition>
    where
        F: Fn(&Batch, DateTime<Utc>) -> WorkflowResult<Transition> + Sync,
    {
        let mut tx = self.store.begin().await?;
        match self.transition_in(&mut tx, action, batch_id, plan).await {
            Ok(transition) => {
                tx.commit().await?;
                Ok(transition)
            }
            Err(error) => {
                Self::rollback(tx, "transition").await;
                Err(error)
            }
        }
    }

    async fn transition_in<F>(
        &self,
        tx: &mut S::Transaction,
        action: GuardedAction,
        batch_id: BatchId,
        plan: &F,
    ) -> WorkflowResult<Transition>
    where
        F: Fn(&Batch, DateTime<Utc>) -> WorkflowResult<Transition> + Sync,
    {
        let current = tx
            .lock_batch(batch_id)
            .await?
            .ok_or(Missing::Batch(batch_id))?;
        let transition = plan(&current, self.clock.now())?;

        if !transition.resource_changes.is_empty() {
            let mut held = self
                .lock
                .acquire_all(tx, transition.resource_changes.iter().map(|c| &c.resource))
                .await?;
            for change in &transition.resource_changes {
                if let Some(locked) = held.get_mut(&change.resource) {
                    self.lock.apply(tx, locked, change).await?;
                }
            }
        }

        match tx.update_batch(&transition.batch, transition.expected).await {
            Ok(()) => {}
            Err(StoreError::StatusMismatch { expected, .. }) => {
                return Err(WorkflowError::InvalidTransition {
                    reference: current.reference.clone(),
                    action,
                    reason: TransitionDenied::ConcurrentUpdate { expected },
                });
            }
            Err(other) => return Err(other.into()),
        }

        for entry in &transition.extensions {
            tx.record_extension(entry).await?;
        }

        Ok(transition)
    }

    async fn rollback(tx: S::Transaction, operation: &str) {
        if let Err(error) = tx.rollback().await {
            warn!(operation, error = %error, "[service] rollback failed; store discards the transaction");
        }
    }

    fn observe_failure(&self, operation: &str, error: &WorkflowError) {
        match error {
            WorkflowError::ReservationConflict(reason) => {
                self.metrics.conflicts.increment();
                warn!(operation, reason = %reason, "reservation conflict");
            }
            WorkflowError::InvalidTransition { .. } => {
                self.metrics.invalid_transitions.increment();
                warn!(operation, error = %error, "transition refused");
            }
            WorkflowError::Persistence(store) if store.is_outcome_unknown() => {
                error!(
                    operation,
                    error = %error,
                    "commit outcome unknown; not retried, read the batch back to confirm"
                );
            }
            WorkflowError::Persistence(_) | WorkflowError::SequenceUnavailable(_) => {
                error!(operation, error = %error, "persistence failure");
            }
            WorkflowError::Validation(_) | WorkflowError::NotFound(_) => {
                debug!(operation, error = %error, "request rejected");
            }
        }
    }
}
