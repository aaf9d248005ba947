//! Reservation checks for a new batch, run under resource locks.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::errors::{ConflictReason, WorkflowError, WorkflowResult};
use crate::lock::{LockedResource, ResourceLock};
use crate::resource::ResourceStatus;
use crate::store::StoreTransaction;
use crate::types::{Money, PartitionKey, ResourceId};

/// One requested line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    /// Resource to reserve.
    pub resource_id: ResourceId,
    /// How many units. At least 1.
    pub quantity: u32,
    /// Line notes.
    #[serde(default)]
    pub notes: Option<String>,
}

impl ItemRequest {
    /// A line without notes.
    pub const fn new(resource_id: ResourceId, quantity: u32) -> Self {
        Self {
            resource_id,
            quantity,
            notes: None,
        }
    }
}

/// A line that passed every check, with the resource still held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedItem {
    /// The locked resource.
    pub locked: LockedResource,
    /// Requested units.
    pub quantity: u32,
    /// Line notes.
    pub notes: Option<String>,
}

/// A fully checked request plus the aggregate facts derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedReservation {
    /// Lines in request order.
    pub items: Vec<ValidatedItem>,
    /// Partition shared by every line.
    pub partition: PartitionKey,
    /// Some line's resource is valued above the threshold.
    pub is_critical: bool,
    /// Sum of requested units.
    pub total_quantity: u64,
}

/// Checks availability, single-partition membership, criticality and quantity.
#[derive(Debug, Clone)]
pub struct ReservationValidator {
    critical_threshold: Money,
    lock: ResourceLock,
}

impl ReservationValidator {
    /// A validator classifying resources above `critical_threshold` as critical.
    pub const fn new(critical_threshold: Money) -> Self {
        Self {
            critical_threshold,
            lock: ResourceLock,
        }
    }

    /// Locks and checks every candidate. All or nothing.
    ///
    /// Every resource is locked (in ascending id order) before any conflict
    /// check runs. Checks then run in request order, so the first offending
    /// line is the one reported.
    #[instrument(skip_all, fields(lines = candidates.len()))]
    pub async fn validate<T: StoreTransaction>(
        &self,
        tx: &mut T,
        candidates: &[ItemRequest],
    ) -> WorkflowResult<ValidatedReservation> {
        if candidates.is_empty() {
            return Err(WorkflowError::validation("a batch needs at least one item"));
        }
        let mut distinct = BTreeSet::new();
        if let Some(duplicate) = candidates
            .iter()
            .find(|candidate| !distinct.insert(&candidate.resource_id))
        {
            return Err(WorkflowError::validation(format!(
                "resource {} is requested more than once",
                duplicate.resource_id
            )));
        }

        let held = self
            .lock
            .acquire_all(tx, candidates.iter().map(|c| &c.resource_id))
            .await?;

        let mut partition: Option<PartitionKey> = None;
        let mut is_critical = false;
        let mut total_quantity = 0_u64;
        let mut items = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let Some(locked) = held.get(&candidate.resource_id) else {
                continue;
            };
            self.check_available(tx, locked).await?;

            let resource = locked.resource();
            match &partition {
                None => partition = Some(resource.partition.clone()),
                Some(expected) if *expected != resource.partition => {
                    return Err(ConflictReason::MixedPartitions {
                        resource: resource.id.clone(),
                        expected: expected.clone(),
                        found: resource.partition.clone(),
                    }
                    .into());
                }
                Some(_) => {}
            }

            if resource.value > self.critical_threshold {
                debug!(resource = %resource.id, value = %resource.value, "[validator] critical line");
                is_critical = true;
            }

            if candidate.quantity < 1 {
                return Err(ConflictReason::InvalidQuantity {
                    resource: resource.id.clone(),
                    quantity: candidate.quantity,
                }
                .into());
            }
            total_quantity += u64::from(candidate.quantity);

            items.push(ValidatedItem {
                locked: locked.clone(),
                quantity: candidate.quantity,
                notes: candidate.notes.clone(),
            });
        }

        let partition = partition
            .ok_or_else(|| WorkflowError::validation("a batch needs at least one item"))?;

        Ok(ValidatedReservation {
            items,
            partition,
            is_critical,
            total_quantity,
        })
    }

    async fn check_available<T: StoreTransaction>(
        &self,
        tx: &mut T,
        locked: &LockedResource,
    ) -> WorkflowResult<()> {
        let status = locked.resource().status;
        let holder = self.lock.holder(tx, locked).await?;

        match (status, holder) {
            (_, Some(holder)) => Err(ConflictReason::AlreadyReserved {
                resource: locked.id().clone(),
                holder: holder.reference,
            }
            .into()),
            (ResourceStatus::Available, None) => Ok(()),
            (status, None) => Err(ConflictReason::Unavailable {
                resource: locked.id().clone(),
                status,
            }
            .into()),
        }
    }
}
