//! The batch aggregate: one borrower, many lines, one workflow status.
//!
//! All item mutations go through [`Batch`] so that the derived totals and the
//! returned/partially-returned rule hold after every change. Item counts are
//! never stored independently of the item list.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Missing, WorkflowError, WorkflowResult};
use crate::resource::UnknownStatus;
use crate::types::{ActorId, BatchId, BatchItemId, PartitionKey, ReferenceNumber, ResourceId};

/// Workflow status of a batch, mirrored (with lag) on each item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Awaiting an independent verifier.
    PendingVerification,
    /// Verified, awaiting an authorizer.
    PendingApproval,
    /// Authorized, awaiting physical hand-over.
    Approved,
    /// Handed over to the borrower.
    Released,
    /// Some quantity has come back.
    PartiallyReturned,
    /// Everything has come back. Terminal.
    Returned,
    /// Withdrawn before release. Terminal.
    Canceled,
}

impl BatchStatus {
    /// Stable storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingVerification => "pending_verification",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Released => "released",
            Self::PartiallyReturned => "partially_returned",
            Self::Returned => "returned",
            Self::Canceled => "canceled",
        }
    }

    /// Not yet terminal; the batch still holds its resources.
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Returned | Self::Canceled)
    }

    /// Prior to release.
    pub const fn is_cancelable(self) -> bool {
        matches!(
            self,
            Self::PendingVerification | Self::PendingApproval | Self::Approved
        )
    }

    /// Physically with the borrower.
    pub const fn is_borrowed(self) -> bool {
        matches!(self, Self::Released | Self::PartiallyReturned)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw {
            "pending_verification" => Self::PendingVerification,
            "pending_approval" => Self::PendingApproval,
            "approved" => Self::Approved,
            "released" => Self::Released,
            "partially_returned" => Self::PartiallyReturned,
            "returned" => Self::Returned,
            "canceled" => Self::Canceled,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Who borrows the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowerInfo {
    /// Display name. Required.
    pub name: String,
    /// Phone or e-mail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    /// Badge or employee number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl BorrowerInfo {
    /// A borrower known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contact: None,
            id: None,
        }
    }
}

/// Audit record for one workflow stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStamp {
    /// Who acted.
    pub actor: ActorId,
    /// When.
    pub at: DateTime<Utc>,
    /// Free-form notes or cancellation reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl StageStamp {
    /// Builds a stamp.
    pub const fn new(actor: ActorId, at: DateTime<Utc>, notes: Option<String>) -> Self {
        Self { actor, at, notes }
    }
}

/// Who did what, and when, for each stage of the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLog {
    /// The maker.
    pub created: StageStamp,
    /// Set on verification (or auto-stamped on the streamlined path).
    #[serde(default)]
    pub verified: Option<StageStamp>,
    /// Set on approval (or auto-stamped on the streamlined path).
    #[serde(default)]
    pub approved: Option<StageStamp>,
    /// Set on hand-over.
    #[serde(default)]
    pub released: Option<StageStamp>,
    /// Most recent return.
    #[serde(default)]
    pub last_returned: Option<StageStamp>,
    /// Set on cancellation; notes carry the reason.
    #[serde(default)]
    pub canceled: Option<StageStamp>,
}

impl StageLog {
    /// A log with only the creation stamp.
    pub const fn created(stamp: StageStamp) -> Self {
        Self {
            created: stamp,
            verified: None,
            approved: None,
            released: None,
            last_returned: None,
            canceled: None,
        }
    }
}

/// One line of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Line identifier.
    pub id: BatchItemId,
    /// Reserved resource.
    pub resource_id: ResourceId,
    /// Quantity requested. At least 1.
    pub quantity: u32,
    /// Running total returned so far.
    pub quantity_returned: u32,
    /// Per-line status. Lags the batch once lines return at different times.
    pub status: BatchStatus,
    /// When this line is due back.
    pub expected_return: DateTime<Utc>,
    /// Notes supplied at creation.
    pub notes: Option<String>,
    /// Condition reported on the most recent return of this line.
    pub return_condition: Option<String>,
}

impl BatchItem {
    /// Quantity still with the borrower (or still to be handed over).
    pub const fn outstanding(&self) -> u32 {
        self.quantity.saturating_sub(self.quantity_returned)
    }

    /// Whether this line still holds its resource.
    pub const fn is_outstanding(&self) -> bool {
        self.outstanding() > 0
    }
}

/// A quantity coming back on one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReturn {
    /// Line being returned.
    pub item_id: BatchItemId,
    /// How many units. At least 1, at most the outstanding quantity.
    pub quantity: u32,
    /// Condition of the returned units.
    #[serde(default)]
    pub condition: Option<String>,
}

/// A persisted return-date change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRecord {
    /// Batch the line belongs to.
    pub batch: BatchId,
    /// Line extended.
    pub item: BatchItemId,
    /// Date before the change.
    pub previous: DateTime<Utc>,
    /// Date after the change.
    pub new: DateTime<Utc>,
    /// Why.
    pub reason: String,
    /// Who.
    pub actor: ActorId,
    /// When.
    pub at: DateTime<Utc>,
}

/// An aggregate reservation of one or more resources for one borrower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Internal identifier.
    pub id: BatchId,
    /// External identifier, unique.
    pub reference: ReferenceNumber,
    /// Project every line belongs to.
    pub partition: PartitionKey,
    /// Who borrows.
    pub borrower: BorrowerInfo,
    /// Why.
    pub purpose: Option<String>,
    /// Latest expected return across lines.
    pub expected_return: DateTime<Utc>,
    /// Workflow status.
    pub status: BatchStatus,
    /// Some line's resource exceeds the criticality threshold.
    pub is_critical: bool,
    /// Created through the fast-track path.
    pub streamlined: bool,
    /// Lines, in request order.
    pub items: Vec<BatchItem>,
    /// Stage audit.
    pub stages: StageLog,
}

impl Batch {
    /// The maker.
    pub const fn creator(&self) -> &ActorId {
        &self.stages.created.actor
    }

    /// Number of lines.
    pub fn total_items(&self) -> usize {
        self.items.len()
    }

    /// Sum of requested quantity over all lines.
    pub fn total_quantity(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.quantity)).sum()
    }

    /// Sum of outstanding quantity over all lines.
    pub fn outstanding_quantity(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.outstanding())).sum()
    }

    /// Whether the batch still holds resources.
    pub const fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Looks up a line.
    pub fn item(&self, id: BatchItemId) -> Option<&BatchItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Whether any line of this batch references `resource`.
    ///
    /// An open batch holds every resource it names until it closes, including
    /// lines already given back in full.
    pub fn references(&self, resource: &ResourceId) -> bool {
        self.items.iter().any(|item| item.resource_id == *resource)
    }

    /// Moves the batch to `status` and mirrors it on every outstanding line.
    pub(crate) fn advance(&mut self, status: BatchStatus) {
        self.status = status;
        for item in self.items.iter_mut().filter(|item| item.is_outstanding()) {
            item.status = status;
        }
    }

    /// Applies a set of returns, all or nothing.
    ///
    /// The batch becomes `Returned` only when nothing is outstanding on any
    /// line. Only then are its resources handed back: the returned list holds
    /// every line's resource on that final return and is empty before it.
    pub fn apply_returns(&mut self, returns: &[ItemReturn]) -> WorkflowResult<Vec<ResourceId>> {
        if returns.is_empty() {
            return Err(WorkflowError::validation("at least one item must be returned"));
        }

        let mut seen = BTreeSet::new();
        for entry in returns {
            if !seen.insert(entry.item_id) {
                return Err(WorkflowError::validation(format!(
                    "item {} appears more than once in the return",
                    entry.item_id
                )));
            }
            let item = self.item(entry.item_id).ok_or(Missing::Item {
                batch: self.id,
                item: entry.item_id,
            })?;
            if entry.quantity == 0 {
                return Err(WorkflowError::validation(format!(
                    "returned quantity for item {} must be at least 1",
                    entry.item_id
                )));
            }
            if entry.quantity > item.outstanding() {
                return Err(WorkflowError::validation(format!(
                    "cannot return {} of item {}: only {} outstanding",
                    entry.quantity,
                    entry.item_id,
                    item.outstanding()
                )));
            }
        }

        for entry in returns {
            if let Some(item) = self.items.iter_mut().find(|item| item.id == entry.item_id) {
                item.quantity_returned += entry.quantity;
                if entry.condition.is_some() {
                    item.return_condition.clone_from(&entry.condition);
                }
                item.status = if item.is_outstanding() {
                    BatchStatus::PartiallyReturned
                } else {
                    BatchStatus::Returned
                };
            }
        }

        if self.items.iter().any(BatchItem::is_outstanding) {
            self.status = BatchStatus::PartiallyReturned;
            return Ok(Vec::new());
        }
        self.status = BatchStatus::Returned;
        Ok(self
            .items
            .iter()
            .map(|item| item.resource_id.clone())
            .collect())
    }

    /// Moves the chosen lines' return date to `new_date`.
    ///
    /// Every chosen line must still be borrowed with quantity outstanding, and
    /// `new_date` must not precede the batch's current expected return. The
    /// batch date becomes the latest across lines. Returns each line's
    /// previous date.
    pub fn extend_items(
        &mut self,
        item_ids: &[BatchItemId],
        new_date: DateTime<Utc>,
    ) -> WorkflowResult<Vec<(BatchItemId, DateTime<Utc>)>> {
        if item_ids.is_empty() {
            return Err(WorkflowError::validation("at least one item must be extended"));
        }
        if new_date < self.expected_return {
            return Err(WorkflowError::validation(format!(
                "new return date {new_date} precedes the current expected return {}",
                self.expected_return
            )));
        }

        let chosen: BTreeSet<BatchItemId> = item_ids.iter().copied().collect();
        for id in &chosen {
            let item = self.item(*id).ok_or(Missing::Item {
                batch: self.id,
                item: *id,
            })?;
            if !item.status.is_borrowed() || !item.is_outstanding() {
                return Err(WorkflowError::validation(format!(
                    "item {id} is not currently borrowed"
                )));
            }
        }

        let mut previous = Vec::with_capacity(chosen.len());
        for item in self.items.iter_mut().filter(|item| chosen.contains(&item.id)) {
            previous.push((item.id, item.expected_return));
            item.expected_return = new_date;
        }
        self.recompute_expected_return();

        Ok(previous)
    }

    /// Outstanding lines past their expected return.
    pub fn overdue_items(&self, now: DateTime<Utc>) -> Vec<&BatchItem> {
        if !self.status.is_borrowed() {
            return Vec::new();
        }
        self.items
            .iter()
            .filter(|item| item.is_outstanding() && item.expected_return < now)
            .collect()
    }

    fn recompute_expected_return(&mut self) {
        if let Some(latest) = self.items.iter().map(|item| item.expected_return).max() {
            self.expected_return = latest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 9, 0, 0).single().expect("valid date")
    }

    fn line(resource: &str, quantity: u32) -> BatchItem {
        BatchItem {
            id: BatchItemId::generate(),
            resource_id: ResourceId::try_new(resource.to_string()).expect("valid resource"),
            quantity,
            quantity_returned: 0,
            status: BatchStatus::Released,
            expected_return: at(10),
            notes: None,
            return_condition: None,
        }
    }

    fn released_batch(items: Vec<BatchItem>) -> Batch {
        let partition = PartitionKey::try_new("P1".to_string()).expect("valid partition");
        let actor = ActorId::try_new("maker".to_string()).expect("valid actor");
        Batch {
            id: BatchId::generate(),
            reference: "BRW-P1-2025-0001".parse().expect("valid reference"),
            partition,
            borrower: BorrowerInfo::named("Ada"),
            purpose: None,
            expected_return: at(10),
            status: BatchStatus::Released,
            is_critical: false,
            streamlined: false,
            items,
            stages: StageLog::created(StageStamp::new(actor, at(1), None)),
        }
    }

    fn give_back(item: &BatchItem, quantity: u32) -> ItemReturn {
        ItemReturn {
            item_id: item.id,
            quantity,
            condition: None,
        }
    }

    #[test]
    fn totals_are_derived_from_lines() {
        let batch = released_batch(vec![line("A", 2), line("B", 3)]);

        assert_eq!(batch.total_items(), 2);
        assert_eq!(batch.total_quantity(), 5);
    }

    #[test]
    fn partial_return_keeps_every_resource_until_the_batch_closes() {
        let mut batch = released_batch(vec![line("A", 1), line("B", 3)]);
        let (a, b) = (batch.items[0].clone(), batch.items[1].clone());

        let freed = batch
            .apply_returns(&[give_back(&a, 1), give_back(&b, 1)])
            .expect("returns are within outstanding");

        assert!(freed.is_empty());
        assert_eq!(batch.status, BatchStatus::PartiallyReturned);
        assert_eq!(batch.items[0].status, BatchStatus::Returned);
        assert_eq!(batch.items[1].outstanding(), 2);
        assert!(batch.is_open());
        assert!(batch.references(&a.resource_id));

        let freed = batch
            .apply_returns(&[give_back(&b, 2)])
            .expect("rest of the line comes back");

        assert_eq!(freed, vec![a.resource_id, b.resource_id]);
        assert_eq!(batch.status, BatchStatus::Returned);
    }

    #[test]
    fn over_return_is_rejected_without_touching_any_line() {
        let mut batch = released_batch(vec![line("A", 2), line("B", 1)]);
        let before = batch.clone();
        let (a, b) = (batch.items[0].clone(), batch.items[1].clone());

        let result = batch.apply_returns(&[give_back(&a, 1), give_back(&b, 2)]);

        assert!(matches!(result, Err(WorkflowError::Validation(_))));
        assert_eq!(batch, before);
    }

    #[test]
    fn unknown_line_is_not_found() {
        let mut batch = released_batch(vec![line("A", 1)]);
        let stranger = line("Z", 1);

        let result = batch.apply_returns(&[give_back(&stranger, 1)]);

        assert!(matches!(result, Err(WorkflowError::NotFound(Missing::Item { .. }))));
    }

    #[test]
    fn condition_note_is_kept_on_the_line() {
        let mut batch = released_batch(vec![line("A", 1)]);
        let item_id = batch.items[0].id;

        batch
            .apply_returns(&[ItemReturn {
                item_id,
                quantity: 1,
                condition: Some("chipped bit".to_string()),
            }])
            .expect("return succeeds");

        assert_eq!(batch.items[0].return_condition.as_deref(), Some("chipped bit"));
        assert_eq!(batch.status, BatchStatus::Returned);
    }

    #[test]
    fn extension_moves_batch_date_to_latest_line() {
        let mut batch = released_batch(vec![line("A", 1), line("B", 1)]);
        let first = batch.items[0].id;

        let previous = batch.extend_items(&[first], at(20)).expect("extension allowed");

        assert_eq!(previous, vec![(first, at(10))]);
        assert_eq!(batch.expected_return, at(20));
        assert_eq!(batch.items[1].expected_return, at(10));
    }

    #[test]
    fn extension_cannot_move_date_backwards() {
        let mut batch = released_batch(vec![line("A", 1)]);
        let first = batch.items[0].id;

        let result = batch.extend_items(&[first], at(10) - Duration::days(1));

        assert!(matches!(result, Err(WorkflowError::Validation(_))));
    }

    #[test]
    fn fully_returned_line_cannot_be_extended() {
        let mut batch = released_batch(vec![line("A", 1), line("B", 1)]);
        let a = batch.items[0].clone();
        batch.apply_returns(&[give_back(&a, 1)]).expect("return succeeds");

        let result = batch.extend_items(&[a.id], at(20));

        assert!(matches!(result, Err(WorkflowError::Validation(_))));
    }

    #[test]
    fn overdue_lists_only_outstanding_lines_past_due() {
        let mut batch = released_batch(vec![line("A", 1), line("B", 1)]);
        let a = batch.items[0].clone();
        batch.apply_returns(&[give_back(&a, 1)]).expect("return succeeds");

        let overdue = batch.overdue_items(at(11));

        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].resource_id.as_ref(), "B");
        assert!(batch.overdue_items(at(9)).is_empty());
    }

    proptest! {
        #[test]
        fn returns_converge_to_returned_only_at_the_end(
            quantities in prop::collection::vec(1u32..6, 1..5),
            seed in any::<u64>(),
        ) {
            let items: Vec<BatchItem> = quantities
                .iter()
                .enumerate()
                .map(|(index, quantity)| line(&format!("R{index}"), *quantity))
                .collect();
            let mut batch = released_batch(items);

            // Return one unit at a time, visiting lines in a seed-dependent order.
            let mut steps: Vec<usize> = quantities
                .iter()
                .enumerate()
                .flat_map(|(index, quantity)| std::iter::repeat(index).take(*quantity as usize))
                .collect();
            let len = steps.len();
            for i in 0..len {
                let j = usize::try_from(seed.rotate_left(u32::try_from(i % 64).unwrap_or(0)) % len as u64)
                    .unwrap_or(0);
                steps.swap(i, j);
            }

            for (done, index) in steps.iter().enumerate() {
                let item_id = batch.items[*index].id;
                batch
                    .apply_returns(&[ItemReturn { item_id, quantity: 1, condition: None }])
                    .expect("single unit is always within outstanding");
                if done + 1 < len {
                    prop_assert_eq!(batch.status, BatchStatus::PartiallyReturned);
                }
            }

            prop_assert_eq!(batch.status, BatchStatus::Returned);
            prop_assert_eq!(batch.outstanding_quantity(), 0);
        }
    }
}
