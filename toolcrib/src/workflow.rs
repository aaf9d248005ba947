//! The maker/verifier/authorizer state machine.
//!
//! ```text
//! PendingVerification -> PendingApproval -> Approved -> Released -> PartiallyReturned -> Returned
//!          \                   \               \                        |   ^
//!           +-------------------+---------------+--> Canceled           +---+
//! ```
//!
//! The engine is pure: it inspects a batch already read under its lock,
//! checks guards, and returns the new state together with the resource
//! availability changes the caller must apply in the same transaction.

use chrono::{DateTime, Utc};

use crate::aggregate::{
    Batch, BatchItem, BatchStatus, BorrowerInfo, ExtensionRecord, ItemReturn, StageLog,
    StageStamp,
};
use crate::errors::{TransitionDenied, WorkflowError, WorkflowResult};
use crate::resource::{ResourceChange, ResourceStatus};
use crate::roles::{Actor, GuardedAction, RolePolicy};
use crate::types::{BatchId, BatchItemId, PartitionKey, ReferenceNumber};

/// Which approval path a new batch takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPath {
    /// Maker, then verifier, then authorizer.
    Full,
    /// Straight to `Approved`, stamped with the creator.
    Streamlined,
}

/// Everything needed to open a batch, once validation has passed.
#[derive(Debug, Clone)]
pub struct BatchDraft {
    /// Issued reference.
    pub reference: ReferenceNumber,
    /// Shared partition of every line.
    pub partition: PartitionKey,
    /// Who borrows.
    pub borrower: BorrowerInfo,
    /// Why.
    pub purpose: Option<String>,
    /// Requested return.
    pub expected_return: DateTime<Utc>,
    /// Some line exceeds the criticality threshold.
    pub is_critical: bool,
    /// Lines in request order. Status is assigned by the engine.
    pub items: Vec<BatchItem>,
    /// Maker's notes.
    pub notes: Option<String>,
}

/// The outcome of a guarded transition.
#[derive(Debug, Clone)]
pub struct Transition {
    /// The batch after the transition.
    pub batch: Batch,
    /// Status the stored row must still have for the write to apply.
    pub expected: BatchStatus,
    /// Availability changes to apply under resource locks.
    pub resource_changes: Vec<ResourceChange>,
    /// Return-date history to append.
    pub extensions: Vec<ExtensionRecord>,
}

impl Transition {
    fn status_only(batch: Batch, expected: BatchStatus) -> Self {
        Self::with_changes(batch, expected, Vec::new())
    }

    fn with_changes(
        batch: Batch,
        expected: BatchStatus,
        resource_changes: Vec<ResourceChange>,
    ) -> Self {
        Self {
            batch,
            expected,
            resource_changes,
            extensions: Vec::new(),
        }
    }
}

/// Applies workflow rules.
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    policy: RolePolicy,
    segregation_of_duties: bool,
}

const STREAMLINED_NOTE: &str = "streamlined approval";

impl WorkflowEngine {
    /// An engine enforcing `policy`.
    pub const fn new(policy: RolePolicy, segregation_of_duties: bool) -> Self {
        Self {
            policy,
            segregation_of_duties,
        }
    }

    /// The role policy in force.
    pub const fn policy(&self) -> &RolePolicy {
        &self.policy
    }

    /// Critical batches always take the full path; otherwise the actor's
    /// fast-track role decides.
    pub fn initial_path(&self, actor: &Actor, is_critical: bool) -> ApprovalPath {
        if !is_critical && self.policy.permits(actor, GuardedAction::StreamlinedCreate) {
            ApprovalPath::Streamlined
        } else {
            ApprovalPath::Full
        }
    }

    /// Builds the new batch in its initial state.
    pub fn open(&self, actor: &Actor, draft: BatchDraft, now: DateTime<Utc>) -> Batch {
        let path = self.initial_path(actor, draft.is_critical);
        let mut stages = StageLog::created(StageStamp::new(actor.id.clone(), now, draft.notes));

        let status = match path {
            ApprovalPath::Full => BatchStatus::PendingVerification,
            ApprovalPath::Streamlined => {
                let stamp = StageStamp::new(actor.id.clone(), now, Some(STREAMLINED_NOTE.to_string()));
                stages.verified = Some(stamp.clone());
                stages.approved = Some(stamp);
                BatchStatus::Approved
            }
        };

        let items = draft
            .items
            .into_iter()
            .map(|item| BatchItem { status, ..item })
            .collect();

        Batch {
            id: BatchId::generate(),
            reference: draft.reference,
            partition: draft.partition,
            borrower: draft.borrower,
            purpose: draft.purpose,
            expected_return: draft.expected_return,
            status,
            is_critical: draft.is_critical,
            streamlined: path == ApprovalPath::Streamlined,
            items,
            stages,
        }
    }

    /// PendingVerification -> PendingApproval.
    pub fn verify(
        &self,
        batch: &Batch,
        actor: &Actor,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Transition> {
        let action = GuardedAction::Verify;
        Self::require_state(batch, action, |s| s == BatchStatus::PendingVerification)?;
        self.require_role(batch, actor, action)?;
        if self.segregation_of_duties && actor.id == *batch.creator() {
            return Err(deny(batch, action, sod(actor, "maker")));
        }

        let mut next = batch.clone();
        next.stages.verified = Some(StageStamp::new(actor.id.clone(), now, notes));
        next.advance(BatchStatus::PendingApproval);
        Ok(Transition::status_only(next, batch.status))
    }

    /// PendingApproval -> Approved.
    pub fn approve(
        &self,
        batch: &Batch,
        actor: &Actor,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Transition> {
        let action = GuardedAction::Approve;
        Self::require_state(batch, action, |s| s == BatchStatus::PendingApproval)?;
        self.require_role(batch, actor, action)?;
        let verified_by_actor = batch
            .stages
            .verified
            .as_ref()
            .is_some_and(|stamp| stamp.actor == actor.id);
        if self.segregation_of_duties && verified_by_actor {
            return Err(deny(batch, action, sod(actor, "verifier")));
        }

        let mut next = batch.clone();
        next.stages.approved = Some(StageStamp::new(actor.id.clone(), now, notes));
        next.advance(BatchStatus::Approved);
        Ok(Transition::status_only(next, batch.status))
    }

    /// Approved -> Released. Every resource goes from reserved to in use.
    pub fn release(
        &self,
        batch: &Batch,
        actor: &Actor,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Transition> {
        let action = GuardedAction::Release;
        Self::require_state(batch, action, |s| s == BatchStatus::Approved)?;
        self.require_role(batch, actor, action)?;

        let resource_changes = batch
            .items
            .iter()
            .map(|item| {
                ResourceChange::new(
                    item.resource_id.clone(),
                    ResourceStatus::Reserved,
                    ResourceStatus::InUse,
                )
            })
            .collect();

        let mut next = batch.clone();
        next.stages.released = Some(StageStamp::new(actor.id.clone(), now, notes));
        next.advance(BatchStatus::Released);
        Ok(Transition::with_changes(next, batch.status, resource_changes))
    }

    /// Released/PartiallyReturned -> PartiallyReturned/Returned.
    ///
    /// Resources go back to the pool together, on the return that closes the
    /// batch.
    pub fn record_return(
        &self,
        batch: &Batch,
        actor: &Actor,
        returns: &[ItemReturn],
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Transition> {
        let action = GuardedAction::Return;
        Self::require_state(batch, action, BatchStatus::is_borrowed)?;
        self.require_role(batch, actor, action)?;

        let mut next = batch.clone();
        let freed = next.apply_returns(returns)?;
        next.stages.last_returned = Some(StageStamp::new(actor.id.clone(), now, notes));

        let resource_changes = freed
            .into_iter()
            .map(|resource| {
                ResourceChange::new(resource, ResourceStatus::InUse, ResourceStatus::Available)
            })
            .collect();
        Ok(Transition::with_changes(next, batch.status, resource_changes))
    }

    /// Any pre-release state -> Canceled. Reserved resources become available.
    ///
    /// The maker may always withdraw their own request.
    pub fn cancel(
        &self,
        batch: &Batch,
        actor: &Actor,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Transition> {
        let action = GuardedAction::Cancel;
        Self::require_state(batch, action, BatchStatus::is_cancelable)?;
        if actor.id != *batch.creator() {
            self.require_role(batch, actor, action)?;
        }

        let resource_changes = batch
            .items
            .iter()
            .map(|item| {
                ResourceChange::new(
                    item.resource_id.clone(),
                    ResourceStatus::Reserved,
                    ResourceStatus::Available,
                )
            })
            .collect();

        let mut next = batch.clone();
        next.stages.canceled = Some(StageStamp::new(actor.id.clone(), now, reason));
        next.advance(BatchStatus::Canceled);
        Ok(Transition::with_changes(next, batch.status, resource_changes))
    }

    /// Moves borrowed lines' return date later, producing one history entry per line.
    pub fn extend(
        &self,
        batch: &Batch,
        actor: &Actor,
        item_ids: &[BatchItemId],
        new_date: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Transition> {
        let action = GuardedAction::ExtendReturnDate;
        Self::require_state(batch, action, BatchStatus::is_borrowed)?;
        self.require_role(batch, actor, action)?;
        if reason.trim().is_empty() {
            return Err(WorkflowError::validation("an extension reason is required"));
        }

        let mut next = batch.clone();
        let previous = next.extend_items(item_ids, new_date)?;
        let extensions = previous
            .into_iter()
            .map(|(item, previous)| ExtensionRecord {
                batch: batch.id,
                item,
                previous,
                new: new_date,
                reason: reason.trim().to_string(),
                actor: actor.id.clone(),
                at: now,
            })
            .collect();

        Ok(Transition {
            extensions,
            ..Transition::status_only(next, batch.status)
        })
    }

    fn require_state(
        batch: &Batch,
        action: GuardedAction,
        allowed: impl Fn(BatchStatus) -> bool,
    ) -> WorkflowResult<()> {
        if allowed(batch.status) {
            Ok(())
        } else {
            Err(deny(
                batch,
                action,
                TransitionDenied::WrongState {
                    actual: batch.status,
                },
            ))
        }
    }

    fn require_role(&self, batch: &Batch, actor: &Actor, action: GuardedAction) -> WorkflowResult<()> {
        if self.policy.permits(actor, action) {
            Ok(())
        } else {
            Err(deny(
                batch,
                action,
                TransitionDenied::MissingRole {
                    actor: actor.id.clone(),
                    action,
                },
            ))
        }
    }
}

fn deny(batch: &Batch, action: GuardedAction, reason: TransitionDenied) -> WorkflowError {
    WorkflowError::InvalidTransition {
        reference: batch.reference.clone(),
        action,
        reason,
    }
}

fn sod(actor: &Actor, stage: &'static str) -> TransitionDenied {
    TransitionDenied::SegregationOfDuties {
        actor: actor.id.clone(),
        stage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::Role;
    use crate::types::{ActorId, ResourceId};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).single().expect("valid date")
    }

    fn actor(id: &str, roles: impl IntoIterator<Item = Role>) -> Actor {
        Actor::new(ActorId::try_new(id.to_string()).expect("valid actor"), roles)
    }

    fn draft(is_critical: bool) -> BatchDraft {
        let resource = |id: &str| ResourceId::try_new(id.to_string()).expect("valid resource");
        let line = |id: &str, quantity| BatchItem {
            id: BatchItemId::generate(),
            resource_id: resource(id),
            quantity,
            quantity_returned: 0,
            status: BatchStatus::PendingVerification,
            expected_return: now() + Duration::days(7),
            notes: None,
            return_condition: None,
        };
        BatchDraft {
            reference: "BRW-P1-2025-0001".parse().expect("valid reference"),
            partition: PartitionKey::try_new("P1".to_string()).expect("valid partition"),
            borrower: BorrowerInfo::named("Grace"),
            purpose: Some("site survey".to_string()),
            expected_return: now() + Duration::days(7),
            is_critical,
            items: vec![line("LEVEL-1", 1), line("TRIPOD-2", 2)],
            notes: None,
        }
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(RolePolicy::default(), true)
    }

    fn assert_denied(result: WorkflowResult<Transition>, expected: &TransitionDenied) {
        match result {
            Err(WorkflowError::InvalidTransition { reason, .. }) => assert_eq!(&reason, expected),
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    #[test]
    fn maker_without_fast_track_role_starts_full_path() {
        let maker = actor("maker", [Role::Maker]);

        let batch = engine().open(&maker, draft(false), now());

        assert_eq!(batch.status, BatchStatus::PendingVerification);
        assert!(!batch.streamlined);
        assert!(batch.stages.verified.is_none());
        assert!(batch.items.iter().all(|i| i.status == BatchStatus::PendingVerification));
    }

    #[test]
    fn authorizer_creating_non_critical_batch_is_streamlined() {
        let boss = actor("boss", [Role::Authorizer]);

        let batch = engine().open(&boss, draft(false), now());

        assert_eq!(batch.status, BatchStatus::Approved);
        assert!(batch.streamlined);
        assert_eq!(batch.stages.verified.as_ref().map(|s| &s.actor), Some(&boss.id));
        assert_eq!(batch.stages.approved.as_ref().map(|s| s.at), Some(now()));
    }

    #[test]
    fn critical_batch_never_streamlines() {
        let admin = actor("admin", [Role::Administrator, Role::Authorizer]);

        let batch = engine().open(&admin, draft(true), now());

        assert_eq!(batch.status, BatchStatus::PendingVerification);
    }

    #[test]
    fn approve_before_verify_is_refused() {
        let maker = actor("maker", [Role::Maker]);
        let boss = actor("boss", [Role::Authorizer]);
        let batch = engine().open(&maker, draft(false), now());

        let result = engine().approve(&batch, &boss, None, now());

        assert_denied(
            result,
            &TransitionDenied::WrongState {
                actual: BatchStatus::PendingVerification,
            },
        );
    }

    #[test]
    fn maker_cannot_verify_own_request() {
        let maker = actor("maker", [Role::Maker, Role::Verifier]);
        let batch = engine().open(&maker, draft(false), now());

        let result = engine().verify(&batch, &maker, None, now());

        assert_denied(result, &sod(&maker, "maker"));
    }

    #[test]
    fn segregation_can_be_disabled() {
        let maker = actor("maker", [Role::Maker, Role::Verifier]);
        let lenient = WorkflowEngine::new(RolePolicy::default(), false);
        let batch = lenient.open(&maker, draft(false), now());

        let verified = lenient.verify(&batch, &maker, None, now()).expect("allowed");

        assert_eq!(verified.batch.status, BatchStatus::PendingApproval);
    }

    #[test]
    fn verifier_cannot_also_approve() {
        let maker = actor("maker", [Role::Maker]);
        let both = actor("both", [Role::Verifier, Role::Authorizer]);
        let batch = engine().open(&maker, draft(false), now());
        let verified = engine().verify(&batch, &both, None, now()).expect("verify allowed");

        let result = engine().approve(&verified.batch, &both, None, now());

        assert_denied(result, &sod(&both, "verifier"));
    }

    #[test]
    fn release_reserves_nothing_new_and_marks_resources_in_use() {
        let boss = actor("boss", [Role::Authorizer]);
        let keeper = actor("keeper", [Role::Custodian]);
        let batch = engine().open(&boss, draft(false), now());

        let released = engine().release(&batch, &keeper, None, now()).expect("release allowed");

        assert_eq!(released.expected, BatchStatus::Approved);
        assert_eq!(released.batch.status, BatchStatus::Released);
        assert_eq!(released.resource_changes.len(), 2);
        assert!(released
            .resource_changes
            .iter()
            .all(|c| c.from == ResourceStatus::Reserved && c.to == ResourceStatus::InUse));
    }

    #[test]
    fn verifier_cannot_release() {
        let boss = actor("boss", [Role::Authorizer]);
        let checker = actor("checker", [Role::Verifier]);
        let batch = engine().open(&boss, draft(false), now());

        let result = engine().release(&batch, &checker, None, now());

        assert_denied(
            result,
            &TransitionDenied::MissingRole {
                actor: checker.id.clone(),
                action: GuardedAction::Release,
            },
        );
    }

    #[test]
    fn maker_may_cancel_own_request_without_a_cancel_role() {
        let maker = actor("maker", [Role::Maker]);
        let batch = engine().open(&maker, draft(false), now());

        let canceled = engine()
            .cancel(&batch, &maker, Some("no longer needed".to_string()), now())
            .expect("creator may cancel");

        assert_eq!(canceled.batch.status, BatchStatus::Canceled);
        assert_eq!(
            canceled.batch.stages.canceled.and_then(|s| s.notes).as_deref(),
            Some("no longer needed")
        );
        assert!(canceled
            .resource_changes
            .iter()
            .all(|c| c.to == ResourceStatus::Available));
    }

    #[test]
    fn released_batch_cannot_be_canceled() {
        let boss = actor("boss", [Role::Authorizer, Role::Custodian]);
        let batch = engine().open(&boss, draft(false), now());
        let released = engine().release(&batch, &boss, None, now()).expect("release allowed");

        let result = engine().cancel(&released.batch, &boss, None, now());

        assert_denied(
            result,
            &TransitionDenied::WrongState {
                actual: BatchStatus::Released,
            },
        );
    }

    #[test]
    fn resources_come_back_only_with_the_closing_return() {
        let boss = actor("boss", [Role::Authorizer, Role::Custodian]);
        let batch = engine().open(&boss, draft(false), now());
        let released = engine().release(&batch, &boss, None, now()).expect("release allowed");
        let (level, tripod) = (released.batch.items[0].id, released.batch.items[1].id);
        let give_back = |item_id, quantity| ItemReturn {
            item_id,
            quantity,
            condition: None,
        };

        let partial = engine()
            .record_return(&released.batch, &boss, &[give_back(level, 1)], None, now())
            .expect("return allowed");

        assert_eq!(partial.batch.status, BatchStatus::PartiallyReturned);
        assert!(partial.resource_changes.is_empty());

        let closing = engine()
            .record_return(&partial.batch, &boss, &[give_back(tripod, 2)], None, now())
            .expect("return allowed");

        assert_eq!(closing.batch.status, BatchStatus::Returned);
        assert_eq!(closing.expected, BatchStatus::PartiallyReturned);
        let freed: Vec<&str> = closing
            .resource_changes
            .iter()
            .map(|c| c.resource.as_ref())
            .collect();
        assert_eq!(freed, ["LEVEL-1", "TRIPOD-2"]);
        assert!(closing
            .resource_changes
            .iter()
            .all(|c| c.from == ResourceStatus::InUse && c.to == ResourceStatus::Available));
    }

    #[test]
    fn extension_requires_a_reason() {
        let boss = actor("boss", [Role::Authorizer, Role::Custodian]);
        let batch = engine().open(&boss, draft(false), now());
        let released = engine().release(&batch, &boss, None, now()).expect("release allowed");
        let item = released.batch.items[0].id;

        let result = engine().extend(
            &released.batch,
            &boss,
            &[item],
            now() + Duration::days(14),
            "  ",
            now(),
        );

        assert!(matches!(result, Err(WorkflowError::Validation(_))));
    }

    #[test]
    fn extension_produces_history_per_line() {
        let boss = actor("boss", [Role::Authorizer, Role::Custodian]);
        let batch = engine().open(&boss, draft(false), now());
        let released = engine().release(&batch, &boss, None, now()).expect("release allowed");
        let items: Vec<BatchItemId> = released.batch.items.iter().map(|i| i.id).collect();
        let new_date = now() + Duration::days(14);

        let transition = engine()
            .extend(&released.batch, &boss, &items, new_date, "survey delayed", now())
            .expect("extension allowed");
        let records = &transition.extensions;

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.new == new_date && r.reason == "survey delayed"));
        assert_eq!(transition.batch.expected_return, new_date);
        assert_eq!(transition.expected, BatchStatus::Released);
    }
}
