//! Behavior every store adapter must exhibit.
//!
//! Each scenario builds a [`ReservationService`] over a fresh store from
//! `make_store` and drives it the way a collaborator would. Scenarios work in
//! their own partition, so they can share one database.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::join_all;
use uuid::Uuid;

use toolcrib::{
    Actor, ActorId, Batch, BatchStatus, BorrowerInfo, ConflictReason, CreateBatchRequest,
    FixedClock, ItemRequest, ItemReturn, Money, PartitionKey, ReferenceNumber,
    ReservationService, ReservationStore, Resource, ResourceId, ResourceStatus, Role,
    SequenceNumber, StoreError, ToolcribConfig, TransitionDenied, WorkflowError, WorkflowResult,
};

use crate::chaos::{ChaosConfig, ChaosReservationStoreExt};

const YEAR: i32 = 2025;

/// A contract scenario that did not hold.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn workflow_error(scenario: &'static str, operation: &'static str, error: &WorkflowError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: &StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} store call returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn opened_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(YEAR, 3, 3, 9, 0, 0)
        .single()
        .expect("valid contract timestamp")
}

fn unique_partition() -> PartitionKey {
    let token = Uuid::now_v7().simple().to_string();
    PartitionKey::try_new(format!("P{}", &token[16..])).expect("valid partition key")
}

fn actor(name: &str, roles: impl IntoIterator<Item = Role>) -> Actor {
    Actor::new(
        ActorId::try_new(name.to_string()).expect("valid actor id"),
        roles,
    )
}

fn maker() -> Actor {
    actor("maker", [Role::Maker])
}

fn authorizer() -> Actor {
    actor("authorizer", [Role::Authorizer])
}

fn custodian() -> Actor {
    actor("custodian", [Role::Custodian])
}

struct Fixture<S: ReservationStore> {
    scenario: &'static str,
    service: ReservationService<S>,
    partition: PartitionKey,
}

impl<S: ReservationStore> Fixture<S> {
    fn new(scenario: &'static str, store: S) -> Self {
        Self {
            scenario,
            service: ReservationService::with_clock(
                store,
                ToolcribConfig::default(),
                Arc::new(FixedClock::at(opened_at())),
            ),
            partition: unique_partition(),
        }
    }

    async fn seed(
        &self,
        name: &str,
        value: u64,
        status: ResourceStatus,
    ) -> Result<ResourceId, ContractTestFailure> {
        let id = ResourceId::try_new(format!("{}-{name}", self.partition))
            .expect("valid resource id");
        let mut resource =
            Resource::available(id.clone(), self.partition.clone(), name, Money::from_major(value));
        resource.status = status;
        self.service
            .store()
            .register_resource(resource)
            .await
            .map_err(|error| ContractTestFailure::store_error(self.scenario, "register_resource", &error))?;
        Ok(id)
    }

    async fn seed_available(&self, name: &str, value: u64) -> Result<ResourceId, ContractTestFailure> {
        self.seed(name, value, ResourceStatus::Available).await
    }

    fn request(&self, lines: &[(&ResourceId, u32)]) -> CreateBatchRequest {
        CreateBatchRequest {
            borrower: BorrowerInfo::named(format!("crew of {}", self.partition)),
            expected_return: opened_at() + Duration::days(14),
            purpose: Some("contract scenario".to_string()),
            items: lines
                .iter()
                .map(|(id, quantity)| ItemRequest::new((*id).clone(), *quantity))
                .collect(),
            notes: None,
        }
    }

    fn reference(&self, sequence: u32) -> ReferenceNumber {
        ReferenceNumber::sequential(
            "BRW",
            self.partition.clone(),
            YEAR,
            SequenceNumber::try_new(sequence).expect("valid sequence number"),
        )
    }

    async fn create(
        &self,
        actor: &Actor,
        lines: &[(&ResourceId, u32)],
    ) -> Result<Batch, ContractTestFailure> {
        self.service
            .create_batch(actor, self.request(lines))
            .await
            .map_err(|error| self.unexpected("create_batch", &error))
    }

    async fn status_of(&self, id: &ResourceId) -> Result<ResourceStatus, ContractTestFailure> {
        self.service
            .find_resource(id)
            .await
            .map(|resource| resource.status)
            .map_err(|error| self.unexpected("find_resource", &error))
    }

    async fn expect_status(
        &self,
        id: &ResourceId,
        expected: ResourceStatus,
    ) -> ContractTestResult {
        let actual = self.status_of(id).await?;
        if actual == expected {
            Ok(())
        } else {
            Err(self.fail(format!("resource {id} is {actual}, expected {expected}")))
        }
    }

    fn unexpected(&self, operation: &'static str, error: &WorkflowError) -> ContractTestFailure {
        ContractTestFailure::workflow_error(self.scenario, operation, error)
    }

    fn fail(&self, detail: impl Into<String>) -> ContractTestFailure {
        ContractTestFailure::assertion(self.scenario, detail)
    }
}

fn conflict_of(
    scenario: &'static str,
    result: WorkflowResult<Batch>,
) -> Result<ConflictReason, ContractTestFailure> {
    match result {
        Err(WorkflowError::ReservationConflict(reason)) => Ok(reason),
        Err(other) => Err(ContractTestFailure::workflow_error(scenario, "create_batch", &other)),
        Ok(batch) => Err(ContractTestFailure::assertion(
            scenario,
            format!("expected a reservation conflict, but {} was created", batch.reference),
        )),
    }
}

/// Two lines, one above the critical threshold: the batch is critical, starts
/// at `PendingVerification` and takes the first reference of its partition.
/// A second request for the same resources names the first batch.
pub async fn test_critical_batch_reference<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "critical_batch_reference";

    let fixture = Fixture::new(SCENARIO, make_store());
    let drill = fixture.seed_available("DRILL", 1_000).await?;
    let scope = fixture.seed_available("SCOPE", 60_000).await?;

    let first = fixture
        .create(&authorizer(), &[(&drill, 1), (&scope, 1)])
        .await?;

    if !first.is_critical || first.status != BatchStatus::PendingVerification {
        return Err(fixture.fail(format!(
            "expected a critical batch at pending_verification, got critical={} status={}",
            first.is_critical, first.status
        )));
    }
    if first.reference != fixture.reference(1) {
        return Err(fixture.fail(format!(
            "expected reference {}, got {}",
            fixture.reference(1),
            first.reference
        )));
    }

    let second = fixture
        .service
        .create_batch(&authorizer(), fixture.request(&[(&drill, 1), (&scope, 1)]))
        .await;
    match conflict_of(SCENARIO, second)? {
        ConflictReason::AlreadyReserved { holder, .. } if holder == first.reference => Ok(()),
        other => Err(fixture.fail(format!(
            "expected conflict naming {}, got: {other}",
            first.reference
        ))),
    }
}

/// Two concurrent requests for the same resource: exactly one wins.
pub async fn test_concurrent_double_booking<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "concurrent_double_booking";

    let fixture = Fixture::new(SCENARIO, make_store());
    let tripod = fixture.seed_available("TRIPOD", 300).await?;
    let maker = maker();

    let attempts = (0..2).map(|_| {
        fixture
            .service
            .create_batch(&maker, fixture.request(&[(&tripod, 1)]))
    });
    let results = join_all(attempts).await;

    let mut winners = Vec::new();
    let mut conflicts = Vec::new();
    for result in results {
        match result {
            Ok(batch) => winners.push(batch),
            Err(WorkflowError::ReservationConflict(reason)) => conflicts.push(reason),
            Err(other) => return Err(fixture.unexpected("create_batch", &other)),
        }
    }

    if winners.len() != 1 || conflicts.len() != 1 {
        return Err(fixture.fail(format!(
            "expected one winner and one conflict, got {} and {}",
            winners.len(),
            conflicts.len()
        )));
    }
    match &conflicts[0] {
        ConflictReason::AlreadyReserved { holder, .. } if *holder == winners[0].reference => {}
        other => {
            return Err(fixture.fail(format!(
                "conflict should name {}, got: {other}",
                winners[0].reference
            )))
        }
    }
    fixture
        .expect_status(&tripod, ResourceStatus::Reserved)
        .await
}

/// Concurrent creations in one partition get distinct sequence numbers, and
/// later creations get higher ones.
pub async fn test_sequence_monotonicity<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "sequence_monotonicity";
    const BATCHES: usize = 8;

    let fixture = Fixture::new(SCENARIO, make_store());
    let mut resources = Vec::with_capacity(BATCHES + 1);
    for index in 0..=BATCHES {
        resources.push(fixture.seed_available(&format!("CABLE{index}"), 20).await?);
    }
    let maker = maker();

    let attempts = resources[..BATCHES].iter().map(|resource| {
        fixture
            .service
            .create_batch(&maker, fixture.request(&[(resource, 1)]))
    });
    let mut issued = Vec::with_capacity(BATCHES);
    for result in join_all(attempts).await {
        let batch = result.map_err(|error| fixture.unexpected("create_batch", &error))?;
        let sequence = batch
            .reference
            .sequence()
            .ok_or_else(|| fixture.fail(format!("{} is not sequential", batch.reference)))?;
        issued.push(sequence.into_inner());
    }

    issued.sort_unstable();
    if issued.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(fixture.fail(format!("sequence numbers repeat: {issued:?}")));
    }

    let last = fixture.create(&maker, &[(&resources[BATCHES], 1)]).await?;
    let last_sequence = last.reference.sequence().map(SequenceNumber::into_inner);
    match (last_sequence, issued.last()) {
        (Some(later), Some(&highest)) if later > highest => Ok(()),
        (later, highest) => Err(fixture.fail(format!(
            "later creation got {later:?}, earlier maximum was {highest:?}"
        ))),
    }
}

/// The third of five lines fails validation: nothing is reserved, no batch
/// exists, and the next creation still gets the first reference.
pub async fn test_rollback_atomicity<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "rollback_atomicity";

    let fixture = Fixture::new(SCENARIO, make_store());
    let mut resources = Vec::new();
    for index in 1..=5 {
        let status = if index == 3 {
            ResourceStatus::Unavailable
        } else {
            ResourceStatus::Available
        };
        resources.push(fixture.seed(&format!("LAMP{index}"), 50, status).await?);
    }
    let lines: Vec<_> = resources.iter().map(|id| (id, 1)).collect();

    let result = fixture
        .service
        .create_batch(&maker(), fixture.request(&lines))
        .await;
    match conflict_of(SCENARIO, result)? {
        ConflictReason::Unavailable { resource, .. } if resource == resources[2] => {}
        other => return Err(fixture.fail(format!("unexpected conflict: {other}"))),
    }

    for (index, id) in resources.iter().enumerate() {
        let expected = if index == 2 {
            ResourceStatus::Unavailable
        } else {
            ResourceStatus::Available
        };
        fixture.expect_status(id, expected).await?;
    }
    let leaked = fixture
        .service
        .find_by_reference(&fixture.reference(1))
        .await
        .map_err(|error| fixture.unexpected("find_by_reference", &error))?;
    if let Some(batch) = leaked {
        return Err(fixture.fail(format!("failed creation left batch {}", batch.id)));
    }

    let retry: Vec<_> = lines
        .into_iter()
        .enumerate()
        .filter(|(index, _)| *index != 2)
        .map(|(_, line)| line)
        .collect();
    let batch = fixture.create(&maker(), &retry).await?;
    if batch.reference == fixture.reference(1) {
        Ok(())
    } else {
        Err(fixture.fail(format!(
            "expected the first reference after rollback, got {}",
            batch.reference
        )))
    }
}

/// A critical line forces the full path even for a fast-track actor.
pub async fn test_criticality_forces_full_path<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "criticality_forces_full_path";

    let fixture = Fixture::new(SCENARIO, make_store());
    let analyzer = fixture.seed_available("ANALYZER", 75_000).await?;
    let clamp = fixture.seed_available("CLAMP", 15).await?;
    let admin = actor("admin", [Role::Administrator]);

    let critical = fixture.create(&admin, &[(&analyzer, 1)]).await?;
    if critical.status != BatchStatus::PendingVerification || critical.streamlined {
        return Err(fixture.fail(format!(
            "critical batch took the streamlined path: status={}",
            critical.status
        )));
    }

    let routine = fixture.create(&admin, &[(&clamp, 1)]).await?;
    if routine.status != BatchStatus::Approved || !routine.streamlined {
        return Err(fixture.fail(format!(
            "non-critical fast-track batch should be approved, got {}",
            routine.status
        )));
    }
    if routine.stages.verified.is_none() || routine.stages.approved.is_none() {
        return Err(fixture.fail("streamlined batch is missing its stage stamps"));
    }
    Ok(())
}

/// Returns spread over several calls reach `Returned` only when every unit is
/// back, and free the resource only then.
pub async fn test_partial_return_convergence<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "partial_return_convergence";

    let fixture = Fixture::new(SCENARIO, make_store());
    let radios = fixture.seed_available("RADIOS", 400).await?;
    let custodian = custodian();

    let batch = fixture.create(&authorizer(), &[(&radios, 3)]).await?;
    let batch = fixture
        .service
        .release(batch.id, &custodian, None)
        .await
        .map_err(|error| fixture.unexpected("release", &error))?;
    fixture.expect_status(&radios, ResourceStatus::InUse).await?;
    let line = batch.items[0].id;

    for (quantity, expected) in [
        (1, BatchStatus::PartiallyReturned),
        (1, BatchStatus::PartiallyReturned),
        (1, BatchStatus::Returned),
    ] {
        let after = fixture
            .service
            .return_items(
                batch.id,
                &custodian,
                vec![ItemReturn {
                    item_id: line,
                    quantity,
                    condition: Some("good".to_string()),
                }],
                None,
            )
            .await
            .map_err(|error| fixture.unexpected("return_items", &error))?;
        if after.status != expected {
            return Err(fixture.fail(format!(
                "after returning {} of 3, status is {}, expected {expected}",
                after.items[0].quantity_returned, after.status
            )));
        }
        if expected != BatchStatus::Returned {
            fixture.expect_status(&radios, ResourceStatus::InUse).await?;
        }
    }

    fixture
        .expect_status(&radios, ResourceStatus::Available)
        .await
}

/// A two-line batch whose first line is fully back still holds both
/// resources: a new request for that resource conflicts until the batch is
/// `Returned`, and succeeds afterwards.
pub async fn test_partially_returned_batch_keeps_resources<F, S>(
    make_store: F,
) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "partially_returned_batch_keeps_resources";

    let fixture = Fixture::new(SCENARIO, make_store());
    let anchor = fixture.seed_available("ANCHOR", 150).await?;
    let belay = fixture.seed_available("BELAY", 90).await?;
    let custodian = custodian();

    let batch = fixture
        .create(&authorizer(), &[(&anchor, 1), (&belay, 1)])
        .await?;
    let batch = fixture
        .service
        .release(batch.id, &custodian, None)
        .await
        .map_err(|error| fixture.unexpected("release", &error))?;
    let (anchor_line, belay_line) = (batch.items[0].id, batch.items[1].id);

    let give_back = |item_id| {
        fixture.service.return_items(
            batch.id,
            &custodian,
            vec![ItemReturn {
                item_id,
                quantity: 1,
                condition: None,
            }],
            None,
        )
    };

    let after = give_back(anchor_line)
        .await
        .map_err(|error| fixture.unexpected("return_items", &error))?;
    if after.status != BatchStatus::PartiallyReturned {
        return Err(fixture.fail(format!(
            "after returning one of two lines, status is {}",
            after.status
        )));
    }
    fixture.expect_status(&anchor, ResourceStatus::InUse).await?;
    fixture.expect_status(&belay, ResourceStatus::InUse).await?;

    let premature = fixture
        .service
        .create_batch(&maker(), fixture.request(&[(&anchor, 1)]))
        .await;
    match conflict_of(SCENARIO, premature)? {
        ConflictReason::AlreadyReserved { resource, holder }
            if resource == anchor && holder == batch.reference => {}
        other => {
            return Err(fixture.fail(format!(
                "expected {} to be held by {}, got: {other}",
                anchor, batch.reference
            )))
        }
    }

    let after = give_back(belay_line)
        .await
        .map_err(|error| fixture.unexpected("return_items", &error))?;
    if after.status != BatchStatus::Returned {
        return Err(fixture.fail(format!(
            "after returning every line, status is {}",
            after.status
        )));
    }
    fixture
        .expect_status(&anchor, ResourceStatus::Available)
        .await?;
    fixture.expect_status(&belay, ResourceStatus::Available).await?;

    fixture.create(&maker(), &[(&anchor, 1)]).await.map(|_| ())
}

/// Guards refuse out-of-order and self-approved transitions without touching
/// the stored batch.
pub async fn test_transition_guard_enforcement<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "transition_guard_enforcement";

    let fixture = Fixture::new(SCENARIO, make_store());
    let saw = fixture.seed_available("SAW", 120).await?;
    let batch = fixture.create(&maker(), &[(&saw, 1)]).await?;

    let early = fixture.service.approve(batch.id, &authorizer(), None).await;
    match early {
        Err(WorkflowError::InvalidTransition {
            reason: TransitionDenied::WrongState { actual },
            ..
        }) if actual == BatchStatus::PendingVerification => {}
        Err(other) => return Err(fixture.unexpected("approve", &other)),
        Ok(batch) => {
            return Err(fixture.fail(format!(
                "approve on pending_verification succeeded: {}",
                batch.status
            )))
        }
    }
    let stored = fixture
        .service
        .find_batch(batch.id)
        .await
        .map_err(|error| fixture.unexpected("find_batch", &error))?;
    if stored != batch {
        return Err(fixture.fail("refused approval modified the stored batch"));
    }

    let dual = actor("dual", [Role::Verifier, Role::Authorizer]);
    fixture
        .service
        .verify(batch.id, &dual, None)
        .await
        .map_err(|error| fixture.unexpected("verify", &error))?;
    match fixture.service.approve(batch.id, &dual, None).await {
        Err(WorkflowError::InvalidTransition {
            reason: TransitionDenied::SegregationOfDuties { .. },
            ..
        }) => Ok(()),
        Err(other) => Err(fixture.unexpected("approve", &other)),
        Ok(_) => Err(fixture.fail("verifier approved their own verification")),
    }
}

/// Canceling before release frees every reserved resource.
pub async fn test_cancel_releases_resources<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "cancel_releases_resources";

    let fixture = Fixture::new(SCENARIO, make_store());
    let ladder = fixture.seed_available("LADDER", 90).await?;
    let harness = fixture.seed_available("HARNESS", 70).await?;
    let maker = maker();

    let batch = fixture
        .create(&maker, &[(&ladder, 1), (&harness, 2)])
        .await?;
    fixture.expect_status(&ladder, ResourceStatus::Reserved).await?;

    let canceled = fixture
        .service
        .cancel(batch.id, &maker, Some("site visit postponed".to_string()))
        .await
        .map_err(|error| fixture.unexpected("cancel", &error))?;
    if canceled.status != BatchStatus::Canceled {
        return Err(fixture.fail(format!("expected canceled, got {}", canceled.status)));
    }
    fixture.expect_status(&ladder, ResourceStatus::Available).await?;
    fixture
        .expect_status(&harness, ResourceStatus::Available)
        .await?;

    fixture.create(&maker, &[(&ladder, 1)]).await.map(|_| ())
}

/// Extensions move the line and batch dates and persist a history entry.
pub async fn test_extension_history<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "extension_history";

    let fixture = Fixture::new(SCENARIO, make_store());
    let generator = fixture.seed_available("GENERATOR", 2_500).await?;
    let custodian = custodian();

    let batch = fixture.create(&authorizer(), &[(&generator, 1)]).await?;
    let batch = fixture
        .service
        .release(batch.id, &custodian, None)
        .await
        .map_err(|error| fixture.unexpected("release", &error))?;
    let new_date = batch.expected_return + Duration::days(7);

    let outcome = fixture
        .service
        .extend_return_date(
            batch.id,
            vec![batch.items[0].id],
            new_date,
            "survey overran".to_string(),
            &custodian,
        )
        .await
        .map_err(|error| fixture.unexpected("extend_return_date", &error))?;
    if outcome.batch.expected_return != new_date || outcome.records.len() != 1 {
        return Err(fixture.fail("extension did not move the batch date"));
    }

    let history = fixture
        .service
        .extension_history(batch.id)
        .await
        .map_err(|error| fixture.unexpected("extension_history", &error))?;
    match history.as_slice() {
        [entry]
            if entry.previous == batch.expected_return
                && entry.new == new_date
                && entry.reason == "survey overran" =>
        {
            Ok(())
        }
        other => Err(fixture.fail(format!("unexpected extension history: {other:?}"))),
    }
}

/// A failing sequence counter degrades to a fallback reference that the
/// store persists and can look up.
pub async fn test_sequence_fallback<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ReservationStore,
{
    const SCENARIO: &str = "sequence_fallback";

    let store = make_store()
        .with_chaos(ChaosConfig::deterministic().with_sequence_failure_probability(1.0));
    let fixture = Fixture::new(SCENARIO, store);
    let meter = fixture.seed_available("METER", 60).await?;

    let batch = fixture.create(&maker(), &[(&meter, 1)]).await?;
    let expected_prefix = format!("BRW-{}-{YEAR}-X", fixture.partition);
    if !batch.reference.is_fallback() || !batch.reference.to_string().starts_with(&expected_prefix) {
        return Err(fixture.fail(format!(
            "expected a fallback reference, got {}",
            batch.reference
        )));
    }
    if fixture.service.metrics().snapshot().sequence_fallbacks != 1 {
        return Err(fixture.fail("fallback was not counted"));
    }

    let found = fixture
        .service
        .find_by_reference(&batch.reference)
        .await
        .map_err(|error| fixture.unexpected("find_by_reference", &error))?;
    match found {
        Some(stored) if stored.id == batch.id => Ok(()),
        _ => Err(fixture.fail("fallback reference cannot be looked up")),
    }
}

/// Generates one test per contract scenario for a store adapter.
///
/// ```ignore
/// toolcrib_testing::reservation_store_contract_tests! {
///     suite = in_memory,
///     make_store = toolcrib_memory::InMemoryReservationStore::new,
/// }
/// ```
#[macro_export]
macro_rules! reservation_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_cancel_releases_resources, test_concurrent_double_booking,
                test_critical_batch_reference, test_criticality_forces_full_path,
                test_extension_history, test_partial_return_convergence,
                test_partially_returned_batch_keeps_resources,
                test_rollback_atomicity, test_sequence_fallback, test_sequence_monotonicity,
                test_transition_guard_enforcement,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn critical_batch_reference_contract() {
                test_critical_batch_reference($make_store)
                    .await
                    .expect("reservation store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_double_booking_contract() {
                test_concurrent_double_booking($make_store)
                    .await
                    .expect("reservation store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn sequence_monotonicity_contract() {
                test_sequence_monotonicity($make_store)
                    .await
                    .expect("reservation store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn rollback_atomicity_contract() {
                test_rollback_atomicity($make_store)
                    .await
                    .expect("reservation store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn criticality_forces_full_path_contract() {
                test_criticality_forces_full_path($make_store)
                    .await
                    .expect("reservation store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn partial_return_convergence_contract() {
                test_partial_return_convergence($make_store)
                    .await
                    .expect("reservation store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn partially_returned_batch_keeps_resources_contract() {
                test_partially_returned_batch_keeps_resources($make_store)
                    .await
                    .expect("reservation store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn transition_guard_enforcement_contract() {
                test_transition_guard_enforcement($make_store)
                    .await
                    .expect("reservation store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn cancel_releases_resources_contract() {
                test_cancel_releases_resources($make_store)
                    .await
                    .expect("reservation store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn extension_history_contract() {
                test_extension_history($make_store)
                    .await
                    .expect("reservation store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn sequence_fallback_contract() {
                test_sequence_fallback($make_store)
                    .await
                    .expect("reservation store contract failed");
            }
        }
    };
}

pub use reservation_store_contract_tests;
