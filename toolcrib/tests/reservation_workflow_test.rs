//! End-to-end workflow tests through `ReservationService` on the in-memory
//! adapter.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use toolcrib::{
    Actor, ActorId, Batch, BatchStatus, BorrowerInfo, CreateBatchRequest, ErrorKind, FixedClock,
    ItemRequest, ItemReturn, Missing, Money, OperationResponse, PartitionKey, ReservationService,
    ReservationStore, Resource, ResourceId, ResourceStatus, Role, ToolcribConfig,
    TransitionDenied, WorkflowError,
};
use toolcrib_memory::InMemoryReservationStore;

struct Harness {
    service: ReservationService<InMemoryReservationStore>,
    clock: FixedClock,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 7, 8, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn actor(name: &str, roles: impl IntoIterator<Item = Role>) -> Actor {
    Actor::new(ActorId::try_new(name.to_string()).expect("valid actor id"), roles)
}

fn resource_id(name: &str) -> ResourceId {
    ResourceId::try_new(name.to_string()).expect("valid resource id")
}

impl Harness {
    async fn new(config: ToolcribConfig, pool: &[(&str, &str, u64)]) -> Self {
        let store = InMemoryReservationStore::new();
        for (id, partition, value) in pool {
            store
                .register_resource(Resource::available(
                    resource_id(id),
                    PartitionKey::try_new((*partition).to_string()).expect("valid partition"),
                    *id,
                    Money::from_major(*value),
                ))
                .await
                .expect("seed resource");
        }
        let clock = FixedClock::at(start());
        Self {
            service: ReservationService::with_clock(store, config, Arc::new(clock.clone())),
            clock,
        }
    }

    fn request(&self, lines: &[(&str, u32)]) -> CreateBatchRequest {
        CreateBatchRequest {
            borrower: BorrowerInfo {
                name: "Dana Okafor".to_string(),
                contact: Some("dana@example.org".to_string()),
                id: Some("EMP-0042".to_string()),
            },
            expected_return: start() + Duration::days(10),
            purpose: Some("bridge inspection".to_string()),
            items: lines
                .iter()
                .map(|(id, quantity)| ItemRequest::new(resource_id(id), *quantity))
                .collect(),
            notes: Some("urgent".to_string()),
        }
    }

    async fn status(&self, id: &str) -> ResourceStatus {
        self.service
            .find_resource(&resource_id(id))
            .await
            .expect("resource exists")
            .status
    }
}

fn pool() -> Vec<(&'static str, &'static str, u64)> {
    vec![
        ("LASER-1", "BRIDGE", 1_000),
        ("THERMO-1", "BRIDGE", 60_000),
        ("ROPE-1", "BRIDGE", 40),
        ("HELMET-9", "TUNNEL", 25),
    ]
}

#[tokio::test]
async fn full_approval_path_runs_from_creation_to_return() {
    // Given: a critical request from a maker
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;
    let maker = actor("mira", [Role::Maker]);
    let verifier = actor("vic", [Role::Verifier]);
    let authorizer = actor("ada", [Role::Authorizer]);
    let custodian = actor("cy", [Role::Custodian]);

    let batch = harness
        .service
        .create_batch(&maker, harness.request(&[("LASER-1", 1), ("THERMO-1", 2)]))
        .await
        .expect("batch created");
    assert_eq!(batch.reference.to_string(), "BRW-BRIDGE-2025-0001");
    assert!(batch.is_critical);
    assert_eq!(batch.total_items(), 2);
    assert_eq!(batch.total_quantity(), 3);
    assert_eq!(harness.status("THERMO-1").await, ResourceStatus::Reserved);

    // When: it walks verify, approve, release and two returns
    harness.clock.advance(Duration::hours(1));
    let batch = harness
        .service
        .verify(batch.id, &verifier, Some("checked calibration".to_string()))
        .await
        .expect("verified");
    assert_eq!(batch.status, BatchStatus::PendingApproval);

    let batch = harness
        .service
        .approve(batch.id, &authorizer, None)
        .await
        .expect("approved");
    let batch = harness
        .service
        .release(batch.id, &custodian, None)
        .await
        .expect("released");
    assert_eq!(harness.status("LASER-1").await, ResourceStatus::InUse);

    let laser = batch.items[0].id;
    let thermo = batch.items[1].id;
    let batch = harness
        .service
        .return_items(
            batch.id,
            &custodian,
            vec![
                ItemReturn {
                    item_id: laser,
                    quantity: 1,
                    condition: Some("lens scratched".to_string()),
                },
                ItemReturn {
                    item_id: thermo,
                    quantity: 1,
                    condition: None,
                },
            ],
            None,
        )
        .await
        .expect("first return");

    // Then: resources stay out until the whole batch is back
    assert_eq!(batch.status, BatchStatus::PartiallyReturned);
    assert_eq!(harness.status("LASER-1").await, ResourceStatus::InUse);
    assert_eq!(harness.status("THERMO-1").await, ResourceStatus::InUse);

    let batch = harness
        .service
        .return_items(
            batch.id,
            &custodian,
            vec![ItemReturn {
                item_id: thermo,
                quantity: 1,
                condition: None,
            }],
            Some("all back".to_string()),
        )
        .await
        .expect("second return");
    assert_eq!(batch.status, BatchStatus::Returned);
    assert_eq!(harness.status("LASER-1").await, ResourceStatus::Available);
    assert_eq!(harness.status("THERMO-1").await, ResourceStatus::Available);

    let stages = &batch.stages;
    assert_eq!(stages.created.actor.as_ref(), "mira");
    assert_eq!(
        stages.verified.as_ref().map(|s| s.actor.to_string()),
        Some("vic".to_string())
    );
    assert_eq!(
        stages.verified.as_ref().and_then(|s| s.notes.as_deref()),
        Some("checked calibration")
    );
    assert_eq!(
        batch.items[0].return_condition.as_deref(),
        Some("lens scratched")
    );
}

#[tokio::test]
async fn mixed_partitions_are_rejected_without_reserving_anything() {
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;
    let maker = actor("mira", [Role::Maker]);

    let error = harness
        .service
        .create_batch(&maker, harness.request(&[("ROPE-1", 1), ("HELMET-9", 1)]))
        .await
        .expect_err("items span two projects");

    assert_eq!(error.kind(), ErrorKind::ReservationConflict);
    assert_eq!(harness.status("ROPE-1").await, ResourceStatus::Available);
    assert_eq!(harness.service.store().batch_count(), 0);
}

#[tokio::test]
async fn malformed_requests_are_validation_errors() {
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;
    let maker = actor("mira", [Role::Maker]);

    let mut past_due = harness.request(&[("ROPE-1", 1)]);
    past_due.expected_return = start() - Duration::days(1);
    let mut nameless = harness.request(&[("ROPE-1", 1)]);
    nameless.borrower.name = "   ".to_string();
    let empty = harness.request(&[]);
    let duplicated = harness.request(&[("ROPE-1", 1), ("ROPE-1", 2)]);

    for request in [past_due, nameless, empty, duplicated] {
        let error = harness
            .service
            .create_batch(&maker, request)
            .await
            .expect_err("request is malformed");
        assert_eq!(error.kind(), ErrorKind::Validation, "{error}");
    }
    assert_eq!(harness.status("ROPE-1").await, ResourceStatus::Available);
}

#[tokio::test]
async fn zero_quantity_is_a_reservation_conflict() {
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;

    let error = harness
        .service
        .create_batch(&actor("mira", [Role::Maker]), harness.request(&[("ROPE-1", 0)]))
        .await
        .expect_err("quantity below one");

    assert_eq!(error.kind(), ErrorKind::ReservationConflict);
}

#[tokio::test]
async fn unknown_resources_and_batches_are_not_found() {
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;
    let maker = actor("mira", [Role::Maker]);

    let error = harness
        .service
        .create_batch(&maker, harness.request(&[("GHOST-1", 1)]))
        .await
        .expect_err("resource does not exist");
    assert!(matches!(error, WorkflowError::NotFound(Missing::Resource(_))));

    let error = harness
        .service
        .verify(toolcrib::BatchId::generate(), &actor("vic", [Role::Verifier]), None)
        .await
        .expect_err("batch does not exist");
    assert_eq!(error.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn missing_role_is_refused_after_state_check() {
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;
    let maker = actor("mira", [Role::Maker]);
    let batch = harness
        .service
        .create_batch(&maker, harness.request(&[("ROPE-1", 1)]))
        .await
        .expect("batch created");

    let error = harness
        .service
        .verify(batch.id, &actor("cy", [Role::Custodian]), None)
        .await
        .expect_err("custodians do not verify");

    assert!(matches!(
        error,
        WorkflowError::InvalidTransition {
            reason: TransitionDenied::MissingRole { .. },
            ..
        }
    ));
    assert_eq!(harness.service.metrics().snapshot().invalid_transitions, 1);
}

#[tokio::test]
async fn creator_cannot_verify_their_own_batch_unless_segregation_is_off() {
    let both = actor("sam", [Role::Maker, Role::Verifier]);

    let strict = Harness::new(ToolcribConfig::default(), &pool()).await;
    let batch = strict
        .service
        .create_batch(&both, strict.request(&[("ROPE-1", 1)]))
        .await
        .expect("batch created");
    let refused = strict.service.verify(batch.id, &both, None).await;
    assert!(matches!(
        refused,
        Err(WorkflowError::InvalidTransition {
            reason: TransitionDenied::SegregationOfDuties { .. },
            ..
        })
    ));

    let relaxed_config = ToolcribConfig {
        segregation_of_duties: false,
        ..ToolcribConfig::default()
    };
    let relaxed = Harness::new(relaxed_config, &pool()).await;
    let batch = relaxed
        .service
        .create_batch(&both, relaxed.request(&[("ROPE-1", 1)]))
        .await
        .expect("batch created");
    let verified = relaxed
        .service
        .verify(batch.id, &both, None)
        .await
        .expect("segregation disabled");
    assert_eq!(verified.status, BatchStatus::PendingApproval);
}

#[tokio::test]
async fn released_batches_cannot_be_canceled() {
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;
    let authorizer = actor("ada", [Role::Authorizer]);
    let batch = harness
        .service
        .create_batch(&authorizer, harness.request(&[("ROPE-1", 1)]))
        .await
        .expect("streamlined batch");
    assert_eq!(batch.status, BatchStatus::Approved);
    harness
        .service
        .release(batch.id, &actor("cy", [Role::Custodian]), None)
        .await
        .expect("released");

    let error = harness
        .service
        .cancel(batch.id, &authorizer, Some("changed plans".to_string()))
        .await
        .expect_err("borrowed batches are returned, not canceled");

    assert!(matches!(
        error,
        WorkflowError::InvalidTransition {
            reason: TransitionDenied::WrongState {
                actual: BatchStatus::Released
            },
            ..
        }
    ));
    assert_eq!(harness.status("ROPE-1").await, ResourceStatus::InUse);
}

#[tokio::test]
async fn overdue_lines_follow_the_clock_and_extensions() {
    // Given: a released batch
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;
    let custodian = actor("cy", [Role::Custodian]);
    let batch = harness
        .service
        .create_batch(&actor("ada", [Role::Authorizer]), harness.request(&[("ROPE-1", 2), ("LASER-1", 1)]))
        .await
        .expect("batch created");
    let batch = harness
        .service
        .release(batch.id, &custodian, None)
        .await
        .expect("released");

    // When: the clock passes the due date
    harness.clock.advance(Duration::days(11));
    let overdue = harness.service.overdue_items(batch.id).await.expect("overdue");
    assert_eq!(overdue.len(), 2);

    // And: one line is extended
    let rope = batch.items[0].id;
    let new_date = start() + Duration::days(20);
    let outcome = harness
        .service
        .extend_return_date(batch.id, vec![rope], new_date, "weather delay".to_string(), &custodian)
        .await
        .expect("extended");

    // Then: only the other line is still overdue and the batch date moved
    assert_eq!(outcome.batch.expected_return, new_date);
    let overdue = harness.service.overdue_items(batch.id).await.expect("overdue");
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].resource_id, resource_id("LASER-1"));

    let history = harness
        .service
        .extension_history(batch.id)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].item, rope);
    assert_eq!(history[0].actor.as_ref(), "cy");
}

#[tokio::test]
async fn extension_requires_a_reason() {
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;
    let custodian = actor("cy", [Role::Custodian]);
    let batch = harness
        .service
        .create_batch(&actor("ada", [Role::Authorizer]), harness.request(&[("ROPE-1", 1)]))
        .await
        .expect("batch created");
    let batch = harness
        .service
        .release(batch.id, &custodian, None)
        .await
        .expect("released");

    let error = harness
        .service
        .extend_return_date(
            batch.id,
            vec![batch.items[0].id],
            batch.expected_return + Duration::days(1),
            "  ".to_string(),
            &custodian,
        )
        .await
        .expect_err("blank reason");

    assert_eq!(error.kind(), ErrorKind::Validation);
    assert!(harness
        .service
        .extension_history(batch.id)
        .await
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn responses_carry_a_message_for_every_outcome() {
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;
    let maker = actor("mira", [Role::Maker]);

    let created: OperationResponse = harness
        .service
        .create_batch(&maker, harness.request(&[("ROPE-1", 1)]))
        .await
        .into();
    assert!(created.success);
    assert_eq!(
        created.message,
        "Batch BRW-BRIDGE-2025-0001 is now pending_verification"
    );

    let conflict: OperationResponse = harness
        .service
        .create_batch(&maker, harness.request(&[("ROPE-1", 1)]))
        .await
        .into();
    assert!(!conflict.success);
    assert_eq!(conflict.error, Some(ErrorKind::ReservationConflict));
    assert!(conflict.message.contains("BRW-BRIDGE-2025-0001"));
    assert!(conflict.batch.is_none());
}

#[tokio::test]
async fn batches_can_be_found_by_reference() {
    let harness = Harness::new(ToolcribConfig::default(), &pool()).await;
    let batch: Batch = harness
        .service
        .create_batch(&actor("mira", [Role::Maker]), harness.request(&[("ROPE-1", 1)]))
        .await
        .expect("batch created");

    let parsed = "BRW-BRIDGE-2025-0001".parse().expect("valid reference");
    let found = harness
        .service
        .find_by_reference(&parsed)
        .await
        .expect("lookup")
        .expect("batch exists");

    assert_eq!(found, batch);
}
