use std::sync::Arc;

use chrono::{TimeZone, Utc};
use toolcrib::{
    Actor, ActorId, BorrowerInfo, CreateBatchRequest, FixedClock, ItemRequest, Money, PartitionKey,
    ReservationService, ReservationStore, Resource, ResourceId, Role, ToolcribConfig,
};
use toolcrib_memory::InMemoryReservationStore;
use toolcrib_testing::chaos::{ChaosConfig, ChaosReservationStoreExt};

fn maker() -> Actor {
    Actor::new(
        ActorId::try_new("mira".to_string()).expect("valid actor id"),
        [Role::Maker],
    )
}

async fn seed<S: ReservationStore>(store: &S, id: &ResourceId) {
    store
        .register_resource(Resource::available(
            id.clone(),
            PartitionKey::try_new("OPS".to_string()).expect("valid partition"),
            "pressure gauge",
            Money::from_major(120),
        ))
        .await
        .expect("seed resource");
}

fn request(id: &ResourceId) -> CreateBatchRequest {
    CreateBatchRequest {
        borrower: BorrowerInfo::named("Night shift"),
        expected_return: Utc
            .with_ymd_and_hms(2025, 2, 20, 17, 0, 0)
            .single()
            .expect("valid timestamp"),
        purpose: None,
        items: vec![ItemRequest::new(id.clone(), 1)],
        notes: None,
    }
}

fn clock() -> Arc<FixedClock> {
    let now = Utc
        .with_ymd_and_hms(2025, 2, 10, 22, 0, 0)
        .single()
        .expect("valid timestamp");
    Arc::new(FixedClock::at(now))
}

#[tokio::test]
#[tracing_test::traced_test]
async fn sequence_fallback_is_logged_and_counted() {
    // Given: a store whose sequence counter is down
    let store = InMemoryReservationStore::new()
        .with_chaos(ChaosConfig::deterministic().with_sequence_failure_probability(1.0));
    let gauge = ResourceId::try_new("GAUGE-7".to_string()).expect("valid resource id");
    seed(&store, &gauge).await;
    let service = ReservationService::with_clock(store, ToolcribConfig::default(), clock());

    // When: a batch is created
    let batch = service
        .create_batch(&maker(), request(&gauge))
        .await
        .expect("fallback keeps creation available");

    // Then: the fallback is visible to operators
    assert!(batch.reference.is_fallback());
    assert!(
        logs_contain("sequence counter unavailable"),
        "fallback should be logged as a warning"
    );
    assert!(logs_contain(&batch.reference.to_string()));
    assert_eq!(service.metrics().snapshot().sequence_fallbacks, 1);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn committed_creation_emits_span_and_summary() {
    let store = InMemoryReservationStore::new();
    let gauge = ResourceId::try_new("GAUGE-8".to_string()).expect("valid resource id");
    seed(&store, &gauge).await;
    let service = ReservationService::with_clock(store, ToolcribConfig::default(), clock());

    service
        .create_batch(&maker(), request(&gauge))
        .await
        .expect("batch created");

    assert!(logs_contain("create_batch"));
    assert!(logs_contain("[service.create_batch] batch created"));
    assert!(logs_contain("BRW-OPS-2025-0001"));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn conflicts_are_logged_as_warnings() {
    let store = InMemoryReservationStore::new();
    let gauge = ResourceId::try_new("GAUGE-9".to_string()).expect("valid resource id");
    seed(&store, &gauge).await;
    let service = ReservationService::with_clock(store, ToolcribConfig::default(), clock());

    service
        .create_batch(&maker(), request(&gauge))
        .await
        .expect("first batch");
    let second = service.create_batch(&maker(), request(&gauge)).await;

    assert!(second.is_err());
    assert!(logs_contain("reservation conflict"));
    assert_eq!(service.metrics().snapshot().conflicts, 1);
}
