//! Fault injection for reservation stores.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

use toolcrib::{
    Batch, BatchId, BatchStatus, ExtensionRecord, HolderRef, Operation, ReferenceNumber,
    ReservationStore, Resource, ResourceId, ResourceStatus, SequenceKey, SequenceNumber,
    StoreError, StoreResult, StoreTransaction,
};

/// Injection rate in `[0.0, 1.0]`.
///
/// ```ignore
/// use toolcrib_testing::chaos::Probability;
///
/// assert!(Probability::try_new(0.5).is_ok());
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

fn clamped(probability: f32) -> Probability {
    Probability::try_new(probability.clamp(0.0, 1.0)).expect("clamped value is always valid")
}

/// Which faults to inject, and how often.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    connection_failure_probability: Probability,
    sequence_failure_probability: Probability,
    commit_deadlocks: u32,
    lost_commit_acks: u32,
}

impl ChaosConfig {
    /// No faults, reproducible random draws.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// `begin` fails with a transient connection error at this rate.
    pub fn with_connection_failure_probability(mut self, probability: f32) -> Self {
        self.connection_failure_probability = clamped(probability);
        self
    }

    /// `next_sequence` fails at this rate. The transaction stays usable.
    pub fn with_sequence_failure_probability(mut self, probability: f32) -> Self {
        self.sequence_failure_probability = clamped(probability);
        self
    }

    /// The next `count` commits roll back and report a deadlock.
    pub const fn with_commit_deadlocks(mut self, count: u32) -> Self {
        self.commit_deadlocks = count;
        self
    }

    /// The next `count` commits are applied, then report a lost connection.
    pub const fn with_lost_commit_acks(mut self, count: u32) -> Self {
        self.lost_commit_acks = count;
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            connection_failure_probability: Probability::try_new(0.0)
                .expect("0.0 is valid probability"),
            sequence_failure_probability: Probability::try_new(0.0)
                .expect("0.0 is valid probability"),
            commit_deadlocks: 0,
            lost_commit_acks: 0,
        }
    }
}

/// Adds [`ChaosReservationStore`] wrapping to any store.
pub trait ChaosReservationStoreExt: Sized {
    /// Wraps `self` so that it fails according to `config`.
    fn with_chaos(self, config: ChaosConfig) -> ChaosReservationStore<Self>;
}

impl<S: ReservationStore> ChaosReservationStoreExt for S {
    fn with_chaos(self, config: ChaosConfig) -> ChaosReservationStore<Self> {
        ChaosReservationStore::new(self, config)
    }
}

#[derive(Debug)]
struct ChaosState {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    commit_deadlocks_left: AtomicU32,
    lost_commit_acks_left: AtomicU32,
    injected: AtomicU32,
}

impl ChaosState {
    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f32 = probability.into();
        let hit = if probability <= 0.0 {
            false
        } else if probability >= 1.0 {
            true
        } else {
            self.rng.lock().random_bool(f64::from(probability))
        };
        if hit {
            self.injected.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    fn take_commit_deadlock(&self) -> bool {
        self.take(&self.commit_deadlocks_left)
    }

    fn take_lost_commit_ack(&self) -> bool {
        self.take(&self.lost_commit_acks_left)
    }

    fn take(&self, budget: &AtomicU32) -> bool {
        let taken = budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if taken {
            self.injected.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }
}

/// A store that delegates to `S` and fails on purpose.
#[derive(Debug)]
pub struct ChaosReservationStore<S> {
    store: S,
    state: Arc<ChaosState>,
}

impl<S> ChaosReservationStore<S> {
    /// Wraps `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };
        Self {
            store,
            state: Arc::new(ChaosState {
                commit_deadlocks_left: AtomicU32::new(config.commit_deadlocks),
                lost_commit_acks_left: AtomicU32::new(config.lost_commit_acks),
                config,
                rng: Mutex::new(rng),
                injected: AtomicU32::new(0),
            }),
        }
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.store
    }

    /// How many faults have been injected so far.
    pub fn injected_faults(&self) -> u32 {
        self.state.injected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<S: ReservationStore> ReservationStore for ChaosReservationStore<S> {
    type Transaction = ChaosTransaction<S::Transaction>;

    async fn begin(&self) -> StoreResult<Self::Transaction> {
        if self
            .state
            .should_inject(self.state.config.connection_failure_probability)
        {
            debug!("[chaos.begin] injecting connection failure");
            return Err(StoreError::Connection {
                operation: Operation::BeginTransaction,
                detail: "injected connection failure".to_string(),
            });
        }
        Ok(ChaosTransaction {
            inner: self.store.begin().await?,
            state: Arc::clone(&self.state),
        })
    }

    async fn find_batch(&self, id: BatchId) -> StoreResult<Option<Batch>> {
        self.store.find_batch(id).await
    }

    async fn find_batch_by_reference(
        &self,
        reference: &ReferenceNumber,
    ) -> StoreResult<Option<Batch>> {
        self.store.find_batch_by_reference(reference).await
    }

    async fn find_resource(&self, id: &ResourceId) -> StoreResult<Option<Resource>> {
        self.store.find_resource(id).await
    }

    async fn extension_history(&self, batch: BatchId) -> StoreResult<Vec<ExtensionRecord>> {
        self.store.extension_history(batch).await
    }

    async fn register_resource(&self, resource: Resource) -> StoreResult<()> {
        self.store.register_resource(resource).await
    }
}

/// Transaction of a [`ChaosReservationStore`].
#[derive(Debug)]
pub struct ChaosTransaction<T> {
    inner: T,
    state: Arc<ChaosState>,
}

#[async_trait]
impl<T: StoreTransaction> StoreTransaction for ChaosTransaction<T> {
    async fn lock_resource(&mut self, id: &ResourceId) -> StoreResult<Option<Resource>> {
        self.inner.lock_resource(id).await
    }

    async fn open_holder(&mut self, resource: &ResourceId) -> StoreResult<Option<HolderRef>> {
        self.inner.open_holder(resource).await
    }

    async fn next_sequence(&mut self, key: &SequenceKey) -> StoreResult<SequenceNumber> {
        if self
            .state
            .should_inject(self.state.config.sequence_failure_probability)
        {
            debug!(sequence_key = %key, "[chaos.next_sequence] injecting counter failure");
            return Err(StoreError::Backend {
                operation: Operation::NextSequence,
                detail: "injected sequence counter failure".to_string(),
            });
        }
        self.inner.next_sequence(key).await
    }

    async fn insert_batch(&mut self, batch: &Batch) -> StoreResult<()> {
        self.inner.insert_batch(batch).await
    }

    async fn lock_batch(&mut self, id: BatchId) -> StoreResult<Option<Batch>> {
        self.inner.lock_batch(id).await
    }

    async fn update_batch(&mut self, batch: &Batch, expected: BatchStatus) -> StoreResult<()> {
        self.inner.update_batch(batch, expected).await
    }

    async fn set_resource_status(
        &mut self,
        id: &ResourceId,
        status: ResourceStatus,
    ) -> StoreResult<()> {
        self.inner.set_resource_status(id, status).await
    }

    async fn record_extension(&mut self, entry: &ExtensionRecord) -> StoreResult<()> {
        self.inner.record_extension(entry).await
    }

    async fn commit(self) -> StoreResult<()> {
        if self.state.take_commit_deadlock() {
            debug!("[chaos.commit] injecting deadlock");
            self.inner.rollback().await?;
            return Err(StoreError::Deadlock {
                operation: Operation::Commit,
            });
        }
        if self.state.take_lost_commit_ack() {
            debug!("[chaos.commit] committing, then dropping the acknowledgement");
            self.inner.commit().await?;
            return Err(StoreError::Connection {
                operation: Operation::Commit,
                detail: "injected connection loss after commit".to_string(),
            });
        }
        self.inner.commit().await
    }

    async fn rollback(self) -> StoreResult<()> {
        self.inner.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolcrib::PartitionKey;
    use toolcrib_memory::InMemoryReservationStore;

    fn key() -> SequenceKey {
        SequenceKey::new(
            PartitionKey::try_new("P1".to_string()).expect("valid partition"),
            2025,
        )
    }

    #[test]
    fn probability_rejects_out_of_range_values() {
        assert!(Probability::try_new(-0.1).is_err());
        assert!(Probability::try_new(1.01).is_err());
        assert!(Probability::try_new(1.0).is_ok());
    }

    #[test]
    fn builder_clamps_out_of_range_values() {
        let config = ChaosConfig::deterministic().with_sequence_failure_probability(7.0);
        let rate: f32 = config.sequence_failure_probability.into();
        assert!((rate - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn sequence_failure_leaves_transaction_usable() {
        // Given: a store whose sequence counter always fails
        let store = InMemoryReservationStore::new()
            .with_chaos(ChaosConfig::deterministic().with_sequence_failure_probability(1.0));

        // When: the counter is asked for a number
        let mut tx = store.begin().await.expect("begin");
        let result = tx.next_sequence(&key()).await;

        // Then: the failure is reported and the transaction still commits
        assert!(matches!(
            result,
            Err(StoreError::Backend {
                operation: Operation::NextSequence,
                ..
            })
        ));
        tx.commit().await.expect("commit after counter failure");
        assert_eq!(store.injected_faults(), 1);
    }

    #[tokio::test]
    async fn commit_deadlocks_are_consumed_one_at_a_time() {
        let store = InMemoryReservationStore::new()
            .with_chaos(ChaosConfig::deterministic().with_commit_deadlocks(1));

        let mut first = store.begin().await.expect("begin");
        first.next_sequence(&key()).await.expect("sequence");
        let failed = first.commit().await;

        let mut second = store.begin().await.expect("begin");
        let issued = second.next_sequence(&key()).await.expect("sequence");
        second.commit().await.expect("second commit succeeds");

        assert!(matches!(failed, Err(StoreError::Deadlock { .. })));
        // the deadlocked transaction was rolled back, so its number is recycled
        assert_eq!(issued.into_inner(), 1);
        assert_eq!(store.inner().sequence_value(&key()), Some(1));
    }

    #[tokio::test]
    async fn connection_failures_are_transient() {
        let store = InMemoryReservationStore::new()
            .with_chaos(ChaosConfig::deterministic().with_connection_failure_probability(1.0));

        let error = store.begin().await.expect_err("begin should fail");

        assert!(error.is_transient());
    }
}
