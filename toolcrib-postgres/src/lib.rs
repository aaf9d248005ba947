//! PostgreSQL adapter for toolcrib
//!
//! Implements [`ReservationStore`] on a `sqlx` connection pool. Every
//! [`PostgresTransaction`] is one database transaction:
//!
//! - resource and batch holds are `SELECT ... FOR UPDATE` row locks, so they
//!   exclude other processes, not only other tasks;
//! - the reference counter is an upsert followed by a locked re-read inside a
//!   savepoint, so a counter failure leaves the enclosing transaction usable;
//! - batch updates are guarded by the expected status;
//! - SQLSTATEs are classified into transient and permanent store errors.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod rows;

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use nutype::nutype;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{query, query_scalar, Connection, Pool, Postgres};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use toolcrib::{
    Batch, BatchId, BatchStatus, ExtensionRecord, HolderRef, Operation, ReferenceNumber,
    ReservationStore, Resource, ResourceId, ResourceStatus, SequenceKey, SequenceNumber,
    StoreError, StoreResult, StoreTransaction,
};

use crate::rows::{
    column, decoded, extension_from_row, fetch_batch, resource_from_row, BatchKey, LOCK_RESOURCE,
    SELECT_EXTENSIONS, SELECT_RESOURCE,
};

/// Statuses of batches that no longer hold resources.
const CLOSED_STATUSES: [&str; 2] = [BatchStatus::Returned.as_str(), BatchStatus::Canceled.as_str()];

/// Errors raised while setting up the store.
#[derive(Debug, Error)]
pub enum PostgresStoreError {
    /// The pool could not connect.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),
    /// The schema could not be brought up to date.
    #[error("failed to apply toolcrib migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// Zero is ruled out by the underlying `NonZeroU32`.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Configuration for [`PostgresReservationStore`].
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Longest a transaction waits on a row lock. Unbounded when unset.
    pub lock_timeout: Option<Duration>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            lock_timeout: None,
        }
    }
}

/// Reservation store on PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresReservationStore {
    pool: Pool<Postgres>,
    lock_timeout: Option<Duration>,
}

impl PostgresReservationStore {
    /// Connects with default configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let connection_string = connection_string.into();
        let max_connections: NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresStoreError::ConnectionFailed)?;
        Ok(Self {
            pool,
            lock_timeout: config.lock_timeout,
        })
    }

    /// Wraps an existing pool. Lock waits are unbounded.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Same pool, with a different lock wait limit.
    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> Result<(), PostgresStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresStoreError::MigrationFailed)
    }
}

#[async_trait]
impl ReservationStore for PostgresReservationStore {
    type Transaction = PostgresTransaction;

    #[instrument(name = "postgres.begin", skip(self))]
    async fn begin(&self) -> StoreResult<Self::Transaction> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        if let Some(limit) = self.lock_timeout {
            query("SELECT set_config('lock_timeout', $1, true)")
                .bind(format!("{}ms", limit.as_millis()))
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        }

        Ok(PostgresTransaction {
            tx,
            lock_timeout: self.lock_timeout,
        })
    }

    #[instrument(name = "postgres.find_batch", skip(self))]
    async fn find_batch(&self, id: BatchId) -> StoreResult<Option<Batch>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Read))?;
        fetch_batch(&mut conn, BatchKey::Id(id), Operation::Read).await
    }

    #[instrument(name = "postgres.find_batch_by_reference", skip(self))]
    async fn find_batch_by_reference(
        &self,
        reference: &ReferenceNumber,
    ) -> StoreResult<Option<Batch>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Read))?;
        fetch_batch(&mut conn, BatchKey::Reference(reference), Operation::Read).await
    }

    #[instrument(name = "postgres.find_resource", skip(self))]
    async fn find_resource(&self, id: &ResourceId) -> StoreResult<Option<Resource>> {
        let row = query(SELECT_RESOURCE)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Read))?;
        row.map(|row| resource_from_row(&row, Operation::Read))
            .transpose()
    }

    #[instrument(name = "postgres.extension_history", skip(self))]
    async fn extension_history(&self, batch: BatchId) -> StoreResult<Vec<ExtensionRecord>> {
        let rows = query(SELECT_EXTENSIONS)
            .bind(batch.into_inner())
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Read))?;
        rows.iter()
            .map(|row| extension_from_row(row, Operation::Read))
            .collect()
    }

    #[instrument(name = "postgres.register_resource", skip(self, resource), fields(resource = %resource.id))]
    async fn register_resource(&self, resource: Resource) -> StoreResult<()> {
        let value = decoded(
            i64::try_from(resource.value.minor_units()),
            Operation::RegisterResource,
        )?;
        query(
            "INSERT INTO toolcrib_resources (resource_id, partition_key, name, value_minor, status) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (resource_id) DO UPDATE SET \
                partition_key = EXCLUDED.partition_key, \
                name = EXCLUDED.name, \
                value_minor = EXCLUDED.value_minor, \
                status = EXCLUDED.status",
        )
        .bind(resource.id.to_string())
        .bind(resource.partition.to_string())
        .bind(&resource.name)
        .bind(value)
        .bind(resource.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::RegisterResource))?;
        Ok(())
    }
}

/// A database transaction. Dropping it uncommitted rolls it back.
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    lock_timeout: Option<Duration>,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

async fn issue_sequence(conn: &mut PgConnection, key: &SequenceKey) -> StoreResult<SequenceNumber> {
    let partition = key.partition.to_string();
    query(
        "INSERT INTO toolcrib_sequences (partition_key, year, last_value) VALUES ($1, $2, 1) \
         ON CONFLICT (partition_key, year) \
         DO UPDATE SET last_value = toolcrib_sequences.last_value + 1",
    )
    .bind(&partition)
    .bind(key.year)
    .execute(&mut *conn)
    .await
    .map_err(|error| map_sqlx_error(error, Operation::NextSequence))?;

    let value: i32 = query_scalar(
        "SELECT last_value FROM toolcrib_sequences \
         WHERE partition_key = $1 AND year = $2 FOR UPDATE",
    )
    .bind(&partition)
    .bind(key.year)
    .fetch_one(&mut *conn)
    .await
    .map_err(|error| map_sqlx_error(error, Operation::NextSequence))?;

    let value = decoded(u32::try_from(value), Operation::NextSequence)?;
    decoded(SequenceNumber::try_new(value), Operation::NextSequence)
}

fn count<N>(value: N, operation: Operation) -> StoreResult<i32>
where
    N: TryInto<i32, Error = std::num::TryFromIntError>,
{
    decoded(value.try_into(), operation)
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    #[instrument(name = "postgres.lock_resource", skip(self), fields(lock_timeout = ?self.lock_timeout))]
    async fn lock_resource(&mut self, id: &ResourceId) -> StoreResult<Option<Resource>> {
        let row = query(LOCK_RESOURCE)
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::LockResource))?;
        row.map(|row| resource_from_row(&row, Operation::LockResource))
            .transpose()
    }

    #[instrument(name = "postgres.open_holder", skip(self))]
    async fn open_holder(&mut self, resource: &ResourceId) -> StoreResult<Option<HolderRef>> {
        let row = query(
            "SELECT b.batch_id, b.reference, b.status \
             FROM toolcrib_batch_items i \
             JOIN toolcrib_batches b ON b.batch_id = i.batch_id \
             WHERE i.resource_id = $1 \
               AND b.status <> ALL($2) \
             ORDER BY b.created_at \
             LIMIT 1",
        )
        .bind(resource.to_string())
        .bind(&CLOSED_STATUSES[..])
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::FindHolder))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let reference: String = column(&row, "reference", Operation::FindHolder)?;
        let status: String = column(&row, "status", Operation::FindHolder)?;
        Ok(Some(HolderRef {
            batch: BatchId::new(column(&row, "batch_id", Operation::FindHolder)?),
            reference: decoded(reference.parse::<ReferenceNumber>(), Operation::FindHolder)?,
            status: decoded(status.parse::<BatchStatus>(), Operation::FindHolder)?,
        }))
    }

    #[instrument(name = "postgres.next_sequence", skip(self), fields(key = %key))]
    async fn next_sequence(&mut self, key: &SequenceKey) -> StoreResult<SequenceNumber> {
        let mut savepoint = Connection::begin(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::NextSequence))?;

        match issue_sequence(&mut savepoint, key).await {
            Ok(sequence) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|error| map_sqlx_error(error, Operation::NextSequence))?;
                debug!(value = %sequence, "[postgres.next_sequence] issued");
                Ok(sequence)
            }
            Err(failure) => {
                if let Err(error) = savepoint.rollback().await {
                    warn!(error = %error, "[postgres.next_sequence] savepoint rollback failed");
                }
                Err(failure)
            }
        }
    }

    #[instrument(name = "postgres.insert_batch", skip(self, batch), fields(reference = %batch.reference))]
    async fn insert_batch(&mut self, batch: &Batch) -> StoreResult<()> {
        let op = Operation::InsertBatch;
        query(
            "INSERT INTO toolcrib_batches (batch_id, reference, partition_key, borrower, purpose, \
                expected_return, status, is_critical, streamlined, total_items, total_quantity, stages) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(batch.id.into_inner())
        .bind(batch.reference.to_string())
        .bind(batch.partition.to_string())
        .bind(Json(&batch.borrower))
        .bind(batch.purpose.as_deref())
        .bind(batch.expected_return)
        .bind(batch.status.as_str())
        .bind(batch.is_critical)
        .bind(batch.streamlined)
        .bind(count(batch.total_items(), op)?)
        .bind(decoded(i64::try_from(batch.total_quantity()), op)?)
        .bind(Json(&batch.stages))
        .execute(&mut *self.tx)
        .await
        .map_err(|error| map_sqlx_error(error, op))?;

        for (position, item) in batch.items.iter().enumerate() {
            query(
                "INSERT INTO toolcrib_batch_items (item_id, batch_id, position, resource_id, \
                    quantity, quantity_returned, status, expected_return, notes, return_condition) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(item.id.into_inner())
            .bind(batch.id.into_inner())
            .bind(count(position, op)?)
            .bind(item.resource_id.to_string())
            .bind(count(item.quantity, op)?)
            .bind(count(item.quantity_returned, op)?)
            .bind(item.status.as_str())
            .bind(item.expected_return)
            .bind(item.notes.as_deref())
            .bind(item.return_condition.as_deref())
            .execute(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, op))?;
        }
        Ok(())
    }

    #[instrument(name = "postgres.lock_batch", skip(self))]
    async fn lock_batch(&mut self, id: BatchId) -> StoreResult<Option<Batch>> {
        fetch_batch(&mut self.tx, BatchKey::LockedId(id), Operation::LockBatch).await
    }

    #[instrument(name = "postgres.update_batch", skip(self, batch), fields(reference = %batch.reference, %expected))]
    async fn update_batch(&mut self, batch: &Batch, expected: BatchStatus) -> StoreResult<()> {
        let op = Operation::UpdateBatch;
        let updated = query(
            "UPDATE toolcrib_batches SET status = $2, expected_return = $3, stages = $4, \
                total_items = $5, total_quantity = $6, updated_at = now() \
             WHERE batch_id = $1 AND status = $7",
        )
        .bind(batch.id.into_inner())
        .bind(batch.status.as_str())
        .bind(batch.expected_return)
        .bind(Json(&batch.stages))
        .bind(count(batch.total_items(), op)?)
        .bind(decoded(i64::try_from(batch.total_quantity()), op)?)
        .bind(expected.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|error| map_sqlx_error(error, op))?;

        if updated.rows_affected() == 0 {
            let actual: Option<String> =
                query_scalar("SELECT status FROM toolcrib_batches WHERE batch_id = $1")
                    .bind(batch.id.into_inner())
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(|error| map_sqlx_error(error, op))?;
            let actual = decoded(
                actual.map(|raw| raw.parse::<BatchStatus>()).transpose(),
                op,
            )?;
            return Err(StoreError::StatusMismatch {
                batch: batch.id,
                expected,
                actual,
            });
        }

        for item in &batch.items {
            query(
                "UPDATE toolcrib_batch_items SET quantity_returned = $2, status = $3, \
                    expected_return = $4, return_condition = $5 \
                 WHERE item_id = $1",
            )
            .bind(item.id.into_inner())
            .bind(count(item.quantity_returned, op)?)
            .bind(item.status.as_str())
            .bind(item.expected_return)
            .bind(item.return_condition.as_deref())
            .execute(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, op))?;
        }
        Ok(())
    }

    #[instrument(name = "postgres.set_resource_status", skip(self), fields(%status))]
    async fn set_resource_status(
        &mut self,
        id: &ResourceId,
        status: ResourceStatus,
    ) -> StoreResult<()> {
        let updated = query("UPDATE toolcrib_resources SET status = $2 WHERE resource_id = $1")
            .bind(id.to_string())
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::UpdateResource))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Backend {
                operation: Operation::UpdateResource,
                detail: format!("resource {id} does not exist"),
            });
        }
        Ok(())
    }

    #[instrument(name = "postgres.record_extension", skip(self, entry), fields(item = %entry.item))]
    async fn record_extension(&mut self, entry: &ExtensionRecord) -> StoreResult<()> {
        query(
            "INSERT INTO toolcrib_extensions (batch_id, item_id, previous_date, new_date, reason, \
                actor, extended_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.batch.into_inner())
        .bind(entry.item.into_inner())
        .bind(entry.previous)
        .bind(entry.new)
        .bind(&entry.reason)
        .bind(entry.actor.to_string())
        .bind(entry.at)
        .execute(&mut *self.tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::RecordExtension))?;
        Ok(())
    }

    #[instrument(name = "postgres.commit", skip(self))]
    async fn commit(self) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Commit))
    }

    #[instrument(name = "postgres.rollback", skip(self))]
    async fn rollback(self) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Rollback))
    }
}

/// Classifies a driver error.
///
/// Deadlocks, serialization failures, lock and statement timeouts, and lost
/// connections are transient; the service re-runs the transaction.
pub(crate) fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StoreError {
    let mapped = match &error {
        sqlx::Error::Database(db_error) => {
            let code = db_error.code();
            match code.as_deref() {
                Some("40P01") => StoreError::Deadlock { operation },
                Some("40001") => StoreError::SerializationFailure { operation },
                Some("55P03" | "57014") => StoreError::LockTimeout {
                    operation,
                    waited: None,
                },
                Some("23505") => StoreError::Duplicate {
                    operation,
                    detail: db_error.message().to_string(),
                },
                Some(code) if code.starts_with("08") => StoreError::Connection {
                    operation,
                    detail: db_error.message().to_string(),
                },
                _ => StoreError::Backend {
                    operation,
                    detail: db_error.message().to_string(),
                },
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connection {
            operation,
            detail: error.to_string(),
        },
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_) => StoreError::corrupt(operation, &error),
        _ => StoreError::Backend {
            operation,
            detail: error.to_string(),
        },
    };

    if mapped.is_transient() {
        warn!(
            error = %error,
            %operation,
            "[postgres.transient_error] database operation aborted"
        );
    } else {
        error!(
            error = %error,
            %operation,
            "[postgres.database_error] database operation failed"
        );
    }
    mapped
}
