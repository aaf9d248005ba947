//! Row decoding and the queries that read whole aggregates.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::types::Json;
use sqlx::{query, Postgres, Row};
use uuid::Uuid;

use toolcrib::{
    ActorId, Batch, BatchId, BatchItem, BatchItemId, BatchStatus, BorrowerInfo, ExtensionRecord,
    Money, Operation, PartitionKey, ReferenceNumber, Resource, ResourceId, ResourceStatus,
    StageLog, StoreError, StoreResult,
};

use crate::map_sqlx_error;

pub const SELECT_RESOURCE: &str = "SELECT resource_id, partition_key, name, value_minor, status \
     FROM toolcrib_resources WHERE resource_id = $1";

pub const LOCK_RESOURCE: &str = "SELECT resource_id, partition_key, name, value_minor, status \
     FROM toolcrib_resources WHERE resource_id = $1 FOR UPDATE";

const SELECT_BATCH_BY_ID: &str = "SELECT batch_id, reference, partition_key, borrower, purpose, \
     expected_return, status, is_critical, streamlined, stages \
     FROM toolcrib_batches WHERE batch_id = $1";

const LOCK_BATCH_BY_ID: &str = "SELECT batch_id, reference, partition_key, borrower, purpose, \
     expected_return, status, is_critical, streamlined, stages \
     FROM toolcrib_batches WHERE batch_id = $1 FOR UPDATE";

const SELECT_BATCH_BY_REFERENCE: &str = "SELECT batch_id, reference, partition_key, borrower, \
     purpose, expected_return, status, is_critical, streamlined, stages \
     FROM toolcrib_batches WHERE reference = $1";

const SELECT_ITEMS: &str = "SELECT item_id, resource_id, quantity, quantity_returned, status, \
     expected_return, notes, return_condition \
     FROM toolcrib_batch_items WHERE batch_id = $1 ORDER BY position";

pub const SELECT_EXTENSIONS: &str = "SELECT batch_id, item_id, previous_date, new_date, \
     reason, actor, extended_at \
     FROM toolcrib_extensions WHERE batch_id = $1 ORDER BY extension_id";

/// How a batch is looked up.
#[derive(Debug, Clone, Copy)]
pub enum BatchKey<'a> {
    Id(BatchId),
    LockedId(BatchId),
    Reference(&'a ReferenceNumber),
}

/// Reads a batch and its lines, in position order.
pub async fn fetch_batch(
    conn: &mut PgConnection,
    key: BatchKey<'_>,
    operation: Operation,
) -> StoreResult<Option<Batch>> {
    let head = match key {
        BatchKey::Id(id) => query(SELECT_BATCH_BY_ID).bind(id.into_inner()),
        BatchKey::LockedId(id) => query(LOCK_BATCH_BY_ID).bind(id.into_inner()),
        BatchKey::Reference(reference) => {
            query(SELECT_BATCH_BY_REFERENCE).bind(reference.to_string())
        }
    };
    let Some(row) = head
        .fetch_optional(&mut *conn)
        .await
        .map_err(|error| map_sqlx_error(error, operation))?
    else {
        return Ok(None);
    };

    let batch_id: Uuid = column(&row, "batch_id", operation)?;
    let lines = query(SELECT_ITEMS)
        .bind(batch_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|error| map_sqlx_error(error, operation))?;
    let items = lines
        .iter()
        .map(|line| item_from_row(line, operation))
        .collect::<StoreResult<Vec<_>>>()?;

    batch_from_row(&row, items, operation).map(Some)
}

pub fn column<'r, T>(row: &'r PgRow, name: &str, operation: Operation) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|error| map_sqlx_error(error, operation))
}

pub fn decoded<T, E: Display>(result: Result<T, E>, operation: Operation) -> StoreResult<T> {
    result.map_err(|error| StoreError::corrupt(operation, error))
}

fn batch_from_row(row: &PgRow, items: Vec<BatchItem>, operation: Operation) -> StoreResult<Batch> {
    let reference: String = column(row, "reference", operation)?;
    let partition: String = column(row, "partition_key", operation)?;
    let status: String = column(row, "status", operation)?;
    let borrower: Json<BorrowerInfo> = column(row, "borrower", operation)?;
    let stages: Json<StageLog> = column(row, "stages", operation)?;

    Ok(Batch {
        id: BatchId::new(column(row, "batch_id", operation)?),
        reference: decoded(reference.parse::<ReferenceNumber>(), operation)?,
        partition: decoded(PartitionKey::try_new(partition), operation)?,
        borrower: borrower.0,
        purpose: column(row, "purpose", operation)?,
        expected_return: column(row, "expected_return", operation)?,
        status: decoded(status.parse::<BatchStatus>(), operation)?,
        is_critical: column(row, "is_critical", operation)?,
        streamlined: column(row, "streamlined", operation)?,
        items,
        stages: stages.0,
    })
}

fn item_from_row(row: &PgRow, operation: Operation) -> StoreResult<BatchItem> {
    let resource: String = column(row, "resource_id", operation)?;
    let quantity: i32 = column(row, "quantity", operation)?;
    let returned: i32 = column(row, "quantity_returned", operation)?;
    let status: String = column(row, "status", operation)?;

    Ok(BatchItem {
        id: BatchItemId::new(column(row, "item_id", operation)?),
        resource_id: decoded(ResourceId::try_new(resource), operation)?,
        quantity: decoded(u32::try_from(quantity), operation)?,
        quantity_returned: decoded(u32::try_from(returned), operation)?,
        status: decoded(status.parse::<BatchStatus>(), operation)?,
        expected_return: column(row, "expected_return", operation)?,
        notes: column(row, "notes", operation)?,
        return_condition: column(row, "return_condition", operation)?,
    })
}

pub fn resource_from_row(row: &PgRow, operation: Operation) -> StoreResult<Resource> {
    let id: String = column(row, "resource_id", operation)?;
    let partition: String = column(row, "partition_key", operation)?;
    let value: i64 = column(row, "value_minor", operation)?;
    let status: String = column(row, "status", operation)?;

    Ok(Resource {
        id: decoded(ResourceId::try_new(id), operation)?,
        partition: decoded(PartitionKey::try_new(partition), operation)?,
        name: column(row, "name", operation)?,
        value: Money::new(decoded(u64::try_from(value), operation)?),
        status: decoded(status.parse::<ResourceStatus>(), operation)?,
    })
}

pub fn extension_from_row(row: &PgRow, operation: Operation) -> StoreResult<ExtensionRecord> {
    let actor: String = column(row, "actor", operation)?;
    let previous: DateTime<Utc> = column(row, "previous_date", operation)?;
    let new: DateTime<Utc> = column(row, "new_date", operation)?;

    Ok(ExtensionRecord {
        batch: BatchId::new(column(row, "batch_id", operation)?),
        item: BatchItemId::new(column(row, "item_id", operation)?),
        previous,
        new,
        reason: column(row, "reason", operation)?,
        actor: decoded(ActorId::try_new(actor), operation)?,
        at: column(row, "extended_at", operation)?,
    })
}
