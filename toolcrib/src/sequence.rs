//! Reference numbers counted per (partition, year).
//!
//! The counter row is incremented inside the caller's transaction, so a
//! rolled-back creation gives its number back and two committed creations
//! never share one. When the counter itself fails, the configured
//! [`SequencePolicy`] decides between a fallback reference and a hard error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::errors::{StoreResult, WorkflowError, WorkflowResult};
use crate::metrics::ServiceMetrics;
use crate::store::StoreTransaction;
use crate::types::{PartitionKey, ReferenceNumber, SequenceKey, SequenceNumber};

/// What to do when the sequence counter cannot issue a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencePolicy {
    /// Issue a time-derived, non-sequential reference and carry on.
    #[default]
    Fallback,
    /// Abort the creation with [`WorkflowError::SequenceUnavailable`].
    Fail,
}

/// Issues batch references.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    prefix: String,
    policy: SequencePolicy,
    metrics: Arc<ServiceMetrics>,
}

impl SequenceCounter {
    /// A counter issuing references with `prefix`.
    pub fn new(
        prefix: impl Into<String>,
        policy: SequencePolicy,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            policy,
            metrics,
        }
    }

    /// Next number for `key`. Only valid inside an active transaction.
    pub async fn next<T: StoreTransaction>(
        &self,
        tx: &mut T,
        key: &SequenceKey,
    ) -> StoreResult<SequenceNumber> {
        tx.next_sequence(key).await
    }

    /// Issues the reference for a new batch in `partition` during `year`.
    #[instrument(skip(self, tx), fields(partition = %partition, year))]
    pub async fn issue<T: StoreTransaction>(
        &self,
        tx: &mut T,
        partition: &PartitionKey,
        year: i32,
    ) -> WorkflowResult<ReferenceNumber> {
        let key = SequenceKey::new(partition.clone(), year);
        match self.next(tx, &key).await {
            Ok(sequence) => Ok(ReferenceNumber::sequential(
                self.prefix.clone(),
                partition.clone(),
                year,
                sequence,
            )),
            Err(error) => match self.policy {
                SequencePolicy::Fallback => {
                    let reference =
                        ReferenceNumber::fallback(self.prefix.clone(), partition.clone(), year);
                    self.metrics.sequence_fallbacks.increment();
                    warn!(
                        target: "toolcrib::sequence",
                        sequence_key = %key,
                        reference = %reference,
                        error = %error,
                        "sequence counter unavailable; issued non-sequential fallback reference"
                    );
                    Ok(reference)
                }
                SequencePolicy::Fail => Err(WorkflowError::SequenceUnavailable(error)),
            },
        }
    }
}
