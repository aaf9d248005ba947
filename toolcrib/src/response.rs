//! Structured results for collaborators that surface messages to people.

use serde::Serialize;

use crate::aggregate::Batch;
use crate::errors::{ErrorKind, WorkflowResult};
use crate::service::ExtensionOutcome;

/// Success flag, human-readable message, and the batch on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResponse {
    /// Whether the operation committed.
    pub success: bool,
    /// What happened, fit for display.
    pub message: String,
    /// The batch after the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<Batch>,
    /// Failure class, when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl OperationResponse {
    fn succeeded(message: String, batch: Batch) -> Self {
        Self {
            success: true,
            message,
            batch: Some(batch),
            error: None,
        }
    }
}

impl From<WorkflowResult<Batch>> for OperationResponse {
    fn from(result: WorkflowResult<Batch>) -> Self {
        match result {
            Ok(batch) => Self::succeeded(
                format!("Batch {} is now {}", batch.reference, batch.status),
                batch,
            ),
            Err(error) => Self {
                success: false,
                message: error.to_string(),
                batch: None,
                error: Some(error.kind()),
            },
        }
    }
}

impl From<WorkflowResult<ExtensionOutcome>> for OperationResponse {
    fn from(result: WorkflowResult<ExtensionOutcome>) -> Self {
        match result {
            Ok(outcome) => Self::succeeded(
                format!(
                    "Extended {} line(s) of batch {} to {}",
                    outcome.records.len(),
                    outcome.batch.reference,
                    outcome.batch.expected_return.format("%Y-%m-%d %H:%M UTC")
                ),
                outcome.batch,
            ),
            Err(error) => Self::from(Err::<Batch, _>(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Missing, WorkflowError};
    use crate::types::BatchId;

    #[test]
    fn failure_carries_message_and_kind() {
        let id = BatchId::generate();
        let response = OperationResponse::from(Err::<Batch, _>(WorkflowError::from(Missing::Batch(id))));

        assert!(!response.success);
        assert!(response.message.contains(&id.to_string()));
        assert_eq!(response.error, Some(ErrorKind::NotFound));
        assert!(response.batch.is_none());
    }
}
