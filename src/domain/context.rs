//! Operation Context
//!
//! Contains metadata about the current operation for tracing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context for an operation, carried into handler log spans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationContext {
    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// Who initiated the operation (user, scheduler, accrual job)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
}

impl OperationContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for background jobs
    pub fn system(job: &str) -> Self {
        Self::new()
            .with_initiator(format!("system:{}", job))
            .with_correlation_id(Uuid::new_v4())
    }

    /// Create context with correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Create context with initiator
    pub fn with_initiator(mut self, initiator: impl Into<String>) -> Self {
        self.initiator = Some(initiator.into());
        self
    }

    /// Generate a new correlation ID if not present
    pub fn ensure_correlation_id(&mut self) -> Uuid {
        *self.correlation_id.get_or_insert_with(Uuid::new_v4)
    }
}
