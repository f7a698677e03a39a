//! AuditSink port - records phase-boundary events.
//!
//! Fire-and-forget from the runner's side: an `Err` is logged and dropped,
//! never propagated into the execution.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::AuditEvent;

#[derive(Debug, Error)]
#[error("audit sink error: {0}")]
pub struct AuditError(pub String);

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}
