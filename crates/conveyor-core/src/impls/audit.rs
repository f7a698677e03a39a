//! AuditSink implementations.
//!
//! - **TracingAuditSink**: one structured `info` line per event (default)
//! - **RecordingAuditSink**: keeps events in memory for assertions
//! - **NoopAuditSink**: drops everything

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::domain::AuditEvent;
use crate::ports::{AuditError, AuditSink};

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "conveyor::audit",
            task_id = %event.task_id,
            content_type = %event.content_type,
            content_id = %event.content_id,
            action = ?event.action,
            at = %event.at,
            "{}",
            event.detail
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    fail: bool,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records nothing and returns an error for every event.
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        if self.fail {
            return Err(AuditError("audit log unavailable".to_string()));
        }
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AuditAction, ContentType, TaskId};
    use chrono::Utc;

    fn event() -> AuditEvent {
        AuditEvent {
            task_id: TaskId::from_ulid(ulid::Ulid::new()),
            content_type: ContentType::new("publication.document.v1"),
            content_id: "doc".to_string(),
            action: AuditAction::Published,
            detail: "published".to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn recording_sink_keeps_events_in_order() {
        let sink = RecordingAuditSink::new();
        sink.record(event()).await.unwrap();
        sink.record(event()).await.unwrap();
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test]
    async fn failing_sink_reports_errors() {
        let sink = RecordingAuditSink::failing();
        assert!(sink.record(event()).await.is_err());
        assert!(sink.events().is_empty());
    }
}
