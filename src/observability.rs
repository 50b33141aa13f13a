//! Correlation and trace context for orchestration passes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation ID linking every log line of one bundle record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Trace context for one pass (validate or submit) and its sub-steps
///
/// The correlation id is the bundle record id, so a validate pass and the
/// later submit pass for the same record share it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub correlation_id: CorrelationId,
    pub operation: String,
    pub started_at: DateTime<Utc>,
}

impl TraceContext {
    pub fn new(operation: &str, correlation_id: CorrelationId) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: None,
            correlation_id,
            operation: operation.to_string(),
            started_at: Utc::now(),
        }
    }

    /// Child span for a sub-step (validation simulation, submission resync)
    pub fn child_span(&self, operation: &str) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: Some(self.span_id.clone()),
            correlation_id: self.correlation_id.clone(),
            operation: operation.to_string(),
            started_at: Utc::now(),
        }
    }

    /// `tracing` span carrying the trace identifiers
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "bundle_pass",
            trace_id = %self.trace_id,
            span_id = %self.span_id,
            parent_span_id = %self.parent_span_id.as_deref().unwrap_or("-"),
            bundle_id = %self.correlation_id,
            operation = %self.operation
        )
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}
