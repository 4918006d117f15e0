//! Correlation ID support for tying together the log lines a single
//! replication connection cycle (or polling batch) produces, the way the
//! teacher's HTTP server ties together the log lines of a single request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::Span;

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A correlation ID that uniquely identifies a replication session or a
/// polling batch, threaded through every span and log line it produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new correlation ID from a millisecond timestamp and a
    /// monotonic counter — readable in logs and unique within a process.
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let counter = CORRELATION_COUNTER.fetch_add(1, Ordering::SeqCst);
        CorrelationId(format!("{timestamp}-{counter}"))
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

/// Holds the correlation ID and top-level span for one connection cycle
/// of a listener. One is created per `ReplicationListener::run_once` call
/// and per polled batch.
#[derive(Debug, Clone)]
pub struct TracingContext {
    pub correlation_id: CorrelationId,
    pub span: Span,
}

impl TracingContext {
    pub fn new() -> Self {
        let correlation_id = CorrelationId::new();
        let span = tracing::info_span!(
            "listener_session",
            correlation_id = %correlation_id,
            component = "pg-outbox"
        );
        Self { correlation_id, span }
    }
}

impl Default for TracingContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn tracing_context_carries_its_correlation_id_into_the_span() {
        let context = TracingContext::new();
        assert!(!context.correlation_id.as_str().is_empty());
    }
}
