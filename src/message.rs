//! The canonical outbox/inbox message shape.
//!
//! `TransactionalMessage` is the mutable working copy threaded through the
//! pipeline: storage operations read and write its attempt counters in
//! place as the message moves through poisonous-check, lock-and-dispatch,
//! and error-resolution phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Polling-only batch-selection behaviour (§3 of the spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    Sequential,
    Parallel,
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Sequential
    }
}

impl Concurrency {
    pub fn as_sql_str(self) -> &'static str {
        match self {
            Concurrency::Sequential => "sequential",
            Concurrency::Parallel => "parallel",
        }
    }

    pub fn from_sql_str(s: &str) -> Self {
        match s {
            "parallel" => Concurrency::Parallel,
            _ => Concurrency::Sequential,
        }
    }
}

/// The stored form of a message: one row in the outbox/inbox table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionalMessage {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    pub payload: Value,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_attempts: i16,
    pub finished_attempts: i16,
    pub processed_at: Option<DateTime<Utc>>,
    pub segment: Option<String>,
    pub concurrency: Concurrency,
    pub locked_until: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
}

impl TransactionalMessage {
    /// `started_attempts - finished_attempts`: a value > 1 means a prior
    /// attempt crashed without finishing.
    pub fn attempt_gap(&self) -> i16 {
        self.started_attempts - self.finished_attempts
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn is_first_attempt(&self) -> bool {
        self.finished_attempts == 0
    }

    pub fn registry_key(&self) -> String {
        format!("{}@{}", self.aggregate_type, self.message_type)
    }
}

/// Producer-facing input for `MessageStore::insert`. `id` defaults to a
/// fresh UUIDv7 (time-ordered, friendlier to the `created_at` index) when
/// not supplied by the caller.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Option<Uuid>,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    pub payload: Value,
    pub metadata: Option<Value>,
    pub segment: Option<String>,
    pub concurrency: Concurrency,
}

impl NewMessage {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: None,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            message_type: message_type.into(),
            payload,
            metadata: None,
            segment: None,
            concurrency: Concurrency::Sequential,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn resolved_id(&self) -> Uuid {
        self.id.unwrap_or_else(Uuid::now_v7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransactionalMessage {
        TransactionalMessage {
            id: Uuid::now_v7(),
            aggregate_type: "order".into(),
            aggregate_id: "o-1".into(),
            message_type: "order.created".into(),
            payload: serde_json::json!({"total": 12}),
            metadata: None,
            created_at: Utc::now(),
            started_attempts: 0,
            finished_attempts: 0,
            processed_at: None,
            segment: None,
            concurrency: Concurrency::Sequential,
            locked_until: None,
            abandoned_at: None,
        }
    }

    #[test]
    fn attempt_gap_reflects_crashed_prior_attempt() {
        let mut m = sample();
        m.started_attempts = 4;
        m.finished_attempts = 1;
        assert_eq!(m.attempt_gap(), 3);
    }

    #[test]
    fn registry_key_combines_aggregate_and_message_type() {
        let m = sample();
        assert_eq!(m.registry_key(), "order@order.created");
    }

    #[test]
    fn new_message_generates_id_when_absent() {
        let a = NewMessage::new("order", "o-1", "order.created", serde_json::json!({}));
        let b = NewMessage::new("order", "o-1", "order.created", serde_json::json!({}));
        assert_ne!(a.resolved_id(), b.resolved_id());
    }
}
