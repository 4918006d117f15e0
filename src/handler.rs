//! The user-supplied side of the pipeline: a small trait with `handle` and
//! an optional `handle_error`, and a registry resolving handlers by
//! `(aggregateType, messageType)` or falling back to a single general
//! handler.

use crate::errors::OutboxResult;
use crate::message::TransactionalMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_postgres::Transaction;

/// Implemented once per (aggregateType, messageType) pair, or once as a
/// general handler covering every message. `handle` runs inside the same
/// transaction that will mark the message completed; returning `Err` rolls
/// that transaction back and routes the message into Phase 3 (error
/// resolution).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &TransactionalMessage, txn: &Transaction<'_>) -> OutboxResult<()>;

    /// Called from Phase 3 in a fresh transaction. This must not propagate:
    /// if it returns `Err`, the pipeline logs it and
    /// falls back to a best-effort `increase_finished_attempts` instead of
    /// trusting the handler's own bookkeeping.
    async fn handle_error(
        &self,
        _error: &crate::errors::OutboxError,
        _message: &TransactionalMessage,
        _txn: &Transaction<'_>,
        _should_retry: bool,
    ) -> OutboxResult<()> {
        Ok(())
    }
}

/// Resolves a handler for a message: either every message goes to one
/// general handler, or each `(aggregateType, messageType)` pair has its own
/// entry. Configuring both is a configuration error caught at registry
/// build time.
pub enum HandlerRegistry {
    General(Arc<dyn MessageHandler>),
    Keyed(HashMap<String, Arc<dyn MessageHandler>>),
}

impl HandlerRegistry {
    pub fn general(handler: Arc<dyn MessageHandler>) -> Self {
        Self::General(handler)
    }

    pub fn keyed() -> KeyedRegistryBuilder {
        KeyedRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    pub fn resolve(&self, message: &TransactionalMessage) -> Option<Arc<dyn MessageHandler>> {
        match self {
            HandlerRegistry::General(handler) => Some(handler.clone()),
            HandlerRegistry::Keyed(handlers) => handlers.get(&message.registry_key()).cloned(),
        }
    }
}

pub struct KeyedRegistryBuilder {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl KeyedRegistryBuilder {
    pub fn register(
        mut self,
        aggregate_type: impl Into<String>,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.handlers
            .insert(format!("{}@{}", aggregate_type.into(), message_type.into()), handler);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry::Keyed(self.handlers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(&self, _message: &TransactionalMessage, _txn: &Transaction<'_>) -> OutboxResult<()> {
            Ok(())
        }
    }

    fn msg(aggregate_type: &str, message_type: &str) -> TransactionalMessage {
        TransactionalMessage {
            id: Uuid::now_v7(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: "a-1".into(),
            message_type: message_type.into(),
            payload: json!({}),
            metadata: None,
            created_at: Utc::now(),
            started_attempts: 0,
            finished_attempts: 0,
            processed_at: None,
            segment: None,
            concurrency: crate::message::Concurrency::Sequential,
            locked_until: None,
            abandoned_at: None,
        }
    }

    #[test]
    fn keyed_registry_resolves_by_aggregate_and_message_type() {
        let registry = HandlerRegistry::keyed()
            .register("order", "order.created", Arc::new(NoopHandler))
            .build();

        assert!(registry.resolve(&msg("order", "order.created")).is_some());
        assert!(registry.resolve(&msg("order", "order.cancelled")).is_none());
    }

    #[test]
    fn general_registry_resolves_everything() {
        let registry = HandlerRegistry::general(Arc::new(NoopHandler));
        assert!(registry.resolve(&msg("anything", "anything")).is_some());
    }
}
