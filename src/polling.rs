//! The polling listener: periodically calls
//! the server-side batch-selection function instead of subscribing to the
//! WAL stream. Leases (`locked_until`) stand in for the acknowledge
//! manager's out-of-order bookkeeping — a message is never dispatched twice
//! concurrently because `next_messages` only returns rows whose lease has
//! expired.

use crate::concurrency::ConcurrencyController;
use crate::config::OutboxConfig;
use crate::db::{execute_transaction, IsolationLevel};
use crate::errors::OutboxResult;
use crate::handler::HandlerRegistry;
use crate::pipeline::process_message;
use crate::storage::{MessageStore, TableRef};
use crate::strategies::Strategies;
use crate::tracing_context::TracingContext;
use deadpool_postgres::Pool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

/// Drives the poll-batch-dispatch loop until cancelled.
pub struct PollingListener {
    config: Arc<OutboxConfig>,
    table: TableRef,
    registry: Arc<HandlerRegistry>,
    strategies: Strategies,
    concurrency: Arc<dyn ConcurrencyController>,
    handler_pool: Pool,
    shutdown: CancellationToken,
}

impl PollingListener {
    pub fn new(
        config: Arc<OutboxConfig>,
        handler_pool: Pool,
        registry: Arc<HandlerRegistry>,
        concurrency: Arc<dyn ConcurrencyController>,
        shutdown: CancellationToken,
    ) -> Self {
        let strategies = Strategies::defaults(&config);
        let table = TableRef::new(&config.db_schema, &config.db_table);
        Self {
            config,
            table,
            registry,
            strategies,
            concurrency,
            handler_pool,
            shutdown,
        }
    }

    /// Runs until the shutdown token is cancelled.
    pub async fn run(self: Arc<Self>) -> OutboxResult<()> {
        let function_name = match &self.config.next_messages_function_schema {
            Some(schema) => format!("{schema}.{}", self.config.next_messages_function_name),
            None => self.config.next_messages_function_name.clone(),
        };

        let mut ticker = tokio::time::interval(self.config.next_messages_polling_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }

            if let Err(e) = self.poll_once(&function_name).await {
                warn!(error = %e, "polling batch fetch failed, will retry next tick");
            }
        }
    }

    async fn poll_once(&self, function_name: &str) -> OutboxResult<()> {
        let table = self.table.clone();
        let function_name = function_name.to_string();
        let batch_size = self.config.next_messages_batch_size;
        let lease_ms = self.config.next_messages_lock().as_millis() as i64;

        let batch = execute_transaction(
            &self.handler_pool,
            IsolationLevel::ReadCommitted,
            Box::new(move |txn| {
                Box::pin(async move {
                    let store = MessageStore::new(&table);
                    store.next_batch(txn, &function_name, batch_size, lease_ms).await
                })
            }),
        )
        .await?;

        if batch.is_empty() {
            return Ok(());
        }
        let tracing_context = TracingContext::new();
        debug!(count = batch.len(), correlation_id = %tracing_context.correlation_id, "polled batch of messages");

        for message in batch {
            let concurrency = self.concurrency.clone();
            let handler_pool = self.handler_pool.clone();
            let table = self.table.clone();
            let registry = self.registry.clone();
            let strategies = self.strategies.clone();
            let cancel = self.shutdown.clone();
            let timeout = (strategies.processing_timeout)(&message);
            let span = tracing::debug_span!(
                "process_message",
                correlation_id = %tracing_context.correlation_id,
                message_id = %message.id,
            );

            let task = async move {
                let release = match concurrency.acquire(&message, &cancel).await {
                    Ok(release) => release,
                    Err(e) => {
                        warn!(error = %e, message_id = %message.id, "concurrency controller refused polled message");
                        return;
                    }
                };

                let outcome = tokio::time::timeout(
                    timeout,
                    process_message(&handler_pool, &table, &registry, &strategies, &message),
                )
                .await;

                release.release();

                match outcome {
                    Ok(Ok(outcome)) => debug!(message_id = %message.id, ?outcome, "polled message finished"),
                    Ok(Err(e)) => error!(error = %e, message_id = %message.id, "polled message pipeline error"),
                    Err(_) => warn!(message_id = %message.id, "polled message processing timed out, lease will expire and it will be retried"),
                }
            };

            tokio::spawn(task.instrument(span));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OutboxConfig {
        OutboxConfig {
            database_url: "postgres://localhost/db".into(),
            handler_database_url: None,
            db_schema: "public".into(),
            db_table: "messages".into(),
            db_publication: "outbox_pub".into(),
            db_replication_slot: "outbox_slot".into(),
            restart_delay_in_ms: 250,
            restart_delay_slot_in_use_in_ms: 10_000,
            message_processing_timeout_in_ms: 15_000,
            max_attempts: 5,
            enable_poisonous_message_protection: true,
            max_poisonous_attempts: 3,
            next_messages_function_name: "next_outbox_messages".into(),
            next_messages_function_schema: Some("app".into()),
            next_messages_batch_size: 5,
            next_messages_polling_interval_in_ms: 500,
            next_messages_lock_in_ms: 10_000,
            cleanup_retention_in_secs: None,
            cleanup_interval_in_secs: 3600,
            max_concurrency: 10,
            listener_mode: crate::config::ListenerMode::Replication,
        }
    }

    #[test]
    fn qualifies_function_name_with_configured_schema() {
        let config = config();
        let qualified = match &config.next_messages_function_schema {
            Some(schema) => format!("{schema}.{}", config.next_messages_function_name),
            None => config.next_messages_function_name.clone(),
        };
        assert_eq!(qualified, "app.next_outbox_messages");
    }
}
