//! Scheduled cleanup of processed/abandoned rows:
//! a background task that periodically deletes rows older than the
//! configured retention window, run on the handler pool so it never
//! competes with the replication connection.

use crate::config::OutboxConfig;
use crate::db::{execute_transaction, IsolationLevel};
use crate::storage::{MessageStore, TableRef};
use deadpool_postgres::Pool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawns the cleanup loop, or does nothing and returns `None` when no
/// retention window is configured (`cleanup_retention_in_secs` is `None`,
/// disabling the feature entirely rather than running it with some implicit
/// default).
pub fn spawn_cleanup_task(
    pool: Pool,
    config: Arc<OutboxConfig>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let retention_secs = config.cleanup_retention_in_secs?;
    let interval = Duration::from_secs(config.cleanup_interval_in_secs);
    let table = TableRef::new(&config.db_schema, &config.db_table);
    let retention = chrono::Duration::seconds(retention_secs as i64);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    debug!("cleanup task stopping");
                    return;
                }
            }

            let table = table.clone();
            let result = execute_transaction(
                &pool,
                IsolationLevel::ReadCommitted,
                Box::new(move |txn| {
                    Box::pin(async move {
                        let store = MessageStore::new(&table);
                        store.cleanup_older_than(txn, retention).await
                    })
                }),
            )
            .await;

            match result {
                Ok(deleted) if deleted > 0 => {
                    debug!(deleted, "cleanup removed expired rows");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "cleanup sweep failed"),
            }
        }
    }))
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
            next_messages_function_schema: None,
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
    fn disabled_when_retention_is_unset() {
        assert!(config().cleanup_retention_in_secs.is_none());
    }
}
