//! Pluggable policy points used by the pipeline (spec.md §2, "Strategy
//! interfaces + defaults"): isolation level, per-message timeout, retry
//! decisions, poisonous-retry decisions, and restart delay. Each is a
//! function of the message/config so callers can override any single
//! decision without reimplementing the pipeline.

use crate::config::OutboxConfig;
use crate::db::IsolationLevel;
use crate::message::TransactionalMessage;
use std::sync::Arc;
use std::time::Duration;

pub type IsolationLevelFn = Arc<dyn Fn(&TransactionalMessage) -> IsolationLevel + Send + Sync>;
pub type TimeoutFn = Arc<dyn Fn(&TransactionalMessage) -> Duration + Send + Sync>;
pub type RetryFn = Arc<dyn Fn(&TransactionalMessage) -> bool + Send + Sync>;
pub type PoisonousRetryFn = Arc<dyn Fn(&TransactionalMessage, i16) -> bool + Send + Sync>;

/// Bundles every decision point the pipeline consults. Construct with
/// `Strategies::defaults(&config)` and override individual fields for
/// tests or non-default policies.
#[derive(Clone)]
pub struct Strategies {
    pub isolation_level: IsolationLevelFn,
    pub processing_timeout: TimeoutFn,
    pub message_retry: RetryFn,
    pub poisonous_retry: PoisonousRetryFn,
    pub restart_delay: Duration,
    pub restart_delay_slot_in_use: Duration,
    /// When `false`, Phase 1 of the pipeline (the poisonous-message guard)
    /// is skipped entirely: no `started_attempts` increment, no attempt-gap
    /// check.
    pub enable_poisonous_message_protection: bool,
}

impl Strategies {
    /// The defaults named throughout spec.md §4.6/§6.3: READ COMMITTED,
    /// the configured per-message timeout, `finished_attempts < max_attempts`,
    /// and `diff <= max_poisonous_attempts`.
    pub fn defaults(config: &OutboxConfig) -> Self {
        let max_attempts = config.max_attempts;
        let max_poisonous_attempts = config.max_poisonous_attempts;
        let timeout = config.message_processing_timeout();

        Self {
            isolation_level: Arc::new(|_message| IsolationLevel::ReadCommitted),
            processing_timeout: Arc::new(move |_message| timeout),
            message_retry: Arc::new(move |message| message.finished_attempts < max_attempts),
            poisonous_retry: Arc::new(move |_message, diff| diff <= max_poisonous_attempts),
            restart_delay: config.restart_delay(),
            restart_delay_slot_in_use: config.restart_delay_slot_in_use(),
            enable_poisonous_message_protection: config.enable_poisonous_message_protection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

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

    fn msg(finished_attempts: i16) -> TransactionalMessage {
        TransactionalMessage {
            id: Uuid::now_v7(),
            aggregate_type: "order".into(),
            aggregate_id: "o-1".into(),
            message_type: "order.created".into(),
            payload: json!({}),
            metadata: None,
            created_at: Utc::now(),
            started_attempts: finished_attempts,
            finished_attempts,
            processed_at: None,
            segment: None,
            concurrency: crate::message::Concurrency::Sequential,
            locked_until: None,
            abandoned_at: None,
        }
    }

    #[test]
    fn default_retry_strategy_stops_at_max_attempts() {
        let strategies = Strategies::defaults(&config());
        assert!((strategies.message_retry)(&msg(4)));
        assert!(!(strategies.message_retry)(&msg(5)));
    }

    #[test]
    fn default_poisonous_strategy_matches_scenario_2_from_spec() {
        let strategies = Strategies::defaults(&config());
        // started=5, finished=1 after the increment -> diff=4 > max_poisonous_attempts=3
        assert!(!(strategies.poisonous_retry)(&msg(1), 4));
        assert!((strategies.poisonous_retry)(&msg(1), 3));
    }

    #[test]
    fn poisonous_protection_flag_tracks_config() {
        let mut c = config();
        c.enable_poisonous_message_protection = false;
        let strategies = Strategies::defaults(&c);
        assert!(!strategies.enable_poisonous_message_protection);
    }
}
