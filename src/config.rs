//! Listener configuration, unifying CLI flags and environment variables via
//! `clap`'s `env` attribute so the same binary runs unchanged from a shell
//! or a container's environment block.

use crate::errors::{OutboxError, OutboxResult};
use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Which listener implementation the binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListenerMode {
    /// Logical replication (the default).
    Replication,
    /// Periodic polling of `next_messages_function_name`, for environments
    /// that can't grant `REPLICATION` privileges.
    Polling,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pg-outbox-listener",
    about = "Transactional outbox/inbox listener for PostgreSQL",
    version
)]
pub struct OutboxConfig {
    /// PostgreSQL connection string used for the replication connection.
    #[arg(long, env = "OUTBOX_DATABASE_URL")]
    pub database_url: String,

    /// Connection string for the regular (non-replication) pool. Defaults
    /// to `database_url` when not set; split them when the listener and the
    /// handler pool should live on different PgBouncer ports.
    #[arg(long, env = "OUTBOX_HANDLER_DATABASE_URL")]
    pub handler_database_url: Option<String>,

    /// Schema holding the outbox/inbox table.
    #[arg(long, env = "OUTBOX_DB_SCHEMA", default_value = "public")]
    pub db_schema: String,

    /// Table holding outbox/inbox messages.
    #[arg(long, env = "OUTBOX_DB_TABLE", default_value = "messages")]
    pub db_table: String,

    /// Publication the listener subscribes to.
    #[arg(long, env = "OUTBOX_DB_PUBLICATION", default_value = "outbox_pub")]
    pub db_publication: String,

    /// Logical replication slot name.
    #[arg(long, env = "OUTBOX_DB_REPLICATION_SLOT", default_value = "outbox_slot")]
    pub db_replication_slot: String,

    /// Delay before reconnecting after a transient replication failure.
    #[arg(long, env = "OUTBOX_RESTART_DELAY_MS", default_value_t = 250)]
    pub restart_delay_in_ms: u64,

    /// Delay before retrying when the slot is held by another process
    /// (SQLSTATE 55006) — much longer than the default restart delay since
    /// this almost always means another instance is already running.
    #[arg(long, env = "OUTBOX_RESTART_DELAY_SLOT_IN_USE_MS", default_value_t = 10_000)]
    pub restart_delay_slot_in_use_in_ms: u64,

    /// Per-message handler timeout.
    #[arg(long, env = "OUTBOX_PROCESSING_TIMEOUT_MS", default_value_t = 15_000)]
    pub message_processing_timeout_in_ms: u64,

    /// Maximum finished attempts before a message is abandoned.
    #[arg(long, env = "OUTBOX_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: i16,

    /// Whether to detect and abandon poisonous messages (crashed mid-attempt
    /// repeatedly) rather than retrying them forever.
    #[arg(long, env = "OUTBOX_ENABLE_POISONOUS_PROTECTION", default_value_t = true)]
    pub enable_poisonous_message_protection: bool,

    /// Maximum attempt-gap (`started_attempts - finished_attempts`) before a
    /// message is treated as poisonous.
    #[arg(long, env = "OUTBOX_MAX_POISONOUS_ATTEMPTS", default_value_t = 3)]
    pub max_poisonous_attempts: i16,

    /// Name of the server-side function the polling listener calls to fetch
    /// the next batch of messages.
    #[arg(long, env = "OUTBOX_NEXT_MESSAGES_FUNCTION", default_value = "next_outbox_messages")]
    pub next_messages_function_name: String,

    /// Schema containing `next_messages_function_name`.
    #[arg(long, env = "OUTBOX_NEXT_MESSAGES_SCHEMA")]
    pub next_messages_function_schema: Option<String>,

    /// Batch size for the polling listener.
    #[arg(long, env = "OUTBOX_NEXT_MESSAGES_BATCH_SIZE", default_value_t = 5)]
    pub next_messages_batch_size: i32,

    /// Polling cadence.
    #[arg(long, env = "OUTBOX_NEXT_MESSAGES_POLLING_INTERVAL_MS", default_value_t = 500)]
    pub next_messages_polling_interval_in_ms: u64,

    /// Row lock duration used by the polling function's `FOR UPDATE SKIP
    /// LOCKED ... lock_ms` window.
    #[arg(long, env = "OUTBOX_NEXT_MESSAGES_LOCK_MS", default_value_t = 10_000)]
    pub next_messages_lock_in_ms: u64,

    /// Retention window for `cleanup`: processed/abandoned rows older than
    /// this are deleted. `None` disables cleanup.
    #[arg(long, env = "OUTBOX_CLEANUP_RETENTION_SECS")]
    pub cleanup_retention_in_secs: Option<u64>,

    /// Interval between cleanup sweeps.
    #[arg(long, env = "OUTBOX_CLEANUP_INTERVAL_SECS", default_value_t = 3600)]
    pub cleanup_interval_in_secs: u64,

    /// Maximum number of messages processed concurrently. `0` means
    /// unbounded (subject to the configured concurrency strategy).
    #[arg(long, env = "OUTBOX_MAX_CONCURRENCY", default_value_t = 10)]
    pub max_concurrency: usize,

    /// Whether to subscribe via logical replication or poll on an interval.
    #[arg(long, env = "OUTBOX_LISTENER_MODE", value_enum, default_value_t = ListenerMode::Replication)]
    pub listener_mode: ListenerMode,
}

impl OutboxConfig {
    pub fn from_env_and_args() -> OutboxResult<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> OutboxResult<()> {
        if self.database_url.trim().is_empty() {
            return Err(OutboxError::config("database_url cannot be empty"));
        }
        if !valid_identifier(&self.db_replication_slot) {
            return Err(OutboxError::config(
                "db_replication_slot can only contain alphanumeric characters and underscores",
            ));
        }
        if self.db_replication_slot.len() > 63 {
            return Err(OutboxError::config("db_replication_slot cannot be longer than 63 characters"));
        }
        if !valid_identifier(&self.db_publication) {
            return Err(OutboxError::config(
                "db_publication can only contain alphanumeric characters and underscores",
            ));
        }
        if self.max_attempts < 1 {
            return Err(OutboxError::config("max_attempts must be at least 1"));
        }
        if self.enable_poisonous_message_protection && self.max_poisonous_attempts < 1 {
            return Err(OutboxError::config("max_poisonous_attempts must be at least 1"));
        }
        if self.next_messages_batch_size < 1 {
            return Err(OutboxError::config("next_messages_batch_size must be at least 1"));
        }
        Ok(())
    }

    pub fn handler_database_url(&self) -> &str {
        self.handler_database_url.as_deref().unwrap_or(&self.database_url)
    }

    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.db_schema, self.db_table)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_in_ms)
    }

    pub fn restart_delay_slot_in_use(&self) -> Duration {
        Duration::from_millis(self.restart_delay_slot_in_use_in_ms)
    }

    pub fn message_processing_timeout(&self) -> Duration {
        Duration::from_millis(self.message_processing_timeout_in_ms)
    }

    pub fn next_messages_polling_interval(&self) -> Duration {
        Duration::from_millis(self.next_messages_polling_interval_in_ms)
    }

    pub fn next_messages_lock(&self) -> Duration {
        Duration::from_millis(self.next_messages_lock_in_ms)
    }
}

fn valid_identifier(s: &str) -> bool {
    !s.trim().is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
