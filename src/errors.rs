//! Error taxonomy for the outbox/inbox listener engine
//!
//! Mirrors the shape used throughout this codebase: a `thiserror`-derived
//! enum with constructor helpers, `#[from]` conversions for the ambient
//! error types we cross paths with, and a crate-wide `Result` alias.

use thiserror::Error;

/// Main error type for the listener engine.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database connection related errors.
    #[error("database connection error: {message}")]
    Connection { message: String },

    /// Configuration related errors (slot/table names, missing required env vars).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// pgoutput / replication protocol parsing errors.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Buffer read/write errors (ack frame construction, WAL frame decode).
    #[error("buffer operation error: {message}")]
    Buffer { message: String },

    /// A transient database error: serialization failure, deadlock, or a
    /// `FOR UPDATE NOWAIT` lock that was unavailable. The caller should treat
    /// the message as retryable.
    #[error("transient database error ({sqlstate}): {message}")]
    Transient { sqlstate: String, message: String },

    /// The replication slot is held by another process (SQLSTATE 55006).
    #[error("replication slot in use: {0}")]
    SlotInUse(String),

    /// The replication slot does not exist (SQLSTATE 42704).
    #[error("replication slot missing: {0}")]
    SlotMissing(String),

    /// A handler invocation exceeded `messageProcessingTimeoutInMs`.
    #[error("message processing timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The concurrency controller was cancelled while a caller was waiting
    /// on `acquire`.
    #[error("concurrency controller cancelled")]
    Cancelled,

    /// LSN acknowledgement bookkeeping error: the same LSN was registered twice.
    #[error("LSN {0} is already being processed")]
    AlreadyProcessing(u64),

    /// LSN acknowledgement bookkeeping error: `finish` was called for an LSN
    /// that was never started.
    #[error("LSN {0} was never registered as processing")]
    NotRegistered(u64),

    /// A message's started/finished attempt gap exceeded the configured
    /// poisonous-message threshold.
    #[error("message {id} abandoned as poisonous (started={started}, finished={finished})")]
    Poisonous {
        id: uuid::Uuid,
        started: i16,
        finished: i16,
    },

    /// Task join errors from spawned pipeline tasks.
    #[error("task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    /// Generic I/O.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Underlying tokio-postgres driver error.
    #[error("postgres driver error")]
    Postgres(#[from] tokio_postgres::Error),

    /// Connection pool errors.
    #[error("connection pool error")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Catch-all for handler/strategy errors that don't need a dedicated variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type OutboxResult<T> = std::result::Result<T, OutboxError>;

impl OutboxError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn buffer<S: Into<String>>(message: S) -> Self {
        Self::Buffer { message: message.into() }
    }

    pub fn transient<S: Into<String>>(sqlstate: S, message: S) -> Self {
        Self::Transient { sqlstate: sqlstate.into(), message: message.into() }
    }
}

/// Tagged outcome for row-lookup storage operations. Per the design notes,
/// these are not modeled as thrown errors: "not found" and "already
/// processed" are expected, frequent outcomes on the happy path (a message
/// vanishing between Phase 1 and Phase 2 because another consumer raced us
/// is indistinguishable from it never having existed, and both are handled
/// identically by the pipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome<T> {
    Found(T),
    NotFound,
    AlreadyProcessed,
}

impl<T> RowOutcome<T> {
    pub fn found(self) -> Option<T> {
        match self {
            RowOutcome::Found(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_actionable(&self) -> bool {
        matches!(self, RowOutcome::Found(_))
    }
}
