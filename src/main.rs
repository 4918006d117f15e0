//! PostgreSQL transactional outbox/inbox listener.
//!
//! Subscribes to a logical replication publication (or polls on an interval,
//! per `--listener-mode`) and dispatches newly inserted rows to registered
//! handlers.

use anyhow::Result;
use pg_outbox::cleanup::spawn_cleanup_task;
use pg_outbox::concurrency::{BoundedSemaphore, ConcurrencyController, FullConcurrency};
use pg_outbox::config::{ListenerMode, OutboxConfig};
use pg_outbox::db::build_pool;
use pg_outbox::errors::OutboxError;
use pg_outbox::handler::{HandlerRegistry, MessageHandler};
use pg_outbox::message::TransactionalMessage;
use pg_outbox::polling::PollingListener;
use pg_outbox::replication::ReplicationListener;
use pg_outbox::OutboxResult;
use std::io::{self, Write};
use std::sync::Arc;
use tokio_postgres::Transaction;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Default handler used when the deployment hasn't registered its own:
/// writes every message to stdout. Lets an operator smoke-test the
/// publication/slot/table wiring before writing real business handlers.
struct StdoutHandler;

#[async_trait::async_trait]
impl MessageHandler for StdoutHandler {
    async fn handle(&self, message: &TransactionalMessage, _txn: &Transaction<'_>) -> OutboxResult<()> {
        let mut stdout = io::stdout();
        writeln!(stdout, "{:#?}", message).map_err(OutboxError::Io)?;
        stdout.flush().map_err(OutboxError::Io)?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    let config = Arc::new(OutboxConfig::from_env_and_args()?);
    info!(
        mode = ?config.listener_mode,
        schema = %config.db_schema,
        table = %config.db_table,
        "starting pg-outbox-listener"
    );

    let handler_pool = build_pool(config.handler_database_url())?;
    let registry = Arc::new(HandlerRegistry::general(Arc::new(StdoutHandler)));
    // `max_concurrency == 0` means unbounded; otherwise cap with a semaphore.
    let concurrency: Arc<dyn ConcurrencyController> = if config.max_concurrency == 0 {
        Arc::new(FullConcurrency)
    } else {
        Arc::new(BoundedSemaphore::new(config.max_concurrency))
    };
    let shutdown = CancellationToken::new();

    let cleanup_handle = spawn_cleanup_task(handler_pool.clone(), config.clone(), shutdown.clone());

    let run_result: OutboxResult<()> = match config.listener_mode {
        ListenerMode::Replication => {
            let listener = Arc::new(ReplicationListener::new(
                config.clone(),
                handler_pool.clone(),
                registry.clone(),
                concurrency.clone(),
            ));
            let runner = listener.clone();
            tokio::select! {
                result = runner.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    listener.stop();
                    Ok(())
                }
            }
        }
        ListenerMode::Polling => {
            let listener = Arc::new(PollingListener::new(
                config.clone(),
                handler_pool.clone(),
                registry.clone(),
                concurrency.clone(),
                shutdown.clone(),
            ));
            tokio::select! {
                result = listener.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    shutdown.cancel();
                    Ok(())
                }
            }
        }
    };

    if let Some(handle) = cleanup_handle {
        handle.abort();
    }

    match run_result {
        Ok(()) => {
            info!("listener stopped");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "listener exited with an error");
            Err(e.into())
        }
    }
}
