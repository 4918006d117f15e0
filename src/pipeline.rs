//! The three-phase per-message pipeline shared by the replication listener
//! and the polling listener. Every phase runs in its own
//! transaction so a crash between phases never leaves the pipeline unable to
//! make progress on restart — the next attempt simply re-derives state from
//! the row.

use crate::db::{execute_transaction, IsolationLevel};
use crate::errors::{OutboxError, OutboxResult, RowOutcome};
use crate::handler::HandlerRegistry;
use crate::message::TransactionalMessage;
use crate::storage::{MessageStore, TableRef};
use crate::strategies::Strategies;
use deadpool_postgres::Pool;
use tracing::{debug, info, warn};

/// What the pipeline did with a message, useful for tests and for the
/// listeners' own logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Row vanished or was already processed before we got to it.
    Skipped,
    /// Abandoned as poisonous in Phase 1, before the handler ever ran.
    Poisonous,
    /// Handler ran and committed successfully.
    Processed,
    /// Handler failed or timed out; the message will be retried later.
    Retrying,
    /// Handler failed and the retry budget is exhausted; abandoned in Phase 3.
    Abandoned,
}

/// Runs the full pipeline for a single message. `message.id` is the only
/// field the pipeline trusts as a stable key — every phase reloads fresh
/// attempt counters from the row rather than relying on what the caller
/// passed in, since the row may have moved since `message` was read.
pub async fn process_message(
    pool: &Pool,
    table: &TableRef,
    registry: &HandlerRegistry,
    strategies: &Strategies,
    message: &TransactionalMessage,
) -> OutboxResult<PipelineOutcome> {
    if strategies.enable_poisonous_message_protection {
        match phase_one_poisonous_guard(pool, table, strategies, message).await? {
            PhaseOneResult::Continue => {}
            PhaseOneResult::Skipped => return Ok(PipelineOutcome::Skipped),
            PhaseOneResult::Abandoned => return Ok(PipelineOutcome::Poisonous),
        }
    }

    match phase_two_dispatch(pool, table, registry, strategies, message).await? {
        PhaseTwoResult::Skipped => return Ok(PipelineOutcome::Skipped),
        PhaseTwoResult::Processed => return Ok(PipelineOutcome::Processed),
        PhaseTwoResult::Failed(error) => {
            phase_three_error_resolution(pool, table, registry, strategies, message, error).await
        }
    }
}

enum PhaseOneResult {
    Continue,
    Skipped,
    Abandoned,
}

/// Phase 1: increment `started_attempts` and check the started/finished gap.
/// A gap larger than the configured threshold means a previous attempt
/// crashed mid-flight one too many times already (a "poisonous message");
/// such a message is abandoned before the handler ever runs again, so it can
/// never itself cause the crash that keeps it poisonous.
async fn phase_one_poisonous_guard(
    pool: &Pool,
    table: &TableRef,
    strategies: &Strategies,
    message: &TransactionalMessage,
) -> OutboxResult<PhaseOneResult> {
    let id = message.id;
    let txn_table = table.clone();
    let outcome = execute_transaction(
        pool,
        IsolationLevel::ReadCommitted,
        Box::new(move |txn| {
            Box::pin(async move {
                let store = MessageStore::new(&txn_table);
                store.started_attempts_increment(txn, id).await
            })
        }),
    )
    .await?;

    let counters = match outcome {
        RowOutcome::NotFound | RowOutcome::AlreadyProcessed => return Ok(PhaseOneResult::Skipped),
        RowOutcome::Found(counters) => counters,
    };

    let gap = counters.started_attempts - counters.finished_attempts;
    if gap <= 1 {
        return Ok(PhaseOneResult::Continue);
    }

    if !(strategies.poisonous_retry)(message, gap) {
        let poisonous = OutboxError::Poisonous {
            id,
            started: counters.started_attempts,
            finished: counters.finished_attempts,
        };
        warn!(message_id = %id, error = %poisonous, "abandoning poisonous message");
        abandon(pool, table, id).await?;
        return Ok(PhaseOneResult::Abandoned);
    }

    Ok(PhaseOneResult::Continue)
}

enum PhaseTwoResult {
    Skipped,
    Processed,
    Failed(OutboxError),
}

/// Phase 2: lock the row with `FOR UPDATE NOWAIT`, resolve a handler, and run
/// it inside the same transaction, bounded by the configured timeout. A
/// handler that returns `Ok` commits alongside `mark_completed`; anything
/// else rolls the transaction back and hands off to Phase 3.
async fn phase_two_dispatch(
    pool: &Pool,
    table: &TableRef,
    registry: &HandlerRegistry,
    strategies: &Strategies,
    message: &TransactionalMessage,
) -> OutboxResult<PhaseTwoResult> {
    let handler = match registry.resolve(message) {
        Some(handler) => handler,
        None => {
            debug!(message_id = %message.id, key = %message.registry_key(), "no handler registered for message, leaving row alone");
            return Ok(PhaseTwoResult::Skipped);
        }
    };

    let timeout = (strategies.processing_timeout)(message);
    let table = table.clone();
    let id = message.id;
    let message = message.clone();

    let result = execute_transaction(
        pool,
        (strategies.isolation_level)(&message),
        Box::new(move |txn| {
            Box::pin(async move {
                let store = MessageStore::new(&table);
                match store.initiate_processing(txn, id).await? {
                    RowOutcome::NotFound | RowOutcome::AlreadyProcessed => Ok(None),
                    RowOutcome::Found(_) => {
                        tokio::time::timeout(timeout, handler.handle(&message, txn))
                            .await
                            .map_err(|_| OutboxError::Timeout(timeout))??;
                        store.mark_completed(txn, id).await?;
                        Ok(Some(()))
                    }
                }
            })
        }),
    )
    .await;

    match result {
        Ok(Some(())) => {
            debug!(message_id = %id, "message processed");
            Ok(PhaseTwoResult::Processed)
        }
        Ok(None) => Ok(PhaseTwoResult::Skipped),
        Err(error) => Ok(PhaseTwoResult::Failed(error)),
    }
}

/// Phase 3: record the failed attempt and decide whether the message gets
/// another chance. The handler's own `handle_error` hook runs in this same
/// transaction but its result is never allowed to fail the phase — a
/// misbehaving `handle_error` must not block retry accounting.
async fn phase_three_error_resolution(
    pool: &Pool,
    table: &TableRef,
    registry: &HandlerRegistry,
    strategies: &Strategies,
    message: &TransactionalMessage,
    error: OutboxError,
) -> OutboxResult<PipelineOutcome> {
    warn!(message_id = %message.id, error = %error, "message processing failed");

    // The retry decision must see the post-increment finished_attempts count,
    // not the count the row had when the handler was dispatched.
    let mut message = message.clone();
    message.finished_attempts += 1;
    let should_retry = (strategies.message_retry)(&message);
    let handler = registry.resolve(&message);
    let table = table.clone();
    let id = message.id;
    let error_message = error.to_string();

    execute_transaction(
        pool,
        IsolationLevel::ReadCommitted,
        Box::new(move |txn| {
            Box::pin(async move {
                let store = MessageStore::new(&table);
                store.increase_finished_attempts(txn, id, None).await?;

                if !should_retry {
                    store.abandon(txn, id).await?;
                }

                if let Some(handler) = handler {
                    let outbox_error = OutboxError::Other(anyhow::anyhow!(error_message));
                    if let Err(e) = handler.handle_error(&outbox_error, &message, txn, should_retry).await {
                        warn!(message_id = %id, error = %e, "handle_error hook failed, ignoring");
                    }
                }

                Ok(())
            })
        }),
    )
    .await?;

    if should_retry {
        Ok(PipelineOutcome::Retrying)
    } else {
        info!(message_id = %message.id, "message abandoned after exhausting retry budget");
        Ok(PipelineOutcome::Abandoned)
    }
}

async fn abandon(pool: &Pool, table: &TableRef, id: uuid::Uuid) -> OutboxResult<()> {
    let table = table.clone();
    execute_transaction(
        pool,
        IsolationLevel::ReadCommitted,
        Box::new(move |txn| {
            Box::pin(async move {
                let store = MessageStore::new(&table);
                store.abandon(txn, id).await
            })
        }),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_variants_are_distinguishable() {
        assert_ne!(PipelineOutcome::Processed, PipelineOutcome::Retrying);
        assert_eq!(PipelineOutcome::Skipped, PipelineOutcome::Skipped);
    }
}
