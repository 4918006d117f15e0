//! The logical replication listener: connects a dedicated
//! replication client, reads the `copyData` stream, parses pgoutput WAL
//! records, and drives the per-message pipeline with out-of-order LSN
//! acknowledgement.

use crate::ack_manager::AcknowledgeManager;
use crate::concurrency::ConcurrencyController;
use crate::config::OutboxConfig;
use crate::db::{build_pool, IsolationLevel};
use crate::errors::{OutboxError, OutboxResult};
use crate::handler::HandlerRegistry;
use crate::lsn::Lsn;
use crate::message::{Concurrency, TransactionalMessage};
use crate::pipeline::{process_message, PipelineOutcome};
use crate::protocol::{
    ColumnData, KeepaliveMessage, MessageParser, RelationCache, RelationInfo, ReplicationMessage,
    StandbyStatusUpdate, TupleData, XLogDataMessage,
};
use crate::storage::TableRef;
use crate::strategies::Strategies;
use crate::tracing_context::TracingContext;
use bytes::Bytes;
use deadpool_postgres::Pool;
use futures_util::{SinkExt, StreamExt};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

/// Listener lifecycle state, tracked purely for logging/observability:
/// `Stopped -> Connecting -> Subscribed -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Stopped,
    Connecting,
    Subscribed,
}

/// Drives the WAL reader loop, restarting with a configured backoff after
/// any fatal error. Owns no process-global state: everything
/// (the `stopped` flag, the acknowledge manager, the concurrency
/// controller) lives on this instance.
pub struct ReplicationListener {
    config: Arc<OutboxConfig>,
    table: TableRef,
    registry: Arc<HandlerRegistry>,
    strategies: Strategies,
    concurrency: Arc<dyn ConcurrencyController>,
    handler_pool: Pool,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl ReplicationListener {
    pub fn new(
        config: Arc<OutboxConfig>,
        handler_pool: Pool,
        registry: Arc<HandlerRegistry>,
        concurrency: Arc<dyn ConcurrencyController>,
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
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Signals every in-flight `acquire`/wait to abort and stops further
    /// restarts from being scheduled.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    /// Runs until `stop()` is called, restarting the connection after each
    /// recoverable error according to the configured restart delay.
    pub async fn run(self: Arc<Self>) -> OutboxResult<()> {
        while !self.stopped.load(Ordering::SeqCst) {
            let mut state = ListenerState::Stopped;
            match self.run_once(&mut state).await {
                Ok(()) => {
                    info!("replication loop exited cleanly, stopping");
                    break;
                }
                Err(err) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    let delay = self.restart_delay_for(&err);
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "replication loop failed, restarting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        Ok(())
    }

    fn restart_delay_for(&self, err: &OutboxError) -> Duration {
        match err {
            OutboxError::SlotInUse(_) => self.strategies.restart_delay_slot_in_use,
            _ => self.strategies.restart_delay,
        }
    }

    /// One connect-subscribe-stream attempt. Returns `Ok(())` only if the
    /// loop was asked to stop; any other termination is an error that
    /// triggers a restart.
    async fn run_once(&self, state: &mut ListenerState) -> OutboxResult<()> {
        *state = ListenerState::Connecting;
        let tracing_context = TracingContext::new();

        self.run_preflight_checks().await?;

        let pg_config = Config::from_str(&self.config.database_url)
            .map_err(|e| OutboxError::config(format!("invalid database_url: {e}")))?;
        let mut replication_config = pg_config;
        replication_config.replication_mode(ReplicationMode::Logical);

        let (client, connection) = replication_config
            .connect(NoTls)
            .await
            .map_err(|e| OutboxError::connection(format!("replication connect failed: {e}")))?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "replication connection driver terminated");
            }
        });

        let start_replication_sql = format!(
            "START_REPLICATION SLOT {} LOGICAL 0/0 (proto_version '2', publication_names '{}')",
            quote_ident(&self.config.db_replication_slot),
            self.config.db_publication
        );

        let duplex_stream = client
            .copy_both_simple::<Bytes>(&start_replication_sql)
            .await
            .map_err(map_start_replication_error)?;
        tokio::pin!(duplex_stream);

        *state = ListenerState::Subscribed;
        info!(
            slot = %self.config.db_replication_slot,
            publication = %self.config.db_publication,
            correlation_id = %tracing_context.correlation_id,
            "subscribed to logical replication stream"
        );

        let ack_manager = Arc::new(AcknowledgeManager::new());
        let mut relations = RelationCache::new();
        // Carries the largest LSN each spawned pipeline task has finished
        // with, so `run_once` — the only place holding `duplex_stream` — can
        // send the standby status update once it is actually safe to.
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<Lsn>();

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }

            tokio::select! {
                frame = duplex_stream.next() => {
                    let frame = match frame {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => return Err(OutboxError::connection(format!("copyData read failed: {e}"))),
                        None => return Err(OutboxError::connection("replication stream closed by server")),
                    };

                    if frame.is_empty() {
                        continue;
                    }

                    match frame[0] {
                        b'w' => {
                            let xlog = XLogDataMessage::parse(&frame)?;
                            self.handle_xlog_data(&xlog, &mut relations, &ack_manager, &tracing_context, &ack_tx).await;
                        }
                        b'k' => {
                            let keepalive = KeepaliveMessage::parse(&frame)?;
                            if keepalive.reply_requested {
                                let keepalive_lsn = Lsn::new(keepalive.wal_end);
                                trace!(%keepalive_lsn, "keepalive requested a reply");
                                match advance_for_keepalive(&ack_manager, keepalive_lsn).await {
                                    Ok(Some(safe_lsn)) => {
                                        self.send_feedback(&mut duplex_stream, safe_lsn).await?;
                                    }
                                    Ok(None) => {
                                        trace!(%keepalive_lsn, "messages still in flight, withholding standby status update");
                                    }
                                    Err(e) => {
                                        warn!(error = %e, %keepalive_lsn, "failed to advance acknowledge manager for keepalive");
                                    }
                                }
                            }
                        }
                        other => {
                            warn!(byte = other, "unknown copyData frame type, dropping");
                        }
                    }
                }
                Some(safe_lsn) = ack_rx.recv() => {
                    self.send_feedback(&mut duplex_stream, safe_lsn).await?;
                }
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn handle_xlog_data(
        &self,
        xlog: &XLogDataMessage,
        relations: &mut RelationCache,
        ack_manager: &Arc<AcknowledgeManager>,
        tracing_context: &TracingContext,
        ack_tx: &mpsc::UnboundedSender<Lsn>,
    ) {
        let message = match MessageParser::parse_wal_message(&xlog.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to parse pgoutput message, dropping");
                return;
            }
        };

        match message {
            ReplicationMessage::Relation { relation } => {
                relations.add(relation);
            }
            ReplicationMessage::Insert {
                relation_id,
                tuple_data,
                ..
            } => {
                let Some(relation) = relations.get(relation_id) else {
                    warn!(relation_id, "insert for unknown relation, dropping (no prior Relation message)");
                    return;
                };
                if !self.relation_matches_configured_table(relation) {
                    return;
                }
                match row_to_message(relation, &tuple_data) {
                    Ok(transactional_message) => {
                        self.dispatch(
                            transactional_message,
                            Lsn::new(xlog.data_start),
                            ack_manager.clone(),
                            tracing_context.correlation_id.clone(),
                            ack_tx.clone(),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "insert row missing required columns, dropping");
                    }
                }
            }
            other => {
                debug!(message_type = other.message_type(), "ignoring non-insert pgoutput message");
            }
        }
    }

    fn relation_matches_configured_table(&self, relation: &RelationInfo) -> bool {
        relation.namespace == self.config.db_schema && relation.relation_name == self.config.db_table
    }

    /// Spawns the pipeline for one message. The LSN is registered with the
    /// acknowledge manager before the task is spawned so a burst of WAL
    /// inserts can never race the ack manager's bookkeeping.
    fn dispatch(
        &self,
        message: TransactionalMessage,
        lsn: Lsn,
        ack_manager: Arc<AcknowledgeManager>,
        correlation_id: crate::tracing_context::CorrelationId,
        ack_tx: mpsc::UnboundedSender<Lsn>,
    ) {
        let concurrency = self.concurrency.clone();
        let handler_pool = self.handler_pool.clone();
        let table = self.table.clone();
        let registry = self.registry.clone();
        let strategies = self.strategies.clone();
        let cancel = self.shutdown.clone();
        let timeout = (strategies.processing_timeout)(&message);
        let span = tracing::debug_span!("process_message", correlation_id = %correlation_id, message_id = %message.id, %lsn);

        let task = async move {
            if let Err(e) = ack_manager.start_processing(lsn).await {
                error!(error = %e, %lsn, "failed to register LSN with acknowledge manager");
                return;
            }

            let release = match concurrency.acquire(&message, &cancel).await {
                Ok(release) => release,
                Err(e) => {
                    warn!(error = %e, %lsn, "concurrency controller refused message, LSN left unacknowledged for redelivery");
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
                Ok(Ok(outcome)) => {
                    debug!(message_id = %message.id, ?outcome, %lsn, "pipeline finished");
                    if matches!(outcome, PipelineOutcome::Retrying) {
                        debug!(message_id = %message.id, %lsn, "message will be retried, LSN left unacknowledged for redelivery");
                    } else {
                        match ack_manager.finish_processing(lsn).await {
                            Ok(Some(safe_lsn)) => {
                                let _ = ack_tx.send(safe_lsn);
                            }
                            Ok(None) => {}
                            Err(e) => error!(error = %e, %lsn, "failed to finish LSN bookkeeping"),
                        }
                    }
                }
                Ok(Err(e)) => {
                    error!(error = %e, message_id = %message.id, %lsn, "pipeline returned an unexpected error, LSN left unacknowledged");
                }
                Err(_) => {
                    warn!(message_id = %message.id, %lsn, "message processing timed out, LSN left unacknowledged for redelivery");
                }
            }
        };

        tokio::spawn(task.instrument(span));
    }

    async fn send_feedback(
        &self,
        stream: &mut Pin<&mut tokio_postgres::CopyBothDuplexStream<Bytes>>,
        received_lsn: Lsn,
    ) -> OutboxResult<()> {
        let next = received_lsn.next();
        let update = StandbyStatusUpdate {
            write_lsn: next.raw(),
            flush_lsn: next.raw(),
            apply_lsn: next.raw(),
            client_time: crate::wire::system_time_to_postgres_timestamp(SystemTime::now()) as u64,
            reply_requested: false,
        };
        let bytes = update.to_bytes()?;
        stream
            .as_mut()
            .send(Bytes::copy_from_slice(&bytes))
            .await
            .map_err(|e| OutboxError::connection(format!("failed to send standby status update: {e}")))
    }

    /// Verifies `wal_level = logical`, the publication, and the replication
    /// slot on a plain (non-replication) connection, creating the slot when
    /// it is missing.
    async fn run_preflight_checks(&self) -> OutboxResult<()> {
        let pool = build_pool(self.config.handler_database_url())?;
        let client = pool.get().await?;

        let wal_level: String = client
            .query_one("SHOW wal_level", &[])
            .await
            .map_err(|e| OutboxError::connection(format!("failed to check wal_level: {e}")))?
            .get(0);
        if wal_level != "logical" {
            return Err(OutboxError::config(format!(
                "wal_level is '{wal_level}', expected 'logical'"
            )));
        }

        let publication_exists: bool = client
            .query_opt(
                "SELECT 1 FROM pg_publication WHERE pubname = $1",
                &[&self.config.db_publication],
            )
            .await?
            .is_some();
        if !publication_exists {
            return Err(OutboxError::config(format!(
                "publication '{}' does not exist",
                self.config.db_publication
            )));
        }

        let slot_exists: bool = client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.config.db_replication_slot],
            )
            .await?
            .is_some();
        if !slot_exists {
            info!(slot = %self.config.db_replication_slot, "replication slot missing, creating it");
            client
                .execute(
                    "SELECT pg_create_logical_replication_slot($1, 'pgoutput')",
                    &[&self.config.db_replication_slot],
                )
                .await
                .map_err(|e| OutboxError::connection(format!("failed to create replication slot: {e}")))?;
        }

        Ok(())
    }
}

/// Maps a pgoutput `Insert`'s tuple data onto a `TransactionalMessage`,
/// validating every required column
/// `metadata`/`segment`/`concurrency`/`locked_until` are optional.
fn row_to_message(relation: &RelationInfo, tuple: &TupleData) -> OutboxResult<TransactionalMessage> {
    let required = |name: &str| -> OutboxResult<&str> {
        tuple
            .text(relation, name)
            .ok_or_else(|| OutboxError::protocol(format!("insert row missing required column: {name}")))
    };

    let id = Uuid::parse_str(required("id")?)
        .map_err(|e| OutboxError::protocol(format!("invalid id column: {e}")))?;
    let aggregate_type = required("aggregate_type")?.to_string();
    let aggregate_id = required("aggregate_id")?.to_string();
    let message_type = required("message_type")?.to_string();
    let created_at_raw = required("created_at")?;
    let created_at = chrono::DateTime::parse_from_str(created_at_raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(created_at_raw))
        .map_err(|e| OutboxError::protocol(format!("invalid created_at column: {e}")))?
        .with_timezone(&chrono::Utc);
    let payload_raw = required("payload")?;
    let payload: serde_json::Value = serde_json::from_str(payload_raw)
        .map_err(|e| OutboxError::protocol(format!("invalid payload column: {e}")))?;

    let has_metadata_column = relation.columns.iter().any(|c| c.column_name == "metadata");
    if !has_metadata_column {
        return Err(OutboxError::protocol("insert row missing required column: metadata"));
    }
    let metadata = match tuple.text(relation, "metadata") {
        Some(raw) => serde_json::from_str(raw).ok(),
        None => None,
    };

    let segment = tuple.text(relation, "segment").map(str::to_string);
    let concurrency = tuple
        .text(relation, "concurrency")
        .map(Concurrency::from_sql_str)
        .unwrap_or_default();
    let locked_until = tuple
        .text(relation, "locked_until")
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc));

    Ok(TransactionalMessage {
        id,
        aggregate_type,
        aggregate_id,
        message_type,
        payload,
        metadata,
        created_at,
        started_attempts: 0,
        finished_attempts: 0,
        processed_at: None,
        segment,
        concurrency,
        locked_until,
        abandoned_at: None,
    })
}

/// A reply-requested keepalive carries the server's current WAL end, not a
/// message LSN, but per the protocol it should still be treated as
/// immediately processable: register it, finish it at once, and see whether
/// that unblocks anything pending below it. If messages are still in
/// flight below `lsn`, `finish_processing` correctly reports nothing is
/// safe to acknowledge yet.
async fn advance_for_keepalive(
    ack_manager: &AcknowledgeManager,
    lsn: Lsn,
) -> OutboxResult<Option<Lsn>> {
    match ack_manager.start_processing(lsn).await {
        Ok(()) => ack_manager.finish_processing(lsn).await,
        Err(OutboxError::AlreadyProcessing(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Classifies a `START_REPLICATION`/slot-acquire failure by SQLSTATE per
/// spec.md §4.4/§7: `55006` (object in use) and `42704` (undefined object)
/// get dedicated restart handling; everything else is a generic connection
/// error.
fn map_start_replication_error(err: tokio_postgres::Error) -> OutboxError {
    match err.code() {
        Some(&SqlState::OBJECT_IN_USE) => OutboxError::SlotInUse(err.to_string()),
        Some(&SqlState::UNDEFINED_OBJECT) => OutboxError::SlotMissing(err.to_string()),
        _ => OutboxError::connection(format!("START_REPLICATION failed: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ColumnInfo;

    fn relation_with(columns: &[&str]) -> RelationInfo {
        RelationInfo {
            oid: 1,
            namespace: "public".into(),
            relation_name: "messages".into(),
            replica_identity: 'd',
            column_count: columns.len() as i16,
            columns: columns
                .iter()
                .map(|name| ColumnInfo {
                    key_flag: 0,
                    column_name: name.to_string(),
                    column_type: 25,
                    atttypmod: -1,
                })
                .collect(),
        }
    }

    fn text_column(value: &str) -> ColumnData {
        ColumnData {
            data_type: 't',
            length: value.len() as i32,
            data: value.to_string(),
        }
    }

    #[test]
    fn row_to_message_maps_required_columns() {
        let relation = relation_with(&[
            "id",
            "aggregate_type",
            "aggregate_id",
            "message_type",
            "created_at",
            "payload",
            "metadata",
        ]);
        let tuple = TupleData {
            column_count: 7,
            columns: vec![
                text_column(&Uuid::now_v7().to_string()),
                text_column("order"),
                text_column("o-1"),
                text_column("order.created"),
                text_column("2024-01-01T00:00:00Z"),
                text_column("{\"total\":1}"),
                ColumnData { data_type: 'n', length: 0, data: String::new() },
            ],
            processed_length: 0,
        };

        let message = row_to_message(&relation, &tuple).unwrap();
        assert_eq!(message.aggregate_type, "order");
        assert_eq!(message.payload, serde_json::json!({"total": 1}));
        assert!(message.metadata.is_none());
    }

    #[test]
    fn row_to_message_rejects_missing_required_column() {
        let relation = relation_with(&["id", "aggregate_type"]);
        let tuple = TupleData {
            column_count: 2,
            columns: vec![text_column(&Uuid::now_v7().to_string()), text_column("order")],
            processed_length: 0,
        };
        assert!(row_to_message(&relation, &tuple).is_err());
    }

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("outbox_slot"), "\"outbox_slot\"");
        assert_eq!(quote_ident("weird\"slot"), "\"weird\"\"slot\"");
    }
}
