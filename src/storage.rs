//! The small set of SQL operations the pipeline runs against the
//! outbox/inbox table. Every operation takes an open
//! transaction — none of them begin or commit anything themselves.

use crate::db::to_outbox_error;
use crate::errors::{OutboxError, OutboxResult, RowOutcome};
use crate::message::{Concurrency, NewMessage, TransactionalMessage};
use chrono::{DateTime, Utc};
use tokio_postgres::Transaction;
use uuid::Uuid;

/// Attempt counters loaded by `started_attempts_increment`/`initiate_processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptCounters {
    pub started_attempts: i16,
    pub finished_attempts: i16,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Identifies the table the store reads and writes, pre-validated so the
/// schema/table names can be embedded directly in SQL (never user data —
/// always a config-time identifier, validated in `OutboxConfig::validate`).
#[derive(Debug, Clone)]
pub struct TableRef {
    qualified_name: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            qualified_name: format!("{schema}.{table}"),
        }
    }

    fn sql(&self) -> &str {
        &self.qualified_name
    }
}

/// The storage operations spec.md §4.3 requires.
pub struct MessageStore<'a> {
    table: &'a TableRef,
}

impl<'a> MessageStore<'a> {
    pub fn new(table: &'a TableRef) -> Self {
        Self { table }
    }

    /// `INSERT ... ON CONFLICT(id) DO NOTHING`, returning whether a row was
    /// actually inserted (`false` means a message with this id already existed).
    pub async fn insert(&self, txn: &Transaction<'_>, message: &NewMessage) -> OutboxResult<bool> {
        let id = message.resolved_id();
        let sql = format!(
            "INSERT INTO {} (id, aggregate_type, aggregate_id, message_type, payload, metadata, segment, concurrency) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (id) DO NOTHING",
            self.table.sql()
        );
        let rows = txn
            .execute(
                &sql,
                &[
                    &id,
                    &message.aggregate_type,
                    &message.aggregate_id,
                    &message.message_type,
                    &message.payload,
                    &message.metadata,
                    &message.segment,
                    &message.concurrency.as_sql_str(),
                ],
            )
            .await
            .map_err(to_outbox_error)?;
        Ok(rows == 1)
    }

    /// `UPDATE ... SET started_attempts = started_attempts + 1 ... RETURNING ...`
    pub async fn started_attempts_increment(
        &self,
        txn: &Transaction<'_>,
        id: Uuid,
    ) -> OutboxResult<RowOutcome<AttemptCounters>> {
        let sql = format!(
            "UPDATE {} SET started_attempts = started_attempts + 1 WHERE id = $1 \
             RETURNING started_attempts, finished_attempts, processed_at",
            self.table.sql()
        );
        let row = match txn.query_opt(&sql, &[&id]).await.map_err(to_outbox_error)? {
            Some(row) => row,
            None => return Ok(RowOutcome::NotFound),
        };
        let counters = AttemptCounters {
            started_attempts: row.get(0),
            finished_attempts: row.get(1),
            processed_at: row.get(2),
        };
        if counters.processed_at.is_some() {
            return Ok(RowOutcome::AlreadyProcessed);
        }
        Ok(RowOutcome::Found(counters))
    }

    /// `SELECT ... FOR UPDATE NOWAIT` — locks the row for the rest of the
    /// transaction. A lock held by another transaction surfaces as
    /// `OutboxError::Transient` (SQLSTATE `55P03`, lock_not_available),
    /// translated by `db::to_outbox_error` before it reaches here, so this
    /// layer only has to worry about "found" vs "not found".
    pub async fn initiate_processing(
        &self,
        txn: &Transaction<'_>,
        id: Uuid,
    ) -> OutboxResult<RowOutcome<AttemptCounters>> {
        let sql = format!(
            "SELECT started_attempts, finished_attempts, processed_at FROM {} \
             WHERE id = $1 FOR UPDATE NOWAIT",
            self.table.sql()
        );
        let row = match txn.query_opt(&sql, &[&id]).await.map_err(to_outbox_error)? {
            Some(row) => row,
            None => return Ok(RowOutcome::NotFound),
        };
        let counters = AttemptCounters {
            started_attempts: row.get(0),
            finished_attempts: row.get(1),
            processed_at: row.get(2),
        };
        if counters.processed_at.is_some() {
            return Ok(RowOutcome::AlreadyProcessed);
        }
        Ok(RowOutcome::Found(counters))
    }

    /// `UPDATE ... SET processed_at = now(), finished_attempts = finished_attempts + 1 ...`
    pub async fn mark_completed(&self, txn: &Transaction<'_>, id: Uuid) -> OutboxResult<()> {
        let sql = format!(
            "UPDATE {} SET processed_at = now(), finished_attempts = finished_attempts + 1 WHERE id = $1",
            self.table.sql()
        );
        txn.execute(&sql, &[&id]).await.map_err(to_outbox_error)?;
        Ok(())
    }

    /// Either forces `finished_attempts = value` (give-up) or increments it
    /// by one (normal retry accounting), depending on `value`.
    pub async fn increase_finished_attempts(
        &self,
        txn: &Transaction<'_>,
        id: Uuid,
        value: Option<i16>,
    ) -> OutboxResult<()> {
        let sql = match value {
            Some(_) => format!("UPDATE {} SET finished_attempts = $2 WHERE id = $1", self.table.sql()),
            None => format!(
                "UPDATE {} SET finished_attempts = finished_attempts + 1 WHERE id = $1",
                self.table.sql()
            ),
        };
        match value {
            Some(v) => txn.execute(&sql, &[&id, &v]).await,
            None => txn.execute(&sql, &[&id]).await,
        }
        .map_err(to_outbox_error)?;
        Ok(())
    }

    /// `UPDATE ... SET abandoned_at = now() WHERE id = $1` — used both when a
    /// message is abandoned as poisonous (Phase 1) and when it exhausts its
    /// retry budget (Phase 3).
    pub async fn abandon(&self, txn: &Transaction<'_>, id: Uuid) -> OutboxResult<()> {
        let sql = format!("UPDATE {} SET abandoned_at = now() WHERE id = $1", self.table.sql());
        txn.execute(&sql, &[&id]).await.map_err(to_outbox_error)?;
        Ok(())
    }

    /// Invokes the server-side `next_messages` function (§4.5/§6.1), which
    /// atomically selects up to `max_size` eligible rows, leases them, and
    /// increments `started_attempts`.
    pub async fn next_batch(
        &self,
        txn: &Transaction<'_>,
        function_name: &str,
        max_size: i32,
        lease_ms: i64,
    ) -> OutboxResult<Vec<TransactionalMessage>> {
        let sql = format!("SELECT * FROM {function_name}($1, $2)");
        let rows = txn.query(&sql, &[&max_size, &lease_ms]).await.map_err(to_outbox_error)?;
        rows.iter().map(row_to_message).collect()
    }

    /// Deletes processed/abandoned rows older than `retention`, run by the
    /// scheduled cleanup task (spec.md §2, "Scheduled cleanup").
    pub async fn cleanup_older_than(
        &self,
        txn: &Transaction<'_>,
        retention: chrono::Duration,
    ) -> OutboxResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE (processed_at IS NOT NULL AND processed_at < now() - $1::interval) \
             OR (abandoned_at IS NOT NULL AND abandoned_at < now() - $1::interval)",
            self.table.sql()
        );
        let rows = txn.execute(&sql, &[&retention]).await.map_err(to_outbox_error)?;
        Ok(rows)
    }
}

/// Maps a raw row (either a polled batch row or a row reconstructed from a
/// WAL insert) to a `TransactionalMessage`,
/// and §9's "reject rows missing any required column" note.
pub fn row_to_message(row: &tokio_postgres::Row) -> OutboxResult<TransactionalMessage> {
    Ok(TransactionalMessage {
        id: row.try_get("id").map_err(|_| OutboxError::protocol("missing column: id"))?,
        aggregate_type: row
            .try_get("aggregate_type")
            .map_err(|_| OutboxError::protocol("missing column: aggregate_type"))?,
        aggregate_id: row
            .try_get("aggregate_id")
            .map_err(|_| OutboxError::protocol("missing column: aggregate_id"))?,
        message_type: row
            .try_get("message_type")
            .map_err(|_| OutboxError::protocol("missing column: message_type"))?,
        payload: row.try_get("payload").map_err(|_| OutboxError::protocol("missing column: payload"))?,
        metadata: row.try_get("metadata").ok(),
        created_at: row
            .try_get("created_at")
            .map_err(|_| OutboxError::protocol("missing column: created_at"))?,
        started_attempts: row.try_get("started_attempts").unwrap_or(0),
        finished_attempts: row.try_get("finished_attempts").unwrap_or(0),
        processed_at: row.try_get("processed_at").ok(),
        segment: row.try_get("segment").ok(),
        concurrency: row
            .try_get::<_, Option<String>>("concurrency")
            .ok()
            .flatten()
            .map(|s| Concurrency::from_sql_str(&s))
            .unwrap_or_default(),
        locked_until: row.try_get("locked_until").ok(),
        abandoned_at: row.try_get("abandoned_at").ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ref_renders_qualified_name() {
        let table = TableRef::new("public", "messages");
        assert_eq!(table.sql(), "public.messages");
    }
}
