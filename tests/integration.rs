//! End-to-end tests against a real PostgreSQL instance.
//!
//! Ignored by default because they need a database with `wal_level = logical`
//! reachable via `OUTBOX_TEST_DATABASE_URL` (the replication-specific
//! scenarios additionally need `REPLICATION` privilege on that role). These
//! exercise the pipeline the way the listeners do, without standing up a
//! real replication connection or polling loop, since that part is covered
//! by the protocol-level unit tests in `src/protocol.rs` and `src/lsn.rs`.
//!
//! Run:
//!   OUTBOX_TEST_DATABASE_URL=postgres://... cargo test --test integration -- --ignored

use async_trait::async_trait;
use chrono::Utc;
use pg_outbox::concurrency::{ConcurrencyController, DiscriminatingMutex};
use pg_outbox::config::OutboxConfig;
use pg_outbox::db::build_pool;
use pg_outbox::errors::{OutboxError, OutboxResult};
use pg_outbox::handler::{HandlerRegistry, MessageHandler};
use pg_outbox::message::{NewMessage, TransactionalMessage};
use pg_outbox::pipeline::{process_message, PipelineOutcome};
use pg_outbox::schema::{create_next_messages_function_sql, create_table_sql};
use pg_outbox::storage::{MessageStore, TableRef};
use pg_outbox::strategies::Strategies;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn test_database_url() -> Option<String> {
    std::env::var("OUTBOX_TEST_DATABASE_URL").ok()
}

fn test_config(schema: &str, table: &str, database_url: String) -> OutboxConfig {
    OutboxConfig {
        database_url,
        handler_database_url: None,
        db_schema: schema.into(),
        db_table: table.into(),
        db_publication: "outbox_pub".into(),
        db_replication_slot: "outbox_slot".into(),
        restart_delay_in_ms: 250,
        restart_delay_slot_in_use_in_ms: 10_000,
        message_processing_timeout_in_ms: 15_000,
        max_attempts: 5,
        enable_poisonous_message_protection: true,
        max_poisonous_attempts: 3,
        next_messages_function_name: "next_outbox_messages".into(),
        next_messages_function_schema: Some(schema.into()),
        next_messages_batch_size: 5,
        next_messages_polling_interval_in_ms: 500,
        next_messages_lock_in_ms: 10_000,
        cleanup_retention_in_secs: None,
        cleanup_interval_in_secs: 3600,
        max_concurrency: 10,
        listener_mode: pg_outbox::config::ListenerMode::Replication,
    }
}

/// Stands up a scratch schema (random name per test run so tests can run
/// concurrently against the same database) with the table and polling
/// function DDL, returning the pool and the chosen schema name. Callers are
/// responsible for dropping it afterwards with `DROP SCHEMA ... CASCADE`.
async fn setup_schema(database_url: &str) -> (deadpool_postgres::Pool, String) {
    let pool = build_pool(database_url).expect("build pool");
    let schema = format!("outbox_test_{}", Uuid::now_v7().simple());
    let client = pool.get().await.expect("get client");
    client
        .batch_execute(&format!("CREATE SCHEMA {schema}"))
        .await
        .expect("create schema");
    client
        .batch_execute(&create_table_sql(&schema, "messages"))
        .await
        .expect("create table");
    client
        .batch_execute(&create_next_messages_function_sql(
            &schema,
            "messages",
            "next_outbox_messages",
        ))
        .await
        .expect("create next_messages function");
    (pool, schema)
}

async fn teardown_schema(pool: &deadpool_postgres::Pool, schema: &str) {
    let client = pool.get().await.expect("get client");
    client
        .batch_execute(&format!("DROP SCHEMA {schema} CASCADE"))
        .await
        .expect("drop schema");
}

struct RecordingHandler {
    seen: Mutex<Vec<Uuid>>,
    fail_until_attempt: i16,
}

impl RecordingHandler {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_until_attempt: 0,
        }
    }

    fn failing(fail_until_attempt: i16) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_until_attempt,
        }
    }

    fn call_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        message: &TransactionalMessage,
        _txn: &tokio_postgres::Transaction<'_>,
    ) -> OutboxResult<()> {
        self.seen.lock().unwrap().push(message.id);
        if message.started_attempts <= self.fail_until_attempt {
            return Err(OutboxError::Other(anyhow::anyhow!("simulated handler failure")));
        }
        Ok(())
    }
}

#[tokio::test]
#[ignore]
async fn happy_path_two_messages_are_processed_exactly_once() {
    let Some(database_url) = test_database_url() else {
        eprintln!("skipping: OUTBOX_TEST_DATABASE_URL not set");
        return;
    };
    let (pool, schema) = setup_schema(&database_url).await;
    let config = test_config(&schema, "messages", database_url);
    let table = TableRef::new(&schema, "messages");

    let mut client = pool.get().await.unwrap();
    let txn = client.transaction().await.unwrap();
    let store = MessageStore::new(&table);
    let msg_a = NewMessage::new("order", "o-1", "order.created", serde_json::json!({"n": 1}));
    let msg_b = NewMessage::new("order", "o-2", "order.created", serde_json::json!({"n": 2}));
    let id_a = msg_a.resolved_id();
    let id_b = msg_b.resolved_id();
    assert!(store.insert(&txn, &msg_a).await.unwrap());
    assert!(store.insert(&txn, &msg_b).await.unwrap());
    txn.commit().await.unwrap();

    let handler = Arc::new(RecordingHandler::new());
    let registry = HandlerRegistry::general(handler.clone());
    let strategies = Strategies::defaults(&config);

    for id in [id_a, id_b] {
        let message = TransactionalMessage {
            id,
            aggregate_type: "order".into(),
            aggregate_id: "o".into(),
            message_type: "order.created".into(),
            payload: serde_json::json!({}),
            metadata: None,
            created_at: Utc::now(),
            started_attempts: 0,
            finished_attempts: 0,
            processed_at: None,
            segment: None,
            concurrency: pg_outbox::message::Concurrency::Sequential,
            locked_until: None,
            abandoned_at: None,
        };
        let outcome = process_message(&pool, &table, &registry, &strategies, &message)
            .await
            .unwrap();
        assert_eq!(outcome, PipelineOutcome::Processed);
    }

    assert_eq!(handler.call_count(), 2);

    let client = pool.get().await.unwrap();
    let row = client
        .query_one(
            &format!("SELECT processed_at, finished_attempts FROM {schema}.messages WHERE id = $1"),
            &[&id_a],
        )
        .await
        .unwrap();
    let processed_at: Option<chrono::DateTime<Utc>> = row.get(0);
    let finished_attempts: i16 = row.get(1);
    assert!(processed_at.is_some());
    assert_eq!(finished_attempts, 1);

    teardown_schema(&pool, &schema).await;
}

#[tokio::test]
#[ignore]
async fn poisonous_message_is_abandoned_without_invoking_the_handler() {
    let Some(database_url) = test_database_url() else {
        eprintln!("skipping: OUTBOX_TEST_DATABASE_URL not set");
        return;
    };
    let (pool, schema) = setup_schema(&database_url).await;
    let config = test_config(&schema, "messages", database_url);
    let table = TableRef::new(&schema, "messages");

    let mut client = pool.get().await.unwrap();
    let txn = client.transaction().await.unwrap();
    let store = MessageStore::new(&table);
    let new_message = NewMessage::new("order", "o-1", "order.created", serde_json::json!({}));
    let id = new_message.resolved_id();
    store.insert(&txn, &new_message).await.unwrap();
    txn.commit().await.unwrap();

    // Simulate three prior crashes: started_attempts=4, finished_attempts=1.
    client
        .execute(
            &format!("UPDATE {schema}.messages SET started_attempts = 4, finished_attempts = 1 WHERE id = $1"),
            &[&id],
        )
        .await
        .unwrap();

    let handler = Arc::new(RecordingHandler::new());
    let registry = HandlerRegistry::general(handler.clone());
    let strategies = Strategies::defaults(&config);

    let message = TransactionalMessage {
        id,
        aggregate_type: "order".into(),
        aggregate_id: "o-1".into(),
        message_type: "order.created".into(),
        payload: serde_json::json!({}),
        metadata: None,
        created_at: Utc::now(),
        started_attempts: 4,
        finished_attempts: 1,
        processed_at: None,
        segment: None,
        concurrency: pg_outbox::message::Concurrency::Sequential,
        locked_until: None,
        abandoned_at: None,
    };

    let outcome = process_message(&pool, &table, &registry, &strategies, &message)
        .await
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::Poisonous);
    assert_eq!(handler.call_count(), 0, "handler must never run for a poisonous message");

    let row = client
        .query_one(
            &format!("SELECT abandoned_at, started_attempts FROM {schema}.messages WHERE id = $1"),
            &[&id],
        )
        .await
        .unwrap();
    let abandoned_at: Option<chrono::DateTime<Utc>> = row.get(0);
    let started_attempts: i16 = row.get(1);
    assert!(abandoned_at.is_some());
    assert_eq!(started_attempts, 5);

    teardown_schema(&pool, &schema).await;
}

#[tokio::test]
#[ignore]
async fn handler_failure_within_retry_budget_leaves_the_row_unprocessed() {
    let Some(database_url) = test_database_url() else {
        eprintln!("skipping: OUTBOX_TEST_DATABASE_URL not set");
        return;
    };
    let (pool, schema) = setup_schema(&database_url).await;
    let config = test_config(&schema, "messages", database_url);
    let table = TableRef::new(&schema, "messages");

    let mut client = pool.get().await.unwrap();
    let txn = client.transaction().await.unwrap();
    let store = MessageStore::new(&table);
    let new_message = NewMessage::new("order", "o-1", "order.created", serde_json::json!({}));
    let id = new_message.resolved_id();
    store.insert(&txn, &new_message).await.unwrap();
    txn.commit().await.unwrap();

    // fail_until_attempt=100 means every attempt in this test fails.
    let handler = Arc::new(RecordingHandler::failing(100));
    let registry = HandlerRegistry::general(handler.clone());
    let strategies = Strategies::defaults(&config);

    let message = TransactionalMessage {
        id,
        aggregate_type: "order".into(),
        aggregate_id: "o-1".into(),
        message_type: "order.created".into(),
        payload: serde_json::json!({}),
        metadata: None,
        created_at: Utc::now(),
        started_attempts: 0,
        finished_attempts: 0,
        processed_at: None,
        segment: None,
        concurrency: pg_outbox::message::Concurrency::Sequential,
        locked_until: None,
        abandoned_at: None,
    };

    let outcome = process_message(&pool, &table, &registry, &strategies, &message)
        .await
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::Retrying);

    let row = client
        .query_one(
            &format!("SELECT processed_at, finished_attempts FROM {schema}.messages WHERE id = $1"),
            &[&id],
        )
        .await
        .unwrap();
    let processed_at: Option<chrono::DateTime<Utc>> = row.get(0);
    let finished_attempts: i16 = row.get(1);
    assert!(processed_at.is_none());
    assert_eq!(finished_attempts, 1);

    teardown_schema(&pool, &schema).await;
}

#[tokio::test]
#[ignore]
async fn give_up_at_max_attempts_abandons_the_message() {
    let Some(database_url) = test_database_url() else {
        eprintln!("skipping: OUTBOX_TEST_DATABASE_URL not set");
        return;
    };
    let (pool, schema) = setup_schema(&database_url).await;
    let config = test_config(&schema, "messages", database_url);
    let table = TableRef::new(&schema, "messages");

    let mut client = pool.get().await.unwrap();
    let txn = client.transaction().await.unwrap();
    let store = MessageStore::new(&table);
    let new_message = NewMessage::new("order", "o-1", "order.created", serde_json::json!({}));
    let id = new_message.resolved_id();
    store.insert(&txn, &new_message).await.unwrap();
    txn.commit().await.unwrap();

    client
        .execute(
            &format!("UPDATE {schema}.messages SET started_attempts = 4, finished_attempts = 4 WHERE id = $1"),
            &[&id],
        )
        .await
        .unwrap();

    let handler = Arc::new(RecordingHandler::failing(100));
    let registry = HandlerRegistry::general(handler.clone());
    let strategies = Strategies::defaults(&config);

    let message = TransactionalMessage {
        id,
        aggregate_type: "order".into(),
        aggregate_id: "o-1".into(),
        message_type: "order.created".into(),
        payload: serde_json::json!({}),
        metadata: None,
        created_at: Utc::now(),
        started_attempts: 4,
        finished_attempts: 4,
        processed_at: None,
        segment: None,
        concurrency: pg_outbox::message::Concurrency::Sequential,
        locked_until: None,
        abandoned_at: None,
    };

    let outcome = process_message(&pool, &table, &registry, &strategies, &message)
        .await
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::Abandoned);

    let row = client
        .query_one(
            &format!("SELECT finished_attempts, processed_at FROM {schema}.messages WHERE id = $1"),
            &[&id],
        )
        .await
        .unwrap();
    let finished_attempts: i16 = row.get(0);
    let processed_at: Option<chrono::DateTime<Utc>> = row.get(1);
    assert_eq!(finished_attempts, 5);
    assert!(processed_at.is_none());

    teardown_schema(&pool, &schema).await;
}

#[tokio::test]
#[ignore]
async fn discriminating_mutex_serializes_same_key_concurrent_messages() {
    let key_fn: pg_outbox::concurrency::KeyFn = Arc::new(|m: &TransactionalMessage| m.aggregate_id.clone());
    let controller = Arc::new(DiscriminatingMutex::new(key_fn));
    let token = CancellationToken::new();

    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..4 {
        let controller = controller.clone();
        let token = token.clone();
        let order = order.clone();
        let message = TransactionalMessage {
            id: Uuid::now_v7(),
            aggregate_type: "order".into(),
            aggregate_id: if i % 2 == 0 { "A".into() } else { "B".into() },
            message_type: "order.created".into(),
            payload: serde_json::json!({}),
            metadata: None,
            created_at: Utc::now(),
            started_attempts: 0,
            finished_attempts: 0,
            processed_at: None,
            segment: None,
            concurrency: pg_outbox::message::Concurrency::Sequential,
            locked_until: None,
            abandoned_at: None,
        };
        handles.push(tokio::spawn(async move {
            let release = controller.acquire(&message, &token).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            order.lock().unwrap().push(message.aggregate_id.clone());
            release.release();
        }));
    }

    let started = std::time::Instant::now();
    for handle in handles {
        handle.await.unwrap();
    }
    let elapsed = started.elapsed();

    // Two keys running concurrently, two messages serialized per key:
    // total wall time should be close to one round (~20ms), not four (~80ms).
    assert!(
        elapsed < std::time::Duration::from_millis(70),
        "expected same-key serialization with cross-key parallelism, took {elapsed:?}"
    );
}
