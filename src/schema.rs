//! DDL for the outbox/inbox table and the polling batch function
//!. These constants exist only to stand up a scratch
//! schema for the `#[ignore]`d integration tests — the DDL generator
//! tool itself is out of scope.

/// Table DDL, parameterised by schema/table name via `format!`.
pub fn create_table_sql(schema: &str, table: &str) -> String {
    format!(
        "CREATE TABLE {schema}.{table} (
  id uuid PRIMARY KEY,
  aggregate_type TEXT NOT NULL,
  aggregate_id TEXT NOT NULL,
  message_type TEXT NOT NULL,
  segment TEXT,
  concurrency TEXT NOT NULL DEFAULT 'sequential'
    CHECK (concurrency IN ('sequential','parallel')),
  payload JSONB NOT NULL,
  metadata JSONB,
  locked_until TIMESTAMPTZ NOT NULL DEFAULT to_timestamp(0),
  created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
  processed_at TIMESTAMPTZ,
  abandoned_at TIMESTAMPTZ,
  started_attempts SMALLINT NOT NULL DEFAULT 0,
  finished_attempts SMALLINT NOT NULL DEFAULT 0
);
CREATE INDEX ON {schema}.{table} (segment);
CREATE INDEX ON {schema}.{table} (created_at);
CREATE INDEX ON {schema}.{table} (processed_at);
CREATE INDEX ON {schema}.{table} (abandoned_at);"
    )
}

/// Publication DDL for the replication path: inserts only.
pub fn create_publication_sql(publication: &str, schema: &str, table: &str) -> String {
    format!("CREATE PUBLICATION {publication} FOR TABLE {schema}.{table} WITH (publish = 'insert')")
}

/// The server-side batch function implementing the two-group selection
/// algorithm from spec.md §4.5: Group A is the oldest unprocessed row per
/// segment, Group B fills remaining batch slots with the oldest
/// `concurrency = 'parallel'` rows not already in Group A, skipping rows
/// another worker already holds (`FOR NO KEY UPDATE SKIP LOCKED`... here
/// `NOWAIT`-style skip is expressed as `SKIP LOCKED` to match "rows that
/// fail ... are skipped" rather than erroring the whole batch).
pub fn create_next_messages_function_sql(schema: &str, table: &str, function_name: &str) -> String {
    format!(
        "CREATE OR REPLACE FUNCTION {schema}.{function_name}(max_size INT, lease_ms BIGINT)
RETURNS SETOF {schema}.{table} AS $$
DECLARE
  selected_ids uuid[];
BEGIN
  IF max_size < 1 THEN
    RAISE EXCEPTION 'max_size must be at least 1' USING ERRCODE = 'MAXNR';
  END IF;

  WITH group_a AS (
    SELECT DISTINCT ON (segment) id
    FROM {schema}.{table}
    WHERE segment IS NOT NULL
      AND processed_at IS NULL
      AND abandoned_at IS NULL
      AND locked_until <= now()
    ORDER BY segment, created_at
    FOR NO KEY UPDATE SKIP LOCKED
  ),
  group_b AS (
    SELECT id
    FROM {schema}.{table}
    WHERE concurrency = 'parallel'
      AND processed_at IS NULL
      AND abandoned_at IS NULL
      AND locked_until <= now()
      AND id NOT IN (SELECT id FROM group_a)
    ORDER BY created_at
    FOR NO KEY UPDATE SKIP LOCKED
    LIMIT GREATEST(max_size - (SELECT count(*) FROM group_a), 0)
  )
  SELECT array_agg(id) INTO selected_ids FROM (
    SELECT id FROM group_a
    UNION ALL
    SELECT id FROM group_b
    LIMIT max_size
  ) chosen;

  RETURN QUERY
  UPDATE {schema}.{table}
  SET locked_until = now() + (lease_ms || ' milliseconds')::interval,
      started_attempts = started_attempts + 1
  WHERE id = ANY(selected_ids)
  RETURNING *;
END;
$$ LANGUAGE plpgsql;"
    )
}
