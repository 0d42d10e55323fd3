use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Users
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  call_limit INTEGER NOT NULL,
  credits BIGINT NOT NULL,
  status TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Campaigns
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS campaigns (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  status TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Agents
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS agents (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  provider_agent_id TEXT NOT NULL,
  phone_number_id TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    // Phone numbers
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS phone_numbers (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  e164 TEXT NOT NULL,
  created_at_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Queue
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS queue (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  call_type TEXT NOT NULL,
  campaign_id TEXT,
  status TEXT NOT NULL,

  agent_id TEXT NOT NULL,
  contact_id TEXT,
  phone_number TEXT NOT NULL,
  user_data_json TEXT NOT NULL,
  source_number_id TEXT,

  priority BIGINT NOT NULL,
  scheduled_for_ms BIGINT NOT NULL,
  created_at_ms BIGINT NOT NULL,

  call_id TEXT,
  last_allocation_at_ms BIGINT,
  failure_reason TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    // Active calls (the concurrency authority)
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS active_calls (
  call_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  call_type TEXT NOT NULL,
  started_at_ms BIGINT NOT NULL,
  execution_id TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    // Single-row lock target for slot reservation. Every reserve
    // transaction updates this row first; the row lock lines writers up
    // so the capacity counts they read are stable.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS reserve_guard (
  id INTEGER PRIMARY KEY,
  version BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
INSERT INTO reserve_guard (id, version) VALUES (1, 0)
ON CONFLICT(id) DO NOTHING;
"#,
    )
    .execute(pool)
    .await?;

    // Terminal call records
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS calls (
  call_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  agent_id TEXT NOT NULL,
  execution_id TEXT,
  status TEXT NOT NULL,
  duration_secs BIGINT,
  created_at_ms BIGINT NOT NULL,
  completed_at_ms BIGINT
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_queue_user_status ON queue(user_id, status);"#)
        .execute(pool)
        .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_queue_status_sched ON queue(status, scheduled_for_ms);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_active_calls_user ON active_calls(user_id);"#)
        .execute(pool)
        .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_active_calls_execution ON active_calls(execution_id);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_calls_execution ON calls(execution_id);"#)
        .execute(pool)
        .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_campaigns_user ON campaigns(user_id);"#)
        .execute(pool)
        .await?;

    Ok(())
}
