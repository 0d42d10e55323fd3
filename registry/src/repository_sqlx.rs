use std::str::FromStr;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::model::{
    ActiveCall, Agent, CallRecord, CallStatus, CallType, NewQueueItem, PhoneNumber, QueueItem,
    QueueStatus, REASON_SYSTEM_LIMIT, REASON_USER_LIMIT, ReserveOutcome,
};
use crate::repository::{ActiveCallRegistry, CallLog, CallQueue, Directory};

/// Concurrency caps the registry enforces. The per-user value is the
/// default applied when a user row carries no explicit limit.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub system_limit: u32,
    pub default_user_limit: u32,
}

/// SQLx-backed implementation of every persistence seam.
/// Responsible only for persistence and row mapping.
pub struct SqlxRegistry {
    pool: AnyPool,
    cfg: RegistryConfig,
}

impl SqlxRegistry {
    pub fn new(pool: AnyPool, cfg: RegistryConfig) -> Self {
        Self { pool, cfg }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Shared reservation body. The transaction's first statement takes
    /// a row lock on the reserve guard, so concurrent reservers
    /// serialize before any count is read: whoever holds the lock sees
    /// every previously committed slot, and aggregate snapshots cannot
    /// race past the caps. The insert predicate then evaluates the
    /// system count, the user count, and the user's limit in a single
    /// statement; `rows_affected` discriminates success from a capacity
    /// miss, and the miss reason is classified under the same lock.
    /// System limit is checked first.
    async fn reserve(
        &self,
        user_id: &str,
        call_id: &str,
        call_type: CallType,
        now_ms: u64,
    ) -> anyhow::Result<Option<&'static str>> {
        let mut tx = self.pool.begin().await?;

        // Lock the guard row; held until commit.
        sqlx::query("UPDATE reserve_guard SET version = version + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;

        let res = sqlx::query(
            r#"
INSERT INTO active_calls (call_id, user_id, call_type, started_at_ms, execution_id)
SELECT ?, ?, ?, ?, NULL
WHERE (SELECT COUNT(*) FROM active_calls) < ?
  AND (SELECT COUNT(*) FROM active_calls WHERE user_id = ?)
      < COALESCE((SELECT call_limit FROM users WHERE id = ?), ?);
"#,
        )
        .bind(call_id)
        .bind(user_id)
        .bind(call_type.to_string())
        .bind(u64_to_i64(now_ms)?)
        .bind(self.cfg.system_limit as i64)
        .bind(user_id)
        .bind(user_id)
        .bind(self.cfg.default_user_limit as i64)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(None);
        }

        let system: i64 = sqlx::query("SELECT COUNT(*) FROM active_calls")
            .fetch_one(&mut *tx)
            .await?
            .get(0);

        tx.commit().await?;

        let reason = if system >= self.cfg.system_limit as i64 {
            REASON_SYSTEM_LIMIT
        } else {
            REASON_USER_LIMIT
        };

        tracing::debug!(
            user_id = %user_id,
            call_id = %call_id,
            call_type = %call_type,
            reason,
            "reserve CAS miss"
        );

        Ok(Some(reason))
    }
}

#[async_trait]
impl ActiveCallRegistry for SqlxRegistry {
    async fn reserve_direct(
        &self,
        user_id: &str,
        call_id: &str,
        now_ms: u64,
    ) -> anyhow::Result<ReserveOutcome> {
        match self
            .reserve(user_id, call_id, CallType::Direct, now_ms)
            .await?
        {
            None => Ok(ReserveOutcome::Reserved),
            // Direct calls are never rejected outright; they queue.
            Some(reason) => Ok(ReserveOutcome::Queue(reason.to_string())),
        }
    }

    async fn reserve_campaign(
        &self,
        user_id: &str,
        call_id: &str,
        now_ms: u64,
    ) -> anyhow::Result<ReserveOutcome> {
        match self
            .reserve(user_id, call_id, CallType::Campaign, now_ms)
            .await?
        {
            None => Ok(ReserveOutcome::Reserved),
            Some(reason) => Ok(ReserveOutcome::Reject(reason.to_string())),
        }
    }

    async fn attach_execution(&self, call_id: &str, execution_id: &str) -> anyhow::Result<()> {
        let res = sqlx::query("UPDATE active_calls SET execution_id = ? WHERE call_id = ?")
            .bind(execution_id)
            .bind(call_id)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            tracing::warn!(
                call_id = %call_id,
                execution_id = %execution_id,
                "attach_execution found no slot; continuing"
            );
        }

        Ok(())
    }

    async fn release(&self, call_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_calls WHERE call_id = ?")
            .bind(call_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn release_by_execution(&self, execution_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_calls WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn count_active_system(&self) -> anyhow::Result<u32> {
        let n: i64 = sqlx::query("SELECT COUNT(*) FROM active_calls")
            .fetch_one(&self.pool)
            .await?
            .get(0);

        i64_to_u32(n)
    }

    async fn count_active_user(&self, user_id: &str) -> anyhow::Result<u32> {
        let n: i64 = sqlx::query("SELECT COUNT(*) FROM active_calls WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?
            .get(0);

        i64_to_u32(n)
    }

    async fn list_active_user(&self, user_id: &str) -> anyhow::Result<Vec<ActiveCall>> {
        let rows = sqlx::query(
            r#"
SELECT call_id, user_id, call_type, started_at_ms, execution_id
FROM active_calls
WHERE user_id = ?
ORDER BY started_at_ms ASC;
"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_active_call(&r) {
                Ok(c) => out.push(c),
                Err(e) => {
                    // poison-row resilience: skip but don't fail the listing
                    tracing::warn!(error = %e, "skipping malformed active_calls row");
                }
            }
        }

        Ok(out)
    }

    async fn cleanup_orphans(&self, stale_after_ms: u64, now_ms: u64) -> anyhow::Result<u64> {
        let cutoff = now_ms.saturating_sub(stale_after_ms);

        let res = sqlx::query(
            r#"
DELETE FROM active_calls
WHERE started_at_ms < ?
  AND NOT EXISTS (
    SELECT 1 FROM calls
    WHERE calls.call_id = active_calls.call_id
      AND calls.status IN ('pending', 'in_progress')
  );
"#,
        )
        .bind(u64_to_i64(cutoff)?)
        .execute(&self.pool)
        .await?;

        let removed = res.rows_affected();
        if removed > 0 {
            tracing::info!(removed, "cleaned up orphaned active call slots");
        }

        Ok(removed)
    }
}

#[async_trait]
impl CallQueue for SqlxRegistry {
    async fn enqueue(&self, item: NewQueueItem, now_ms: u64) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        let user_data_json =
            serde_json::to_string(&item.user_data).context("serialize user_data")?;

        sqlx::query(
            r#"
INSERT INTO queue (
  id, user_id, call_type, campaign_id, status,
  agent_id, contact_id, phone_number, user_data_json, source_number_id,
  priority, scheduled_for_ms, created_at_ms,
  call_id, last_allocation_at_ms, failure_reason
)
VALUES (?, ?, ?, ?, 'queued', ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL);
"#,
        )
        .bind(&id)
        .bind(&item.user_id)
        .bind(item.call_type.to_string())
        .bind(&item.campaign_id)
        .bind(&item.agent_id)
        .bind(&item.contact_id)
        .bind(&item.phone_number)
        .bind(user_data_json)
        .bind(&item.source_number_id)
        .bind(item.priority)
        .bind(u64_to_i64(item.scheduled_for_ms)?)
        .bind(u64_to_i64(now_ms)?)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn users_with_eligible_items(&self, now_ms: u64) -> anyhow::Result<Vec<String>> {
        // User-level fairness order. Never-allocated users coalesce to 0
        // and therefore lead.
        let rows = sqlx::query(
            r#"
SELECT q.user_id AS user_id,
       COALESCE(MIN(q.last_allocation_at_ms), 0) AS first_alloc,
       MIN(q.created_at_ms) AS first_created
FROM queue q
LEFT JOIN campaigns c ON q.campaign_id = c.id
WHERE q.status = 'queued'
  AND q.scheduled_for_ms <= ?
  AND (q.call_type = 'direct' OR c.status = 'active')
GROUP BY q.user_id
ORDER BY first_alloc ASC, first_created ASC;
"#,
        )
        .bind(u64_to_i64(now_ms)?)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| r.get::<String, _>("user_id"))
            .collect())
    }

    async fn pop_next_eligible(
        &self,
        user_id: &str,
        now_ms: u64,
    ) -> anyhow::Result<Option<QueueItem>> {
        // Candidate select + status CAS. A miss means another writer got
        // the row first; retry against the next candidate a few times.
        for _ in 0..3 {
            let row = sqlx::query(
                r#"
SELECT q.id, q.user_id, q.call_type, q.campaign_id, q.status,
       q.agent_id, q.contact_id, q.phone_number, q.user_data_json, q.source_number_id,
       q.priority, q.scheduled_for_ms, q.created_at_ms,
       q.call_id, q.last_allocation_at_ms, q.failure_reason
FROM queue q
LEFT JOIN campaigns c ON q.campaign_id = c.id
WHERE q.user_id = ?
  AND q.status = 'queued'
  AND q.scheduled_for_ms <= ?
  AND (q.call_type = 'direct' OR c.status = 'active')
ORDER BY q.priority DESC, q.scheduled_for_ms ASC, q.created_at_ms ASC
LIMIT 1;
"#,
            )
            .bind(user_id)
            .bind(u64_to_i64(now_ms)?)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let mut item = row_to_queue_item(&row)?;

            let res = sqlx::query(
                r#"
UPDATE queue
SET status = 'processing', last_allocation_at_ms = ?, failure_reason = NULL
WHERE id = ? AND status = 'queued';
"#,
            )
            .bind(u64_to_i64(now_ms)?)
            .bind(&item.id)
            .execute(&self.pool)
            .await?;

            if res.rows_affected() != 1 {
                tracing::debug!(item_id = %item.id, "pop CAS miss; retrying");
                continue;
            }

            item.status = QueueStatus::Processing;
            item.last_allocation_at_ms = Some(now_ms);
            item.failure_reason = None;
            return Ok(Some(item));
        }

        Ok(None)
    }

    async fn revert_to_queued(&self, item_id: &str, reason: &str) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
UPDATE queue
SET status = 'queued', failure_reason = ?, call_id = NULL
WHERE id = ? AND status = 'processing';
"#,
        )
        .bind(reason)
        .bind(item_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(anyhow!("revert_to_queued: item {} not processing", item_id));
        }

        Ok(())
    }

    async fn mark_failed(&self, item_id: &str, reason: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
UPDATE queue
SET status = 'failed', failure_reason = ?
WHERE id = ? AND status IN ('queued', 'processing');
"#,
        )
        .bind(reason)
        .bind(item_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn attach_call(&self, item_id: &str, call_id: &str) -> anyhow::Result<()> {
        let res = sqlx::query("UPDATE queue SET call_id = ? WHERE id = ?")
            .bind(call_id)
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(anyhow!("attach_call: queue item {} not found", item_id));
        }

        Ok(())
    }

    async fn complete_by_call(&self, call_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
UPDATE queue
SET status = 'completed'
WHERE call_id = ? AND status = 'processing';
"#,
        )
        .bind(call_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, item_id: &str) -> anyhow::Result<Option<QueueItem>> {
        let row = sqlx::query(
            r#"
SELECT id, user_id, call_type, campaign_id, status,
       agent_id, contact_id, phone_number, user_data_json, source_number_id,
       priority, scheduled_for_ms, created_at_ms,
       call_id, last_allocation_at_ms, failure_reason
FROM queue
WHERE id = ?;
"#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_queue_item(&r)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Directory for SqlxRegistry {
    async fn credits(&self, user_id: &str) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT credits FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(r.get::<i64, _>("credits")),
            None => {
                tracing::warn!(user_id = %user_id, "credits lookup for unknown user");
                Ok(0)
            }
        }
    }

    async fn call_limit(&self, user_id: &str) -> anyhow::Result<u32> {
        let row = sqlx::query("SELECT call_limit FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => i64_to_u32(r.get::<i64, _>("call_limit")),
            None => Ok(self.cfg.default_user_limit),
        }
    }

    async fn pause_active_campaigns(&self, user_id: &str) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
UPDATE campaigns
SET status = 'paused'
WHERE user_id = ? AND status = 'active';
"#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let paused = res.rows_affected();
        if paused > 0 {
            tracing::info!(user_id = %user_id, paused, "paused campaigns for user out of credits");
        }

        Ok(paused)
    }

    async fn agent(&self, agent_id: &str) -> anyhow::Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, user_id, provider_agent_id, phone_number_id FROM agents WHERE id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Agent {
            id: r.get("id"),
            user_id: r.get("user_id"),
            provider_agent_id: r.get("provider_agent_id"),
            phone_number_id: r.get("phone_number_id"),
        }))
    }

    async fn phone_number(&self, id: &str) -> anyhow::Result<Option<PhoneNumber>> {
        let row =
            sqlx::query("SELECT id, user_id, e164, created_at_ms FROM phone_numbers WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(r) => Ok(Some(row_to_phone_number(&r)?)),
            None => Ok(None),
        }
    }

    async fn newest_phone_number(&self, user_id: &str) -> anyhow::Result<Option<PhoneNumber>> {
        let row = sqlx::query(
            r#"
SELECT id, user_id, e164, created_at_ms
FROM phone_numbers
WHERE user_id = ?
ORDER BY created_at_ms DESC
LIMIT 1;
"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_phone_number(&r)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CallLog for SqlxRegistry {
    async fn record_placed(&self, rec: &CallRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO calls (
  call_id, user_id, agent_id, execution_id, status,
  duration_secs, created_at_ms, completed_at_ms
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(call_id) DO UPDATE SET
  execution_id = excluded.execution_id,
  status = excluded.status;
"#,
        )
        .bind(&rec.call_id)
        .bind(&rec.user_id)
        .bind(&rec.agent_id)
        .bind(&rec.execution_id)
        .bind(rec.status.to_string())
        .bind(rec.duration_secs.map(|v| v as i64))
        .bind(u64_to_i64(rec.created_at_ms)?)
        .bind(rec.completed_at_ms.map(|v| v as i64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_terminal_by_execution(
        &self,
        execution_id: &str,
        status: CallStatus,
        duration_secs: Option<u64>,
        now_ms: u64,
    ) -> anyhow::Result<Option<String>> {
        if !status.is_terminal() {
            return Err(anyhow!("mark_terminal called with non-terminal {status}"));
        }

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT call_id FROM calls WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let call_id: String = row.get("call_id");

        // Idempotency: an already-terminal record is left as-is.
        sqlx::query(
            r#"
UPDATE calls
SET status = ?, duration_secs = ?, completed_at_ms = ?
WHERE call_id = ? AND status IN ('pending', 'in_progress');
"#,
        )
        .bind(status.to_string())
        .bind(duration_secs.map(|v| v as i64))
        .bind(u64_to_i64(now_ms)?)
        .bind(&call_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(call_id))
    }

    async fn find_by_execution(&self, execution_id: &str) -> anyhow::Result<Option<CallRecord>> {
        let row = sqlx::query(
            r#"
SELECT call_id, user_id, agent_id, execution_id, status,
       duration_secs, created_at_ms, completed_at_ms
FROM calls
WHERE execution_id = ?;
"#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_call_record(&r)?)),
            None => Ok(None),
        }
    }

    async fn find_latest_open_by_agent(&self, agent_id: &str) -> anyhow::Result<Option<CallRecord>> {
        let row = sqlx::query(
            r#"
SELECT call_id, user_id, agent_id, execution_id, status,
       duration_secs, created_at_ms, completed_at_ms
FROM calls
WHERE agent_id = ? AND status IN ('pending', 'in_progress')
ORDER BY created_at_ms DESC
LIMIT 1;
"#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_call_record(&r)?)),
            None => Ok(None),
        }
    }
}

/* =========================
Row mapping + conversions
========================= */

fn row_to_active_call(r: &sqlx::any::AnyRow) -> anyhow::Result<ActiveCall> {
    let type_str: String = r.get("call_type");

    Ok(ActiveCall {
        call_id: r.get("call_id"),
        user_id: r.get("user_id"),
        call_type: CallType::from_str(&type_str)?,
        started_at_ms: i64_to_u64(r.get("started_at_ms"))?,
        execution_id: r.get("execution_id"),
    })
}

fn row_to_queue_item(r: &sqlx::any::AnyRow) -> anyhow::Result<QueueItem> {
    let type_str: String = r.get("call_type");
    let status_str: String = r.get("status");
    let user_data_json: String = r.get("user_data_json");

    let user_data: serde_json::Value =
        serde_json::from_str(&user_data_json).context("invalid user_data_json")?;

    Ok(QueueItem {
        id: r.get("id"),
        user_id: r.get("user_id"),
        call_type: CallType::from_str(&type_str)?,
        campaign_id: r.get("campaign_id"),
        status: QueueStatus::from_str(&status_str)?,
        agent_id: r.get("agent_id"),
        contact_id: r.get("contact_id"),
        phone_number: r.get("phone_number"),
        user_data,
        source_number_id: r.get("source_number_id"),
        priority: r.get("priority"),
        scheduled_for_ms: i64_to_u64(r.get("scheduled_for_ms"))?,
        created_at_ms: i64_to_u64(r.get("created_at_ms"))?,
        call_id: r.get("call_id"),
        last_allocation_at_ms: r
            .get::<Option<i64>, _>("last_allocation_at_ms")
            .map(i64_to_u64)
            .transpose()?,
        failure_reason: r.get("failure_reason"),
    })
}

fn row_to_phone_number(r: &sqlx::any::AnyRow) -> anyhow::Result<PhoneNumber> {
    Ok(PhoneNumber {
        id: r.get("id"),
        user_id: r.get("user_id"),
        e164: r.get("e164"),
        created_at_ms: i64_to_u64(r.get("created_at_ms"))?,
    })
}

fn row_to_call_record(r: &sqlx::any::AnyRow) -> anyhow::Result<CallRecord> {
    let status_str: String = r.get("status");

    Ok(CallRecord {
        call_id: r.get("call_id"),
        user_id: r.get("user_id"),
        agent_id: r.get("agent_id"),
        execution_id: r.get("execution_id"),
        status: CallStatus::from_str(&status_str)?,
        duration_secs: r
            .get::<Option<i64>, _>("duration_secs")
            .map(i64_to_u64)
            .transpose()?,
        created_at_ms: i64_to_u64(r.get("created_at_ms"))?,
        completed_at_ms: r
            .get::<Option<i64>, _>("completed_at_ms")
            .map(i64_to_u64)
            .transpose()?,
    })
}

/* =========================
Numeric safety helpers
========================= */

fn i64_to_u64(v: i64) -> anyhow::Result<u64> {
    if v < 0 {
        return Err(anyhow!("negative i64 where u64 expected: {v}"));
    }
    Ok(v as u64)
}

fn i64_to_u32(v: i64) -> anyhow::Result<u32> {
    if v < 0 || v > u32::MAX as i64 {
        return Err(anyhow!("out of range for u32: {v}"));
    }
    Ok(v as u32)
}

fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    if v > i64::MAX as u64 {
        return Err(anyhow!("u64 too large for i64: {v}"));
    }
    Ok(v as i64)
}
