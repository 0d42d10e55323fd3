//! Read-only aggregates behind the cached views.
//!
//! These queries are what the cache refresher re-computes; they never
//! mutate state and tolerate empty tables.

use serde_json::{Value, json};
use sqlx::{AnyPool, Row};

pub async fn dashboard_overview(pool: &AnyPool, user_id: &str) -> anyhow::Result<Value> {
    let active: i64 = sqlx::query("SELECT COUNT(*) FROM active_calls WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await?
        .get(0);

    let queued: i64 =
        sqlx::query("SELECT COUNT(*) FROM queue WHERE user_id = ? AND status = 'queued'")
            .bind(user_id)
            .fetch_one(pool)
            .await?
            .get(0);

    let row = sqlx::query(
        r#"
SELECT COUNT(*) AS total,
       SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
       SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
FROM calls
WHERE user_id = ?;
"#,
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    let total: i64 = row.get("total");
    let completed: Option<i64> = row.get("completed");
    let failed: Option<i64> = row.get("failed");

    let credits: Option<i64> = sqlx::query("SELECT credits FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .map(|r| r.get(0));

    Ok(json!({
        "active_calls": active,
        "queued_calls": queued,
        "total_calls": total,
        "completed_calls": completed.unwrap_or(0),
        "failed_calls": failed.unwrap_or(0),
        "credits": credits.unwrap_or(0),
    }))
}

pub async fn agent_summary(pool: &AnyPool, user_id: &str, agent_id: &str) -> anyhow::Result<Value> {
    let row = sqlx::query(
        r#"
SELECT COUNT(*) AS total,
       SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
       SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
       SUM(COALESCE(duration_secs, 0)) AS total_duration_secs
FROM calls
WHERE user_id = ? AND agent_id = ?;
"#,
    )
    .bind(user_id)
    .bind(agent_id)
    .fetch_one(pool)
    .await?;

    let total: i64 = row.get("total");
    let completed: Option<i64> = row.get("completed");
    let failed: Option<i64> = row.get("failed");
    let total_duration: Option<i64> = row.get("total_duration_secs");

    Ok(json!({
        "agent_id": agent_id,
        "total_calls": total,
        "completed_calls": completed.unwrap_or(0),
        "failed_calls": failed.unwrap_or(0),
        "total_duration_secs": total_duration.unwrap_or(0),
    }))
}

/// Completed-call counts over a trailing window named by the key
/// (`day`, `week`, anything else reads as all-time).
pub async fn performance_window(
    pool: &AnyPool,
    user_id: &str,
    period: &str,
    now_ms: u64,
) -> anyhow::Result<Value> {
    let window_ms: u64 = match period {
        "day" => 24 * 60 * 60 * 1_000,
        "week" => 7 * 24 * 60 * 60 * 1_000,
        _ => now_ms,
    };
    let since = now_ms.saturating_sub(window_ms) as i64;

    let row = sqlx::query(
        r#"
SELECT COUNT(*) AS total,
       SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
       CAST(AVG(COALESCE(duration_secs, 0)) AS DOUBLE PRECISION) AS avg_duration_secs
FROM calls
WHERE user_id = ? AND created_at_ms >= ?;
"#,
    )
    .bind(user_id)
    .bind(since)
    .fetch_one(pool)
    .await?;

    let total: i64 = row.get("total");
    let completed: Option<i64> = row.get("completed");
    let avg_duration: Option<f64> = row.get("avg_duration_secs");

    Ok(json!({
        "period": period,
        "total_calls": total,
        "completed_calls": completed.unwrap_or(0),
        "avg_duration_secs": avg_duration.unwrap_or(0.0),
    }))
}
