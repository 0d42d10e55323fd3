use anyhow::Result;
use async_trait::async_trait;

use crate::model::{
    ActiveCall, Agent, CallRecord, CallStatus, NewQueueItem, PhoneNumber, QueueItem,
    ReserveOutcome,
};

/// Authoritative store of in-flight calls.
///
/// The row count here is what concurrency limits are compared against;
/// no other component may count or mutate slots.
#[async_trait]
pub trait ActiveCallRegistry: Send + Sync {
    /// Reserve a slot for an interactive call. Never rejects outright:
    /// at capacity the outcome is `Queue(reason)`.
    ///
    /// Must read the system count, the user count, and the user's limit
    /// and insert in a single serializable step.
    async fn reserve_direct(
        &self,
        user_id: &str,
        call_id: &str,
        now_ms: u64,
    ) -> Result<ReserveOutcome>;

    /// Reserve a slot for a campaign call. At capacity the outcome is
    /// `Reject(reason)` and the queue item stays queued.
    async fn reserve_campaign(
        &self,
        user_id: &str,
        call_id: &str,
        now_ms: u64,
    ) -> Result<ReserveOutcome>;

    /// Best-effort: a missing row is logged, not fatal.
    async fn attach_execution(&self, call_id: &str, execution_id: &str) -> Result<()>;

    /// Idempotent; releasing an absent slot is a no-op.
    async fn release(&self, call_id: &str) -> Result<()>;

    /// Idempotent; releasing an absent slot is a no-op.
    async fn release_by_execution(&self, execution_id: &str) -> Result<()>;

    async fn count_active_system(&self) -> Result<u32>;

    async fn count_active_user(&self, user_id: &str) -> Result<u32>;

    async fn list_active_user(&self, user_id: &str) -> Result<Vec<ActiveCall>>;

    /// Remove slots older than `stale_after_ms` whose call record is
    /// terminal or absent. Returns the number of rows removed.
    async fn cleanup_orphans(&self, stale_after_ms: u64, now_ms: u64) -> Result<u64>;
}

/// The persistent call queue. Single-writer-per-row is enforced by
/// conditional updates on `status`.
#[async_trait]
pub trait CallQueue: Send + Sync {
    async fn enqueue(&self, item: NewQueueItem, now_ms: u64) -> Result<String>;

    /// Users that currently have at least one eligible item, ordered for
    /// fairness: least-recently-allocated first (never-allocated users
    /// lead), ties broken by oldest item.
    async fn users_with_eligible_items(&self, now_ms: u64) -> Result<Vec<String>>;

    /// Atomically pop the user's next eligible item: highest priority,
    /// then earliest `scheduled_for`, then oldest. The item transitions
    /// to `processing` with `last_allocation_at` stamped.
    async fn pop_next_eligible(&self, user_id: &str, now_ms: u64) -> Result<Option<QueueItem>>;

    /// Return a `processing` item to `queued`, annotating why. The
    /// allocation stamp is kept so the user is deprioritized next tick.
    async fn revert_to_queued(&self, item_id: &str, reason: &str) -> Result<()>;

    async fn mark_failed(&self, item_id: &str, reason: &str) -> Result<()>;

    async fn attach_call(&self, item_id: &str, call_id: &str) -> Result<()>;

    /// Conditional: only a `processing` item completes.
    async fn complete_by_call(&self, call_id: &str) -> Result<()>;

    async fn get(&self, item_id: &str) -> Result<Option<QueueItem>>;
}

/// Read-mostly lookups over users, campaigns, agents, and numbers.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Missing users read as zero credits.
    async fn credits(&self, user_id: &str) -> Result<i64>;

    /// The user's concurrent-call limit, defaulted when unset.
    async fn call_limit(&self, user_id: &str) -> Result<u32>;

    /// Pause every `active` campaign the user owns. Returns how many
    /// campaigns transitioned.
    async fn pause_active_campaigns(&self, user_id: &str) -> Result<u64>;

    async fn agent(&self, agent_id: &str) -> Result<Option<Agent>>;

    async fn phone_number(&self, id: &str) -> Result<Option<PhoneNumber>>;

    async fn newest_phone_number(&self, user_id: &str) -> Result<Option<PhoneNumber>>;
}

/// Terminal call records.
#[async_trait]
pub trait CallLog: Send + Sync {
    async fn record_placed(&self, rec: &CallRecord) -> Result<()>;

    /// Transition the call identified by `execution_id` to a terminal
    /// status. Idempotent: an already-terminal row is left untouched.
    /// Returns the call id when a record exists.
    async fn mark_terminal_by_execution(
        &self,
        execution_id: &str,
        status: CallStatus,
        duration_secs: Option<u64>,
        now_ms: u64,
    ) -> Result<Option<String>>;

    async fn find_by_execution(&self, execution_id: &str) -> Result<Option<CallRecord>>;

    /// Fallback for terminal events that carry only an agent id: the
    /// agent's most recent non-terminal call.
    async fn find_latest_open_by_agent(&self, agent_id: &str) -> Result<Option<CallRecord>>;
}
