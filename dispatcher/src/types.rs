use std::time::Duration;

/// Priority assigned to queued direct calls. Campaign producers use
/// priorities in `0..=100`, so direct work always outranks campaign
/// work within a user.
pub const DIRECT_PRIORITY: i64 = 1_000;

/// Configuration knobs for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// System-wide concurrent call cap.
    pub system_limit: u32,

    /// Cadence of the dispatch tick.
    pub tick_interval: Duration,

    /// Bounded in-process retries for queue/call-log transitions after
    /// the provider has accepted a call.
    pub db_retry_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            system_limit: 10,
            tick_interval: Duration::from_secs(10),
            db_retry_attempts: 3,
        }
    }
}

/// Result of one `allocate_next` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// A call was placed and now holds a slot until its terminal event.
    Placed {
        call_id: String,
        execution_id: String,
    },
    /// The item was consumed (failed or reverted) without filling the
    /// slot; the caller may try the next item.
    Skipped,
    /// Nothing eligible remains for this user.
    NoItem,
}
