use std::fmt;
use std::str::FromStr;

/// Outcome of a slot reservation against the active-call registry.
///
/// Capacity is not an error: callers receive a tagged value and decide
/// whether the work queues (direct) or stays queued with an annotation
/// (campaign). Only infrastructure failures surface as `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// A slot was inserted; the caller now owns exactly one release.
    Reserved,
    /// At capacity; the call should wait in the queue.
    Queue(String),
    /// At capacity; the item stays queued and is annotated.
    Reject(String),
}

pub const REASON_SYSTEM_LIMIT: &str = "system limit";
pub const REASON_USER_LIMIT: &str = "user limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Direct,
    Campaign,
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallType::Direct => "direct",
            CallType::Campaign => "campaign",
        };
        f.write_str(s)
    }
}

impl FromStr for CallType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(CallType::Direct),
            "campaign" => Ok(CallType::Campaign),
            other => Err(anyhow::anyhow!("Invalid CallType value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueStatus::Queued),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(anyhow::anyhow!("Invalid QueueStatus value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::Cancelled
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Pending => "pending",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for CallStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CallStatus::Pending),
            "in_progress" => Ok(CallStatus::InProgress),
            "completed" => Ok(CallStatus::Completed),
            "failed" => Ok(CallStatus::Failed),
            "cancelled" => Ok(CallStatus::Cancelled),
            other => Err(anyhow::anyhow!("Invalid CallStatus value: {}", other)),
        }
    }
}

/// One unit of concurrency. A row exists iff a call is believed to be
/// in flight and holds capacity.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub call_id: String,
    pub user_id: String,
    pub call_type: CallType,
    pub started_at_ms: u64,
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: String,
    pub user_id: String,
    pub call_type: CallType,
    pub campaign_id: Option<String>,
    pub status: QueueStatus,

    pub agent_id: String,
    pub contact_id: Option<String>,
    pub phone_number: String,
    /// Opaque payload forwarded to the provider (normalized at the
    /// provider boundary, never interpreted here).
    pub user_data: serde_json::Value,
    pub source_number_id: Option<String>,

    pub priority: i64,
    pub scheduled_for_ms: u64,
    pub created_at_ms: u64,

    pub call_id: Option<String>,
    pub last_allocation_at_ms: Option<u64>,
    pub failure_reason: Option<String>,
}

/// Enqueue-time fields; ids and timestamps are assigned by the queue.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub user_id: String,
    pub call_type: CallType,
    pub campaign_id: Option<String>,
    pub agent_id: String,
    pub contact_id: Option<String>,
    pub phone_number: String,
    pub user_data: serde_json::Value,
    pub source_number_id: Option<String>,
    pub priority: i64,
    pub scheduled_for_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub user_id: String,
    pub provider_agent_id: String,
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PhoneNumber {
    pub id: String,
    pub user_id: String,
    pub e164: String,
    pub created_at_ms: u64,
}

/// Terminal record of a call, written at placement and finalized by the
/// terminal-event processor.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub execution_id: Option<String>,
    pub status: CallStatus,
    pub duration_secs: Option<u64>,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}
