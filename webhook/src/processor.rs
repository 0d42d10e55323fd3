use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

use cache::{DomainEvent, InvalidationService};
use common::time::now_ms;
use registry::model::CallStatus;
use registry::repository::{ActiveCallRegistry, CallLog, CallQueue};

use crate::event::TerminalEvent;

/// Downstream consumer of terminal-event payloads.
///
/// Implementations must be idempotent: the pipeline delivers at least
/// once, and re-processing the same event must not repeat its effects.
#[async_trait]
pub trait TerminalEventProcessor: Send + Sync + 'static {
    async fn process(&self, payload: &Value) -> anyhow::Result<()>;
}

/// Production processor: finalizes the call record, completes the queue
/// item, releases the concurrency slot, and invalidates derived views.
///
/// Every step is a conditional update keyed on the execution id, so the
/// whole chain is safe to re-run.
pub struct CallEventProcessor {
    registry: Arc<dyn ActiveCallRegistry>,
    queue: Arc<dyn CallQueue>,
    calls: Arc<dyn CallLog>,
    invalidation: Option<Arc<InvalidationService>>,
}

impl CallEventProcessor {
    pub fn new(
        registry: Arc<dyn ActiveCallRegistry>,
        queue: Arc<dyn CallQueue>,
        calls: Arc<dyn CallLog>,
        invalidation: Option<Arc<InvalidationService>>,
    ) -> Self {
        Self {
            registry,
            queue,
            calls,
            invalidation,
        }
    }
}

fn terminal_status(event: &TerminalEvent) -> CallStatus {
    match event.status.as_deref() {
        Some("failed") | Some("error") => CallStatus::Failed,
        Some("cancelled") | Some("canceled") => CallStatus::Cancelled,
        _ => CallStatus::Completed,
    }
}

#[async_trait]
impl TerminalEventProcessor for CallEventProcessor {
    #[instrument(skip(self, payload), target = "webhook")]
    async fn process(&self, payload: &Value) -> anyhow::Result<()> {
        let event = TerminalEvent::from_payload(payload)?;

        // Resolve the execution id: directly from the event, or via the
        // agent's most recent open call.
        let record = match &event.execution_id {
            Some(id) => self
                .calls
                .find_by_execution(id)
                .await?
                .with_context(|| format!("no call record for execution {id}"))?,
            None => {
                let agent_id = event.agent_id.as_deref().unwrap_or_default();
                match self.calls.find_latest_open_by_agent(agent_id).await? {
                    Some(rec) => rec,
                    None => bail!("no open call for agent {agent_id}"),
                }
            }
        };

        let Some(execution_id) = record.execution_id.clone() else {
            bail!("call record {} has no execution id", record.call_id);
        };

        let status = terminal_status(&event);

        self.calls
            .mark_terminal_by_execution(
                &execution_id,
                status,
                event.conversation_duration,
                now_ms(),
            )
            .await
            .context("finalize call record")?;

        self.queue.complete_by_call(&record.call_id).await?;

        self.registry.release_by_execution(&execution_id).await?;

        if let Some(invalidation) = &self.invalidation {
            if let Err(e) = invalidation
                .apply(&DomainEvent::CallCompleted {
                    user_id: record.user_id.clone(),
                })
                .await
            {
                // Views heal via TTL; a cold read beats a dead event.
                warn!(user_id = %record.user_id, error = %e, "cache invalidation failed after call completion");
            }
        }

        info!(
            call_id = %record.call_id,
            execution_id = %execution_id,
            status = %status,
            "terminal event processed"
        );

        Ok(())
    }
}
