use std::sync::atomic::Ordering;

use anyhow::anyhow;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use registry::model::{CallRecord, CallStatus, CallType, NewQueueItem, ReserveOutcome};

use crate::engine::{Dispatcher, build_request};
use crate::error::DispatchError;
use crate::source::select_source_number;
use crate::types::DIRECT_PRIORITY;

/// An interactive request to start a call right now.
#[derive(Debug, Clone)]
pub struct DirectCallRequest {
    pub user_id: String,
    pub agent_id: String,
    pub phone_number: String,
    pub contact_id: Option<String>,
    pub user_data: Value,
    pub source_number_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectCallOutcome {
    /// The call is in flight.
    Placed {
        call_id: String,
        execution_id: String,
    },
    /// Capacity was unavailable; a direct-priority queue item now
    /// carries the request.
    Queued { item_id: String, reason: String },
}

impl Dispatcher {
    /// Direct-call fast path: pre-reserve a slot before touching the
    /// queue. At capacity the request enqueues with priority above any
    /// campaign item, preserving responsiveness without violating caps.
    #[instrument(skip(self, req), target = "dispatcher", fields(user_id = %req.user_id))]
    pub async fn place_direct_call(
        &self,
        req: DirectCallRequest,
        now_ms: u64,
    ) -> Result<DirectCallOutcome, DispatchError> {
        // Preconditions: nothing below holds a slot yet.
        let agent = self
            .directory
            .agent(&req.agent_id)
            .await?
            .ok_or_else(|| DispatchError::AgentNotFound(req.agent_id.clone()))?;

        if agent.user_id != req.user_id {
            return Err(DispatchError::AgentNotOwned(
                agent.id.clone(),
                req.user_id.clone(),
            ));
        }

        let source = select_source_number(
            self.directory.as_ref(),
            &req.user_id,
            req.source_number_id.as_deref(),
            &agent,
        )
        .await?;

        let call_id = Uuid::new_v4().to_string();

        match self
            .registry
            .reserve_direct(&req.user_id, &call_id, now_ms)
            .await?
        {
            ReserveOutcome::Reserved => {}
            ReserveOutcome::Queue(reason) => {
                let item_id = self
                    .queue
                    .enqueue(
                        NewQueueItem {
                            user_id: req.user_id.clone(),
                            call_type: CallType::Direct,
                            campaign_id: None,
                            agent_id: req.agent_id.clone(),
                            contact_id: req.contact_id.clone(),
                            phone_number: req.phone_number.clone(),
                            user_data: req.user_data.clone(),
                            source_number_id: req.source_number_id.clone(),
                            priority: DIRECT_PRIORITY,
                            scheduled_for_ms: now_ms,
                        },
                        now_ms,
                    )
                    .await?;

                info!(item_id = %item_id, reason = %reason, "direct call queued");

                return Ok(DirectCallOutcome::Queued { item_id, reason });
            }
            ReserveOutcome::Reject(reason) => {
                return Err(DispatchError::Infra(anyhow!(
                    "unexpected reject for direct reserve: {reason}"
                )));
            }
        }

        // Slot held: release on every failure path below.
        let provider_req = build_request(
            &agent,
            &req.phone_number,
            source.as_ref(),
            &req.user_data,
            &req.user_id,
            req.contact_id.as_deref(),
            &call_id,
        );

        let execution_id = match self.provider.start_call(&provider_req).await {
            Ok(exec) => exec.execution_id,
            Err(e) => {
                self.counters
                    .provider_failures
                    .fetch_add(1, Ordering::Relaxed);
                let message = e.stable_message();

                self.registry.release(&call_id).await?;
                return Err(DispatchError::Provider(message));
            }
        };

        if let Err(e) = self
            .registry
            .attach_execution(&call_id, &execution_id)
            .await
        {
            warn!(call_id = %call_id, error = %e, "attach_execution failed");
        }

        if let Err(e) = self
            .calls
            .record_placed(&CallRecord {
                call_id: call_id.clone(),
                user_id: req.user_id.clone(),
                agent_id: agent.id.clone(),
                execution_id: Some(execution_id.clone()),
                status: CallStatus::InProgress,
                duration_secs: None,
                created_at_ms: now_ms,
                completed_at_ms: None,
            })
            .await
        {
            warn!(call_id = %call_id, error = %e, "recording placed call failed; releasing slot");
            self.registry.release(&call_id).await?;
            return Err(DispatchError::Infra(e));
        }

        info!(call_id = %call_id, execution_id = %execution_id, "direct call placed");

        Ok(DirectCallOutcome::Placed {
            call_id,
            execution_id,
        })
    }
}

