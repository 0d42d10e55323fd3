use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use common::time::now_ms;
use provider::{CallMetadata, CallRequest, UserData, VoiceProvider};
use registry::model::{Agent, CallRecord, CallStatus, CallType, PhoneNumber, QueueItem,
    ReserveOutcome};
use registry::repository::{ActiveCallRegistry, CallLog, CallQueue, Directory};

use crate::counters::Counters;
use crate::error::DispatchError;
use crate::source::select_source_number;
use crate::types::{Allocation, DispatchConfig};

/// Drains the queue under the system and per-user caps.
///
/// Safety/liveness properties:
/// - The dispatch lock is non-reentrant; an overlapping tick returns
///   immediately, and the guard releases on every exit path.
/// - Every reserved slot is either attached to an accepted call or
///   released before the allocation returns.
/// - Work per tick is bounded by the slot math; a user at cap costs one
///   count query.
pub struct Dispatcher {
    pub(crate) cfg: DispatchConfig,
    pub(crate) registry: Arc<dyn ActiveCallRegistry>,
    pub(crate) queue: Arc<dyn CallQueue>,
    pub(crate) directory: Arc<dyn Directory>,
    pub(crate) calls: Arc<dyn CallLog>,
    pub(crate) provider: Arc<dyn VoiceProvider>,
    dispatch_lock: tokio::sync::Mutex<()>,
    pub(crate) counters: Counters,
}

impl Dispatcher {
    pub fn new(
        cfg: DispatchConfig,
        registry: Arc<dyn ActiveCallRegistry>,
        queue: Arc<dyn CallQueue>,
        directory: Arc<dyn Directory>,
        calls: Arc<dyn CallLog>,
        provider: Arc<dyn VoiceProvider>,
        counters: Counters,
    ) -> Self {
        Self {
            cfg,
            registry,
            queue,
            directory,
            calls,
            provider,
            dispatch_lock: tokio::sync::Mutex::new(()),
            counters,
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Executes one dispatch tick.
    ///
    /// Flow:
    /// 1) Take the dispatch lock; bail out if a tick is running.
    /// 2) Early-exit when the system is at cap.
    /// 3) Walk users in fairness order; per user, allocate up to
    ///    `min(user headroom, system headroom)` items.
    #[instrument(skip(self), target = "dispatcher")]
    pub async fn tick(&self, now_ms: u64) -> anyhow::Result<()> {
        let Ok(_guard) = self.dispatch_lock.try_lock() else {
            self.counters.lock_contended.fetch_add(1, Ordering::Relaxed);
            debug!("dispatch tick already running; skipping");
            return Ok(());
        };

        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let mut active_system = self.registry.count_active_system().await?;
        if active_system >= self.cfg.system_limit {
            debug!(active_system, "system at capacity; nothing to dispatch");
            return Ok(());
        }

        let users = self.queue.users_with_eligible_items(now_ms).await?;
        if users.is_empty() {
            return Ok(());
        }

        debug!(users = users.len(), "dispatching for eligible users");

        for user_id in users {
            active_system = self.registry.count_active_system().await?;
            if active_system >= self.cfg.system_limit {
                debug!("system reached capacity mid-tick");
                break;
            }

            let active_user = self.registry.count_active_user(&user_id).await?;
            let user_limit = self.directory.call_limit(&user_id).await?;

            if active_user >= user_limit {
                self.counters.capacity_skips.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let slots = (user_limit - active_user).min(self.cfg.system_limit - active_system);

            for _ in 0..slots {
                match self.allocate_next(&user_id, now_ms).await? {
                    Allocation::Placed {
                        call_id,
                        execution_id,
                    } => {
                        self.counters.calls_placed.fetch_add(1, Ordering::Relaxed);
                        info!(
                            user_id = %user_id,
                            call_id = %call_id,
                            execution_id = %execution_id,
                            "call placed"
                        );
                    }
                    Allocation::Skipped => {}
                    Allocation::NoItem => break,
                }
            }
        }

        Ok(())
    }

    /// Allocate the user's next eligible queue item.
    ///
    /// Only infrastructure failures *before* a slot is reserved
    /// propagate as `Err`; after reservation every failure path
    /// releases the slot and resolves to `Skipped`.
    #[instrument(skip(self), target = "dispatcher")]
    pub async fn allocate_next(&self, user_id: &str, now_ms: u64) -> anyhow::Result<Allocation> {
        if self.directory.credits(user_id).await? <= 0 {
            let paused = self.directory.pause_active_campaigns(user_id).await?;
            debug!(user_id = %user_id, paused, "user out of credits");
            return Ok(Allocation::NoItem);
        }

        let Some(item) = self.queue.pop_next_eligible(user_id, now_ms).await? else {
            return Ok(Allocation::NoItem);
        };

        // Preconditions resolve before any slot is held.
        let agent = match self.resolve_agent(&item).await {
            Ok(agent) => agent,
            Err(e) if e.is_precondition() => {
                self.counters
                    .precondition_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.queue.mark_failed(&item.id, &e.to_string()).await?;
                return Ok(Allocation::Skipped);
            }
            Err(DispatchError::Infra(e)) => return Err(e),
            Err(e) => return Err(anyhow::Error::from(e)),
        };

        let source = match select_source_number(
            self.directory.as_ref(),
            user_id,
            item.source_number_id.as_deref(),
            &agent,
        )
        .await
        {
            Ok(source) => source,
            Err(e) if e.is_precondition() => {
                self.counters
                    .precondition_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.queue.mark_failed(&item.id, &e.to_string()).await?;
                return Ok(Allocation::Skipped);
            }
            Err(DispatchError::Infra(e)) => return Err(e),
            Err(e) => return Err(anyhow::Error::from(e)),
        };

        let call_id = Uuid::new_v4().to_string();

        let outcome = match item.call_type {
            CallType::Direct => self.registry.reserve_direct(user_id, &call_id, now_ms).await?,
            CallType::Campaign => {
                self.registry
                    .reserve_campaign(user_id, &call_id, now_ms)
                    .await?
            }
        };

        match outcome {
            ReserveOutcome::Reserved => {}
            ReserveOutcome::Queue(reason) | ReserveOutcome::Reject(reason) => {
                self.counters
                    .capacity_reverts
                    .fetch_add(1, Ordering::Relaxed);
                self.queue.revert_to_queued(&item.id, &reason).await?;
                debug!(item_id = %item.id, reason = %reason, "capacity miss; item reverted");
                return Ok(Allocation::NoItem);
            }
        }

        // The slot is held from here: release on every failure path.
        let request = build_request(
            &agent,
            &item.phone_number,
            source.as_ref(),
            &item.user_data,
            &item.user_id,
            item.contact_id.as_deref(),
            &call_id,
        );

        let execution_id = match self.provider.start_call(&request).await {
            Ok(exec) => exec.execution_id,
            Err(e) => {
                self.counters
                    .provider_failures
                    .fetch_add(1, Ordering::Relaxed);
                let message = e.stable_message();
                warn!(item_id = %item.id, call_id = %call_id, error = %message, "provider refused call");

                self.registry.release(&call_id).await?;
                self.queue.mark_failed(&item.id, &message).await?;
                return Ok(Allocation::Skipped);
            }
        };

        if let Err(e) = self
            .registry
            .attach_execution(&call_id, &execution_id)
            .await
        {
            // Best-effort; orphan cleanup covers the gap.
            warn!(call_id = %call_id, error = %e, "attach_execution failed");
        }

        if let Err(e) = self
            .finalize_placement(&item, &agent, &call_id, &execution_id, now_ms)
            .await
        {
            warn!(item_id = %item.id, call_id = %call_id, error = %e, "placement finalization failed; releasing slot");

            self.registry.release(&call_id).await?;
            self.queue
                .mark_failed(&item.id, &format!("internal error: {e}"))
                .await?;
            return Ok(Allocation::Skipped);
        }

        Ok(Allocation::Placed {
            call_id,
            execution_id,
        })
    }

    async fn resolve_agent(&self, item: &QueueItem) -> Result<Agent, DispatchError> {
        let agent = self
            .directory
            .agent(&item.agent_id)
            .await?
            .ok_or_else(|| DispatchError::AgentNotFound(item.agent_id.clone()))?;

        if agent.user_id != item.user_id {
            return Err(DispatchError::AgentNotOwned(
                agent.id.clone(),
                item.user_id.clone(),
            ));
        }

        Ok(agent)
    }

    /// Persist the accepted call: the call record and the queue item's
    /// call id. Retried in-process; a persistent failure bubbles up so
    /// the caller can release the slot.
    async fn finalize_placement(
        &self,
        item: &QueueItem,
        agent: &Agent,
        call_id: &str,
        execution_id: &str,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let record = CallRecord {
            call_id: call_id.to_string(),
            user_id: item.user_id.clone(),
            agent_id: agent.id.clone(),
            execution_id: Some(execution_id.to_string()),
            status: CallStatus::InProgress,
            duration_secs: None,
            created_at_ms: now_ms,
            completed_at_ms: None,
        };

        let mut last_err = None;

        for attempt in 0..self.cfg.db_retry_attempts.max(1) {
            let result = async {
                self.calls.record_placed(&record).await?;
                self.queue.attach_call(&item.id, call_id).await
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "placement transition failed; retrying");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("placement finalization failed")))
    }

    /// Periodic loop; the current tick drains before shutdown completes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.cfg.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            every_ms = self.cfg.tick_interval.as_millis() as u64,
            system_limit = self.cfg.system_limit,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(now_ms()).await {
                        tracing::error!(error = ?e, "dispatch tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("dispatcher stopped");
    }
}

pub(crate) fn build_request(
    agent: &Agent,
    recipient: &str,
    source: Option<&PhoneNumber>,
    user_data: &serde_json::Value,
    user_id: &str,
    contact_id: Option<&str>,
    call_id: &str,
) -> CallRequest {
    CallRequest {
        agent_id: agent.provider_agent_id.clone(),
        recipient_phone_number: recipient.to_string(),
        from_phone_number: source.map(|n| n.e164.clone()),
        user_data: UserData::normalize(user_data),
        metadata: CallMetadata {
            user_id: user_id.to_string(),
            internal_agent_id: agent.id.clone(),
            call_id: call_id.to_string(),
            contact_id: contact_id.map(str::to_string),
        },
    }
}
