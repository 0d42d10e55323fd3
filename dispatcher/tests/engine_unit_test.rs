
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use dispatcher::{
    Allocation, Counters, DIRECT_PRIORITY, DispatchConfig, DispatchError, DirectCallOutcome,
    DirectCallRequest, Dispatcher,
};
use registry::model::{CallStatus, CallType, NewQueueItem, QueueStatus};
use registry::repository::{ActiveCallRegistry, CallQueue};

use mock_store::{MockCallLog, MockDirectory, MockProvider, MockQueue, MockRegistry};

const NOW: u64 = 1_000_000;

struct Harness {
    registry: Arc<MockRegistry>,
    queue: Arc<MockQueue>,
    directory: Arc<MockDirectory>,
    calls: Arc<MockCallLog>,
    provider: Arc<MockProvider>,
    dispatcher: Arc<Dispatcher>,
}

fn harness(system_limit: u32, default_user_limit: u32) -> Harness {
    let registry = Arc::new(MockRegistry::new(system_limit, default_user_limit));
    let queue = Arc::new(MockQueue::new());
    let directory = Arc::new(MockDirectory::new(default_user_limit));
    let calls = Arc::new(MockCallLog::new());
    let provider = Arc::new(MockProvider::new());

    let dispatcher = Arc::new(Dispatcher::new(
        DispatchConfig {
            system_limit,
            tick_interval: Duration::from_secs(10),
            db_retry_attempts: 2,
        },
        registry.clone(),
        queue.clone(),
        directory.clone(),
        calls.clone(),
        provider.clone(),
        Counters::default(),
    ));

    Harness {
        registry,
        queue,
        directory,
        calls,
        provider,
        dispatcher,
    }
}

impl Harness {
    fn set_user_limit(&self, user_id: &str, limit: u32) {
        self.registry
            .user_limits
            .lock()
            .insert(user_id.to_string(), limit);
        self.directory
            .limits
            .lock()
            .insert(user_id.to_string(), limit);
    }

    async fn enqueue_campaign(&self, user_id: &str, campaign_id: &str, created_at: u64) -> String {
        self.queue.activate_campaign(campaign_id);
        self.queue
            .enqueue(
                NewQueueItem {
                    user_id: user_id.to_string(),
                    call_type: CallType::Campaign,
                    campaign_id: Some(campaign_id.to_string()),
                    agent_id: "agent-1".to_string(),
                    contact_id: Some("contact-1".to_string()),
                    phone_number: "+15550001111".to_string(),
                    user_data: json!({ "name": "Ada", "company": "Lovelace Ltd" }),
                    source_number_id: None,
                    priority: 10,
                    scheduled_for_ms: 0,
                },
                created_at,
            )
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn placed_call_carries_execution_and_call_ids() {
    let h = harness(10, 2);
    h.directory.add_agent("agent-1", "A", None);
    let item_id = h.enqueue_campaign("A", "camp-1", NOW - 100).await;

    h.dispatcher.tick(NOW).await.unwrap();

    let item = h.queue.get(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Processing);
    let call_id = item.call_id.expect("call id attached");

    // The slot is held and carries the execution id.
    assert_eq!(h.registry.count_active_system().await.unwrap(), 1);
    let active = h.registry.list_active_user("A").await.unwrap();
    assert_eq!(active[0].call_id, call_id);
    assert_eq!(active[0].execution_id.as_deref(), Some("exec-0"));

    // The call record was written in progress.
    let rec = h.calls.records.lock().get(&call_id).cloned().unwrap();
    assert_eq!(rec.status, CallStatus::InProgress);
    assert_eq!(rec.execution_id.as_deref(), Some("exec-0"));

    // user_data variants were normalized at the provider boundary.
    let calls = h.provider.calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].user_data.lead_name, "Ada");
    assert_eq!(calls[0].user_data.business_name, "Lovelace Ltd");
    assert_eq!(calls[0].agent_id, "prov-agent-1");
}

#[tokio::test]
async fn provider_rejection_releases_the_slot_in_the_same_tick() {
    let h = harness(10, 2);
    h.directory.add_agent("agent-1", "A", None);
    let item_id = h.enqueue_campaign("A", "camp-1", NOW - 100).await;

    h.provider.fail_next("upstream 500");

    h.dispatcher.tick(NOW).await.unwrap();

    let item = h.queue.get(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert!(item.failure_reason.unwrap().contains("upstream 500"));

    // Exactly one reserve, exactly one release; no capacity leaked.
    assert_eq!(h.registry.count_active_system().await.unwrap(), 0);
    assert_eq!(h.registry.released.lock().len(), 1);
    assert_eq!(
        h.dispatcher
            .counters()
            .provider_failures
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn fairness_serves_all_users_across_ticks() {
    let h = harness(2, 1);
    for user in ["A", "B", "C"] {
        h.set_user_limit(user, 1);
    }
    h.directory.add_agent("agent-a", "A", None);
    h.directory.add_agent("agent-b", "B", None);
    h.directory.add_agent("agent-c", "C", None);

    let enqueue = |user: &'static str, agent: &'static str, created: u64| {
        let queue = h.queue.clone();
        async move {
            queue.activate_campaign("camp-1");
            queue
                .enqueue(
                    NewQueueItem {
                        user_id: user.to_string(),
                        call_type: CallType::Campaign,
                        campaign_id: Some("camp-1".to_string()),
                        agent_id: agent.to_string(),
                        contact_id: None,
                        phone_number: "+15550001111".to_string(),
                        user_data: json!({}),
                        source_number_id: None,
                        priority: 10,
                        scheduled_for_ms: 0,
                    },
                    created,
                )
                .await
                .unwrap()
        }
    };

    let item_a = enqueue("A", "agent-a", NOW - 300).await;
    let item_b = enqueue("B", "agent-b", NOW - 200).await;
    let item_c = enqueue("C", "agent-c", NOW - 100).await;

    // Tick 1: A and B get the two system slots; C is left queued.
    h.dispatcher.tick(NOW).await.unwrap();

    let status = |id: &str| {
        let queue = h.queue.clone();
        let id = id.to_string();
        async move { queue.get(&id).await.unwrap().unwrap().status }
    };

    assert_eq!(status(&item_a).await, QueueStatus::Processing);
    assert_eq!(status(&item_b).await, QueueStatus::Processing);
    assert_eq!(status(&item_c).await, QueueStatus::Queued);
    assert_eq!(h.registry.count_active_system().await.unwrap(), 2);

    // A's and B's calls finish between ticks, freeing both slots.
    let active_ids: Vec<String> = h.registry.active.lock().keys().cloned().collect();
    for id in active_ids {
        h.registry.release(&id).await.unwrap();
    }

    // Tick 2: C (never allocated) leads the fairness order and is served.
    h.dispatcher.tick(NOW + 10_000).await.unwrap();
    assert_eq!(status(&item_c).await, QueueStatus::Processing);

    assert_eq!(
        h.dispatcher.counters().calls_placed.load(Ordering::Relaxed),
        3
    );
}

#[tokio::test]
async fn out_of_credits_pauses_campaigns_and_allocates_nothing() {
    let h = harness(10, 2);
    h.directory.add_agent("agent-1", "A", None);
    h.directory.credits.lock().insert("A".to_string(), 0);
    let item_id = h.enqueue_campaign("A", "camp-1", NOW - 100).await;

    let out = h.dispatcher.allocate_next("A", NOW).await.unwrap();
    assert_eq!(out, Allocation::NoItem);

    assert_eq!(h.directory.paused_users.lock().as_slice(), ["A"]);
    let item = h.queue.get(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Queued);
    assert!(h.provider.calls.lock().is_empty());
}

#[tokio::test]
async fn capacity_miss_reverts_the_item_with_annotation() {
    let h = harness(10, 2);
    h.set_user_limit("A", 1);
    h.directory.add_agent("agent-1", "A", None);
    h.registry.preload("pre-existing", "A", CallType::Direct);

    let item_id = h.enqueue_campaign("A", "camp-1", NOW - 100).await;

    let out = h.dispatcher.allocate_next("A", NOW).await.unwrap();
    assert_eq!(out, Allocation::NoItem);

    let item = h.queue.get(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Queued);
    assert_eq!(item.failure_reason.as_deref(), Some("user limit"));

    // The in-flight call was never preempted.
    assert_eq!(h.registry.count_active_user("A").await.unwrap(), 1);
    assert_eq!(
        h.dispatcher
            .counters()
            .capacity_reverts
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn missing_agent_fails_the_item_without_holding_a_slot() {
    let h = harness(10, 2);
    let item_id = h.enqueue_campaign("A", "camp-1", NOW - 100).await;

    let out = h.dispatcher.allocate_next("A", NOW).await.unwrap();
    assert_eq!(out, Allocation::Skipped);

    let item = h.queue.get(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert!(item.failure_reason.unwrap().contains("agent not found"));

    assert_eq!(h.registry.count_active_system().await.unwrap(), 0);
    assert!(h.registry.released.lock().is_empty());
}

#[tokio::test]
async fn foreign_agent_is_a_precondition_failure() {
    let h = harness(10, 2);
    h.directory.add_agent("agent-1", "someone-else", None);
    let item_id = h.enqueue_campaign("A", "camp-1", NOW - 100).await;

    let out = h.dispatcher.allocate_next("A", NOW).await.unwrap();
    assert_eq!(out, Allocation::Skipped);

    let item = h.queue.get(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert!(item.failure_reason.unwrap().contains("not owned"));
    assert_eq!(h.registry.count_active_system().await.unwrap(), 0);
}

#[tokio::test]
async fn source_number_prefers_agent_assignment_then_newest() {
    let h = harness(10, 2);
    h.directory.add_number("num-old", "A", "+15550000001", 100);
    h.directory.add_number("num-new", "A", "+15550000002", 900);
    h.directory.add_number("num-assigned", "A", "+15550000003", 50);
    h.directory.add_agent("agent-1", "A", Some("num-assigned"));
    h.directory.add_agent("agent-2", "A", None);

    // Assigned number wins.
    h.enqueue_campaign("A", "camp-1", NOW - 100).await;
    h.dispatcher.allocate_next("A", NOW).await.unwrap();
    assert_eq!(
        h.provider.calls.lock()[0].from_phone_number.as_deref(),
        Some("+15550000003")
    );

    // Without an assignment, the newest user number wins.
    h.queue.activate_campaign("camp-1");
    h.queue
        .enqueue(
            NewQueueItem {
                user_id: "A".to_string(),
                call_type: CallType::Campaign,
                campaign_id: Some("camp-1".to_string()),
                agent_id: "agent-2".to_string(),
                contact_id: None,
                phone_number: "+15550001111".to_string(),
                user_data: json!({}),
                source_number_id: None,
                priority: 10,
                scheduled_for_ms: 0,
            },
            NOW,
        )
        .await
        .unwrap();
    h.dispatcher.allocate_next("A", NOW).await.unwrap();
    assert_eq!(
        h.provider.calls.lock()[1].from_phone_number.as_deref(),
        Some("+15550000002")
    );
}

#[tokio::test]
async fn foreign_explicit_source_number_is_fatal_for_the_attempt() {
    let h = harness(10, 2);
    h.directory.add_agent("agent-1", "A", None);
    h.directory.add_number("num-b", "B", "+15550000009", 100);

    h.queue.activate_campaign("camp-1");
    let item_id = h
        .queue
        .enqueue(
            NewQueueItem {
                user_id: "A".to_string(),
                call_type: CallType::Campaign,
                campaign_id: Some("camp-1".to_string()),
                agent_id: "agent-1".to_string(),
                contact_id: None,
                phone_number: "+15550001111".to_string(),
                user_data: json!({}),
                source_number_id: Some("num-b".to_string()),
                priority: 10,
                scheduled_for_ms: 0,
            },
            NOW,
        )
        .await
        .unwrap();

    let out = h.dispatcher.allocate_next("A", NOW).await.unwrap();
    assert_eq!(out, Allocation::Skipped);

    let item = h.queue.get(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert!(item.failure_reason.unwrap().contains("not owned"));
    assert!(h.provider.calls.lock().is_empty());
}

#[tokio::test]
async fn persistent_db_failure_after_acceptance_releases_the_slot() {
    let h = harness(10, 2);
    h.directory.add_agent("agent-1", "A", None);
    let item_id = h.enqueue_campaign("A", "camp-1", NOW - 100).await;

    h.calls.fail_writes.store(true, Ordering::Relaxed);

    let out = h.dispatcher.allocate_next("A", NOW).await.unwrap();
    assert_eq!(out, Allocation::Skipped);

    let item = h.queue.get(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert!(item.failure_reason.unwrap().contains("internal error"));

    assert_eq!(h.registry.count_active_system().await.unwrap(), 0);
    assert_eq!(h.registry.released.lock().len(), 1);
}

#[tokio::test]
async fn overlapping_ticks_are_skipped_by_the_dispatch_lock() {
    let h = harness(10, 2);
    h.directory.add_agent("agent-1", "A", None);
    h.enqueue_campaign("A", "camp-1", NOW - 100).await;

    h.provider.set_delay(Duration::from_millis(200));

    let dispatcher = h.dispatcher.clone();
    let slow_tick = tokio::spawn(async move { dispatcher.tick(NOW).await });

    tokio::time::sleep(Duration::from_millis(50)).await;

    // The first tick still holds the dispatch lock.
    h.dispatcher.tick(NOW).await.unwrap();
    assert_eq!(
        h.dispatcher
            .counters()
            .lock_contended
            .load(Ordering::Relaxed),
        1
    );

    slow_tick.await.unwrap().unwrap();
    assert_eq!(h.dispatcher.counters().ticks.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn direct_fast_path_places_when_capacity_allows() {
    let h = harness(10, 2);
    h.directory.add_agent("agent-1", "A", None);

    let out = h
        .dispatcher
        .place_direct_call(
            DirectCallRequest {
                user_id: "A".to_string(),
                agent_id: "agent-1".to_string(),
                phone_number: "+15550009999".to_string(),
                contact_id: None,
                user_data: json!({ "lead_name": "Ada" }),
                source_number_id: None,
            },
            NOW,
        )
        .await
        .unwrap();

    let DirectCallOutcome::Placed {
        call_id,
        execution_id,
    } = out
    else {
        panic!("expected placement");
    };

    assert_eq!(execution_id, "exec-0");
    assert_eq!(h.registry.count_active_user("A").await.unwrap(), 1);
    assert!(h.calls.records.lock().contains_key(&call_id));
}

#[tokio::test]
async fn direct_fast_path_queues_at_user_cap_with_elevated_priority() {
    let h = harness(10, 2);
    h.set_user_limit("A", 1);
    h.directory.add_agent("agent-1", "A", None);
    h.registry.preload("in-flight", "A", CallType::Direct);

    let out = h
        .dispatcher
        .place_direct_call(
            DirectCallRequest {
                user_id: "A".to_string(),
                agent_id: "agent-1".to_string(),
                phone_number: "+15550009999".to_string(),
                contact_id: None,
                user_data: json!({}),
                source_number_id: None,
            },
            NOW,
        )
        .await
        .unwrap();

    let DirectCallOutcome::Queued { item_id, reason } = out else {
        panic!("expected queueing");
    };

    assert_eq!(reason, "user limit");

    let item = h.queue.get(&item_id).await.unwrap().unwrap();
    assert_eq!(item.priority, DIRECT_PRIORITY);
    assert_eq!(item.call_type, CallType::Direct);
    assert_eq!(item.status, QueueStatus::Queued);

    // No provider call, no extra slot.
    assert!(h.provider.calls.lock().is_empty());
    assert_eq!(h.registry.count_active_user("A").await.unwrap(), 1);
}

#[tokio::test]
async fn direct_fast_path_surfaces_preconditions_and_provider_errors() {
    let h = harness(10, 2);

    // Unknown agent: precondition, nothing reserved or queued.
    let err = h
        .dispatcher
        .place_direct_call(
            DirectCallRequest {
                user_id: "A".to_string(),
                agent_id: "ghost".to_string(),
                phone_number: "+15550009999".to_string(),
                contact_id: None,
                user_data: json!({}),
                source_number_id: None,
            },
            NOW,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::AgentNotFound(_)));
    assert_eq!(h.registry.count_active_system().await.unwrap(), 0);
    assert!(h.queue.items.lock().is_empty());

    // Provider failure after reservation: slot released, error surfaced.
    h.directory.add_agent("agent-1", "A", None);
    h.provider.fail_next("busy lines");

    let err = h
        .dispatcher
        .place_direct_call(
            DirectCallRequest {
                user_id: "A".to_string(),
                agent_id: "agent-1".to_string(),
                phone_number: "+15550009999".to_string(),
                contact_id: None,
                user_data: json!({}),
                source_number_id: None,
            },
            NOW,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Provider(_)));
    assert_eq!(h.registry.count_active_system().await.unwrap(), 0);
    assert_eq!(h.registry.released.lock().len(), 1);
}
