use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::processor::TerminalEventProcessor;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Backoff schedule indexed by failure count; the last entry repeats.
    pub delays: Vec<Duration>,
    pub tick_interval: Duration,
    /// How long shutdown waits for a final drain of due jobs.
    pub drain_window: Duration,
    /// Dead letters older than this are eligible for purge.
    pub dlq_retention: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(300),
            ],
            tick_interval: Duration::from_secs(10),
            drain_window: Duration::from_secs(5),
            dlq_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl RetryConfig {
    /// Delay after the k-th failure (k is 1-based).
    fn delay_after_failure(&self, k: u32) -> Duration {
        let idx = (k.saturating_sub(1) as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(idx).copied().unwrap_or(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone)]
struct RetryJob {
    id: Uuid,
    payload: Value,
    attempts: u32,
    next_retry_at: Instant,
    last_error: String,
    created_at: Instant,
}

/// A job that exhausted its retries.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub payload: Value,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: Instant,
    pub dead_at: Instant,
}

#[derive(Default)]
pub struct PipelineCounters {
    pub submitted: AtomicU64,
    pub processed: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub dead_lettered: AtomicU64,
}

/// Accepts terminal-event payloads, tries synchronous processing, and
/// retries failures on a fixed schedule until the DLQ takes over.
pub struct RetryPipeline {
    cfg: RetryConfig,
    processor: Arc<dyn TerminalEventProcessor>,
    pending: Mutex<HashMap<Uuid, RetryJob>>,
    dlq: Mutex<Vec<DeadLetter>>,
    tick_lock: tokio::sync::Mutex<()>,
    pub counters: PipelineCounters,
}

impl RetryPipeline {
    pub fn new(cfg: RetryConfig, processor: Arc<dyn TerminalEventProcessor>) -> Self {
        Self {
            cfg,
            processor,
            pending: Mutex::new(HashMap::new()),
            dlq: Mutex::new(Vec::new()),
            tick_lock: tokio::sync::Mutex::new(()),
            counters: PipelineCounters::default(),
        }
    }

    /// Ingest one payload. Returns `true` when processing succeeded
    /// synchronously; otherwise a retry job now owns the event.
    pub async fn submit(&self, payload: Value) -> bool {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        match self.processor.process(&payload).await {
            Ok(()) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let now = Instant::now();
                let job = RetryJob {
                    id: Uuid::new_v4(),
                    payload,
                    attempts: 1,
                    next_retry_at: now + self.cfg.delay_after_failure(1),
                    last_error: e.to_string(),
                    created_at: now,
                };

                warn!(
                    job_id = %job.id,
                    error = %e,
                    retry_in_ms = self.cfg.delay_after_failure(1).as_millis() as u64,
                    "terminal event processing failed; scheduled for retry"
                );

                self.counters.retries_scheduled.fetch_add(1, Ordering::Relaxed);
                self.pending.lock().insert(job.id, job);
                false
            }
        }
    }

    /// Process every due job. Non-reentrant: an in-progress tick makes
    /// this a no-op.
    pub async fn tick(&self) {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("retry tick already running; skipping");
            return;
        };

        let now = Instant::now();

        let mut due: Vec<RetryJob> = {
            let mut pending = self.pending.lock();
            let ids: Vec<Uuid> = pending
                .values()
                .filter(|j| j.next_retry_at <= now)
                .map(|j| j.id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        if due.is_empty() {
            return;
        }

        due.sort_by_key(|j| (j.next_retry_at, j.created_at));

        for mut job in due {
            match self.processor.process(&job.payload).await {
                Ok(()) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    debug!(job_id = %job.id, attempts = job.attempts, "retry succeeded");
                }
                Err(e) => {
                    job.attempts += 1;
                    job.last_error = e.to_string();

                    if job.attempts >= self.cfg.max_attempts {
                        // Operator alert: the event is out of automatic retries.
                        error!(
                            job_id = %job.id,
                            attempts = job.attempts,
                            error = %job.last_error,
                            "terminal event exhausted retries; moved to dead-letter queue"
                        );

                        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                        self.dlq.lock().push(DeadLetter {
                            id: job.id,
                            payload: job.payload,
                            attempts: job.attempts,
                            last_error: job.last_error,
                            created_at: job.created_at,
                            dead_at: Instant::now(),
                        });
                    } else {
                        let delay = self.cfg.delay_after_failure(job.attempts);
                        job.next_retry_at = Instant::now() + delay;

                        warn!(
                            job_id = %job.id,
                            attempts = job.attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %job.last_error,
                            "retry failed; rescheduled"
                        );

                        self.counters.retries_scheduled.fetch_add(1, Ordering::Relaxed);
                        self.pending.lock().insert(job.id, job);
                    }
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn list_dlq(&self) -> Vec<DeadLetter> {
        self.dlq.lock().clone()
    }

    /// Operator action: give a dead letter a fresh retry lifecycle.
    pub async fn retry_dead_letter(&self, id: Uuid) -> anyhow::Result<bool> {
        let letter = {
            let mut dlq = self.dlq.lock();
            match dlq.iter().position(|d| d.id == id) {
                Some(idx) => dlq.remove(idx),
                None => return Err(anyhow::anyhow!("dead letter {id} not found")),
            }
        };

        Ok(self.submit(letter.payload).await)
    }

    /// Drop dead letters older than `older_than`. Returns the count.
    pub fn purge_dlq(&self, older_than: Duration) -> usize {
        let now = Instant::now();
        let mut dlq = self.dlq.lock();
        let before = dlq.len();
        dlq.retain(|d| now.duration_since(d.dead_at) < older_than);
        before - dlq.len()
    }

    /// Periodic loop. On shutdown the current tick finishes and due
    /// jobs get one final bounded drain.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.cfg.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            every_ms = self.cfg.tick_interval.as_millis() as u64,
            "webhook retry pipeline started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;

                    let purged = self.purge_dlq(self.cfg.dlq_retention);
                    if purged > 0 {
                        info!(purged, "expired dead letters purged");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        if self.pending_len() > 0 {
            let _ = tokio::time::timeout(self.cfg.drain_window, self.tick()).await;
        }

        info!(pending = self.pending_len(), "webhook retry pipeline stopped");
    }
}
