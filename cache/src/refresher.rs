use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::manager::CacheManager;
use crate::memory::RefreshCandidate;

/// Recomputation callback for one key family. Receives the key, returns
/// the fresh value.
pub type RecomputeFn = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// One key family: which cache it lives in, which keys belong to it,
/// and how to recompute them.
pub struct RefreshRoute {
    pub cache: &'static str,
    pub pattern: Regex,
    pub recompute: RecomputeFn,
}

/// Typed registry of recomputation functions, keyed by pattern.
///
/// The refresher never string-matches key families itself; a key with
/// no route simply is not refreshable.
#[derive(Default)]
pub struct RefreshRegistry {
    routes: Vec<RefreshRoute>,
}

impl RefreshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, route: RefreshRoute) -> Self {
        self.routes.push(route);
        self
    }

    pub fn route_for(&self, cache: &str, key: &str) -> Option<&RefreshRoute> {
        self.routes
            .iter()
            .find(|r| r.cache == cache && r.pattern.is_match(key))
    }

    /// Recompute a single key now. `None` when no route covers it.
    pub async fn recompute(&self, cache: &str, key: &str) -> Option<anyhow::Result<Value>> {
        let route = self.route_for(cache, key)?;
        Some((route.recompute)(key.to_string()).await)
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Cadence of the background pass.
    pub interval: Duration,
    /// Age/TTL ratio past which an entry becomes a candidate.
    pub refresh_threshold: f64,
    /// Candidates refreshed per batch.
    pub batch_size: usize,
    /// In-flight recomputation cap.
    pub max_concurrent: usize,
    /// Window for the "recently accessed" priority bump.
    pub recent_window: Duration,
    /// Keys matching any of these always outrank the rest.
    pub critical_patterns: Vec<Regex>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            refresh_threshold: 0.8,
            batch_size: 16,
            max_concurrent: 4,
            recent_window: Duration::from_secs(600),
            critical_patterns: Vec::new(),
        }
    }
}

/// Priority of a refresh candidate. Base 1, +10 for critical data,
/// +5 for hot keys, +3 for recent access.
pub fn score(candidate: &RefreshCandidate, critical: bool) -> u32 {
    let mut p = 1;
    if critical {
        p += 10;
    }
    if candidate.access_count > 10 {
        p += 5;
    }
    if candidate.recently_accessed {
        p += 3;
    }
    p
}

#[derive(Default)]
pub struct RefreshCounters {
    pub refreshed: AtomicU64,
    pub failed: AtomicU64,
    pub skipped_in_flight: AtomicU64,
}

/// Re-computes entries nearing expiry so reads stay warm.
///
/// Guarantees:
/// - at most `max_concurrent` recomputations in flight
/// - at most one in-flight recomputation per key (single-flight)
/// - a failed recomputation never evicts the still-valid entry
pub struct CacheRefresher {
    manager: Arc<CacheManager>,
    registry: Arc<RefreshRegistry>,
    cfg: RefreshConfig,
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
    semaphore: Arc<Semaphore>,
    pub counters: Arc<RefreshCounters>,
}

impl CacheRefresher {
    pub fn new(
        manager: Arc<CacheManager>,
        registry: Arc<RefreshRegistry>,
        cfg: RefreshConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(cfg.max_concurrent.max(1)));

        Self {
            manager,
            registry,
            cfg,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            semaphore,
            counters: Arc::new(RefreshCounters::default()),
        }
    }

    /// One full refresh pass: enumerate, rank, refresh in batches.
    pub async fn run_once(&self) {
        let mut ranked: Vec<(Arc<crate::memory::MemoryCache<Value>>, RefreshCandidate, u32)> =
            Vec::new();

        for instance in self.manager.instances() {
            for candidate in
                instance.refresh_candidates(self.cfg.refresh_threshold, self.cfg.recent_window)
            {
                let critical = self
                    .cfg
                    .critical_patterns
                    .iter()
                    .any(|p| p.is_match(&candidate.key));
                let priority = score(&candidate, critical);
                ranked.push((instance.clone(), candidate, priority));
            }
        }

        if ranked.is_empty() {
            return;
        }

        ranked.sort_by(|a, b| b.2.cmp(&a.2));

        debug!(candidates = ranked.len(), "starting cache refresh pass");

        for batch in ranked.chunks(self.cfg.batch_size.max(1)) {
            let mut tasks = Vec::with_capacity(batch.len());

            for (instance, candidate, _) in batch {
                let marker = (instance.name().to_string(), candidate.key.clone());

                // Single-flight: a key already being refreshed is skipped.
                if !self.in_flight.lock().insert(marker.clone()) {
                    self.counters
                        .skipped_in_flight
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let instance = instance.clone();
                let candidate = candidate.clone();
                let registry = self.registry.clone();
                let in_flight = self.in_flight.clone();
                let semaphore = self.semaphore.clone();
                let counters = self.counters.clone();

                tasks.push(tokio::spawn(async move {
                    // Closed only on process teardown.
                    let Ok(_permit) = semaphore.acquire().await else {
                        in_flight.lock().remove(&marker);
                        return;
                    };

                    match registry.recompute(instance.name(), &candidate.key).await {
                        Some(Ok(value)) => {
                            instance.set(&candidate.key, value, Some(candidate.ttl));
                            counters.refreshed.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(Err(e)) => {
                            // Keep serving the still-valid entry.
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                cache = instance.name(),
                                key = %candidate.key,
                                error = %e,
                                "cache refresh failed; existing entry kept"
                            );
                        }
                        None => {
                            debug!(
                                cache = instance.name(),
                                key = %candidate.key,
                                "no refresh route for key"
                            );
                        }
                    }

                    in_flight.lock().remove(&marker);
                }));
            }

            join_all(tasks).await;
        }
    }

    /// Periodic loop; exits after finishing the current pass once
    /// shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(every_ms = self.cfg.interval.as_millis() as u64, "cache refresher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_once().await,
                _ = shutdown.changed() => break,
            }
        }

        info!("cache refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CacheConfig;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn manager_with_short_ttls() -> Arc<CacheManager> {
        let cfg = CacheConfig {
            max_size: 32,
            max_memory_bytes: 1024 * 1024,
            default_ttl: Duration::from_millis(100),
            cleanup_interval: Duration::from_secs(60),
        };
        Arc::new(CacheManager::new(cfg.clone(), cfg.clone(), cfg))
    }

    fn counting_registry(calls: Arc<AtomicUsize>, fail: bool) -> Arc<RefreshRegistry> {
        let recompute: RecomputeFn = Arc::new(move |key: String| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::Relaxed);
                if fail {
                    anyhow::bail!("recompute blew up for {key}");
                }
                Ok(json!({ "refreshed": key }))
            })
        });

        Arc::new(RefreshRegistry::new().register(RefreshRoute {
            cache: "dashboard",
            pattern: Regex::new("^dashboard:").unwrap(),
            recompute,
        }))
    }

    fn candidate(access_count: u64, recent: bool) -> RefreshCandidate {
        RefreshCandidate {
            key: "dashboard:u1:overview".to_string(),
            ttl: Duration::from_secs(60),
            access_count,
            recently_accessed: recent,
        }
    }

    #[test]
    fn score_stacks_the_documented_bumps() {
        assert_eq!(score(&candidate(0, false), false), 1);
        assert_eq!(score(&candidate(0, false), true), 11);
        assert_eq!(score(&candidate(11, false), false), 6);
        assert_eq!(score(&candidate(0, true), false), 4);
        assert_eq!(score(&candidate(11, true), true), 19);
    }

    #[tokio::test]
    async fn refreshes_only_entries_near_expiry() {
        let manager = manager_with_short_ttls();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(calls.clone(), false);

        let dashboard = manager.instance("dashboard").unwrap();
        dashboard.set("dashboard:u1:overview", json!("stale-soon"), None);
        dashboard.set(
            "dashboard:u1:fresh",
            json!("fresh"),
            Some(Duration::from_secs(60)),
        );

        // Let the short-TTL entry cross the 0.8 threshold.
        std::thread::sleep(Duration::from_millis(90));

        let refresher = CacheRefresher::new(manager, registry, RefreshConfig::default());
        refresher.run_once().await;

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(
            dashboard.get("dashboard:u1:overview"),
            Some(json!({ "refreshed": "dashboard:u1:overview" }))
        );
        assert_eq!(dashboard.get("dashboard:u1:fresh"), Some(json!("fresh")));
    }

    #[tokio::test]
    async fn failed_recompute_keeps_the_entry() {
        let manager = manager_with_short_ttls();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(calls.clone(), true);

        let dashboard = manager.instance("dashboard").unwrap();
        dashboard.set(
            "dashboard:u1:overview",
            json!("still-valid"),
            Some(Duration::from_secs(1)),
        );

        std::thread::sleep(Duration::from_millis(850));

        let refresher = CacheRefresher::new(manager, registry, RefreshConfig::default());
        refresher.run_once().await;

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(refresher.counters.failed.load(Ordering::Relaxed), 1);
        assert_eq!(
            dashboard.get("dashboard:u1:overview"),
            Some(json!("still-valid"))
        );
    }

    #[tokio::test]
    async fn in_flight_keys_are_skipped() {
        let manager = manager_with_short_ttls();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(calls.clone(), false);

        let dashboard = manager.instance("dashboard").unwrap();
        dashboard.set("dashboard:u1:overview", json!("v"), None);
        std::thread::sleep(Duration::from_millis(90));

        let refresher = CacheRefresher::new(manager, registry, RefreshConfig::default());

        // Simulate a refresh already in flight for the key.
        refresher
            .in_flight
            .lock()
            .insert(("dashboard".to_string(), "dashboard:u1:overview".to_string()));

        refresher.run_once().await;

        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(
            refresher.counters.skipped_in_flight.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn keys_without_a_route_are_left_alone() {
        let manager = manager_with_short_ttls();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(calls.clone(), false);

        let agent = manager.instance("agent").unwrap();
        agent.set("agent:u1:a1:summary", json!("v"), Some(Duration::from_secs(1)));
        std::thread::sleep(Duration::from_millis(850));

        let refresher = CacheRefresher::new(manager, registry, RefreshConfig::default());
        refresher.run_once().await;

        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(agent.get("agent:u1:a1:summary"), Some(json!("v")));
    }
}
