use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use cache::memory::MemoryCache;
use cache::refresher::RecomputeFn;
use cache::{
    CacheManager, CacheRefresher, RefreshConfig, RefreshRegistry, RefreshRoute,
    invalidation::InvalidationConfig, InvalidationService,
};
use common::time::now_ms;
use dispatcher::{Counters, DispatchConfig, Dispatcher};
use provider::VoiceProvider;
use registry::repository::ActiveCallRegistry;
use registry::repository_sqlx::{RegistryConfig, SqlxRegistry};
use sqlx::AnyPool;
use webhook::{CallEventProcessor, RetryConfig, RetryPipeline};

use crate::config::AppConfig;
use crate::db::Db;
use crate::views;

/// The assembled dispatch core.
///
/// The HTTP surfaces (interactive API, webhook ingress) are external
/// collaborators: they call `dispatcher.place_direct_call`, the queue's
/// `enqueue`, and `pipeline.submit` on these handles.
pub struct Core {
    pub cfg: AppConfig,
    pub registry: Arc<SqlxRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub pipeline: Arc<RetryPipeline>,
    pub cache_manager: Arc<CacheManager>,
    pub refresher: Arc<CacheRefresher>,
    pub invalidation: Arc<InvalidationService>,
}

impl Core {
    /// Connects the database, runs migrations, and wires every
    /// component. Lifecycle is `init -> spawn_loops -> shutdown signal`.
    pub async fn init(cfg: AppConfig, provider: Arc<dyn VoiceProvider>) -> anyhow::Result<Self> {
        let db = Db::connect(&cfg.database_url).await?;
        db.migrate().await?;

        let registry = Arc::new(SqlxRegistry::new(
            db.pool.clone(),
            RegistryConfig {
                system_limit: cfg.system_limit,
                default_user_limit: cfg.default_user_limit,
            },
        ));

        let cache_manager = Arc::new(CacheManager::new(
            cfg.dashboard_cache.clone(),
            cfg.agent_cache.clone(),
            cfg.performance_cache.clone(),
        ));

        let refresh_registry = Arc::new(build_refresh_registry(db.pool.clone())?);

        let invalidation = Arc::new(InvalidationService::new(
            cache_manager.clone(),
            Some(refresh_registry.clone()),
            InvalidationConfig::default(),
        ));

        let refresher = Arc::new(CacheRefresher::new(
            cache_manager.clone(),
            refresh_registry,
            RefreshConfig {
                interval: cfg.refresh_interval,
                refresh_threshold: cfg.refresh_threshold,
                batch_size: cfg.refresh_batch_size,
                max_concurrent: cfg.refresh_max_concurrent,
                critical_patterns: vec![Regex::new("^dashboard:")?],
                ..Default::default()
            },
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            DispatchConfig {
                system_limit: cfg.system_limit,
                tick_interval: cfg.dispatch_interval,
                db_retry_attempts: cfg.db_retry_attempts,
            },
            registry.clone(),
            registry.clone(),
            registry.clone(),
            registry.clone(),
            provider,
            Counters::default(),
        ));

        let processor = Arc::new(CallEventProcessor::new(
            registry.clone(),
            registry.clone(),
            registry.clone(),
            Some(invalidation.clone()),
        ));

        let pipeline = Arc::new(RetryPipeline::new(
            RetryConfig {
                max_attempts: cfg.webhook_max_attempts,
                delays: cfg.webhook_delays.clone(),
                tick_interval: cfg.webhook_tick,
                dlq_retention: cfg.dlq_retention,
                ..Default::default()
            },
            processor,
        ));

        Ok(Self {
            cfg,
            registry,
            dispatcher,
            pipeline,
            cache_manager,
            refresher,
            invalidation,
        })
    }

    /// Starts every periodic task. Each loop finishes its current tick
    /// and exits once the shutdown channel flips.
    pub fn spawn_loops(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(self.dispatcher.clone().run(shutdown.clone())));
        handles.push(tokio::spawn(self.pipeline.clone().run(shutdown.clone())));
        handles.push(tokio::spawn(self.refresher.clone().run(shutdown.clone())));

        handles.push(spawn_orphan_cleanup(
            self.registry.clone(),
            self.cfg.orphan_cleanup_interval,
            self.cfg.orphan_stale_after,
            shutdown.clone(),
        ));

        for instance in self.cache_manager.instances() {
            handles.push(spawn_cache_sweeper(instance, shutdown.clone()));
        }

        handles
    }
}

fn spawn_orphan_cleanup(
    registry: Arc<SqlxRegistry>,
    every: std::time::Duration,
    stale_after: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = registry
                        .cleanup_orphans(stale_after.as_millis() as u64, now_ms())
                        .await
                    {
                        error!(error = ?e, "orphan cleanup failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn spawn_cache_sweeper(
    instance: Arc<MemoryCache<Value>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(instance.cleanup_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = instance.sweep_expired();
                    if swept > 0 {
                        info!(cache = instance.name(), swept, "expired cache entries swept");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Wires each cached key family to its recomputation query.
pub fn build_refresh_registry(pool: AnyPool) -> anyhow::Result<RefreshRegistry> {
    let dashboard_pool = pool.clone();
    let dashboard: RecomputeFn = Arc::new(move |key: String| {
        let pool = dashboard_pool.clone();
        Box::pin(async move {
            let user_id = key.split(':').nth(1).unwrap_or_default().to_string();
            views::dashboard_overview(&pool, &user_id).await
        })
    });

    let agent_pool = pool.clone();
    let agent: RecomputeFn = Arc::new(move |key: String| {
        let pool = agent_pool.clone();
        Box::pin(async move {
            let mut parts = key.split(':').skip(1);
            let user_id = parts.next().unwrap_or_default().to_string();
            let agent_id = parts.next().unwrap_or_default().to_string();
            views::agent_summary(&pool, &user_id, &agent_id).await
        })
    });

    let performance_pool = pool;
    let performance: RecomputeFn = Arc::new(move |key: String| {
        let pool = performance_pool.clone();
        Box::pin(async move {
            let mut parts = key.split(':').skip(1);
            let user_id = parts.next().unwrap_or_default().to_string();
            let period = parts.next().unwrap_or_default().to_string();
            views::performance_window(&pool, &user_id, &period, now_ms()).await
        })
    });

    Ok(RefreshRegistry::new()
        .register(RefreshRoute {
            cache: cache::manager::DASHBOARD,
            pattern: Regex::new("^dashboard:[^:]+:overview$")?,
            recompute: dashboard,
        })
        .register(RefreshRoute {
            cache: cache::manager::AGENT,
            pattern: Regex::new("^agent:[^:]+:[^:]+:summary$")?,
            recompute: agent,
        })
        .register(RefreshRoute {
            cache: cache::manager::PERFORMANCE,
            pattern: Regex::new("^performance:[^:]+:[^:]+$")?,
            recompute: performance,
        }))
}
