use std::sync::Arc;
use std::time::Duration;

use regex::{Regex, escape};
use tracing::{debug, warn};

use crate::manager::{AGENT, CacheManager, DASHBOARD, PERFORMANCE};
use crate::refresher::RefreshRegistry;

/// Data mutations that must not leave stale derived views behind.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    CallCompleted { user_id: String },
    LeadDataChanged { user_id: String },
    AgentReconfigured { user_id: String, agent_id: String },
    CreditsChanged { user_id: String },
}

/// The key-pattern sets each event maps to. User and agent ids are
/// escaped: they are data, not patterns.
fn patterns_for(event: &DomainEvent) -> Vec<(&'static str, String)> {
    match event {
        DomainEvent::CallCompleted { user_id } => {
            let u = escape(user_id);
            vec![
                (DASHBOARD, format!("^dashboard:{u}:")),
                (PERFORMANCE, format!("^performance:{u}:")),
                (AGENT, format!("^agent:{u}:")),
            ]
        }
        DomainEvent::LeadDataChanged { user_id } => {
            let u = escape(user_id);
            vec![(DASHBOARD, format!("^dashboard:{u}:(overview|leads)"))]
        }
        DomainEvent::AgentReconfigured { user_id, agent_id } => {
            let u = escape(user_id);
            let a = escape(agent_id);
            vec![(AGENT, format!("^agent:{u}:{a}(:|$)"))]
        }
        DomainEvent::CreditsChanged { user_id } => {
            let u = escape(user_id);
            vec![(DASHBOARD, format!("^dashboard:{u}:overview$"))]
        }
    }
}

/// Keys worth re-warming right after invalidation.
fn warm_keys(event: &DomainEvent) -> Vec<(&'static str, String)> {
    match event {
        DomainEvent::CallCompleted { user_id } | DomainEvent::CreditsChanged { user_id } => {
            vec![(DASHBOARD, format!("dashboard:{user_id}:overview"))]
        }
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct InvalidationConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    /// Re-warm targeted keys after a successful invalidation.
    pub warm_after: bool,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            warm_after: false,
        }
    }
}

/// Applies domain events to the caches, synchronously with the
/// triggering mutation.
pub struct InvalidationService {
    manager: Arc<CacheManager>,
    registry: Option<Arc<RefreshRegistry>>,
    cfg: InvalidationConfig,
}

impl InvalidationService {
    pub fn new(
        manager: Arc<CacheManager>,
        registry: Option<Arc<RefreshRegistry>>,
        cfg: InvalidationConfig,
    ) -> Self {
        Self {
            manager,
            registry,
            cfg,
        }
    }

    /// Invalidate the event's pattern sets, retrying with exponential
    /// backoff, then optionally warm the targeted keys. Returns how
    /// many entries were dropped.
    pub async fn apply(&self, event: &DomainEvent) -> anyhow::Result<usize> {
        let mut last_err = None;

        for attempt in 0..self.cfg.max_attempts {
            match self.try_apply(event) {
                Ok(dropped) => {
                    debug!(?event, dropped, "cache invalidation applied");
                    if self.cfg.warm_after {
                        self.warm(event).await;
                    }
                    return Ok(dropped);
                }
                Err(e) => {
                    warn!(?event, attempt, error = %e, "cache invalidation failed; retrying");
                    last_err = Some(e);
                    tokio::time::sleep(self.cfg.base_backoff * 2u32.pow(attempt)).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("invalidation failed")))
    }

    fn try_apply(&self, event: &DomainEvent) -> anyhow::Result<usize> {
        let mut dropped = 0;

        for (cache_name, pattern) in patterns_for(event) {
            let re = Regex::new(&pattern)?;
            if let Some(instance) = self.manager.instance(cache_name) {
                dropped += instance.invalidate_pattern(&re);
            }
        }

        Ok(dropped)
    }

    async fn warm(&self, event: &DomainEvent) {
        let Some(registry) = &self.registry else {
            return;
        };

        for (cache_name, key) in warm_keys(event) {
            let Some(instance) = self.manager.instance(cache_name) else {
                continue;
            };

            match registry.recompute(cache_name, &key).await {
                Some(Ok(value)) => {
                    instance.set(&key, value, None);
                }
                Some(Err(e)) => {
                    warn!(cache = cache_name, key = %key, error = %e, "warm after invalidation failed");
                }
                None => {}
            }
        }
    }
}
