use std::sync::Arc;

use serde_json::Value;

use crate::memory::{CacheConfig, CacheStats, MemoryCache};

pub const DASHBOARD: &str = "dashboard";
pub const AGENT: &str = "agent";
pub const PERFORMANCE: &str = "performance";

/// Owns the named cache instances the platform reads from.
///
/// Invalidation and refresh interact with instances only through the
/// cache's contracted operations; nothing else holds them.
pub struct CacheManager {
    dashboard: Arc<MemoryCache<Value>>,
    agent: Arc<MemoryCache<Value>>,
    performance: Arc<MemoryCache<Value>>,
}

impl CacheManager {
    pub fn new(dashboard: CacheConfig, agent: CacheConfig, performance: CacheConfig) -> Self {
        Self {
            dashboard: Arc::new(MemoryCache::new(DASHBOARD, dashboard)),
            agent: Arc::new(MemoryCache::new(AGENT, agent)),
            performance: Arc::new(MemoryCache::new(PERFORMANCE, performance)),
        }
    }

    pub fn instance(&self, name: &str) -> Option<Arc<MemoryCache<Value>>> {
        match name {
            DASHBOARD => Some(self.dashboard.clone()),
            AGENT => Some(self.agent.clone()),
            PERFORMANCE => Some(self.performance.clone()),
            _ => None,
        }
    }

    pub fn instances(&self) -> Vec<Arc<MemoryCache<Value>>> {
        vec![
            self.dashboard.clone(),
            self.agent.clone(),
            self.performance.clone(),
        ]
    }

    pub fn aggregate_stats(&self) -> Vec<CacheStats> {
        self.instances().iter().map(|c| c.stats()).collect()
    }

    /// Clears every instance. Returns the total entries dropped.
    pub fn clear_all(&self) -> usize {
        self.instances().iter().map(|c| c.clear()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> CacheManager {
        let cfg = CacheConfig::default();
        CacheManager::new(cfg.clone(), cfg.clone(), cfg)
    }

    #[test]
    fn instances_are_resolved_by_name() {
        let m = manager();

        assert!(m.instance(DASHBOARD).is_some());
        assert!(m.instance(AGENT).is_some());
        assert!(m.instance(PERFORMANCE).is_some());
        assert!(m.instance("sessions").is_none());
    }

    #[test]
    fn clear_all_sums_across_instances() {
        let m = manager();

        m.instance(DASHBOARD)
            .unwrap()
            .set("dashboard:u1:overview", json!(1), None);
        m.instance(AGENT)
            .unwrap()
            .set("agent:u1:a1:summary", json!(2), None);

        assert_eq!(m.clear_all(), 2);
        assert!(m.instances().iter().all(|c| c.is_empty()));
    }

    #[test]
    fn aggregate_stats_cover_every_instance() {
        let m = manager();
        let names: Vec<String> = m
            .aggregate_stats()
            .into_iter()
            .map(|s| s.name)
            .collect();

        assert_eq!(names, vec![DASHBOARD, AGENT, PERFORMANCE]);
    }
}
