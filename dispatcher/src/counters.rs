use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub ticks: Arc<AtomicU64>,
    pub lock_contended: Arc<AtomicU64>,

    pub calls_placed: Arc<AtomicU64>,

    // skip reasons
    pub capacity_skips: Arc<AtomicU64>,
    pub capacity_reverts: Arc<AtomicU64>,
    pub precondition_failures: Arc<AtomicU64>,
    pub provider_failures: Arc<AtomicU64>,
}
