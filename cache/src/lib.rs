//! In-process cache engine for read-heavy derived views.
//!
//! [`memory::MemoryCache`] is the building block: LRU order, per-entry
//! TTL, a byte budget, and regex invalidation. [`manager::CacheManager`]
//! owns the named instances the platform uses; [`invalidation`] maps
//! domain events onto key patterns; [`refresher`] re-computes entries
//! nearing expiry so hot keys never go cold on the read path.

pub mod invalidation;
pub mod manager;
pub mod memory;
pub mod refresher;

pub use invalidation::{DomainEvent, InvalidationService};
pub use manager::CacheManager;
pub use memory::{CacheConfig, CacheStats, MemoryCache};
pub use refresher::{CacheRefresher, RefreshConfig, RefreshRegistry, RefreshRoute};
