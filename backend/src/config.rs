use std::str::FromStr;
use std::time::Duration;

use cache::CacheConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string.
    pub database_url: String,

    /// Structured JSON logs (production) vs pretty logs (development).
    pub json_logs: bool,

    // =========================
    // Concurrency caps
    // =========================
    /// System-wide concurrent call cap. The active-call registry is the
    /// authority this is compared against.
    pub system_limit: u32,

    /// Per-user cap applied when a user row carries no explicit limit.
    pub default_user_limit: u32,

    // =========================
    // Dispatcher
    // =========================
    /// Cadence of the dispatch tick.
    pub dispatch_interval: Duration,

    /// Bounded in-process retries for post-acceptance DB transitions.
    pub db_retry_attempts: u32,

    // =========================
    // Voice provider
    // =========================
    pub provider_base_url: String,
    pub provider_api_key: String,
    /// Per-request timeout; a timeout is treated as a provider failure.
    pub provider_timeout: Duration,

    // =========================
    // Webhook retry pipeline
    // =========================
    pub webhook_max_attempts: u32,
    pub webhook_delays: Vec<Duration>,
    pub webhook_tick: Duration,
    pub dlq_retention: Duration,

    // =========================
    // Orphan cleanup
    // =========================
    pub orphan_cleanup_interval: Duration,
    /// Slots older than this with a terminal or absent call record are
    /// reclaimed.
    pub orphan_stale_after: Duration,

    // =========================
    // Cache engine
    // =========================
    pub dashboard_cache: CacheConfig,
    pub agent_cache: CacheConfig,
    pub performance_cache: CacheConfig,

    pub refresh_interval: Duration,
    pub refresh_threshold: f64,
    pub refresh_batch_size: usize,
    pub refresh_max_concurrent: usize,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_ms_or(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(key, default_ms))
}

/// Per-instance cache knobs, e.g. `DASHBOARD_CACHE_MAX_SIZE`.
fn cache_cfg(prefix: &str, defaults: CacheConfig) -> CacheConfig {
    CacheConfig {
        max_size: env_or(&format!("{prefix}_CACHE_MAX_SIZE"), defaults.max_size),
        max_memory_bytes: env_or(
            &format!("{prefix}_CACHE_MAX_MEMORY"),
            defaults.max_memory_bytes,
        ),
        default_ttl: env_ms_or(
            &format!("{prefix}_CACHE_DEFAULT_TTL_MS"),
            defaults.default_ttl.as_millis() as u64,
        ),
        cleanup_interval: env_ms_or(
            &format!("{prefix}_CACHE_CLEANUP_INTERVAL_MS"),
            defaults.cleanup_interval.as_millis() as u64,
        ),
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://dialcast_dev.db".to_string());

        let webhook_delays = std::env::var("WEBHOOK_RETRY_DELAYS_MS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|v| v.trim().parse().ok())
                    .map(Duration::from_millis)
                    .collect::<Vec<_>>()
            })
            .filter(|v: &Vec<Duration>| !v.is_empty())
            .unwrap_or_else(|| {
                vec![
                    Duration::from_millis(5_000),
                    Duration::from_millis(30_000),
                    Duration::from_millis(300_000),
                ]
            });

        Self {
            database_url,
            json_logs: std::env::var("APP_ENV").unwrap_or_default() == "production",

            system_limit: env_or("SYSTEM_CONCURRENT_CALLS_LIMIT", 10),
            default_user_limit: env_or("DEFAULT_USER_CONCURRENT_CALLS_LIMIT", 2),

            dispatch_interval: env_ms_or("QUEUE_PROCESSOR_INTERVAL", 10_000),
            db_retry_attempts: env_or("DB_RETRY_ATTEMPTS", 3),

            provider_base_url: std::env::var("VOICE_PROVIDER_URL")
                .unwrap_or_else(|_| "https://api.voice.invalid".to_string()),
            provider_api_key: std::env::var("VOICE_PROVIDER_API_KEY").unwrap_or_default(),
            provider_timeout: env_ms_or("PROVIDER_REQUEST_TIMEOUT_MS", 15_000),

            webhook_max_attempts: env_or("WEBHOOK_MAX_ATTEMPTS", 3),
            webhook_delays,
            webhook_tick: env_ms_or("WEBHOOK_RETRY_TICK_MS", 10_000),
            dlq_retention: env_ms_or("DLQ_RETENTION_MS", 7 * 24 * 60 * 60 * 1_000),

            orphan_cleanup_interval: env_ms_or("ORPHAN_CLEANUP_INTERVAL_MS", 600_000),
            orphan_stale_after: env_ms_or("ORPHAN_STALE_AFTER_MS", 1_800_000),

            dashboard_cache: cache_cfg("DASHBOARD", CacheConfig::default()),
            agent_cache: cache_cfg("AGENT", CacheConfig::default()),
            performance_cache: cache_cfg("PERFORMANCE", CacheConfig::default()),

            refresh_interval: env_ms_or("CACHE_REFRESH_INTERVAL_MS", 300_000),
            refresh_threshold: env_or("CACHE_REFRESH_THRESHOLD", 0.8),
            refresh_batch_size: env_or("CACHE_REFRESH_BATCH_SIZE", 16),
            refresh_max_concurrent: env_or("CACHE_REFRESH_MAX_CONCURRENT", 4),
        }
    }
}
