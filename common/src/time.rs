/// Milliseconds since the Unix epoch.
///
/// All persisted timestamps in this workspace are epoch-ms integers.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
