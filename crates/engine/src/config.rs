use quiltdb_storage::PlaceholderHook;

/// 25 hours.
pub const DEFAULT_PATCH_RETENTION_MS: u64 = 25 * 60 * 60 * 1000;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

pub const DEFAULT_PATCH_APPLY_DELAY_MS: u64 = 10;

/// Ceiling on MISSING_PATCH requests emitted per sweep; surplus gaps wait
/// for the next heartbeat scan.
pub const DEFAULT_MAX_MISSING_REQUESTS: usize = 100;

/// Constructor options for [`crate::Replicator`].
pub struct ReplicatorConfig {
    /// Explicit peer id; generated from the wall clock when absent.
    pub peer_id: Option<u64>,
    /// Encode wire frames as JSON strings instead of structured records.
    pub socket_string_mode: bool,
    /// Heartbeat cadence; 0 disables the timer entirely.
    pub heartbeat_interval_ms: u64,
    /// Debounce window for merging remote patch bursts.
    pub patch_apply_delay_ms: u64,
    /// Shadow/pending rows older than this are swept.
    pub max_patch_retention_ms: u64,
    pub max_request_for_missing_patches: usize,
    /// Placeholder syntax override for the statement planner.
    pub prepare_statement_hook: Option<PlaceholderHook>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            socket_string_mode: false,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            patch_apply_delay_ms: DEFAULT_PATCH_APPLY_DELAY_MS,
            max_patch_retention_ms: DEFAULT_PATCH_RETENTION_MS,
            max_request_for_missing_patches: DEFAULT_MAX_MISSING_REQUESTS,
            prepare_statement_hook: None,
        }
    }
}

impl ReplicatorConfig {
    pub fn with_peer_id(peer_id: u64) -> Self {
        Self {
            peer_id: Some(peer_id),
            ..Default::default()
        }
    }
}
