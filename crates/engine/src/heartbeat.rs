use rand::Rng;

/// One hour between retention sweeps, give or take the jitter.
pub(crate) const SWEEP_INTERVAL_MS: u64 = 3_600_000;
pub(crate) const SWEEP_JITTER_MS: u64 = 300_000;

/// Timestamps driving the periodic work. All fields are wall-clock ms.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Heartbeat {
    pub last_ping_ms: u64,
    pub last_scan_ms: u64,
    pub next_sweep_ms: u64,
}

impl Heartbeat {
    pub fn new(now_ms: u64) -> Self {
        Self {
            last_ping_ms: now_ms,
            last_scan_ms: now_ms,
            next_sweep_ms: next_sweep(now_ms),
        }
    }
}

/// Next sweep deadline: one hour out, jittered ±5 minutes so a fleet started
/// together does not sweep together.
pub(crate) fn next_sweep(now_ms: u64) -> u64 {
    let jitter = rand::thread_rng().gen_range(0..=2 * SWEEP_JITTER_MS);
    now_ms + SWEEP_INTERVAL_MS - SWEEP_JITTER_MS + jitter
}
