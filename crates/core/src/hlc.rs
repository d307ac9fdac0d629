use std::fmt;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds between the Unix epoch and 2025-01-01T00:00:00Z, the HLC epoch.
pub const HLC_EPOCH_MS: u64 = 1_735_689_600_000;

/// Low bits of an HLC value carry the causality counter.
pub const COUNTER_BITS: u32 = 13;

/// Largest counter value that fits in the low bits.
pub const COUNTER_MAX: u64 = (1 << COUNTER_BITS) - 1;

/// Wall-clock source. Injected so tests can freeze and rewind time.
pub trait WallClock {
    /// Current wall time as milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Production clock backed by `SystemTime`.
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A 53-bit hybrid logical timestamp: the high 40 bits are milliseconds since
/// [`HLC_EPOCH_MS`], the low 13 bits a counter 0..8191. The integer ordering
/// of the packed value is the clock ordering.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hlc(u64);

impl Hlc {
    pub const ZERO: Hlc = Hlc(0);

    pub fn from_raw(raw: u64) -> Self {
        Hlc(raw)
    }

    /// Pack a Unix-epoch millisecond timestamp and a counter.
    pub fn from_parts(unix_ms: u64, counter: u64) -> Self {
        let since_epoch = unix_ms.saturating_sub(HLC_EPOCH_MS);
        Hlc((since_epoch << COUNTER_BITS) | (counter & COUNTER_MAX))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The causality counter in the low bits.
    pub fn counter(self) -> u64 {
        self.0 & COUNTER_MAX
    }

    /// Milliseconds since the HLC epoch (the high bits).
    pub fn timestamp(self) -> u64 {
        self.0 >> COUNTER_BITS
    }

    /// Milliseconds since the Unix epoch.
    pub fn to_unix_ms(self) -> u64 {
        self.timestamp() + HLC_EPOCH_MS
    }
}

impl fmt::Debug for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hlc({}+{})", self.timestamp(), self.counter())
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates monotonically ordered HLC values and folds in remote timestamps.
///
/// Two `create()` calls in the same wall millisecond with no intervening
/// `receive` return the same value: ordering of a single peer's patches
/// within a millisecond is carried by its sequence id, not the clock.
pub struct HlcClock {
    wall: Rc<dyn WallClock>,
    highest_remote: Hlc,
    counter: u64,
    drift: u64,
}

impl HlcClock {
    pub fn new(wall: Rc<dyn WallClock>) -> Self {
        Self {
            wall,
            highest_remote: Hlc::ZERO,
            counter: 0,
            drift: 0,
        }
    }

    /// Mint a timestamp for a local write.
    pub fn create(&mut self) -> Hlc {
        let now = Hlc::from_parts(self.wall.now_ms(), 0);
        if now > self.highest_remote {
            self.counter = 0;
            return now;
        }
        self.counter += 1;
        self.drift = self.highest_remote.as_u64() - now.as_u64();
        if self.counter > COUNTER_MAX {
            tracing::warn!(
                counter = self.counter,
                "hlc counter overflow within one millisecond"
            );
        }
        Hlc::from_raw(self.highest_remote.as_u64() + self.counter)
    }

    /// Fold a remote timestamp in. Every later `create()` strictly exceeds it.
    pub fn receive(&mut self, remote: Hlc) {
        if remote > self.highest_remote {
            if remote.timestamp() > self.highest_remote.timestamp() {
                self.counter = 0;
            }
            self.highest_remote = remote;
        }
    }

    pub fn highest_remote(&self) -> Hlc {
        self.highest_remote
    }

    /// How far the remote front is ahead of the local wall clock, in ms.
    pub fn drift_ms(&self) -> u64 {
        self.drift >> COUNTER_BITS
    }
}
