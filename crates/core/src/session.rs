use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::peer::PeerId;

/// Longest token string the parser will look at.
const MAX_TOKEN_LEN: usize = 50;

/// Largest integer either token component may carry (2^53 − 1).
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Total polling budget for read-your-writes, in ms.
pub const DEFAULT_CONSISTENCY_DEADLINE_MS: u64 = 5_000;

/// First non-zero backoff delay, in ms.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 10;

/// `"<peerId>.<sequenceId>"` — handed to a caller after a successful local
/// write so later reads can wait for that write to be visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken {
    pub peer: PeerId,
    pub seq: u64,
}

impl SessionToken {
    pub fn new(peer: PeerId, seq: u64) -> Self {
        Self { peer, seq }
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peer, self.seq)
    }
}

impl FromStr for SessionToken {
    type Err = CoreError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.len() > MAX_TOKEN_LEN {
            return Err(CoreError::MalformedToken("token too long".into()));
        }
        let mut parts = text.split('.');
        let (peer, seq) = match (parts.next(), parts.next(), parts.next()) {
            (Some(peer), Some(seq), None) => (peer, seq),
            _ => {
                return Err(CoreError::MalformedToken(
                    "expected exactly two components".into(),
                ))
            }
        };
        let peer: u64 = peer
            .parse()
            .map_err(|_| CoreError::MalformedToken(format!("bad peer id `{peer}`")))?;
        let seq: u64 = seq
            .parse()
            .map_err(|_| CoreError::MalformedToken(format!("bad sequence id `{seq}`")))?;
        if peer == 0 || seq == 0 || peer > MAX_SAFE_INTEGER || seq > MAX_SAFE_INTEGER {
            return Err(CoreError::MalformedToken("component out of range".into()));
        }
        Ok(SessionToken {
            peer: PeerId::new(peer),
            seq,
        })
    }
}

/// Exponential backoff schedule: 0, d, 2d, 4d, … with the cumulative delay
/// truncated to a total deadline.
#[derive(Debug, Clone)]
pub struct Backoff {
    next_delay: u64,
    remaining: u64,
    first: bool,
}

impl Backoff {
    pub fn new(base_ms: u64, deadline_ms: u64) -> Self {
        Self {
            next_delay: base_ms,
            remaining: deadline_ms,
            first: true,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE_MS, DEFAULT_CONSISTENCY_DEADLINE_MS)
    }
}

impl Iterator for Backoff {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.first {
            self.first = false;
            return Some(0);
        }
        if self.remaining == 0 {
            return None;
        }
        let delay = self.next_delay.min(self.remaining);
        self.remaining -= delay;
        self.next_delay = self.next_delay.saturating_mul(2);
        Some(delay)
    }
}
