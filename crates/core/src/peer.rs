use std::fmt;

use rand::Rng;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hlc::{Hlc, COUNTER_BITS, HLC_EPOCH_MS};

/// Random low-bits range used when generating a peer id.
const PEER_ID_RAND_RANGE: u64 = 8090;

/// A 53-bit peer identifier. Uniqueness is probabilistic when generated;
/// a collision between two live peers breaks convergence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    pub fn new(raw: u64) -> Self {
        PeerId(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Derive a fresh id from the wall clock plus random low bits.
    pub fn generate(now_ms: u64) -> Self {
        let ms = now_ms.saturating_sub(HLC_EPOCH_MS);
        let low = rand::thread_rng().gen_range(0..PEER_ID_RAND_RANGE);
        PeerId((ms << COUNTER_BITS) | low)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-remote-peer replication counters.
///
/// Wire form is a fixed array `[lastAt, lastSeq, guaranteedAt, guaranteedSeq,
/// lastMsgTs]`; the trailing liveness stamp is optional on input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// HLC of the highest-sequence patch ever seen.
    pub last_patch_at: Hlc,
    /// Highest sequence id ever seen.
    pub last_sequence_id: u64,
    /// HLC through which the local prefix is gap-free.
    pub contiguous_patch_at: Hlc,
    /// Highest sequence id through which the prefix is gap-free.
    pub contiguous_sequence_id: u64,
    /// Wall-clock ms of the last message received from the peer.
    pub last_message_ms: u64,
}

impl PeerStats {
    /// The local view is synced when the gap-free prefix reaches the highest
    /// sequence seen.
    pub fn is_synced(&self) -> bool {
        self.contiguous_sequence_id == self.last_sequence_id
    }

    /// Record a newly observed (seq, at); only ever moves the high-water mark up.
    pub fn observe(&mut self, seq: u64, at: Hlc) {
        if seq > self.last_sequence_id {
            self.last_sequence_id = seq;
            self.last_patch_at = at;
        }
    }

    /// Advance the gap-free prefix.
    pub fn advance_contiguous(&mut self, seq: u64, at: Hlc) {
        self.contiguous_sequence_id = seq;
        self.contiguous_patch_at = at;
    }
}

impl Serialize for PeerStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(5))?;
        seq.serialize_element(&self.last_patch_at.as_u64())?;
        seq.serialize_element(&self.last_sequence_id)?;
        seq.serialize_element(&self.contiguous_patch_at.as_u64())?;
        seq.serialize_element(&self.contiguous_sequence_id)?;
        seq.serialize_element(&self.last_message_ms)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for PeerStats {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StatsVisitor;

        impl<'de> Visitor<'de> for StatsVisitor {
            type Value = PeerStats;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an array of 4 or 5 counters")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<PeerStats, A::Error> {
                let last_at: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let last_seq: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let contiguous_at: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let contiguous_seq: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                let last_msg: Option<u64> = seq.next_element()?;
                Ok(PeerStats {
                    last_patch_at: Hlc::from_raw(last_at),
                    last_sequence_id: last_seq,
                    contiguous_patch_at: Hlc::from_raw(contiguous_at),
                    contiguous_sequence_id: contiguous_seq,
                    last_message_ms: last_msg.unwrap_or(0),
                })
            }
        }

        deserializer.deserialize_seq(StatsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_embed_the_clock() {
        let now = HLC_EPOCH_MS + 123_456;
        let id = PeerId::generate(now);
        assert_eq!(id.get() >> COUNTER_BITS, 123_456);
        assert!(id.get() & ((1 << COUNTER_BITS) - 1) < PEER_ID_RAND_RANGE);
    }

    #[test]
    fn stats_array_roundtrip() {
        let stats = PeerStats {
            last_patch_at: Hlc::from_raw(900),
            last_sequence_id: 12,
            contiguous_patch_at: Hlc::from_raw(700),
            contiguous_sequence_id: 9,
            last_message_ms: 1_735_689_700_000,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert_eq!(json, "[900,12,700,9,1735689700000]");
        let back: PeerStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }

    #[test]
    fn four_element_array_is_accepted() {
        let back: PeerStats = serde_json::from_str("[900,12,700,9]").unwrap();
        assert_eq!(back.last_sequence_id, 12);
        assert_eq!(back.last_message_ms, 0);
    }

    #[test]
    fn synced_iff_prefix_reaches_high_water() {
        let mut stats = PeerStats::default();
        assert!(stats.is_synced());
        stats.observe(3, Hlc::from_raw(10));
        assert!(!stats.is_synced());
        stats.advance_contiguous(3, Hlc::from_raw(10));
        assert!(stats.is_synced());
    }
}
