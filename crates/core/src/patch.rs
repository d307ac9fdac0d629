use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;
use crate::peer::PeerId;
use crate::value::Value;

/// Reserved table name for peer-stat traffic. A patch on this table carries a
/// peer-stat snapshot rather than a row.
pub const STATS_TABLE: &str = "_";

/// Column-name → value mapping of one row-level change.
pub type Delta = BTreeMap<String, Value>;

/// An immutable, per-peer, strictly-sequenced row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Hybrid logical timestamp minted by the producer.
    pub at: Hlc,
    /// Producing peer.
    pub peer: PeerId,
    /// Per-peer sequence id, strictly increasing from 1.
    pub seq: u64,
    /// Database schema version the producer was on.
    pub ver: u32,
    /// Target table, or [`STATS_TABLE`].
    pub tab: String,
    /// Columns touched by this change.
    pub delta: Delta,
}

impl Patch {
    pub fn is_stats(&self) -> bool {
        self.tab == STATS_TABLE
    }
}
