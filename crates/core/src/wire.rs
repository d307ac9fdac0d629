use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hlc::Hlc;
use crate::patch::{Delta, Patch};
use crate::peer::{PeerId, PeerStats};

pub const MSG_PATCH: u8 = 10;
pub const MSG_PING: u8 = 20;
pub const MSG_MISSING_PATCH: u8 = 30;

/// Peer-stat broadcast. Same envelope as a patch on the reserved table, with
/// the delta carrying a per-peer stat map.
#[derive(Debug, Clone, PartialEq)]
pub struct Ping {
    pub at: Hlc,
    pub peer: PeerId,
    pub seq: u64,
    pub stats: BTreeMap<PeerId, PeerStats>,
}

/// "I, `for_peer`, ask you for patches produced by `peer` in
/// `[min_seq..=max_seq]`."
#[derive(Debug, Clone, PartialEq)]
pub struct MissingPatchRequest {
    pub peer: PeerId,
    pub min_seq: u64,
    pub max_seq: u64,
    pub for_peer: PeerId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Patch(Patch),
    Ping(Ping),
    MissingPatch(MissingPatchRequest),
}

/// Flat wire shape shared by all message kinds; `type` selects the fields
/// that must be present.
#[derive(Serialize, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    peer: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ver: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tab: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<serde_json::Value>,
    #[serde(default, rename = "minSeq", skip_serializing_if = "Option::is_none")]
    min_seq: Option<u64>,
    #[serde(default, rename = "maxSeq", skip_serializing_if = "Option::is_none")]
    max_seq: Option<u64>,
    #[serde(default, rename = "forPeer", skip_serializing_if = "Option::is_none")]
    for_peer: Option<u64>,
}

fn require<T>(field: Option<T>, name: &str) -> Result<T, CoreError> {
    field.ok_or_else(|| CoreError::InvalidMessage(format!("missing field `{name}`")))
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Message::Patch(_) => MSG_PATCH,
            Message::Ping(_) => MSG_PING,
            Message::MissingPatch(_) => MSG_MISSING_PATCH,
        }
    }

    pub fn encode_json(&self) -> Result<String, CoreError> {
        let raw = self.to_raw()?;
        serde_json::to_string(&raw).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn decode_json(text: &str) -> Result<Message, CoreError> {
        let raw: RawMessage =
            serde_json::from_str(text).map_err(|e| CoreError::Serialization(e.to_string()))?;
        Message::from_raw(raw)
    }

    fn to_raw(&self) -> Result<RawMessage, CoreError> {
        let raw = match self {
            Message::Patch(p) => RawMessage {
                kind: MSG_PATCH,
                at: Some(p.at.as_u64()),
                peer: Some(p.peer.get()),
                seq: Some(p.seq),
                ver: Some(p.ver),
                tab: Some(p.tab.clone()),
                delta: Some(
                    serde_json::to_value(&p.delta)
                        .map_err(|e| CoreError::Serialization(e.to_string()))?,
                ),
                min_seq: None,
                max_seq: None,
                for_peer: None,
            },
            Message::Ping(p) => {
                let mut map = serde_json::Map::new();
                for (peer, stats) in &p.stats {
                    map.insert(
                        peer.get().to_string(),
                        serde_json::to_value(stats)
                            .map_err(|e| CoreError::Serialization(e.to_string()))?,
                    );
                }
                RawMessage {
                    kind: MSG_PING,
                    at: Some(p.at.as_u64()),
                    peer: Some(p.peer.get()),
                    seq: Some(p.seq),
                    ver: None,
                    tab: Some(crate::patch::STATS_TABLE.to_string()),
                    delta: Some(serde_json::Value::Object(map)),
                    min_seq: None,
                    max_seq: None,
                    for_peer: None,
                }
            }
            Message::MissingPatch(r) => RawMessage {
                kind: MSG_MISSING_PATCH,
                at: None,
                peer: Some(r.peer.get()),
                seq: None,
                ver: None,
                tab: None,
                delta: None,
                min_seq: Some(r.min_seq),
                max_seq: Some(r.max_seq),
                for_peer: Some(r.for_peer.get()),
            },
        };
        Ok(raw)
    }

    fn from_raw(raw: RawMessage) -> Result<Message, CoreError> {
        match raw.kind {
            MSG_PATCH => {
                let delta: Delta = match raw.delta {
                    Some(v) => serde_json::from_value(v)
                        .map_err(|e| CoreError::InvalidMessage(format!("bad delta: {e}")))?,
                    None => Delta::new(),
                };
                Ok(Message::Patch(Patch {
                    at: Hlc::from_raw(require(raw.at, "at")?),
                    peer: PeerId::new(require(raw.peer, "peer")?),
                    seq: require(raw.seq, "seq")?,
                    ver: require(raw.ver, "ver")?,
                    tab: require(raw.tab, "tab")?,
                    delta,
                }))
            }
            MSG_PING => {
                let mut stats = BTreeMap::new();
                if let Some(serde_json::Value::Object(map)) = raw.delta {
                    for (key, value) in map {
                        let id: u64 = key.parse().map_err(|_| {
                            CoreError::InvalidMessage(format!("bad peer id key `{key}`"))
                        })?;
                        let entry: PeerStats = serde_json::from_value(value)
                            .map_err(|e| CoreError::InvalidMessage(format!("bad stats: {e}")))?;
                        stats.insert(PeerId::new(id), entry);
                    }
                }
                Ok(Message::Ping(Ping {
                    at: Hlc::from_raw(require(raw.at, "at")?),
                    peer: PeerId::new(require(raw.peer, "peer")?),
                    seq: require(raw.seq, "seq")?,
                    stats,
                }))
            }
            MSG_MISSING_PATCH => Ok(Message::MissingPatch(MissingPatchRequest {
                peer: PeerId::new(require(raw.peer, "peer")?),
                min_seq: require(raw.min_seq, "minSeq")?,
                max_seq: require(raw.max_seq, "maxSeq")?,
                for_peer: PeerId::new(require(raw.for_peer, "forPeer")?),
            })),
            other => Err(CoreError::UnknownMessageType(other)),
        }
    }
}
