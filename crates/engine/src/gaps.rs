//! Gap detection and retransmission.
//!
//! The heartbeat scan asks every shadow store (and the pending store) for
//! holes in each producer's sequence axis, clamps the per-peer contiguous
//! prefix at the first hole, and asks the producing peer for the missing
//! ranges. Peers with no holes are promoted to synced.

use quiltdb_core::{Hlc, Message, MissingPatchRequest};
use quiltdb_storage::MissingRange;

use crate::{make_frame, EngineError, Replicator};

impl Replicator {
    /// Entry point for the periodic scan: if any peer's high-water mark is
    /// ahead of its contiguous prefix, sweep from the oldest such prefix.
    pub fn detect_and_request_missing(&mut self) -> Result<(), EngineError> {
        let from = self
            .peers
            .values()
            .filter(|state| {
                state.stats.last_sequence_id > state.stats.contiguous_sequence_id
            })
            .map(|state| state.stats.contiguous_patch_at)
            .min();
        if let Some(from) = from {
            self.get_missing(from)?;
        }
        Ok(())
    }

    /// List sequence holes visible at or after `from` and emit MISSING_PATCH
    /// requests, at most `max_request_for_missing_patches` per sweep. The
    /// first hole per peer bounds that peer's safe prefix; peers with no
    /// holes get their prefix promoted to the high-water mark. Returns the
    /// listed holes.
    pub fn get_missing(&mut self, from: Hlc) -> Result<Vec<MissingRange>, EngineError> {
        let gaps = self.store.list_missing(from)?;
        let mut touched: Vec<quiltdb_core::PeerId> = Vec::new();
        let mut sent = 0usize;

        for gap in &gaps {
            if gap.peer == self.peer_id {
                // Local history is dense by construction.
                continue;
            }
            if !touched.contains(&gap.peer) {
                touched.push(gap.peer);
                if let Some(state) = self.peers.get_mut(&gap.peer) {
                    state.stats.contiguous_sequence_id = gap.seq;
                    state.stats.contiguous_patch_at = gap.at;
                }
            }
            if sent >= self.config.max_request_for_missing_patches {
                continue;
            }
            let Some(state) = self.peers.get(&gap.peer) else {
                tracing::debug!(peer = gap.peer.get(), "gap from unregistered peer skipped");
                continue;
            };
            let Some(socket) = &state.socket else {
                tracing::debug!(
                    peer = gap.peer.get(),
                    "no socket for producing peer, deferring to next sweep"
                );
                continue;
            };
            let request = Message::MissingPatch(MissingPatchRequest {
                peer: gap.peer,
                min_seq: gap.seq + 1,
                max_seq: gap.seq + gap.missing,
                for_peer: self.peer_id,
            });
            let frame = make_frame(self.config.socket_string_mode, &request)?;
            match socket.send(&frame) {
                Ok(()) => {
                    sent += 1;
                    self.metrics.retransmission_out += 1;
                    self.metrics.messages_out += 1;
                }
                Err(e) => {
                    tracing::warn!(peer = gap.peer.get(), error = %e, "missing-patch request failed")
                }
            }
        }

        // No holes for these peers: whatever we heard of is contiguous.
        let hook = &mut self.on_synced;
        for (id, state) in self.peers.iter_mut() {
            if touched.contains(id) {
                continue;
            }
            let (seq, at) = (state.stats.last_sequence_id, state.stats.last_patch_at);
            state.stats.advance_contiguous(seq, at);
            if seq > 0 && !state.synced_fired {
                state.synced_fired = true;
                if let Some(hook) = hook.as_mut() {
                    hook(*id);
                }
            }
        }
        Ok(gaps)
    }

    /// Answer a MISSING_PATCH request: replay the held part of the range to
    /// the requester, in sequence order. Unknown requesters and absent
    /// patches are silently skipped.
    pub(crate) fn serve_missing(
        &mut self,
        request: &MissingPatchRequest,
    ) -> Result<(), EngineError> {
        let Some(state) = self.peers.get(&request.for_peer) else {
            return Ok(());
        };
        let Some(socket) = &state.socket else {
            return Ok(());
        };
        let patches = self.store.patches_in_range(
            request.peer,
            request.min_seq,
            request.max_seq,
            self.db_version,
        )?;
        let mut sent = 0;
        for patch in patches {
            let frame = make_frame(self.config.socket_string_mode, &Message::Patch(patch))?;
            match socket.send(&frame) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(peer = request.for_peer.get(), error = %e, "replay send failed")
                }
            }
        }
        self.metrics.messages_out += sent;
        Ok(())
    }
}
