pub mod config;
pub mod error;
mod gaps;
mod heartbeat;
pub mod metrics;
pub mod transport;

pub use config::ReplicatorConfig;
pub use error::EngineError;
pub use transport::{Frame, PeerSocket, TransportError};

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use quiltdb_core::{
    Backoff, CoreError, Delta, Hlc, HlcClock, Message, Patch, PeerId, PeerStats, Ping,
    SessionToken, SystemClock, WallClock,
};
use quiltdb_storage::{Migration, MigrationOutcome, PatchStore};

use crate::heartbeat::Heartbeat;
use crate::metrics::Metrics;

/// Per-remote-peer state: counters, the send half of its connection, and
/// whether the one-shot `synced` event has fired.
#[derive(Default)]
struct RemotePeer {
    stats: PeerStats,
    socket: Option<Box<dyn PeerSocket>>,
    synced_fired: bool,
}

/// A table whose shadow store received remote patches since the last merge
/// flush. `from` is the lowest `_patchedAt` seen in the burst.
#[derive(Debug, Clone, Copy)]
struct PendingMerge {
    from: Hlc,
    due_ms: u64,
}

enum Track {
    Fresh,
    Duplicate,
    UnknownPeer,
}

fn make_frame(string_mode: bool, msg: &Message) -> Result<Frame, CoreError> {
    if string_mode {
        Ok(Frame::Text(msg.encode_json()?))
    } else {
        Ok(Frame::Record(msg.clone()))
    }
}

/// The replication core. Owns the database, the clock, the peer registry and
/// every counter; all of it runs on one task, so no locking anywhere.
pub struct Replicator {
    config: ReplicatorConfig,
    peer_id: PeerId,
    wall: Rc<dyn WallClock>,
    clock: HlcClock,
    store: PatchStore,
    db_version: u32,
    /// `None` until the first migration ran.
    last_sequence_id: Option<u64>,
    last_patch_at: Hlc,
    peers: BTreeMap<PeerId, RemotePeer>,
    merges: BTreeMap<String, PendingMerge>,
    heartbeat: Heartbeat,
    metrics: Metrics,
    on_synced: Option<Box<dyn FnMut(PeerId)>>,
}

impl Replicator {
    pub fn open(path: &str, mut config: ReplicatorConfig) -> Result<Self, EngineError> {
        let store = match config.prepare_statement_hook.take() {
            Some(hook) => PatchStore::open_with_hook(path, hook)?,
            None => PatchStore::open(path)?,
        };
        Ok(Self::with_store(store, config, Rc::new(SystemClock)))
    }

    pub fn open_in_memory(mut config: ReplicatorConfig) -> Result<Self, EngineError> {
        let store = match config.prepare_statement_hook.take() {
            Some(hook) => PatchStore::open_in_memory_with_hook(hook)?,
            None => PatchStore::open_in_memory()?,
        };
        Ok(Self::with_store(store, config, Rc::new(SystemClock)))
    }

    /// Assemble from parts; the harness uses this to control time.
    pub fn with_store(
        store: PatchStore,
        config: ReplicatorConfig,
        wall: Rc<dyn WallClock>,
    ) -> Self {
        let now = wall.now_ms();
        let peer_id = config
            .peer_id
            .map(PeerId::new)
            .unwrap_or_else(|| PeerId::generate(now));
        Self {
            clock: HlcClock::new(wall.clone()),
            heartbeat: Heartbeat::new(now),
            config,
            peer_id,
            wall,
            store,
            db_version: 0,
            last_sequence_id: None,
            last_patch_at: Hlc::ZERO,
            peers: BTreeMap::new(),
            merges: BTreeMap::new(),
            metrics: Metrics::default(),
            on_synced: None,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn db_version(&self) -> u32 {
        self.db_version
    }

    pub fn last_sequence_id(&self) -> Option<u64> {
        self.last_sequence_id
    }

    pub fn last_patch_at(&self) -> Hlc {
        self.last_patch_at
    }

    pub fn store(&self) -> &PatchStore {
        &self.store
    }

    pub fn peer_stats(&self, peer: PeerId) -> Option<PeerStats> {
        self.peers.get(&peer).map(|state| state.stats)
    }

    /// Register the one-shot per-peer `synced` hook.
    pub fn set_on_synced(&mut self, hook: impl FnMut(PeerId) + 'static) {
        self.on_synced = Some(Box::new(hook));
    }

    // ------------------------------------------------------------------
    // Transport registry
    // ------------------------------------------------------------------

    /// Register (or replace) the send half for a peer. Stats are created on
    /// first registration and survive socket churn.
    pub fn add_remote_peer(&mut self, peer: PeerId, socket: Box<dyn PeerSocket>) {
        let state = self.peers.entry(peer).or_default();
        state.socket = Some(socket);
    }

    /// Drop the socket but keep counters; a reconnect resumes where it left.
    pub fn pause_remote_peer(&mut self, peer: PeerId) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.socket = None;
        }
    }

    /// Forget the peer entirely.
    pub fn close_remote_peer(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
    }

    pub fn connected_peers(&self) -> usize {
        self.peers
            .values()
            .filter(|state| state.socket.is_some())
            .count()
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    /// Run the application's migration list, restore the local sequence
    /// counters from whatever this peer already produced, then drain staged
    /// patches that match the new schema version.
    pub fn migrate(&mut self, migrations: &[Migration]) -> Result<MigrationOutcome, EngineError> {
        let outcome = self.store.migrate(migrations)?;
        self.db_version = outcome.current_version;
        match self.store.last_patch_info(self.peer_id, Hlc::ZERO)? {
            Some((at, seq)) => {
                self.last_patch_at = at;
                self.last_sequence_id = Some(seq);
            }
            None => {
                self.last_patch_at = Hlc::ZERO;
                self.last_sequence_id = Some(0);
            }
        }
        self.apply_pending_patches()?;
        Ok(outcome)
    }

    /// Move staged patches whose version now matches into their shadow
    /// stores and fold them into the materialised tables. Stat snapshots on
    /// the reserved table stay staged until retention.
    pub fn apply_pending_patches(&mut self) -> Result<usize, EngineError> {
        let drained = self.store.take_pending(self.db_version)?;
        let mut applied = 0;
        let mut floors: BTreeMap<String, Hlc> = BTreeMap::new();
        for patch in drained {
            if self.store.table_plan(&patch.tab).is_none() {
                tracing::warn!(table = %patch.tab, "dropping staged patch for unknown table");
                continue;
            }
            self.store.save_patch(&patch)?;
            let floor = floors.entry(patch.tab.clone()).or_insert(patch.at);
            if patch.at < *floor {
                *floor = patch.at;
            }
            applied += 1;
        }
        for (table, from) in floors {
            self.store.apply_patches(&table, from)?;
        }
        Ok(applied)
    }

    // ------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------

    /// Record a local row change: mint a timestamp, persist the patch to the
    /// shadow store, fold it into the materialised table, broadcast it, and
    /// hand back a session token for read-your-writes.
    pub fn upsert(&mut self, table: &str, row: Delta) -> Result<SessionToken, EngineError> {
        if self.db_version == 0 {
            return Err(EngineError::MigrationRequired);
        }
        let Some(last_seq) = self.last_sequence_id else {
            return Err(EngineError::MigrationRequired);
        };
        let columns: Vec<String> = match self.store.table_plan(table) {
            Some(plan) => plan.schema.columns().map(str::to_string).collect(),
            None => return Err(EngineError::UnknownTable(table.to_string())),
        };
        let delta: Delta = row
            .into_iter()
            .filter(|(key, _)| columns.iter().any(|column| column == key))
            .collect();

        let at = self.clock.create();
        self.metrics.note_drift(self.clock.drift_ms());
        let patch = Patch {
            at,
            peer: self.peer_id,
            seq: last_seq + 1,
            ver: self.db_version,
            tab: table.to_string(),
            delta,
        };
        self.store.save_patch(&patch)?;
        self.last_sequence_id = Some(patch.seq);
        self.last_patch_at = at;

        // The caller must observe its own write: merge synchronously.
        self.store.apply_patches(table, at)?;

        let seq = patch.seq;
        self.broadcast(&Message::Patch(patch))?;
        Ok(SessionToken::new(self.peer_id, seq))
    }

    fn broadcast(&mut self, msg: &Message) -> Result<(), EngineError> {
        let frame = make_frame(self.config.socket_string_mode, msg)?;
        let mut sent = 0;
        for (id, state) in &self.peers {
            let Some(socket) = &state.socket else { continue };
            match socket.send(&frame) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(peer = id.get(), error = %e, "broadcast send failed"),
            }
        }
        self.metrics.messages_out += sent;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Decode one transport frame and run it through the pipeline. Frames of
    /// an unknown message type are logged and dropped.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<(), EngineError> {
        match frame.into_message() {
            Ok(msg) => self.handle_message(msg),
            Err(CoreError::UnknownMessageType(kind)) => {
                tracing::warn!(kind, "dropping message of unknown type");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Dispatch one inbound message by type.
    pub fn handle_message(&mut self, msg: Message) -> Result<(), EngineError> {
        self.metrics.messages_in += 1;
        match msg {
            Message::Patch(patch) => {
                if patch.peer == self.peer_id {
                    // Loopback: peer graphs can cycle.
                    return Ok(());
                }
                match self.track_peer(patch.peer, patch.seq, patch.at) {
                    Track::Fresh => self.ingest_patch(patch),
                    Track::Duplicate | Track::UnknownPeer => Ok(()),
                }
            }
            Message::Ping(ping) => {
                if ping.peer == self.peer_id {
                    return Ok(());
                }
                self.track_peer(ping.peer, ping.seq, ping.at);
                Ok(())
            }
            Message::MissingPatch(request) => {
                self.metrics.retransmission_in += 1;
                self.serve_missing(&request)
            }
        }
    }

    /// Steps shared by PATCH and PING: clock merge, liveness, contiguous
    /// prefix and high-water tracking, the one-shot synced event.
    fn track_peer(&mut self, peer: PeerId, seq: u64, at: Hlc) -> Track {
        self.clock.receive(at);
        let now = self.wall.now_ms();
        let Some(state) = self.peers.get_mut(&peer) else {
            tracing::debug!(peer = peer.get(), "message from unknown peer dropped");
            return Track::UnknownPeer;
        };
        state.stats.last_message_ms = now;
        if seq <= state.stats.contiguous_sequence_id {
            return Track::Duplicate;
        }
        state.stats.observe(seq, at);
        if seq == state.stats.contiguous_sequence_id + 1 {
            state.stats.advance_contiguous(seq, at);
            if state.stats.is_synced() && !state.synced_fired {
                state.synced_fired = true;
                if let Some(hook) = self.on_synced.as_mut() {
                    hook(peer);
                }
            }
        }
        Track::Fresh
    }

    fn ingest_patch(&mut self, patch: Patch) -> Result<(), EngineError> {
        if patch.is_stats() {
            // Persistent ping snapshot: staged, never materialised.
            self.store.save_pending(&patch)?;
            return Ok(());
        }
        if patch.ver != self.db_version {
            self.store.save_pending(&patch)?;
            return Ok(());
        }
        if self.store.table_plan(&patch.tab).is_none() {
            tracing::warn!(
                table = %patch.tab,
                peer = patch.peer.get(),
                "patch for unknown table at matching version dropped"
            );
            return Ok(());
        }
        self.store.save_patch(&patch)?;
        self.schedule_merge(&patch.tab, patch.at);
        Ok(())
    }

    /// Debounce: the first remote patch for a table arms a flush one apply
    /// delay out; every further patch only lowers the merge floor.
    fn schedule_merge(&mut self, table: &str, at: Hlc) {
        let due_ms = self.wall.now_ms() + self.config.patch_apply_delay_ms;
        let merge = self
            .merges
            .entry(table.to_string())
            .or_insert(PendingMerge { from: at, due_ms });
        if at < merge.from {
            merge.from = at;
        }
    }

    pub fn has_pending_merges(&self) -> bool {
        !self.merges.is_empty()
    }

    /// Flush merges whose debounce window elapsed.
    pub fn flush_due_merges(&mut self) -> Result<(), EngineError> {
        let now = self.wall.now_ms();
        let due: Vec<String> = self
            .merges
            .iter()
            .filter(|(_, merge)| merge.due_ms <= now)
            .map(|(table, _)| table.clone())
            .collect();
        for table in due {
            if let Some(merge) = self.merges.remove(&table) {
                self.store.apply_patches(&table, merge.from)?;
            }
        }
        Ok(())
    }

    /// Flush everything regardless of deadlines.
    pub fn flush_all_merges(&mut self) -> Result<(), EngineError> {
        let pending = std::mem::take(&mut self.merges);
        for (table, merge) in pending {
            self.store.apply_patches(&table, merge.from)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    /// One timer tick: hourly retention sweep (with a persistent ping), else
    /// the interval ping; plus the interval missing-patch scan.
    pub fn heartbeat_tick(&mut self) -> Result<(), EngineError> {
        if self.config.heartbeat_interval_ms == 0 {
            return Ok(());
        }
        let now = self.wall.now_ms();
        if now >= self.heartbeat.next_sweep_ms {
            let started = Instant::now();
            let cutoff =
                Hlc::from_parts(now.saturating_sub(self.config.max_patch_retention_ms), 0);
            let deleted = self.store.delete_old_patches(cutoff)?;
            tracing::info!(deleted, "retention sweep");
            self.send_persistent_ping()?;
            self.heartbeat.next_sweep_ms = heartbeat::next_sweep(now);
            self.heartbeat.last_ping_ms = now;
            self.metrics.maintenance_seconds += started.elapsed().as_secs_f64();
        } else if now.saturating_sub(self.heartbeat.last_ping_ms)
            >= self.config.heartbeat_interval_ms
        {
            self.send_ping()?;
            self.heartbeat.last_ping_ms = now;
        }
        if now.saturating_sub(self.heartbeat.last_scan_ms) >= self.config.heartbeat_interval_ms {
            self.detect_and_request_missing()?;
            self.heartbeat.last_scan_ms = now;
        }
        self.flush_due_merges()
    }

    /// Non-persistent ping: advertises the current high-water mark without
    /// allocating a sequence id or touching any store.
    pub fn send_ping(&mut self) -> Result<(), EngineError> {
        let Some(seq) = self.last_sequence_id else {
            return Ok(());
        };
        let ping = Message::Ping(Ping {
            at: self.last_patch_at,
            peer: self.peer_id,
            seq,
            stats: self.stats_map(),
        });
        self.broadcast(&ping)
    }

    /// Persistent ping: a real patch on the reserved table, staged locally
    /// and sequence-numbered, so peers can anchor gap detection after GC.
    pub fn send_persistent_ping(&mut self) -> Result<(), EngineError> {
        let Some(last_seq) = self.last_sequence_id else {
            return Ok(());
        };
        let at = self.clock.create();
        self.metrics.note_drift(self.clock.drift_ms());
        let patch = self.store.save_ping_snapshot(
            at,
            self.peer_id,
            last_seq + 1,
            self.db_version,
            &self.stats_map(),
        )?;
        self.last_sequence_id = Some(patch.seq);
        self.last_patch_at = at;
        self.broadcast(&Message::Patch(patch))
    }

    fn stats_map(&self) -> BTreeMap<PeerId, PeerStats> {
        self.peers
            .iter()
            .map(|(id, state)| (*id, state.stats))
            .collect()
    }

    // ------------------------------------------------------------------
    // Read-your-writes
    // ------------------------------------------------------------------

    /// Has the write behind this token become visible locally? An unknown
    /// peer id is treated as consistent (best effort).
    pub fn is_consistent(&self, peer: PeerId, seq: u64) -> bool {
        self.peers
            .get(&peer)
            .map(|state| state.stats.contiguous_sequence_id >= seq)
            .unwrap_or(true)
    }

    /// Token-string form used by middleware: malformed tokens count as "no
    /// token" and let the read through.
    pub fn is_consistent_token(&self, token: &str) -> bool {
        match token.parse::<SessionToken>() {
            Ok(token) => self.is_consistent(token.peer, token.seq),
            Err(_) => true,
        }
    }

    /// Record a read-your-writes poll that ran out its deadline.
    pub fn note_read_your_write_timeout(&mut self) {
        self.metrics.read_your_write_timeouts += 1;
    }

    /// Poll until the write behind `token` is visible, under the standard
    /// backoff schedule truncated to `deadline_ms`. Between probes the
    /// embedding's `pump` is handed the delay to wait out while feeding
    /// inbound traffic. An exhausted deadline is counted and surfaced.
    pub fn wait_for_consistency<F>(
        &mut self,
        token: &SessionToken,
        deadline_ms: u64,
        mut pump: F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(&mut Self, u64) -> Result<(), EngineError>,
    {
        let backoff = Backoff::new(quiltdb_core::session::DEFAULT_BACKOFF_BASE_MS, deadline_ms);
        for delay in backoff {
            pump(&mut *self, delay)?;
            if self.is_consistent(token.peer, token.seq) {
                return Ok(());
            }
        }
        self.note_read_your_write_timeout();
        Err(EngineError::ConsistencyTimeout)
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    /// Prometheus text exposition of the replication counters.
    pub fn metrics(&self) -> String {
        let connected = self.connected_peers();
        let drift_ms = self.clock.drift_ms() as i128;
        let mut lags = Vec::new();
        for (id, state) in &self.peers {
            if state.stats.last_message_ms == 0 {
                continue;
            }
            let lag_ms = drift_ms + state.stats.last_message_ms as i128
                - state.stats.contiguous_patch_at.to_unix_ms() as i128;
            lags.push((*id, lag_ms.max(0) as f64 / 1000.0));
        }
        self.metrics.render(connected, &lags)
    }
}
