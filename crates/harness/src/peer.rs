use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use quiltdb_core::{PeerId, WallClock, HLC_EPOCH_MS};
use quiltdb_engine::{EngineError, Frame, PeerSocket, Replicator, ReplicatorConfig, TransportError};
use quiltdb_storage::{Migration, PatchStore};

/// A comfortable start time well past the HLC epoch.
pub const START_MS: u64 = HLC_EPOCH_MS + 1_000_000;

/// A wall clock the test drives by hand.
pub struct ManualClock(Cell<u64>);

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self(Cell::new(now_ms))
    }

    pub fn set(&self, now_ms: u64) {
        self.0.set(now_ms);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.0.set(self.0.get() + delta_ms);
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl WallClock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

/// A socket that queues frames for inspection or later delivery.
#[derive(Clone, Default)]
pub struct QueueSocket {
    queue: Rc<RefCell<VecDeque<Frame>>>,
}

impl QueueSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    pub fn pop(&self) -> Option<Frame> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn drain(&self) -> Vec<Frame> {
        self.queue.borrow_mut().drain(..).collect()
    }

    /// Reverse the queued frames in place. A deterministic permutation for
    /// out-of-order delivery tests.
    pub fn reverse(&self) {
        self.queue.borrow_mut().make_contiguous().reverse();
    }
}

impl PeerSocket for QueueSocket {
    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.queue.borrow_mut().push_back(frame.clone());
        Ok(())
    }
}

/// The canonical replicated table used across the test suites.
pub fn basic_migrations() -> Vec<Migration> {
    vec![Migration {
        up: "
            CREATE TABLE testA (id INTEGER PRIMARY KEY, tenantId INTEGER, name TEXT, deletedAt INTEGER, createdAt INTEGER);
            CREATE TABLE testA_patches (
                _patchedAt INTEGER NOT NULL, _sequenceId INTEGER NOT NULL, _peerId INTEGER NOT NULL,
                id INTEGER, tenantId INTEGER, name TEXT, deletedAt INTEGER, createdAt INTEGER);
            CREATE INDEX idx_testA_patches_at ON testA_patches (_patchedAt);
        "
        .into(),
        down: "DROP TABLE testA_patches; DROP TABLE testA;".into(),
    }]
}

/// A second schema version adding a sibling table.
pub fn extended_migrations() -> Vec<Migration> {
    let mut list = basic_migrations();
    list.push(Migration {
        up: "
            CREATE TABLE testB (id INTEGER PRIMARY KEY, v TEXT);
            CREATE TABLE testB_patches (
                _patchedAt INTEGER NOT NULL, _sequenceId INTEGER NOT NULL, _peerId INTEGER NOT NULL,
                id INTEGER, v TEXT);
            CREATE INDEX idx_testB_patches_at ON testB_patches (_patchedAt);
        "
        .into(),
        down: "DROP TABLE testB_patches; DROP TABLE testB;".into(),
    });
    list
}

/// A replicator over an in-memory (or file-backed) database with a manual
/// clock, plus helpers for wiring recording sockets.
pub struct TestPeer {
    pub repl: Replicator,
    pub clock: Rc<ManualClock>,
}

impl TestPeer {
    pub fn new(peer_id: u64) -> Result<Self, EngineError> {
        Self::with_config(ReplicatorConfig::with_peer_id(peer_id))
    }

    pub fn with_config(config: ReplicatorConfig) -> Result<Self, EngineError> {
        let clock = Rc::new(ManualClock::new(START_MS));
        let store = PatchStore::open_in_memory()?;
        let repl = Replicator::with_store(store, config, clock.clone());
        Ok(Self { repl, clock })
    }

    pub fn at_path(peer_id: u64, path: &str) -> Result<Self, EngineError> {
        let clock = Rc::new(ManualClock::new(START_MS));
        let store = PatchStore::open(path)?;
        let repl =
            Replicator::with_store(store, ReplicatorConfig::with_peer_id(peer_id), clock.clone());
        Ok(Self { repl, clock })
    }

    pub fn migrate_basic(&mut self) -> Result<(), EngineError> {
        self.repl.migrate(&basic_migrations())?;
        Ok(())
    }

    /// Register a recording socket for `peer` and hand its queue back.
    pub fn attach_outbox(&mut self, peer: u64) -> QueueSocket {
        let socket = QueueSocket::new();
        self.repl
            .add_remote_peer(PeerId::new(peer), Box::new(socket.clone()));
        socket
    }
}
