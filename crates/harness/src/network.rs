use std::rc::Rc;

use quiltdb_core::PeerId;
use quiltdb_engine::{EngineError, Replicator, ReplicatorConfig};
use quiltdb_storage::PatchStore;

use crate::peer::{ManualClock, QueueSocket, TestPeer, START_MS};

/// A full mesh of in-process peers sharing one manual clock. Frames queue in
/// per-peer inboxes until the test pumps delivery, which keeps reorder and
/// loss scenarios deterministic.
pub struct TestNetwork {
    pub clock: Rc<ManualClock>,
    peers: Vec<TestPeer>,
    ids: Vec<u64>,
    inboxes: Vec<QueueSocket>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            clock: Rc::new(ManualClock::new(START_MS)),
            peers: Vec::new(),
            ids: Vec::new(),
            inboxes: Vec::new(),
        }
    }

    /// Add a peer on the shared clock. Call `connect_all` once the roster is
    /// complete.
    pub fn add_peer(&mut self, peer_id: u64) -> Result<usize, EngineError> {
        self.add_peer_with(ReplicatorConfig::with_peer_id(peer_id))
    }

    pub fn add_peer_with(&mut self, config: ReplicatorConfig) -> Result<usize, EngineError> {
        let peer_id = config.peer_id.expect("test peers use explicit ids");
        let store = PatchStore::open_in_memory()?;
        let repl = Replicator::with_store(store, config, self.clock.clone());
        let index = self.peers.len();
        self.peers.push(TestPeer {
            repl,
            clock: self.clock.clone(),
        });
        self.ids.push(peer_id);
        self.inboxes.push(QueueSocket::new());
        Ok(index)
    }

    /// Wire every ordered pair: sender `i` gets a socket for peer `j` that
    /// feeds `j`'s inbox.
    pub fn connect_all(&mut self) {
        for i in 0..self.peers.len() {
            for j in 0..self.peers.len() {
                if i == j {
                    continue;
                }
                let socket = self.inboxes[j].clone();
                self.peers[i]
                    .repl
                    .add_remote_peer(PeerId::new(self.ids[j]), Box::new(socket));
            }
        }
    }

    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    pub fn peer_mut(&mut self, index: usize) -> &mut TestPeer {
        &mut self.peers[index]
    }

    pub fn inbox(&self, index: usize) -> &QueueSocket {
        &self.inboxes[index]
    }

    /// Deliver queued frames until quiescent, then let every debounce window
    /// elapse and flush. Returns the number of frames delivered.
    pub fn deliver_all(&mut self) -> Result<usize, EngineError> {
        let mut delivered = 0;
        loop {
            let mut progressed = false;
            for index in 0..self.peers.len() {
                while let Some(frame) = self.inboxes[index].pop() {
                    self.peers[index].repl.handle_frame(frame)?;
                    delivered += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        self.clock.advance(1_000);
        for peer in &mut self.peers {
            peer.repl.flush_due_merges()?;
        }
        Ok(delivered)
    }

    /// Drop everything currently queued for one peer (a lossy link).
    pub fn drop_inbox(&mut self, index: usize) -> usize {
        self.inboxes[index].drain().len()
    }

    /// Reverse the frames queued for one peer, so the next delivery round
    /// sees them newest-first (a reordering link).
    pub fn reorder_inbox(&mut self, index: usize) {
        self.inboxes[index].reverse();
    }
}
