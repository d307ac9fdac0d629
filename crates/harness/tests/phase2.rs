//! Merge ordering, gap detection and retransmission.

use quiltdb_core::{Delta, Hlc, Message, MissingPatchRequest, Patch, PeerId, Value};
use quiltdb_engine::ReplicatorConfig;
use quiltdb_harness::TestPeer;

fn row(pairs: &[(&str, Value)]) -> Delta {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

fn patch(peer: u64, seq: u64, at: u64, delta: Delta) -> Message {
    Message::Patch(Patch {
        at: Hlc::from_raw(at),
        peer: PeerId::new(peer),
        seq,
        ver: 1,
        tab: "testA".into(),
        delta,
    })
}

#[test]
fn merge_picks_greatest_triple_per_column() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new(1800)?;
    peer.migrate_basic()?;
    peer.attach_outbox(20);

    // Seven patches over two logical rows, deliberately out of order.
    let patches = vec![
        patch(20, 4, 2500, row(&[("id", Value::Integer(2)), ("tenantId", Value::Integer(7)), ("name", Value::Text("x".into()))])),
        patch(20, 1, 1000, row(&[("id", Value::Integer(1)), ("tenantId", Value::Integer(1)), ("name", Value::Text("a".into()))])),
        patch(20, 6, 4000, row(&[("id", Value::Integer(1)), ("deletedAt", Value::Integer(99))])),
        patch(20, 2, 3000, row(&[("id", Value::Integer(1)), ("name", Value::Text("b".into()))])),
        patch(20, 5, 2500, row(&[("id", Value::Integer(2)), ("name", Value::Text("y".into()))])),
        patch(20, 3, 2000, row(&[("id", Value::Integer(1)), ("tenantId", Value::Integer(2))])),
        patch(20, 7, 5000, row(&[("id", Value::Integer(2)), ("tenantId", Value::Null)])),
    ];
    for msg in patches {
        peer.repl.handle_message(msg)?;
    }
    peer.clock.advance(1_000);
    peer.repl.flush_due_merges()?;

    let conn = peer.repl.store().conn();
    let rows: i64 = conn.query_row("SELECT count(*) FROM testA", [], |r| r.get(0))?;
    assert_eq!(rows, 2);

    // Row 1: name "b" wins at 3000, tenantId 2 wins at 2000, deletedAt set at 4000.
    let (tenant, name, deleted): (i64, String, i64) = conn.query_row(
        "SELECT tenantId, name, deletedAt FROM testA WHERE id = 1",
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    assert_eq!((tenant, name.as_str(), deleted), (2, "b", 99));

    // Row 2: same timestamp resolved by sequence id; the explicit null at
    // 5000 must not erase tenantId.
    let (tenant, name): (i64, String) = conn.query_row(
        "SELECT tenantId, name FROM testA WHERE id = 2",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    assert_eq!((tenant, name.as_str()), (7, "y"));
    Ok(())
}

#[test]
fn gaps_are_listed_and_requested_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new(1800)?;
    peer.migrate_basic()?;
    let outbox2 = peer.attach_outbox(2);
    let outbox10 = peer.attach_outbox(10);
    let outbox5 = peer.attach_outbox(5);

    // Peer 2 holds {2,4,6..9,11..14}: missing 1, 3, 5, 10.
    for seq in [2u64, 4, 6, 7, 8, 9, 11, 12, 13, 14] {
        peer.repl
            .handle_message(patch(2, seq, 1000 + seq, row(&[("id", Value::Integer(1))])))?;
    }
    // Peer 10 holds {1,3}: missing 2.
    for seq in [1u64, 3] {
        peer.repl
            .handle_message(patch(10, seq, 2000 + seq, row(&[("id", Value::Integer(2))])))?;
    }
    // Peer 5 is complete.
    for seq in [1u64, 2] {
        peer.repl
            .handle_message(patch(5, seq, 3000 + seq, row(&[("id", Value::Integer(3))])))?;
    }

    let gaps = peer.repl.get_missing(Hlc::ZERO)?;
    let listed: Vec<(u64, u64, u64)> = gaps
        .iter()
        .map(|gap| (gap.peer.get(), gap.seq, gap.missing))
        .collect();
    assert_eq!(
        listed,
        vec![(2, 0, 1), (2, 2, 1), (2, 4, 1), (2, 9, 1), (10, 1, 1)]
    );

    // One request per gap, addressed to the producer, tagged with us.
    let requests: Vec<(u64, u64, u64)> = outbox2
        .drain()
        .into_iter()
        .map(|frame| match frame.into_message().unwrap() {
            Message::MissingPatch(req) => {
                assert_eq!(req.for_peer.get(), 1800);
                (req.peer.get(), req.min_seq, req.max_seq)
            }
            other => panic!("expected request, got type {}", other.kind()),
        })
        .collect();
    assert_eq!(requests, vec![(2, 1, 1), (2, 3, 3), (2, 5, 5), (2, 10, 10)]);

    let requests10: Vec<(u64, u64)> = outbox10
        .drain()
        .into_iter()
        .map(|frame| match frame.into_message().unwrap() {
            Message::MissingPatch(req) => (req.min_seq, req.max_seq),
            other => panic!("expected request, got type {}", other.kind()),
        })
        .collect();
    assert_eq!(requests10, vec![(2, 2)]);
    assert!(outbox5.is_empty());

    // First gap per peer clamps the safe prefix; the complete peer syncs.
    let stats2 = peer.repl.peer_stats(PeerId::new(2)).unwrap();
    assert_eq!(stats2.contiguous_sequence_id, 0);
    let stats10 = peer.repl.peer_stats(PeerId::new(10)).unwrap();
    assert_eq!(stats10.contiguous_sequence_id, 1);
    let stats5 = peer.repl.peer_stats(PeerId::new(5)).unwrap();
    assert_eq!(stats5.contiguous_sequence_id, 2);
    assert!(stats5.is_synced());
    Ok(())
}

#[test]
fn request_ceiling_defers_surplus_gaps() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ReplicatorConfig::with_peer_id(1800);
    config.max_request_for_missing_patches = 2;
    let mut peer = TestPeer::with_config(config)?;
    peer.migrate_basic()?;
    let outbox = peer.attach_outbox(2);

    for seq in [2u64, 4, 6, 8] {
        peer.repl
            .handle_message(patch(2, seq, 1000 + seq, row(&[("id", Value::Integer(1))])))?;
    }
    let gaps = peer.repl.get_missing(Hlc::ZERO)?;
    assert_eq!(gaps.len(), 4);
    assert_eq!(outbox.len(), 2);
    // The prefix clamp still happened even though requests were capped.
    let stats = peer.repl.peer_stats(PeerId::new(2)).unwrap();
    assert_eq!(stats.contiguous_sequence_id, 0);
    Ok(())
}

#[test]
fn missing_socket_skips_that_producer() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new(1800)?;
    peer.migrate_basic()?;
    peer.attach_outbox(2);
    // Stats exist for peer 7 but its socket is gone.
    peer.attach_outbox(7);
    peer.repl.pause_remote_peer(PeerId::new(7));

    peer.repl
        .handle_message(patch(7, 2, 1002, row(&[("id", Value::Integer(1))])))?;
    let gaps = peer.repl.get_missing(Hlc::ZERO)?;
    assert_eq!(gaps.len(), 1);
    // Nothing was sent anywhere, and the next sweep will retry.
    assert_eq!(peer.repl.peer_stats(PeerId::new(7)).unwrap().contiguous_sequence_id, 0);
    Ok(())
}

#[test]
fn serves_held_patches_from_a_requested_range() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new(1800)?;
    peer.migrate_basic()?;
    peer.attach_outbox(3);
    let requester = peer.attach_outbox(2);

    for seq in [1u64, 3, 5] {
        peer.repl.handle_message(patch(
            3,
            seq,
            1000 + seq,
            row(&[("id", Value::Integer(seq as i64))]),
        ))?;
    }

    // [1..100] replays everything we hold, in order; holes are skipped.
    peer.repl
        .handle_message(Message::MissingPatch(MissingPatchRequest {
            peer: PeerId::new(3),
            min_seq: 1,
            max_seq: 100,
            for_peer: PeerId::new(2),
        }))?;
    let replayed: Vec<u64> = requester
        .drain()
        .into_iter()
        .map(|frame| match frame.into_message().unwrap() {
            Message::Patch(p) => {
                assert_eq!(p.peer.get(), 3);
                assert_eq!(p.tab, "testA");
                p.seq
            }
            other => panic!("expected patch, got type {}", other.kind()),
        })
        .collect();
    assert_eq!(replayed, vec![1, 3, 5]);

    // A narrower range honours its bounds.
    peer.repl
        .handle_message(Message::MissingPatch(MissingPatchRequest {
            peer: PeerId::new(3),
            min_seq: 2,
            max_seq: 100,
            for_peer: PeerId::new(2),
        }))?;
    let replayed: Vec<u64> = requester
        .drain()
        .into_iter()
        .map(|frame| match frame.into_message().unwrap() {
            Message::Patch(p) => p.seq,
            other => panic!("expected patch, got type {}", other.kind()),
        })
        .collect();
    assert_eq!(replayed, vec![3, 5]);

    // Unknown requester: no side effect at all.
    peer.repl
        .handle_message(Message::MissingPatch(MissingPatchRequest {
            peer: PeerId::new(3),
            min_seq: 1,
            max_seq: 100,
            for_peer: PeerId::new(999),
        }))?;
    assert!(requester.is_empty());
    Ok(())
}

#[test]
fn retransmitted_patches_close_the_gap_and_sync() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new(1800)?;
    peer.migrate_basic()?;
    peer.attach_outbox(2);

    peer.repl
        .handle_message(patch(2, 1, 1001, row(&[("id", Value::Integer(1))])))?;
    peer.repl
        .handle_message(patch(2, 3, 1003, row(&[("id", Value::Integer(1))])))?;
    assert!(!peer.repl.peer_stats(PeerId::new(2)).unwrap().is_synced());

    // The missing patch arrives (as a retransmission would deliver it).
    peer.repl
        .handle_message(patch(2, 2, 1002, row(&[("id", Value::Integer(1))])))?;
    peer.repl.detect_and_request_missing()?;
    let stats = peer.repl.peer_stats(PeerId::new(2)).unwrap();
    assert_eq!(stats.contiguous_sequence_id, 3);
    assert!(stats.is_synced());
    Ok(())
}
