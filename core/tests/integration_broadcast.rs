// Integration test: broadcast flooding over a line of nodes
//
//   a ── b ── c ── d
//
// Each hop decrements the TTL; a copy arriving with TTL 0 is kept but not
// forwarded, and a node that missed the flood picks it up on its next link.

mod common;

use common::*;
use rand::RngCore;
use skein_core::transport::LocalMedium;
use skein_core::Message;

fn flood_message() -> Message {
    let mut data = vec![0u8; 1000];
    rand::thread_rng().fill_bytes(&mut data);
    Message::builder().field("text", "flood").data(data).build()
}

#[test]
fn test_broadcast_reaches_ttl_hops() {
    init_tracing();
    let medium = LocalMedium::new();
    let mut nodes = line(&medium, &[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
    let all = managers(&nodes.iter().collect::<Vec<_>>());
    medium.settle(&all);
    assert_eq!(medium.link_count(), 3);
    for node in nodes.iter_mut() {
        node.drain();
    }

    let message = flood_message();
    let data = message.data.clone();
    let id = nodes[0].manager.send_broadcast(message, 3).unwrap();
    // 1000 incompressible bytes need three broadcast frames
    assert_eq!(nodes[0].manager.store().blocks.len().unwrap(), 3);
    medium.run_until_idle(&all);

    let mut remaining = Vec::new();
    for node in nodes.iter_mut().skip(1) {
        let events = node.drain();
        let got = broadcasts(&events);
        assert_eq!(got.len(), 1, "{} should see the broadcast once", node.address);
        assert_eq!(got[0].id, id);
        assert_eq!(got[0].sender_id, 1);
        assert_eq!(got[0].text("text"), Some("flood"));
        assert_eq!(got[0].data, data);
        remaining.push(got[0].ttl);
        assert_eq!(node.manager.store().blocks.len().unwrap(), 3);
    }
    assert_eq!(remaining, vec![2, 1, 0]);
    assert!(broadcasts(&nodes[0].drain()).is_empty());
    println!("✓ Broadcast reached 3 hops with TTL {:?}", remaining);
}

#[test]
fn test_broadcast_stops_at_ttl() {
    init_tracing();
    let medium = LocalMedium::new();
    let mut nodes = line(&medium, &[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
    let all = managers(&nodes.iter().collect::<Vec<_>>());
    medium.settle(&all);
    for node in nodes.iter_mut() {
        node.drain();
    }

    nodes[0]
        .manager
        .send_broadcast(Message::builder().field("text", "short").build(), 2)
        .unwrap();
    medium.run_until_idle(&all);

    assert_eq!(broadcasts(&nodes[1].drain()).len(), 1);
    assert_eq!(broadcasts(&nodes[2].drain()).len(), 1);
    assert!(broadcasts(&nodes[3].drain()).is_empty());
    assert!(nodes[3].manager.store().blocks.is_empty().unwrap());
    println!("✓ TTL 2 broadcast stopped before d");
}

#[test]
fn test_late_joiner_receives_stored_broadcast() {
    init_tracing();
    let medium = LocalMedium::new();
    let mut nodes = line(&medium, &[("a", 1), ("b", 2)]);
    let mut all = managers(&nodes.iter().collect::<Vec<_>>());
    medium.settle(&all);

    let id = nodes[0]
        .manager
        .send_broadcast(Message::builder().field("text", "carried").build(), 3)
        .unwrap();
    medium.run_until_idle(&all);
    assert_eq!(broadcasts(&nodes[1].drain()).len(), 1);

    // e shows up next to b after the flood is over
    let mut late = spawn_node(&medium, "e", 5);
    all.push(late.manager.clone());
    medium.set_in_range("b", "e", true);
    medium.settle(&all);

    let events = late.drain();
    let got = broadcasts(&events);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, id);
    assert_eq!(got[0].ttl, 1);
    println!("✓ Stored broadcast replayed to a new peer");
}
