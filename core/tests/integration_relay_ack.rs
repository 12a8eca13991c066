// Integration test: relay messages and ack reconciliation
//
// A message for a device that is not in range travels as relay frames
// through whoever is. The receiver's ack floods back the same way.

mod common;

use common::*;
use rand::RngCore;
use skein_core::transport::LocalMedium;
use skein_core::Message;

#[test]
fn test_relay_through_middle_node() {
    init_tracing();
    let medium = LocalMedium::new();
    let mut nodes = line(&medium, &[("a", 1), ("b", 2), ("c", 3)]);
    let all = managers(&nodes.iter().collect::<Vec<_>>());
    medium.settle(&all);
    assert!(!nodes[0].manager.is_connected(3));
    for node in nodes.iter_mut() {
        node.drain();
    }

    let c_key = nodes[2].manager.identity().public_key_bytes();
    nodes[0].manager.add_device(3, c_key).unwrap();
    let id = nodes[0]
        .manager
        .send_message(Message::builder().receiver(3).field("text", "via b").build())
        .unwrap();
    medium.run_until_idle(&all);

    let c_events = nodes[2].drain();
    let got = received(&c_events);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, id);
    assert_eq!(got[0].sender_id, 1);
    assert_eq!(got[0].text("text"), Some("via b"));
    println!("✓ Relay message delivered through b");

    // b carried the frames but cannot read or deliver them
    assert!(received(&nodes[1].drain()).is_empty());
    assert!(nodes[1].manager.store().blocks.is_complete(id).unwrap());

    assert_eq!(acks(&nodes[0].drain()), vec![id]);
    assert!(nodes[1].manager.store().acks.contains(id).unwrap());
    assert!(!nodes[1].manager.store().acks.is_waited(id).unwrap());
    println!("✓ Ack flooded back to the sender");
}

#[test]
fn test_store_carry_forward() {
    init_tracing();
    let medium = LocalMedium::new();
    let mut nodes = line(&medium, &[("a", 1), ("b", 2)]);
    let mut c = spawn_node(&medium, "c", 3);
    let all = vec![
        nodes[0].manager.clone(),
        nodes[1].manager.clone(),
        c.manager.clone(),
    ];
    medium.settle(&all);

    nodes[0]
        .manager
        .add_device(3, c.manager.identity().public_key_bytes())
        .unwrap();
    let id = nodes[0]
        .manager
        .send_message(Message::builder().receiver(3).field("text", "carried").build())
        .unwrap();
    medium.run_until_idle(&all);
    assert!(nodes[1].manager.store().blocks.is_complete(id).unwrap());
    assert!(received(&c.drain()).is_empty());

    // b walks from a to c
    medium.set_in_range("a", "b", false);
    medium.set_in_range("b", "c", true);
    medium.settle(&all);
    assert!(nodes[1].manager.is_connected(3));

    let c_events = c.drain();
    let got = received(&c_events);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, id);
    // Handed-over blocks leave the carrier
    assert!(nodes[1].manager.store().blocks.is_empty().unwrap());
    assert!(nodes[1].manager.store().acks.contains(id).unwrap());
    println!("✓ b carried the message to c");

    // ...and walks back with the ack
    nodes[0].drain();
    medium.set_in_range("b", "c", false);
    medium.set_in_range("a", "b", true);
    medium.settle(&all);
    assert_eq!(acks(&nodes[0].drain()), vec![id]);
    assert!(!nodes[0].manager.store().acks.contains(id).unwrap());
    println!("✓ Ack carried back to a");
}

#[test]
fn test_duplicate_relay_delivered_once() {
    init_tracing();
    let medium = LocalMedium::new();
    // Two paths from a to d: a-b-d and a-c-d
    let mut nodes: Vec<Node> = [("a", 1), ("b", 2), ("c", 3), ("d", 4)]
        .iter()
        .map(|(addr, id)| spawn_node(&medium, addr, *id))
        .collect();
    for (x, y) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")] {
        medium.set_in_range(x, y, true);
    }
    let all = managers(&nodes.iter().collect::<Vec<_>>());
    medium.settle(&all);
    assert_eq!(medium.link_count(), 4);

    let d_key = nodes[3].manager.identity().public_key_bytes();
    nodes[0].manager.add_device(4, d_key).unwrap();
    nodes[3].drain();
    let id = nodes[0]
        .manager
        .send_message(Message::builder().receiver(4).field("text", "twice?").build())
        .unwrap();
    medium.run_until_idle(&all);

    let d_events = nodes[3].drain();
    assert_eq!(received(&d_events).len(), 1);
    assert_eq!(acks(&nodes[0].drain()), vec![id]);
    println!("✓ Relay deduplicated at the receiver");
}

#[test]
fn test_relay_through_node_with_smaller_payload() {
    init_tracing();
    let medium = LocalMedium::new();
    medium.set_in_range("a", "b", true);
    medium.set_in_range("b", "c", true);
    let mut nodes = vec![
        spawn_node_with_payload(&medium, "a", 1, 495),
        spawn_node_with_payload(&medium, "b", 2, 200),
        spawn_node_with_payload(&medium, "c", 3, 495),
    ];
    let all = managers(&nodes.iter().collect::<Vec<_>>());
    medium.settle(&all);
    assert_eq!(medium.link_count(), 2);
    for node in nodes.iter_mut() {
        node.drain();
    }

    let mut data = vec![0u8; 1500];
    rand::thread_rng().fill_bytes(&mut data);
    let c_key = nodes[2].manager.identity().public_key_bytes();
    nodes[0].manager.add_device(3, c_key).unwrap();
    let id = nodes[0]
        .manager
        .send_message(
            Message::builder()
                .receiver(3)
                .field("text", "big")
                .data(data.clone())
                .build(),
        )
        .unwrap();
    medium.run_until_idle(&all);

    // b forwards a's fragments whole even though it would cut its own smaller
    let c_events = nodes[2].drain();
    let got = received(&c_events);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, id);
    assert_eq!(got[0].data.as_deref(), Some(data.as_slice()));
    assert_eq!(acks(&nodes[0].drain()), vec![id]);
    println!("✓ Relay crossed a node with a smaller payload size");

    let mut flood = vec![0u8; 1000];
    rand::thread_rng().fill_bytes(&mut flood);
    let id = nodes[0]
        .manager
        .send_broadcast(Message::builder().data(flood.clone()).build(), 3)
        .unwrap();
    medium.run_until_idle(&all);

    let c_events = nodes[2].drain();
    let got = broadcasts(&c_events);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, id);
    assert_eq!(got[0].data.as_deref(), Some(flood.as_slice()));
    println!("✓ Broadcast crossed a node with a smaller payload size");
}
