//! Multi-peer scenarios over the in-process transport.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use flowcraft_core::model::JsonMap;
use flowcraft_core::transport::Transport;
use flowcraft_core::{
    Awareness, CollabConfig, CollaborationSession, ConnectionStatus, ContainerKey, CrdtDocument,
    DiagramEdge, DiagramNode, DiagramState, DiagramStores, JoinRequest, MemoryNetwork, RoomId,
    SyncEngine, TransportOptions, UpdateOrigin,
};
use kurbo::Point;
use proptest::prelude::*;
use serde_json::json;

const ROOM: &str = "c0ffee00c0ffee00c0ffee00c0ffee00";

fn node(id: &str, x: f64, y: f64) -> DiagramNode {
    DiagramNode::new(id, "shapeNode", Point::new(x, y)).with_data("label", json!(id))
}

fn join(network: &MemoryNetwork, stores: DiagramStores, name: &str) -> CollaborationSession {
    let mut session =
        CollaborationSession::new(CollabConfig::default(), stores, network.clone()).unwrap();
    session
        .join_room(JoinRequest::new(RoomId::parse(ROOM).unwrap(), name))
        .unwrap();
    session
}

/// Node contents keyed by id, ignoring order.
fn node_set(stores: &DiagramStores) -> BTreeMap<String, (Point, JsonMap)> {
    stores.diagram.with(|state| {
        state
            .nodes
            .iter()
            .map(|n| (n.id.clone(), (n.position, n.data.clone())))
            .collect()
    })
}

#[test]
fn test_late_joiner_receives_seeded_diagram() {
    let network = MemoryNetwork::new();
    let a_stores = DiagramStores::new(DiagramState::new(
        vec![node("n1", 0.0, 0.0), node("n2", 200.0, 0.0)],
        vec![DiagramEdge::new("e1", "n1", "n2")],
    ));
    let b_stores = DiagramStores::default();
    let _a = join(&network, a_stores.clone(), "Ada");
    let b = join(&network, b_stores.clone(), "Bob");

    assert_eq!(b.status(), ConnectionStatus::Connected);
    assert_eq!(node_set(&a_stores), node_set(&b_stores));
    assert_eq!(b_stores.diagram.with(|s| s.edges.len()), 1);
    assert_eq!(b.document().unwrap().len(ContainerKey::Nodes), 2);
}

#[test]
fn test_drag_reaches_peer_after_flush_interval() {
    let network = MemoryNetwork::new();
    let a_stores = DiagramStores::new(DiagramState::new(vec![node("n1", 0.0, 0.0)], vec![]));
    let b_stores = DiagramStores::default();
    let mut a = join(&network, a_stores.clone(), "Ada");
    let _b = join(&network, b_stores.clone(), "Bob");
    assert_eq!(
        b_stores.diagram.with(|s| s.node("n1").unwrap().position),
        Point::ZERO
    );

    for step in 1..=10 {
        let p = Point::new(step as f64 * 10.0, step as f64 * 4.0);
        a_stores.diagram.update(|s| s.move_node("n1", p));
    }
    network.flush();
    assert_eq!(
        b_stores.diagram.with(|s| s.node("n1").unwrap().position),
        Point::ZERO
    );

    let deadline = a.next_deadline().unwrap();
    a.poll(deadline);
    assert_eq!(
        b_stores.diagram.with(|s| s.node("n1").unwrap().position),
        Point::new(100.0, 40.0)
    );
}

#[test]
fn test_remote_changes_do_not_echo() {
    let network = MemoryNetwork::new();
    let a_stores = DiagramStores::default();
    let b_stores = DiagramStores::default();
    let _a = join(&network, a_stores.clone(), "Ada");
    let b = join(&network, b_stores.clone(), "Bob");

    let writes = Rc::new(Cell::new(0));
    let counter = writes.clone();
    let _sub = b_stores
        .diagram
        .subscribe(move |_| counter.set(counter.get() + 1));
    let before = b.document().unwrap().transaction_count();

    for i in 0..3 {
        a_stores
            .diagram
            .update(|s| s.upsert_node(node(&format!("n{i}"), 0.0, 0.0)));
        network.flush();
    }

    assert_eq!(writes.get(), 3);
    assert_eq!(b.document().unwrap().transaction_count(), before);
    assert_eq!(b_stores.diagram.with(|s| s.nodes.len()), 3);
    assert!(!b.is_applying_remote_update());
}

#[test]
fn test_leave_flushes_pending_drag() {
    let network = MemoryNetwork::new();
    let a_stores = DiagramStores::new(DiagramState::new(vec![node("n1", 0.0, 0.0)], vec![]));
    let b_stores = DiagramStores::default();
    let mut a = join(&network, a_stores.clone(), "Ada");
    let _b = join(&network, b_stores.clone(), "Bob");

    a_stores
        .diagram
        .update(|s| s.move_node("n1", Point::new(33.0, 44.0)));
    a.leave_room();
    a.leave_room();

    assert_eq!(a.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        b_stores.diagram.with(|s| s.node("n1").unwrap().position),
        Point::new(33.0, 44.0)
    );
    // Edits after leaving stay local.
    a_stores.diagram.update(|s| s.upsert_node(node("n9", 0.0, 0.0)));
    network.flush();
    assert!(b_stores.diagram.with(|s| s.node("n9").is_none()));
}

#[test]
fn test_presence_and_departure() {
    let network = MemoryNetwork::new();
    let mut a = join(&network, DiagramStores::default(), "Ada");
    let mut b = join(&network, DiagramStores::default(), "Bob");
    a.poll(Instant::now());

    let peers = a.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "Bob");
    assert!(a.take_events().iter().any(|e| matches!(
        e,
        flowcraft_core::CollabEvent::PeerJoined { name, .. } if name == "Bob"
    )));

    b.broadcast_selection(vec!["n1".into()], vec![]);
    network.flush();
    assert_eq!(a.peers()[0].selected_node_ids, vec!["n1".to_string()]);

    b.leave_room();
    assert!(a.peers().is_empty());
    assert!(a.take_events().iter().any(|e| matches!(
        e,
        flowcraft_core::CollabEvent::PeerLeft { name, .. } if name == "Bob"
    )));
}

#[test]
fn test_cursor_updates_coalesce() {
    let network = MemoryNetwork::new();
    let options = TransportOptions {
        signaling_endpoints: Vec::new(),
        password: None,
        max_peers: 20,
    };
    let interval = Duration::from_millis(50);
    let a_doc = CrdtDocument::new();
    let b_doc = CrdtDocument::new();
    let a = Awareness::new(a_doc.peer_id(), interval);
    let b = Awareness::new(b_doc.peer_id(), interval);
    a.set_local_display_name("Ada");
    let _ha = network.connect("t", &a_doc, &a, &options).unwrap();
    let _hb = network.connect("t", &b_doc, &b, &options).unwrap();
    network.flush();

    let received = Rc::new(Cell::new(0));
    let counter = received.clone();
    let a_id = a.local_peer_id();
    let _sub = b.on_change(move |change| {
        if change.updated.contains(&a_id) {
            counter.set(counter.get() + 1);
        }
    });

    let t0 = Instant::now();
    a.broadcast_cursor(Point::new(1.0, 1.0), t0);
    a.broadcast_cursor(Point::new(5.0, 8.0), t0 + Duration::from_millis(10));
    assert!(!a.poll(t0 + Duration::from_millis(10)));
    network.flush();
    assert_eq!(received.get(), 0);

    assert!(a.poll(t0 + interval));
    network.flush();
    assert_eq!(received.get(), 1);
    assert_eq!(b.get(a_id).unwrap().cursor, Some(Point::new(5.0, 8.0)));
}

#[test]
fn test_seed_once() {
    let config = CollabConfig::default();
    let seeded = DiagramStores::new(DiagramState::new(
        vec![node("n1", 0.0, 0.0), node("n2", 10.0, 0.0)],
        vec![DiagramEdge::new("e1", "n1", "n2")],
    ));
    let first = SyncEngine::from_config(CrdtDocument::new(), &config);
    assert!(first.seed(&seeded).unwrap());
    assert_eq!(first.document().len(ContainerKey::Nodes), 2);
    assert_eq!(first.document().len(ContainerKey::Edges), 1);

    // A peer that already received the room's content keeps it.
    let doc = CrdtDocument::new();
    let bytes = first.document().export_snapshot().unwrap();
    doc.apply_update(&bytes, UpdateOrigin::Remote).unwrap();
    let second = SyncEngine::from_config(doc, &config);
    let other = DiagramStores::new(DiagramState::new(vec![node("x", 0.0, 0.0)], vec![]));
    assert!(!second.seed(&other).unwrap());
    assert_eq!(second.document().len(ContainerKey::Nodes), 2);
    assert!(
        second
            .document()
            .entities(ContainerKey::Nodes)
            .iter()
            .all(|(id, _)| id != "x")
    );
}

#[test]
fn test_joining_keeps_room_content() {
    let network = MemoryNetwork::new();
    let a_stores = DiagramStores::new(DiagramState::new(
        vec![node("n1", 0.0, 0.0).with_data("label", json!("A"))],
        vec![],
    ));
    a_stores.swimlanes.update(|s| s.enabled = true);
    let a = join(&network, a_stores.clone(), "Ada");

    let mut local = vec![node("n1", 50.0, 50.0)];
    local.extend((0..20).map(|i| node(&format!("b{i}"), i as f64, 0.0)));
    let b_stores = DiagramStores::new(DiagramState::new(local, vec![]));
    let b = join(&network, b_stores.clone(), "Bob");
    network.flush();

    assert_eq!(b.status(), ConnectionStatus::Connected);
    assert!(a_stores.swimlanes.snapshot().enabled);
    assert!(b_stores.swimlanes.snapshot().enabled);
    assert_eq!(a.document().unwrap().len(ContainerKey::Nodes), 1);
    assert_eq!(a_stores.diagram.with(|s| s.nodes.len()), 1);
    assert_eq!(node_set(&a_stores), node_set(&b_stores));
    assert_eq!(
        b_stores
            .diagram
            .with(|s| s.node("n1").unwrap().data.get("label").cloned()),
        Some(json!("A"))
    );

    // Once attached, the joiner's edits flow as usual.
    b_stores.diagram.update(|s| s.upsert_node(node("b-late", 0.0, 0.0)));
    network.flush();
    assert!(a_stores.diagram.with(|s| s.node("b-late").is_some()));
}

#[test]
fn test_node_and_edge_removal_is_one_transaction() {
    let network = MemoryNetwork::new();
    let a_stores = DiagramStores::new(DiagramState::new(
        vec![node("n1", 0.0, 0.0), node("n2", 10.0, 0.0)],
        vec![DiagramEdge::new("e1", "n1", "n2")],
    ));
    let b_stores = DiagramStores::default();
    let a = join(&network, a_stores.clone(), "Ada");
    let _b = join(&network, b_stores.clone(), "Bob");

    let before = a.document().unwrap().transaction_count();
    a_stores.diagram.update(|s| {
        s.remove_node("n1");
        s.remove_edge("e1");
    });
    assert_eq!(a.document().unwrap().transaction_count(), before + 1);

    network.flush();
    assert_eq!(b_stores.diagram.with(|s| (s.nodes.len(), s.edges.len())), (1, 0));
}

#[test]
fn test_settings_recover_after_malformed_field() {
    let network = MemoryNetwork::new();
    let a_stores = DiagramStores::default();
    let b_stores = DiagramStores::default();
    let a = join(&network, a_stores.clone(), "Ada");
    let _b = join(&network, b_stores.clone(), "Bob");

    let doc = a.document().unwrap();
    doc.transact(UpdateOrigin::Local, |txn| {
        txn.map(ContainerKey::Styles).insert("dark_mode", "not a bool")?;
        Ok(())
    })
    .unwrap();
    network.flush();
    a_stores.styles.update(|s| s.active_style = "ocean".into());
    network.flush();

    let styles = b_stores.styles.snapshot();
    assert_eq!(styles.active_style, "ocean");
    assert!(!styles.dark_mode);
}

// --- Rapid local/remote toggling ---

#[derive(Debug, Clone)]
enum Op {
    Add { peer: bool },
    Move { peer: bool, slot: usize, x: i32, y: i32 },
    Label { peer: bool, slot: usize, label: u8 },
    Remove { peer: bool, slot: usize },
    Sync { forward: bool },
    Flush { peer: bool },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<bool>().prop_map(|peer| Op::Add { peer }),
        (any::<bool>(), 0..8usize, -50..50i32, -50..50i32)
            .prop_map(|(peer, slot, x, y)| Op::Move { peer, slot, x, y }),
        (any::<bool>(), 0..8usize, any::<u8>())
            .prop_map(|(peer, slot, label)| Op::Label { peer, slot, label }),
        (any::<bool>(), 0..8usize).prop_map(|(peer, slot)| Op::Remove { peer, slot }),
        any::<bool>().prop_map(|forward| Op::Sync { forward }),
        any::<bool>().prop_map(|peer| Op::Flush { peer }),
    ]
}

fn sync(from: &SyncEngine, to: &SyncEngine) {
    let bytes = from.document().export_snapshot().unwrap();
    to.document()
        .apply_update(&bytes, UpdateOrigin::Remote)
        .unwrap();
}

fn nth_id(stores: &DiagramStores, slot: usize) -> Option<String> {
    stores.diagram.with(|s| {
        if s.nodes.is_empty() {
            None
        } else {
            Some(s.nodes[slot % s.nodes.len()].id.clone())
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_stores_converge_under_interleaving(ops in prop::collection::vec(op(), 1..40)) {
        let config = CollabConfig::default();
        let stores = [DiagramStores::default(), DiagramStores::default()];
        let engines = [
            SyncEngine::bind(CrdtDocument::new(), &stores[0], &config).unwrap(),
            SyncEngine::bind(CrdtDocument::new(), &stores[1], &config).unwrap(),
        ];
        let mut next_id = 0;

        for op in ops {
            match op {
                Op::Add { peer } => {
                    next_id += 1;
                    let id = format!("{}{}", if peer { "b" } else { "a" }, next_id);
                    stores[peer as usize]
                        .diagram
                        .update(|s| s.upsert_node(node(&id, 0.0, 0.0)));
                }
                Op::Move { peer, slot, x, y } => {
                    let target = &stores[peer as usize];
                    if let Some(id) = nth_id(target, slot) {
                        target
                            .diagram
                            .update(|s| s.move_node(&id, Point::new(x as f64, y as f64)));
                    }
                }
                Op::Label { peer, slot, label } => {
                    let target = &stores[peer as usize];
                    if let Some(id) = nth_id(target, slot) {
                        target.diagram.update(|s| {
                            s.update_node(&id, |n| {
                                n.data.insert("label".into(), json!(label));
                            })
                        });
                    }
                }
                Op::Remove { peer, slot } => {
                    let target = &stores[peer as usize];
                    if let Some(id) = nth_id(target, slot) {
                        target.diagram.update(|s| s.remove_node(&id));
                    }
                }
                Op::Sync { forward } => {
                    let (from, to) = if forward { (0, 1) } else { (1, 0) };
                    sync(&engines[from], &engines[to]);
                }
                Op::Flush { peer } => {
                    engines[peer as usize].flush().unwrap();
                }
            }
        }

        engines[0].flush().unwrap();
        engines[1].flush().unwrap();
        sync(&engines[0], &engines[1]);
        sync(&engines[1], &engines[0]);

        prop_assert_eq!(node_set(&stores[0]), node_set(&stores[1]));
        prop_assert_eq!(engines[0].pending_positions(), 0);
        prop_assert_eq!(
            engines[0].document().len(ContainerKey::Nodes),
            stores[0].diagram.with(|s| s.nodes.len())
        );
    }
}
