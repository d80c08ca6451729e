use conveyor_codec::{MessageType, Performative};
use conveyor_core::{NodeId, NodeStatus};
use conveyor_node::{NodeEvent, NodeTimings, StallReroutePolicy};
use conveyor_sim::{factory_reference_layout, LayoutSpec, NodeSpec, Simulation};

fn build(nodes: Vec<NodeSpec>, timings: NodeTimings) -> Simulation {
    Simulation::new(&LayoutSpec::new(nodes), timings).expect("layout should build")
}

fn events(sim: &Simulation, id: &str) -> Vec<(u64, NodeEvent)> {
    sim.events_for(id).map(|(at, e)| (at, e.clone())).collect()
}

fn path(ids: &[&str]) -> Vec<NodeId> {
    ids.iter().map(|id| NodeId::from(*id)).collect()
}

fn found_routes(sim: &Simulation, id: &str) -> Vec<Vec<NodeId>> {
    sim.events_for(id)
        .filter_map(|(_, e)| match e {
            NodeEvent::RouteFound { path, .. } => Some(path.clone()),
            _ => None,
        })
        .collect()
}

fn arrivals(sim: &Simulation, id: &str) -> Vec<(u64, u64)> {
    sim.events_for(id)
        .filter_map(|(at, e)| match e {
            NodeEvent::Arrived { total_ms } => Some((at, *total_ms)),
            _ => None,
        })
        .collect()
}

fn line_layout() -> Vec<NodeSpec> {
    vec![
        NodeSpec::new("A", &["B"], 100),
        NodeSpec::new("B", &["C"], 100),
        NodeSpec::new("C", &[], 100),
    ]
}

#[test]
fn pallet_walks_a_line_of_three() {
    let mut sim = build(line_layout(), NodeTimings::default());
    sim.send_transfer(&["A", "B", "C"], 0).expect("transfer should queue");
    sim.run_until(1_000).expect("run should finish");

    let a = events(&sim, "A");
    assert!(a.iter().any(|(at, e)| *at == 0 && matches!(e, NodeEvent::Loaded { .. })));
    assert!(a.iter().any(|(at, e)| *at == 100
        && matches!(e, NodeEvent::Unloading { next, .. } if next == "B")));
    assert!(a.iter().any(|(_, e)| matches!(e, NodeEvent::HandedOff { attempts: 1, .. })));

    let b = events(&sim, "B");
    assert!(b.iter().any(|(at, e)| *at == 100 && matches!(e, NodeEvent::Loaded { .. })));
    assert!(b.iter().any(|(at, e)| *at == 200
        && matches!(e, NodeEvent::Unloading { next, .. } if next == "C")));

    assert_eq!(arrivals(&sim, "C"), vec![(200, 300)]);
    for id in ["A", "B", "C"] {
        assert_eq!(sim.node(id).unwrap().status(), NodeStatus::Idle);
    }

    let inbox = sim.operator_inbox();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].performative, Performative::Agree);

    // Pending reply timeouts expire harmlessly.
    sim.run_until(30_000).expect("run should finish");
    assert!(sim.quiescent());
}

#[test]
fn down_next_hop_without_alternative_leaves_pallet_stranded() {
    let mut nodes = line_layout();
    nodes[1] = NodeSpec::new("B", &["C"], 100).with_state(NodeStatus::Down);
    let mut sim = build(nodes, NodeTimings::default());
    sim.send_transfer(&["A", "B", "C"], 0).expect("transfer should queue");
    sim.run_until(60_000).expect("run should finish");

    let a = events(&sim, "A");
    assert!(a
        .iter()
        .any(|(at, e)| *at == 100 && matches!(e, NodeEvent::NextHopDown { to, .. } if to == "B")));
    assert!(a.iter().any(|(_, e)| matches!(e, NodeEvent::QueryStarted { dest, .. } if dest == "C")));
    assert!(found_routes(&sim, "A").is_empty());
    assert!(events(&sim, "B")
        .iter()
        .any(|(_, e)| matches!(e, NodeEvent::QueryAbsorbed { status: NodeStatus::Down, .. })));

    // No retries after DOWN, and nothing reaches C.
    assert_eq!(sim.received("B", MessageType::TransferPallet), 1);
    assert_eq!(sim.received("C", MessageType::FindPathReq), 0);
    assert!(arrivals(&sim, "C").is_empty());
    assert_eq!(sim.node("A").unwrap().active_loaders(), 0);
    // Without a reply there is no ABORT, so the query stays remembered.
    assert_eq!(sim.node("A").unwrap().tracked_queries(), 1);
    assert_eq!(sim.node("B").unwrap().tracked_queries(), 1);
}

#[test]
fn lost_hand_off_is_retried_after_reply_timeout() {
    let mut sim = build(line_layout(), NodeTimings::default());
    sim.send_transfer(&["A", "B", "C"], 0).expect("transfer should queue");
    sim.run_until(50).expect("run should finish");

    sim.set_outbound_loss("A", true).expect("A exists");
    sim.run_for(10_150).expect("run should finish");
    assert!(events(&sim, "A").iter().any(|(at, e)| *at == 10_100
        && matches!(e, NodeEvent::HandoffTimedOut { to, attempts: 1 } if to == "B")));
    assert_eq!(sim.received("B", MessageType::TransferPallet), 0);
    assert!(arrivals(&sim, "C").is_empty());

    sim.set_outbound_loss("A", false).expect("A exists");
    sim.run_until(15_000).expect("run should finish");
    assert!(events(&sim, "A")
        .iter()
        .any(|(at, e)| *at == 14_100 && matches!(e, NodeEvent::HandedOff { attempts: 2, .. })));
    assert_eq!(sim.received("B", MessageType::TransferPallet), 1);
    assert_eq!(arrivals(&sim, "C"), vec![(14_200, 300)]);
    assert_eq!(sim.undeliverable(), 0);
}

#[test]
fn message_to_unknown_node_is_counted_undeliverable() {
    let mut sim = build(line_layout(), NodeTimings::default());
    sim.inject_bytes("A", "Q", b"{}".to_vec());
    sim.run_until(10).expect("run should finish");

    assert_eq!(sim.undeliverable(), 1);
    assert!(sim.quiescent());
}

fn detour_layout() -> Vec<NodeSpec> {
    vec![
        NodeSpec::new("A", &["B", "X"], 100),
        NodeSpec::new("B", &["C"], 100).with_state(NodeStatus::Down),
        NodeSpec::new("X", &["C"], 100),
        NodeSpec::new("C", &[], 100),
    ]
}

#[test]
fn down_next_hop_reroutes_through_detour() {
    let mut sim = build(detour_layout(), NodeTimings::default());
    sim.send_transfer(&["A", "B", "C"], 0).expect("transfer should queue");
    sim.run_until(1_000).expect("run should finish");

    assert_eq!(found_routes(&sim, "A"), vec![path(&["A", "X", "C"])]);
    assert!(events(&sim, "A").iter().any(|(at, e)| *at == 200
        && matches!(e, NodeEvent::Unloading { next, .. } if next == "X")));
    assert_eq!(arrivals(&sim, "C"), vec![(300, 300)]);

    // DOWN B absorbed the query; C heard it only through X.
    assert_eq!(sim.received("C", MessageType::FindPathReq), 1);

    // ABORT cleared every node, and C ignored its second copy.
    for id in ["A", "B", "X", "C"] {
        assert_eq!(sim.node(id).unwrap().tracked_queries(), 0, "{id} kept query state");
    }
    assert_eq!(sim.received("C", MessageType::FindPathAbort), 2);
    let c_aborts = events(&sim, "C")
        .iter()
        .filter(|(_, e)| matches!(e, NodeEvent::QueryAborted { .. }))
        .count();
    assert_eq!(c_aborts, 1);
}

#[test]
fn hand_off_route_does_not_release_a_newer_pallet() {
    let timings = NodeTimings::builder()
        .stall_reroute(StallReroutePolicy::ReleaseAndReload)
        .build();
    let mut sim = build(detour_layout(), timings).with_latency(10);
    sim.send_transfer(&["A", "B", "C"], 0).expect("transfer should queue");
    sim.run_until(125).expect("run should finish");
    // The second pallet lands just after A starts searching around B.
    sim.send_transfer(&["A", "X", "C"], 0).expect("transfer should queue");
    sim.run_until(10_000).expect("run should finish");

    let a = events(&sim, "A");
    assert!(a
        .iter()
        .any(|(at, e)| *at == 130 && matches!(e, NodeEvent::NextHopDown { to, .. } if to == "B")));
    assert_eq!(found_routes(&sim, "A"), vec![path(&["A", "X", "C"])]);
    assert!(!a.iter().any(|(_, e)| matches!(
        e,
        NodeEvent::PalletReleased { .. } | NodeEvent::HoldAbandoned { .. }
    )));
    // The found route reloads through a loader, which waits out the newer pallet.
    assert!(a.iter().any(|(_, e)| matches!(
        e,
        NodeEvent::HandoffDeferred { reason, .. } if reason == "BUSY"
    )));
    assert_eq!(arrivals(&sim, "C").len(), 2);
    assert_eq!(sim.halted("A"), None);
    assert_eq!(sim.undeliverable(), 0);
}

#[test]
fn query_in_cycle_to_unreachable_destination_terminates() {
    let nodes = vec![
        NodeSpec::new("A", &["B"], 100),
        NodeSpec::new("B", &["C"], 100),
        NodeSpec::new("C", &["A"], 100),
    ];
    let mut sim = build(nodes, NodeTimings::default()).with_max_steps(1_000);
    sim.start_query("A", "Z").expect("query should start");
    sim.run_until(100).expect("flood should settle");

    assert!(sim.quiescent());
    assert!(found_routes(&sim, "A").is_empty());
    assert_eq!(sim.received("A", MessageType::FindPathReq), 2);
    assert_eq!(sim.received("B", MessageType::FindPathReq), 1);
    assert_eq!(sim.received("C", MessageType::FindPathReq), 1);
    assert!(events(&sim, "A")
        .iter()
        .any(|(_, e)| matches!(e, NodeEvent::QueryDropped { cost: 3, best_cost: 0, .. })));
    for id in ["A", "B", "C"] {
        assert_eq!(sim.node(id).unwrap().tracked_queries(), 1);
    }
}

fn stall_layout() -> Vec<NodeSpec> {
    vec![
        NodeSpec::new("A", &["B", "X"], 20_000),
        NodeSpec::new("B", &["D"], 100),
        NodeSpec::new("X", &["D"], 100),
        NodeSpec::new("D", &[], 100),
    ]
}

#[test]
fn stalled_node_self_request_is_refused_while_busy() {
    let mut sim = build(stall_layout(), NodeTimings::default());
    sim.send_transfer(&["A", "B", "D"], 0).expect("transfer should queue");
    sim.run_until(9_500).expect("run should finish");

    let a = events(&sim, "A");
    assert!(a.iter().any(|(at, e)| *at == 9_000
        && matches!(e, NodeEvent::StallDetected { destination, .. } if destination == "D")));
    assert_eq!(found_routes(&sim, "A"), vec![path(&["A", "B", "D"])]);
    assert!(a
        .iter()
        .any(|(_, e)| matches!(e, NodeEvent::RerouteRefused { reason, .. } if reason == "BUSY")));
    assert_eq!(sim.node("A").unwrap().status(), NodeStatus::Busy);

    // The stuck hold still completes and delivers.
    sim.run_until(21_000).expect("run should finish");
    assert_eq!(arrivals(&sim, "D"), vec![(20_100, 20_200)]);
}

#[test]
fn stalled_node_can_release_and_reload() {
    let timings = NodeTimings::builder()
        .stall_reroute(StallReroutePolicy::ReleaseAndReload)
        .build();
    let mut sim = build(stall_layout(), timings);
    sim.send_transfer(&["A", "B", "D"], 0).expect("transfer should queue");
    sim.run_until(9_500).expect("run should finish");

    let a = events(&sim, "A");
    assert!(a.iter().any(|(_, e)| matches!(e, NodeEvent::PalletReleased { .. })));
    let loads = a
        .iter()
        .filter(|(_, e)| matches!(e, NodeEvent::Loaded { .. }))
        .count();
    assert_eq!(loads, 2);
    let pallet = sim.node("A").unwrap().pallet().expect("reloaded pallet");
    assert_eq!(pallet.busy_since_ms, 9_000);
    assert_eq!(pallet.elapsed_ms, 0);

    // The first hold completes without a second hand-off.
    sim.run_until(21_000).expect("run should finish");
    assert!(events(&sim, "A")
        .iter()
        .any(|(at, e)| *at == 20_000 && matches!(e, NodeEvent::HoldAbandoned { .. })));
    assert_eq!(sim.received("B", MessageType::TransferPallet), 0);
}

#[test]
fn down_while_busy_refuses_new_work_and_still_hands_off() {
    let nodes = vec![
        NodeSpec::new("A", &["B"], 1_000),
        NodeSpec::new("B", &[], 100),
    ];
    let mut sim = build(nodes, NodeTimings::default());
    sim.send_transfer(&["A", "B"], 0).expect("transfer should queue");
    sim.run_until(10).expect("run should finish");
    sim.set_state("A", NodeStatus::Down).expect("state change should queue");
    sim.run_until(20).expect("run should finish");
    sim.send_transfer(&["A", "B"], 0).expect("transfer should queue");
    sim.run_until(2_000).expect("run should finish");

    let inbox = sim.operator_inbox();
    assert_eq!(inbox.len(), 2);
    assert_eq!(inbox[1].performative, Performative::Refuse);
    assert_eq!(
        inbox[1].reply_body().unwrap().reason.as_deref(),
        Some("DOWN")
    );
    assert_eq!(arrivals(&sim, "B"), vec![(1_000, 1_100)]);
    let a = sim.node("A").unwrap();
    assert_eq!(a.status(), NodeStatus::Down);
    assert!(a.pallet().is_none());
}

#[test]
fn acceptance_yields_exactly_one_agree() {
    let mut sim = build(line_layout(), NodeTimings::default());
    sim.send_transfer(&["A", "B"], 0).expect("transfer should queue");
    sim.run_until(50).expect("run should finish");
    let inbox = sim.operator_inbox();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].performative, Performative::Agree);
}

#[test]
fn refusal_reason_matches_state() {
    let mut sim = build(line_layout(), NodeTimings::default());
    sim.send_transfer(&["A", "B"], 0).expect("transfer should queue");
    sim.send_transfer(&["A", "B"], 0).expect("transfer should queue");
    sim.set_state("B", NodeStatus::Down).expect("state change should queue");
    sim.send_transfer(&["B", "C"], 0).expect("transfer should queue");
    sim.send_transfer(&["C", "A"], 0).expect("transfer should queue");
    sim.run_until(50).expect("run should finish");

    let reasons: Vec<Option<String>> = sim
        .operator_inbox()
        .iter()
        .map(|e| e.reply_body().unwrap().reason)
        .collect();
    assert_eq!(
        reasons,
        vec![
            None,
            Some("BUSY".to_string()),
            Some("DOWN".to_string()),
            Some("bad next hop".to_string()),
        ]
    );
}

#[test]
fn hold_lasts_transfer_ms_under_latency() {
    let nodes = vec![
        NodeSpec::new("A", &["B"], 250),
        NodeSpec::new("B", &[], 10),
    ];
    let mut sim = build(nodes, NodeTimings::default()).with_latency(5);
    sim.send_transfer(&["A", "B"], 0).expect("transfer should queue");
    sim.run_until(1_000).expect("run should finish");

    let a = events(&sim, "A");
    let loaded = a
        .iter()
        .find(|(_, e)| matches!(e, NodeEvent::Loaded { .. }))
        .map(|(at, _)| *at)
        .expect("A should load");
    let unloaded = a
        .iter()
        .find(|(_, e)| matches!(e, NodeEvent::Unloading { .. }))
        .map(|(at, _)| *at)
        .expect("A should unload");
    assert_eq!(loaded, 5);
    assert_eq!(unloaded - loaded, 250);
    assert_eq!(arrivals(&sim, "B"), vec![(260, 260)]);
}

#[test]
fn factory_query_finds_the_shortest_route() {
    let mut sim = Simulation::new(&factory_reference_layout(), NodeTimings::default())
        .expect("factory layout should build");
    sim.start_query("CNV1", "CNV12").expect("query should start");
    sim.run_until(10).expect("run should finish");

    assert_eq!(
        found_routes(&sim, "CNV1"),
        vec![path(&["CNV1", "CNV2", "CNV3", "CNV13", "CNV14", "CNV12"])]
    );
}

#[test]
fn factory_flood_respects_per_node_bound() {
    let layout = factory_reference_layout();
    let mut sim = Simulation::new(&layout, NodeTimings::default()).expect("layout should build");
    sim.start_query("CNV1", "NOWHERE").expect("query should start");
    sim.run_until(10).expect("run should finish");
    assert!(sim.quiescent());

    for node in &layout.nodes {
        let in_degree = layout
            .nodes
            .iter()
            .filter(|n| n.neighbours.contains(&node.id))
            .count();
        let received = sim.received(&node.id, MessageType::FindPathReq);
        assert!(
            received <= 1 + in_degree,
            "{} received {received} requests with in-degree {in_degree}",
            node.id
        );
    }
}

#[test]
fn factory_detour_around_down_conveyor() {
    let mut layout = factory_reference_layout();
    layout.nodes[3].initial_state = NodeStatus::Down;
    let mut sim = Simulation::new(&layout, NodeTimings::default()).expect("layout should build");
    sim.send_transfer(&["CNV3", "CNV4", "CNV5", "CNV6", "CNV7", "CNV8", "CNV9"], 0)
        .expect("transfer should queue");
    sim.run_until(20_000).expect("run should finish");

    assert_eq!(
        found_routes(&sim, "CNV3"),
        vec![path(&["CNV3", "CNV13", "CNV9"])]
    );
    // CNV3 holds twice (2000 each), CNV13 holds 5000, CNV9 adds 2000.
    assert_eq!(arrivals(&sim, "CNV9"), vec![(9_000, 9_000)]);
    for node in &layout.nodes {
        assert_eq!(
            sim.node(&node.id).unwrap().tracked_queries(),
            0,
            "{} kept query state",
            node.id
        );
    }
}

#[test]
fn malformed_traffic_is_dropped() {
    let mut sim = build(line_layout(), NodeTimings::default());
    sim.inject_bytes("B", "A", b"{\"performative\":\"REQUEST\"".to_vec());
    sim.run_until(10).expect("run should finish");
    assert!(events(&sim, "A")
        .iter()
        .any(|(_, e)| matches!(e, NodeEvent::MalformedDropped { .. })));
    assert_eq!(sim.stats("A").unwrap().malformed_messages, 1);
    assert_eq!(sim.node("A").unwrap().status(), NodeStatus::Idle);
    assert!(sim.quiescent());
}
