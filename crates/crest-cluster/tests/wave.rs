//! Direction-solver and start-time tests driven through the agent API.

use std::net::Ipv4Addr;
use std::time::Duration;

use crest_cluster::{
    ClusterAgent, ClusterConfig, ClusterState, Degree, FixedMobility, Output, Timer, WorldContext,
};
use crest_geom::{DensityGrid, Vec3};
use crest_proto::{Message, NodeInfo, Timestamp, TypeTag};

fn addr(id: u64) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, id as u8)
}

fn head_info(id: u64, pos: Vec3, now: Timestamp) -> NodeInfo {
    NodeInfo {
        ts: now,
        id,
        cluster_id: id,
        degree: Degree::Ch,
        is_starting_node: false,
        position: pos,
        address: addr(id),
        ch_address: addr(id),
    }
}

fn promoted_head(id: u64, pos: Vec3, world: &mut WorldContext) -> ClusterAgent {
    let mut agent = ClusterAgent::new(
        ClusterConfig::default(),
        id,
        addr(id),
        Box::new(FixedMobility(pos)),
    )
    .unwrap();
    let now = Timestamp::from_secs_f64(1.0);
    agent.start_clustering(Timestamp::ZERO);
    agent.handle_timer(Timer::ElectionProbe, now, world);
    agent.handle_timer(Timer::Beacon, now, world);
    assert_eq!(agent.info().degree, Degree::Ch);
    agent
}

/// A grid with a single hot cell at the given offset from the head.
fn grid_with_mass_at(dx: f64, dy: f64) -> DensityGrid {
    let size = 16usize;
    let scale = 10.0f32;
    let mut cells = vec![0.0f32; size * size];
    let j = (dx / scale as f64) as i64 + (size / 2) as i64;
    let i = (dy / scale as f64) as i64 + (size / 2) as i64;
    cells[size * i as usize + j as usize] = 2.0;
    DensityGrid::from_cells(cells, size, scale)
}

#[test]
fn solver_selects_only_targets_inside_the_forward_sector() {
    let mut world = WorldContext::new();
    let mut agent = promoted_head(100, Vec3::ZERO, &mut world);
    agent.set_starting_node(true);
    agent.set_base_direction(Vec3::new(10.0, 0.0, 0.0), &mut world);

    let now = Timestamp::from_secs_f64(2.0);
    // Two remote heads: one ahead, one below the sector's lower ray.
    agent.handle_broadcast(
        Message::ClusterInfo { info: head_info(50, Vec3::new(50.0, 5.0, 0.0), now) },
        now,
    );
    agent.handle_broadcast(
        Message::ClusterInfo { info: head_info(60, Vec3::new(50.0, -80.0, 0.0), now) },
        now,
    );

    let stop_at = Timestamp::from_secs_f64(5.0);
    agent.stop_clustering(stop_at, &mut world);

    // Density mass 20 m east of head 50 puts it at world (70, 5); head
    // 60's mass sits on the head itself at (50, -80).
    let ahead = grid_with_mass_at(20.0, 0.0);
    agent.handle_peer_message(
        Message::DistroMap {
            cluster_id: 50,
            info: head_info(50, Vec3::new(50.0, 5.0, 0.0), stop_at),
            cells: ahead.cells().to_vec(),
        },
        stop_at,
    );
    let below = grid_with_mass_at(0.0, 0.0);
    agent.handle_peer_message(
        Message::DistroMap {
            cluster_id: 60,
            info: head_info(60, Vec3::new(50.0, -80.0, 0.0), stop_at),
            cells: below.cells().to_vec(),
        },
        stop_at,
    );

    let decide_at = Timestamp::from_secs_f64(6.0);
    let out = agent.handle_timer(Timer::Decide, decide_at, &mut world);
    assert_eq!(agent.state(), ClusterState::PropagationReady);

    // Only the in-sector cluster gets a handoff slot.
    assert!(out
        .iter()
        .any(|o| matches!(o, Output::SetTimer { timer: Timer::PropagationRetry(50), .. })));
    assert!(!out
        .iter()
        .any(|o| matches!(o, Output::SetTimer { timer: Timer::PropagationRetry(60), .. })));
    // The agent is the starting node, so its own wave is scheduled.
    assert!(out
        .iter()
        .any(|o| matches!(o, Output::SetTimer { timer: Timer::PropagationStart, .. })));

    // The slot fire carries the actual handoff frame.
    let out = agent.handle_timer(Timer::PropagationRetry(50), decide_at, &mut world);
    let frame = out
        .iter()
        .find_map(|o| match o {
            Output::SendTo { cluster: 50, message } => Some(message.clone()),
            _ => None,
        })
        .expect("handoff frame for cluster 50");

    let Message::InterClusterPropagation { starting_time, source, destination, direction, .. } =
        frame
    else {
        panic!("unexpected frame type");
    };
    assert_eq!(starting_time, decide_at + Duration::from_secs(5));
    assert_eq!(source, Vec3::ZERO);
    assert_eq!(destination, Vec3::new(70.0, 5.0, 0.0));

    // Outgoing speed matches the incoming 10 m/s, aimed at the mass.
    assert!((direction.horizontal_length() - 10.0).abs() < 1e-9);
    let unit = Vec3::new(70.0, 5.0, 0.0);
    let unit_len = unit.horizontal_length();
    assert!((direction.x - 10.0 * unit.x / unit_len).abs() < 1e-9);
    assert!((direction.y - 10.0 * unit.y / unit_len).abs() < 1e-9);

    // The local wave leaves with the same vector.
    assert_eq!(agent.propagation_direction(), direction);
}

#[test]
fn earlier_inter_cluster_start_is_adopted_and_equal_one_ignored() {
    let mut world = WorldContext::new();
    let mut agent = promoted_head(9, Vec3::ZERO, &mut world);

    let now = Timestamp::from_secs_f64(2.0);
    let mut member = head_info(3, Vec3::new(10.0, 0.0, 0.0), now);
    member.degree = Degree::Cm;
    member.cluster_id = 9;
    member.ch_address = addr(9);
    agent.handle_broadcast(Message::ClusterInfo { info: member }, now);
    assert!(agent.members().contains(3));

    let frame = |start_secs: f64| Message::InterClusterPropagation {
        cluster_id: 50,
        starting_time: Timestamp::from_secs_f64(start_secs),
        source: Vec3::new(-50.0, 0.0, 0.0),
        destination: Vec3::new(10.0, 0.0, 0.0),
        direction: Vec3::new(10.0, 0.0, 0.0),
    };

    // 60 m along the axis at 10 m/s with the 1.3 margin: 20 + 7.8 s.
    let out = agent.handle_peer_message(frame(20.0), now);
    let adopted = agent.first_propagation_start();
    assert!((adopted.as_secs_f64() - 27.8).abs() < 1e-6);
    // Adoption re-runs the solver; with no downstream cluster the wave
    // keeps the announced course.
    assert_eq!(agent.propagation_direction(), Vec3::new(10.0, 0.0, 0.0));
    assert!(out.iter().any(|o| matches!(
        o,
        Output::SendTo { cluster: 50, message: Message::Ack { acked: TypeTag::InterClusterPropagation, .. } }
    )));

    // A frame implying exactly the recorded start changes nothing.
    let out = agent.handle_peer_message(frame(20.0), now);
    assert_eq!(agent.first_propagation_start(), adopted);
    assert_eq!(out.len(), 1, "only the ack goes out: {out:?}");
    assert!(matches!(out[0], Output::SendTo { cluster: 50, message: Message::Ack { .. } }));

    // A strictly earlier one is adopted again.
    agent.handle_peer_message(frame(19.0), now);
    assert!((agent.first_propagation_start().as_secs_f64() - 26.8).abs() < 1e-6);
}
