//! Protocol scenarios run end to end through the simulator.

use std::time::Duration;

use crest_cluster::{ClusterConfig, ClusterState, Degree};
use crest_geom::Vec3;
use crest_proto::{Timestamp, TypeTag};
use crest_sim::{NetworkConfig, Simulation};

fn at(secs: f64) -> Timestamp {
    Timestamp::from_secs_f64(secs)
}

fn sim() -> Simulation {
    Simulation::new(ClusterConfig::default(), NetworkConfig::default()).unwrap()
}

/// Two nodes in range: the higher id wins the election, the other joins.
#[test]
fn two_node_election() {
    let mut sim = sim();
    sim.add_node(1, Vec3::ZERO);
    sim.add_node(2, Vec3::new(10.0, 0.0, 0.0));
    sim.start_all(Timestamp::ZERO);
    sim.run_until(at(3.0));

    let n1 = sim.agent(1).unwrap();
    assert_eq!(n1.info().degree, Degree::Cm);
    assert_eq!(n1.info().cluster_id, 2);

    let n2 = sim.agent(2).unwrap();
    assert_eq!(n2.info().degree, Degree::Ch);
    assert_eq!(n2.info().cluster_id, 2);
    assert!(n2.members().contains(1));
}

/// A late-starting standalone joins an established head on first contact.
#[test]
fn standalone_merges_with_established_cluster() {
    let mut sim = sim();
    sim.add_node(4, Vec3::new(6.0, 5.0, 0.0));
    sim.add_node(3, Vec3::new(5.0, 5.0, 0.0));
    sim.schedule_start(4, Timestamp::ZERO);
    sim.schedule_start(3, at(2.0));
    sim.run_until(at(4.0));

    let n4 = sim.agent(4).unwrap();
    assert_eq!(n4.info().degree, Degree::Ch);
    assert!(n4.members().contains(3));

    let n3 = sim.agent(3).unwrap();
    assert_eq!(n3.info().degree, Degree::Cm);
    assert_eq!(n3.info().cluster_id, 4);
}

/// A member whose head goes silent ages it out within 2 * interval and
/// claims headship once its neighborhood is empty.
#[test]
fn member_recovers_from_lost_head() {
    let mut sim = sim();
    sim.add_node(1, Vec3::ZERO);
    sim.add_node(2, Vec3::new(10.0, 0.0, 0.0));
    sim.start_all(Timestamp::ZERO);
    sim.run_until(at(3.0));
    assert_eq!(sim.agent(1).unwrap().info().degree, Degree::Cm);

    sim.halt_node(2);
    sim.run_until(at(5.0));

    let n1 = sim.agent(1).unwrap();
    assert!(n1.neighbors().is_empty());
    assert_eq!(n1.info().degree, Degree::Ch);
    assert_eq!(n1.info().cluster_id, 1);
    assert_eq!(n1.state(), ClusterState::ClusterUpdate);
}

/// Two clusters bridged by a boundary member. The heads are out of radio
/// range of each other and learn about one another only through relay.
///
///   20 ---- 2          cluster 20 around x = 0
///      \
///        5             boundary member at x = 80, joins 20 (higher id)
///      /
///   10 ---- 3          cluster 10 around x = 150
fn bridged_clusters() -> Simulation {
    let mut sim = sim();
    sim.add_node(20, Vec3::ZERO);
    sim.add_node(2, Vec3::new(10.0, 0.0, 0.0));
    sim.add_node(5, Vec3::new(80.0, 0.0, 0.0));
    sim.add_node(10, Vec3::new(150.0, 0.0, 0.0));
    sim.add_node(3, Vec3::new(160.0, 0.0, 0.0));
    sim.start_all(Timestamp::ZERO);
    sim
}

#[test]
fn relay_forms_two_bridged_clusters() {
    let mut sim = bridged_clusters();
    sim.run_until(at(5.0));

    let ch20 = sim.agent(20).unwrap();
    assert_eq!(ch20.info().degree, Degree::Ch);
    assert!(ch20.members().contains(2));
    assert!(ch20.members().contains(5));

    let ch10 = sim.agent(10).unwrap();
    assert_eq!(ch10.info().degree, Degree::Ch);
    assert!(ch10.members().contains(3));

    // The boundary member keeps both heads aware of each other.
    assert!(ch10.neighbor_clusters().contains(20));
}

/// A lost density map is retried after MinimumTdmaSlot * 1000 = 1 s and
/// acknowledged exactly once; entering the decide phase stops retries.
#[test]
fn density_exchange_survives_packet_loss() {
    let mut sim = bridged_clusters();
    sim.run_until(at(5.0));

    sim.drop_next_unicasts(10, 20, 1);
    sim.stop_all(at(5.0));
    sim.run_until(at(9.0));

    let attempts: Vec<_> = sim
        .unicast_log()
        .iter()
        .filter(|r| r.from == 10 && r.to == 20 && r.tag == TypeTag::DistroMap)
        .collect();
    assert_eq!(attempts.len(), 2, "one initial send and one retry: {attempts:?}");
    assert!(!attempts[0].delivered);
    assert!(attempts[1].delivered);
    assert_eq!(
        attempts[1].at.saturating_duration_since(attempts[0].at),
        Duration::from_secs(1)
    );

    // Exactly one ack per delivered map.
    let acks = sim
        .unicast_log()
        .iter()
        .filter(|r| r.from == 20 && r.to == 10 && r.tag == TypeTag::Ack && r.delivered)
        .count();
    assert_eq!(acks, 1);

    let ch20 = sim.agent(20).unwrap();
    assert!(ch20.neighbor_distro().contains_key(&10));
    // The receiving side also completed its own exchange view.
    let ch10 = sim.agent(10).unwrap();
    assert!(ch10.neighbor_distro().contains_key(&20));
}

/// Full two-level wave: the starting member's cluster hands the wave to
/// the downstream cluster; start times improve monotonically along the
/// propagation chain.
#[test]
fn wave_crosses_clusters_and_start_times_stay_monotone() {
    let mut sim = bridged_clusters();
    // Boundary member 5 originates a wave heading toward cluster 10.
    sim.set_starting_node(5, Vec3::new(10.0, 0.0, 0.0));
    sim.run_until(at(5.0));
    sim.stop_all(at(5.0));
    sim.run_until(at(25.0));

    // Cluster 20 decided at 6 s, so the wave starts at 11 s.
    let n5 = sim.agent(5).unwrap();
    assert_eq!(n5.state(), ClusterState::PropagationComplete);
    assert_eq!(n5.propagation_start(), at(11.0));

    // The handoff reached cluster 10 and was acknowledged.
    assert!(sim
        .unicast_log()
        .iter()
        .any(|r| r.from == 20 && r.to == 10 && r.tag == TypeTag::InterClusterPropagation && r.delivered));
    assert!(sim
        .unicast_log()
        .iter()
        .any(|r| r.from == 10 && r.to == 20 && r.tag == TypeTag::Ack && r.delivered));

    // Head 10 adopted 11 s + 1.3 * (70 m / 10 m/s) = 20.1 s.
    let ch10 = sim.agent(10).unwrap();
    assert_eq!(ch10.state(), ClusterState::PropagationComplete);
    let ch10_start = ch10.propagation_start().as_secs_f64();
    assert!((ch10_start - 20.1).abs() < 1e-6, "head 10 start {ch10_start}");

    // Its member refined the start by another 10 m / 10 m/s hop.
    let n3 = sim.agent(3).unwrap();
    assert_eq!(n3.state(), ClusterState::PropagationComplete);
    let n3_start = n3.propagation_start().as_secs_f64();
    assert!((n3_start - 21.1).abs() < 1e-6, "member 3 start {n3_start}");

    // Monotone along the chain.
    assert!(n5.propagation_start() < ch10.propagation_start());
    assert!(ch10.propagation_start() < n3.propagation_start());

    // Nodes behind the wave front never activate.
    let ch20 = sim.agent(20).unwrap();
    assert_eq!(ch20.state(), ClusterState::DecidePropagationParam);
    assert_eq!(ch20.propagation_direction(), Vec3::new(10.0, 0.0, 0.0));
    let n2 = sim.agent(2).unwrap();
    assert_eq!(n2.state(), ClusterState::ExchangeDistroMap);
}
