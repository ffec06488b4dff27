//! The per-node clustering agent.
//!
//! Drives a node through formation (initialization, head election,
//! formation, update), the decision phase (density exchange, propagation
//! parameter selection) and the wave phase (ready, running, complete).
//! Inbound messages and timer fires are handled to completion; effects
//! come back as [`Output`]s.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crest_geom::{in_sector, propagation_delay, DensityGrid, Vec3};
use crest_proto::{Degree, Message, NodeInfo, Timestamp, TypeTag};

use crate::config::{ClusterConfig, ConfigError};
use crate::mobility::MobilityModel;
use crate::output::{Output, PeerEndpoint, Timer};
use crate::tables::{AckTable, NeighborTable};
use crate::world::WorldContext;

/// Selection radius for inter-cluster targets.
const SECTOR_RADIUS: f64 = 100.0;
/// Density mass below this does not attract the wave.
const DENSITY_THRESHOLD: f32 = 1.0;
/// Lead time between deciding parameters and the wave start.
const WAVE_LEAD: Duration = Duration::from_secs(5);
/// Window granted to the density exchange before deciding.
const DECIDE_DELAY: Duration = Duration::from_secs(1);
/// How long a node keeps its wave running.
const WAVE_RUN_TIME: Duration = Duration::from_millis(1500);
/// Safety factor on the computed inter-cluster delay.
const DELAY_MARGIN: f64 = 1.3;

/// Protocol phase of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClusterState {
    ClusterInitialization,
    ClusterHeadElection,
    ClusterFormation,
    ClusterUpdate,
    ExchangeDistroMap,
    DecidePropagationParam,
    PropagationReady,
    PropagationRunning,
    PropagationComplete,
    /// Reverse-propagation diagnostic only.
    Active,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ClusterInitialization => "CLUSTER_INITIALIZATION",
            Self::ClusterHeadElection => "CLUSTER_HEAD_ELECTION",
            Self::ClusterFormation => "CLUSTER_FORMATION",
            Self::ClusterUpdate => "CLUSTER_UPDATE",
            Self::ExchangeDistroMap => "EXCHANGE_DISTRO_MAP",
            Self::DecidePropagationParam => "DECIDE_PROPAGATION_PARAM",
            Self::PropagationReady => "PROPAGATION_READY",
            Self::PropagationRunning => "PROPAGATION_RUNNING",
            Self::PropagationComplete => "PROPAGATION_COMPLETE",
            Self::Active => "ACTIVE",
        };
        f.write_str(name)
    }
}

/// Traffic and churn counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AgentStats {
    pub sent: u64,
    pub received: u64,
    pub membership_changes: u64,
    pub formation_messages: u64,
}

impl std::fmt::Display for AgentStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent {} recv {} changes {} formation {}",
            self.sent, self.received, self.membership_changes, self.formation_messages
        )
    }
}

impl std::fmt::Debug for ClusterAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAgent")
            .field("config", &self.config)
            .field("info", &self.info)
            .field("state", &self.state)
            .field("neighbors", &self.neighbors)
            .field("members", &self.members)
            .field("neighbor_clusters", &self.neighbor_clusters)
            .field("distro_map", &self.distro_map)
            .field("neighbor_distro", &self.neighbor_distro)
            .field("distro_acks", &self.distro_acks)
            .field("prop_acks", &self.prop_acks)
            .field("base_direction", &self.base_direction)
            .field("propagation_direction", &self.propagation_direction)
            .field("propagation_start", &self.propagation_start)
            .field("first_start", &self.first_start)
            .field("first_start_node", &self.first_start_node)
            .field("beacon_pending", &self.beacon_pending)
            .field("stats", &self.stats)
            .finish()
    }
}

pub struct ClusterAgent {
    config: ClusterConfig,
    info: NodeInfo,
    state: ClusterState,
    mobility: Box<dyn MobilityModel>,

    neighbors: NeighborTable,
    members: NeighborTable,
    neighbor_clusters: NeighborTable,

    distro_map: Option<DensityGrid>,
    neighbor_distro: BTreeMap<u64, DensityGrid>,
    distro_acks: AckTable,
    prop_acks: AckTable,

    base_direction: Vec3,
    propagation_direction: Vec3,
    propagation_start: Timestamp,
    first_start: Timestamp,
    first_start_node: u64,

    beacon_pending: bool,
    stats: AgentStats,
}

impl ClusterAgent {
    pub fn new(
        config: ClusterConfig,
        id: u64,
        address: Ipv4Addr,
        mobility: Box<dyn MobilityModel>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let info = NodeInfo::new(id, address, mobility.position());
        Ok(Self {
            config,
            info,
            state: ClusterState::ClusterInitialization,
            mobility,
            neighbors: NeighborTable::new(),
            members: NeighborTable::new(),
            neighbor_clusters: NeighborTable::new(),
            distro_map: None,
            neighbor_distro: BTreeMap::new(),
            distro_acks: AckTable::new(),
            prop_acks: AckTable::new(),
            base_direction: Vec3::ZERO,
            propagation_direction: Vec3::ZERO,
            propagation_start: Timestamp::MAX,
            first_start: Timestamp::MAX,
            first_start_node: u64::MAX,
            beacon_pending: false,
            stats: AgentStats::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn stats(&self) -> AgentStats {
        self.stats
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Members of this node's cluster; meaningful only while CH.
    pub fn members(&self) -> &NeighborTable {
        &self.members
    }

    pub fn neighbor_clusters(&self) -> &NeighborTable {
        &self.neighbor_clusters
    }

    pub fn distro_map(&self) -> Option<&DensityGrid> {
        self.distro_map.as_ref()
    }

    pub fn neighbor_distro(&self) -> &BTreeMap<u64, DensityGrid> {
        &self.neighbor_distro
    }

    pub fn propagation_direction(&self) -> Vec3 {
        self.propagation_direction
    }

    pub fn propagation_start(&self) -> Timestamp {
        self.propagation_start
    }

    pub fn first_propagation_start(&self) -> Timestamp {
        self.first_start
    }

    /// Designate this node as a wave origin.
    pub fn set_starting_node(&mut self, is_starting: bool) {
        self.info.is_starting_node = is_starting;
    }

    /// Record the direction a wave from this node would initially take.
    pub fn set_base_direction(&mut self, direction: Vec3, world: &mut WorldContext) {
        self.base_direction = direction;
        world.set_base_direction(self.info.id, direction);
    }

    /// Begin the formation phase: first beacon after the time window,
    /// aging after one TDMA window.
    pub fn start_clustering(&mut self, now: Timestamp) -> Vec<Output> {
        let mut out = Vec::new();
        self.acquire_mobility(now);
        self.schedule_beacon(&mut out, self.config.time_window);
        out.push(Output::SetTimer {
            timer: Timer::NeighborAging,
            delay: self.config.tdma_window(),
        });
        debug!(node = self.info.id, "clustering started");
        out
    }

    /// Externally driven formation: claim headship and announce it.
    pub fn form_cluster(&mut self) -> Vec<Output> {
        let mut out = Vec::new();
        self.state = ClusterState::ClusterFormation;
        self.schedule_beacon(&mut out, Duration::ZERO);
        out
    }

    /// Freeze membership and move into the decision phase.
    pub fn stop_clustering(&mut self, now: Timestamp, world: &mut WorldContext) -> Vec<Output> {
        let mut out = Vec::new();
        out.push(Output::ClearTimer(Timer::NeighborAging));
        self.acquire_mobility(now);
        self.state = ClusterState::ExchangeDistroMap;

        match self.info.degree {
            Degree::Ch => {
                let peers: Vec<PeerEndpoint> = self
                    .neighbor_clusters
                    .iter()
                    .map(|(id, entry)| PeerEndpoint { cluster_id: id, address: entry.address })
                    .collect();
                out.push(Output::ConnectPeers(peers));
                self.update_distro_map(world);
                self.exchange_distro_map(&mut out);
                out.push(Output::SetTimer { timer: Timer::Decide, delay: DECIDE_DELAY });
            }
            Degree::Standalone if self.info.is_starting_node => {
                self.first_start = now + WAVE_LEAD;
                self.propagation_start = self.first_start;
                self.propagation_direction = self.base_direction;
                self.schedule_wave_start(now, &mut out);
            }
            _ => {}
        }
        out
    }

    /// A logical timer installed by a previous callback has fired.
    pub fn handle_timer(
        &mut self,
        timer: Timer,
        now: Timestamp,
        world: &mut WorldContext,
    ) -> Vec<Output> {
        let mut out = Vec::new();
        match timer {
            Timer::Beacon => {
                self.beacon_pending = false;
                self.send_beacon(now, &mut out);
            }
            Timer::ElectionProbe => self.election_probe(&mut out),
            Timer::NeighborAging => self.update_neighbor_list(now, &mut out),
            Timer::Decide => self.decide_propagation_param(now, world, &mut out),
            Timer::PropagationStart => self.start_node_propagation(now, &mut out),
            Timer::PropagationStop => {
                self.state = ClusterState::PropagationComplete;
                out.push(Output::DisconnectPeers);
                debug!(node = self.info.id, "propagation complete");
            }
            Timer::DistroRetry(peer) => {
                if let Some(frame) = self.distro_acks.pending_frame(peer) {
                    let frame = frame.clone();
                    trace!(node = self.info.id, peer, "density map retry");
                    self.send_to(&mut out, peer, frame);
                    out.push(Output::SetTimer {
                        timer: Timer::DistroRetry(peer),
                        delay: self.config.minimum_tdma_slot * 1000,
                    });
                }
            }
            Timer::PropagationRetry(peer) => {
                if let Some(frame) = self.prop_acks.pending_frame(peer) {
                    let frame = frame.clone();
                    trace!(node = self.info.id, peer, "inter-cluster handoff retry");
                    self.send_to(&mut out, peer, frame);
                    out.push(Output::SetTimer {
                        timer: Timer::PropagationRetry(peer),
                        delay: self.config.minimum_tdma_slot * 1000,
                    });
                }
            }
            Timer::Activate => {
                self.state = ClusterState::Active;
                out.push(Output::SetTimer {
                    timer: Timer::Deactivate,
                    delay: Duration::from_secs(1),
                });
            }
            Timer::Deactivate => {
                self.state = ClusterState::PropagationComplete;
                out.push(Output::SetTimer {
                    timer: Timer::Activate,
                    delay: Duration::from_secs(19),
                });
            }
        }
        out
    }

    /// A message arrived on the beacon (broadcast) socket.
    pub fn handle_broadcast(&mut self, message: Message, now: Timestamp) -> Vec<Output> {
        let mut out = Vec::new();
        let prev = (self.info.cluster_id, self.info.degree);
        self.stats.received += 1;

        match message {
            Message::ClusterInfo { info } => self.on_cluster_info(info, now, &mut out),
            Message::InitiateCluster { cluster_id, info } => {
                self.on_initiate_cluster(cluster_id, info, now, &mut out)
            }
            Message::FormCluster { info } => self.on_form_cluster(info, &mut out),
            Message::NeighborClusterInfo { cluster_id, info } => {
                self.on_neighbor_cluster_info(cluster_id, info)
            }
            Message::IntraClusterPropagation { cluster_id, starting_node, starting_time, direction } => {
                self.on_intra_cluster_propagation(
                    cluster_id,
                    starting_node,
                    starting_time,
                    direction,
                    now,
                    &mut out,
                );
            }
            Message::InterNodePropagation { starting_time, position, direction, .. } => {
                self.on_inter_node_propagation(starting_time, position, direction, now, &mut out);
            }
            other => {
                trace!(node = self.info.id, tag = ?other.tag(), "ignoring unicast-only message on beacon socket");
            }
        }

        self.note_membership_change(prev);
        out
    }

    /// A message arrived on the inter-CH control socket.
    pub fn handle_peer_message(&mut self, message: Message, now: Timestamp) -> Vec<Output> {
        let mut out = Vec::new();
        self.stats.received += 1;

        match message {
            Message::DistroMap { cluster_id, info, cells } => {
                self.neighbor_clusters.upsert(cluster_id, info);
                let grid = DensityGrid::from_cells(
                    cells,
                    self.config.distro_map_size,
                    self.config.distro_map_scale,
                );
                // Replacement keeps duplicate delivery idempotent.
                self.neighbor_distro.insert(cluster_id, grid);
                debug!(node = self.info.id, peer = cluster_id, "density map received");

                let ack = Message::Ack {
                    cluster_id: self.info.cluster_id,
                    acked: TypeTag::DistroMap,
                };
                self.send_to(&mut out, cluster_id, ack);
            }

            Message::InterClusterPropagation { cluster_id, starting_time, source, destination, direction } => {
                let (candidate_id, candidate_pos) = self.find_node_by_position(destination);
                let delay = propagation_delay(source, candidate_pos, direction);
                let new_time = starting_time + Duration::from_secs_f64(delay * DELAY_MARGIN);

                if self.first_start > new_time {
                    debug!(
                        node = self.info.id,
                        from = cluster_id,
                        start = %new_time,
                        "adopting earlier wave start"
                    );
                    self.first_start = new_time;
                    self.first_start_node = candidate_id;
                    self.transmit_propagation_direction(candidate_id, direction, now, &mut out);
                }

                let ack = Message::Ack {
                    cluster_id: self.info.cluster_id,
                    acked: TypeTag::InterClusterPropagation,
                };
                self.send_to(&mut out, cluster_id, ack);
            }

            Message::Ack { cluster_id, acked } => match acked {
                TypeTag::DistroMap => {
                    if self.distro_acks.acknowledge(cluster_id) {
                        out.push(Output::ClearTimer(Timer::DistroRetry(cluster_id)));
                    }
                }
                TypeTag::InterClusterPropagation => {
                    if self.prop_acks.acknowledge(cluster_id) {
                        out.push(Output::ClearTimer(Timer::PropagationRetry(cluster_id)));
                    }
                }
                other => {
                    warn!(node = self.info.id, tag = ?other, "ack for unexpected frame type");
                }
            },

            other => {
                trace!(node = self.info.id, tag = ?other.tag(), "ignoring broadcast-only message on control socket");
            }
        }
        out
    }

    /// Log a one-line summary of the node's tables and counters.
    pub fn status_report(&self) {
        debug!(
            node = self.info.id,
            state = %self.state,
            degree = %self.info.degree,
            cluster = self.info.cluster_id,
            neighbors = self.neighbors.len(),
            members = self.members.len(),
            neighbor_clusters = self.neighbor_clusters.len(),
            stats = %self.stats,
            "status report"
        );
    }

    // ---- beacon loop -----------------------------------------------------

    fn send_beacon(&mut self, now: Timestamp, out: &mut Vec<Output>) {
        let prev = (self.info.cluster_id, self.info.degree);

        match self.state {
            ClusterState::ClusterInitialization => {
                self.acquire_mobility(now);
                self.broadcast(out, vec![Message::ClusterInfo { info: self.info }]);
                self.stats.formation_messages += 1;
                out.push(Output::SetTimer {
                    timer: Timer::ElectionProbe,
                    delay: self.config.tdma_window(),
                });
            }

            ClusterState::ClusterHeadElection => {
                self.acquire_mobility(now);
                self.become_head();
                self.broadcast(
                    out,
                    vec![Message::InitiateCluster { cluster_id: self.info.id, info: self.info }],
                );
                self.stats.formation_messages += 1;
                self.state = ClusterState::ClusterUpdate;
                self.schedule_beacon(out, self.config.tdma_window());
            }

            ClusterState::ClusterFormation => {
                self.acquire_mobility(now);
                self.become_head();
                self.broadcast(out, vec![Message::FormCluster { info: self.info }]);
                self.stats.formation_messages += 1;
                self.state = ClusterState::ClusterUpdate;
                self.schedule_beacon(out, self.config.interval);
            }

            ClusterState::ClusterUpdate => {
                self.acquire_mobility(now);
                let mut batch = vec![Message::ClusterInfo { info: self.info }];
                for (_, entry) in self.neighbor_clusters.iter() {
                    batch.push(Message::NeighborClusterInfo {
                        cluster_id: self.info.cluster_id,
                        info: *entry,
                    });
                }
                self.broadcast(out, batch);
                self.schedule_beacon(out, self.config.interval);
            }

            ClusterState::DecidePropagationParam => {
                if self.info.degree == Degree::Ch {
                    self.broadcast(
                        out,
                        vec![Message::IntraClusterPropagation {
                            cluster_id: self.info.cluster_id,
                            starting_node: self.first_start_node,
                            starting_time: self.first_start,
                            direction: self.propagation_direction,
                        }],
                    );
                    self.schedule_beacon(out, self.config.interval);
                }
            }

            other => {
                trace!(node = self.info.id, state = %other, "beacon tick with nothing to send");
            }
        }

        self.note_membership_change(prev);
    }

    /// A pending beacon is never replaced; the earlier schedule wins.
    fn schedule_beacon(&mut self, out: &mut Vec<Output>, delay: Duration) {
        if self.beacon_pending {
            trace!(node = self.info.id, "beacon already pending, keeping earlier schedule");
            return;
        }
        self.beacon_pending = true;
        out.push(Output::SetTimer { timer: Timer::Beacon, delay });
    }

    fn election_probe(&mut self, out: &mut Vec<Output>) {
        if self.state != ClusterState::ClusterInitialization {
            return;
        }
        if self.has_max_id() {
            self.state = ClusterState::ClusterHeadElection;
            self.schedule_beacon(out, self.config.tdma_window());
        } else {
            out.push(Output::SetTimer {
                timer: Timer::ElectionProbe,
                delay: self.config.tdma_window(),
            });
        }
    }

    // ---- inbound beacon handling ----------------------------------------

    fn on_cluster_info(&mut self, other: NodeInfo, now: Timestamp, out: &mut Vec<Output>) {
        if !self.within_range(&other) {
            return;
        }
        self.neighbors.upsert(other.id, other);

        if self.state == ClusterState::ClusterInitialization
            && other.degree == Degree::Ch
            && self.info.degree == Degree::Standalone
        {
            self.state = ClusterState::ClusterUpdate;
            self.become_member(&other);
            self.schedule_beacon(out, self.config.time_window);
        }

        if matches!(self.state, ClusterState::ClusterUpdate | ClusterState::ClusterHeadElection) {
            match self.info.degree {
                Degree::Ch | Degree::Cm => {
                    if other.cluster_id == self.info.id {
                        self.members.upsert(other.id, other);
                    } else if self.members.is_empty() {
                        self.merge_or_promote(false, out);
                    }
                }
                Degree::Standalone => {
                    self.merge_or_promote(true, out);
                }
            }
        }

        self.note_neighbor_cluster(&other, now);
    }

    fn on_initiate_cluster(
        &mut self,
        cluster_id: u64,
        ch_info: NodeInfo,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) {
        if !self.within_range(&ch_info) {
            return;
        }

        if self.state == ClusterState::ClusterInitialization {
            if self.neighbors.contains(cluster_id) {
                self.neighbors.upsert(cluster_id, ch_info);
                self.state = ClusterState::ClusterUpdate;
                self.become_member(&ch_info);
                self.schedule_beacon(out, self.config.time_window);
            }
            // Unknown initiator: stay in initialization and keep probing.
        } else {
            trace!(node = self.info.id, from = ch_info.id, "ignoring further headship claims");
        }

        self.note_neighbor_cluster(&ch_info, now);
    }

    fn on_form_cluster(&mut self, other: NodeInfo, out: &mut Vec<Output>) {
        if !self.within_range(&other) {
            return;
        }
        self.neighbors.upsert(other.id, other);

        if self.neighbors.contains(other.cluster_id) {
            match self.state {
                ClusterState::ClusterHeadElection => {
                    out.push(Output::ClearTimer(Timer::ElectionProbe));
                    self.state = ClusterState::ClusterUpdate;
                    self.become_member(&other);
                    self.schedule_beacon(out, self.config.time_window);
                }
                ClusterState::ClusterFormation => {
                    trace!(node = self.info.id, "already a cluster member");
                }
                _ => {}
            }
        }
    }

    fn on_neighbor_cluster_info(&mut self, cluster_id: u64, ch_info: NodeInfo) {
        // Members relay remote heads to their own head.
        if self.info.degree == Degree::Ch
            && cluster_id == self.info.id
            && ch_info.id != self.info.id
        {
            self.neighbor_clusters.upsert(ch_info.id, ch_info);
        }
    }

    fn on_intra_cluster_propagation(
        &mut self,
        cluster_id: u64,
        starting_node: u64,
        starting_time: Timestamp,
        direction: Vec3,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) {
        if self.info.cluster_id != cluster_id || self.info.degree != Degree::Cm {
            return;
        }
        self.propagation_direction = direction;

        let designated = self.info.id == starting_node
            && (!self.config.disable_starting_node || self.info.is_starting_node);
        let phase_ok = matches!(
            self.state,
            ClusterState::ExchangeDistroMap | ClusterState::PropagationReady
        );
        if designated && phase_ok {
            if self.propagation_start >= starting_time && starting_time > now {
                self.propagation_start = starting_time;
                self.first_start = starting_time;
            }
            self.schedule_wave_start(now, out);
        }
    }

    fn on_inter_node_propagation(
        &mut self,
        starting_time: Timestamp,
        position: Vec3,
        direction: Vec3,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) {
        let reachable = in_sector(
            position,
            self.info.position,
            direction,
            self.config.bf_range,
            self.config.propagation_theta,
        );
        if !reachable {
            return;
        }

        if self.propagation_direction.is_horizontally_zero() {
            // No assigned direction: fan outward, away from the sender,
            // biased by the incoming direction.
            let speed = direction.horizontal_length();
            let come = Vec3::new(direction.x / speed, direction.y / speed, 0.0);
            let delta = self.info.position - position;
            let delta_len = delta.horizontal_length();
            let spread = Vec3::new(come.x + delta.x / delta_len, come.y + delta.y / delta_len, 0.0);
            let spread_len = spread.horizontal_length();
            self.propagation_direction =
                Vec3::new(speed * spread.x / spread_len, speed * spread.y / spread_len, 0.0);
        }

        let distance = self.info.position.distance(&position);
        let velocity = self.propagation_direction.horizontal_length();
        let new_time = starting_time + Duration::from_secs_f64(distance / velocity);

        if new_time < self.propagation_start && now < self.propagation_start {
            self.propagation_start = new_time;
            self.schedule_wave_start(now, out);
        }
    }

    // ---- aging -----------------------------------------------------------

    fn update_neighbor_list(&mut self, now: Timestamp, out: &mut Vec<Output>) {
        self.acquire_mobility(now);
        let prev = (self.info.cluster_id, self.info.degree);
        let max_age = 2 * self.config.interval;
        let mut has_ch = false;

        for (key, value) in self.neighbors.entries() {
            if self.info.cluster_id == value.id
                && self.info.cluster_id == value.cluster_id
                && value.degree == Degree::Ch
            {
                has_ch = true;
            }

            // A member that moved to another cluster is no longer ours.
            if self.members.contains(key) && self.info.id != value.cluster_id {
                self.members.remove(key);
            }

            // Keep the neighbor-cluster table in sync with directly
            // observed heads.
            if value.degree == Degree::Ch && self.info.cluster_id != value.id {
                if !self.neighbor_clusters.contains(key) {
                    self.neighbor_clusters.upsert(key, value);
                }
            } else if self.neighbor_clusters.contains(key) {
                self.neighbor_clusters.remove(key);
            }

            if now.saturating_duration_since(value.ts) > max_age {
                self.neighbors.remove(key);
                self.members.remove(key);

                if value.id == self.info.cluster_id {
                    debug!(node = self.info.id, ch = value.id, "lost cluster head, reinitializing");
                    self.info.cluster_id = u64::MAX;
                    self.info.degree = Degree::Standalone;
                    self.state = ClusterState::ClusterInitialization;
                }

                if self.neighbors.is_empty() && self.info.degree != Degree::Ch {
                    debug!(node = self.info.id, "no neighbors left, claiming headship");
                    self.become_head();
                    self.schedule_beacon(out, Duration::ZERO);
                }
            }
        }

        if self.info.degree == Degree::Cm && !has_ch {
            self.info.cluster_id = u64::MAX;
            self.info.degree = Degree::Standalone;
        }

        self.neighbor_clusters.age(now, max_age);

        self.note_membership_change(prev);
        out.push(Output::SetTimer { timer: Timer::NeighborAging, delay: self.config.interval });
    }

    // ---- density exchange ------------------------------------------------

    fn update_distro_map(&mut self, world: &mut WorldContext) {
        let ch_pos = self.info.position;
        let mut offsets: Vec<[f32; 2]> = vec![[0.0, 0.0]];
        for (_, member) in self.members.iter() {
            offsets.push([
                (member.position.x - ch_pos.x) as f32,
                (member.position.y - ch_pos.y) as f32,
            ]);
        }

        match DensityGrid::from_members(
            &offsets,
            self.config.distro_map_size,
            self.config.distro_map_scale,
        ) {
            Ok(grid) => {
                world.register_density(self.info.id, grid.clone());
                world.register_ch(self.info.id, self.info);
                self.distro_map = Some(grid);
            }
            Err(err) => {
                warn!(node = self.info.id, %err, "density grid not updated");
            }
        }
    }

    fn exchange_distro_map(&mut self, out: &mut Vec<Output>) {
        let Some(grid) = self.distro_map.clone() else {
            return;
        };

        for (peer, _) in self.neighbor_clusters.entries() {
            let frame = Message::DistroMap {
                cluster_id: self.info.id,
                info: self.info,
                cells: grid.cells().to_vec(),
            };
            self.distro_acks.mark_pending(peer, frame.clone());
            self.send_to(out, peer, frame);
            out.push(Output::SetTimer {
                timer: Timer::DistroRetry(peer),
                delay: self.config.minimum_tdma_slot * 1000,
            });
        }
    }

    fn decide_propagation_param(
        &mut self,
        now: Timestamp,
        world: &mut WorldContext,
        out: &mut Vec<Output>,
    ) {
        self.state = ClusterState::DecidePropagationParam;

        // The exchange window is over; cancel outstanding retries.
        for peer in self.distro_acks.cancel_all() {
            out.push(Output::ClearTimer(Timer::DistroRetry(peer)));
        }

        // Backfill maps the wire did not deliver from the shared registry.
        for (peer, _) in self.neighbor_clusters.entries() {
            if self.neighbor_distro.contains_key(&peer) {
                continue;
            }
            if let Some(grid) = world.density(peer) {
                self.neighbor_distro.insert(peer, grid.clone());
            }
            if let Some(record) = world.ch_record(peer) {
                self.neighbor_clusters.upsert(peer, *record);
            }
        }

        // The wave starts only from a cluster that holds a starting node.
        let mut starting_node = self
            .members
            .iter()
            .find(|(_, m)| m.is_starting_node)
            .map(|(id, _)| id);
        if self.info.is_starting_node {
            starting_node = Some(self.info.id);
        }

        if let Some(start_id) = starting_node {
            if let Some(base) = world.base_direction(start_id) {
                self.first_start = now + WAVE_LEAD;
                self.first_start_node = start_id;
                self.transmit_propagation_direction(start_id, base, now, out);
            }
        }
    }

    // ---- direction solver ------------------------------------------------

    /// Select target cells in neighbor density maps, hand the wave off to
    /// the owning heads and derive the local wave direction.
    fn transmit_propagation_direction(
        &mut self,
        start_id: u64,
        incoming: Vec3,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) {
        // A re-solve supersedes any handoffs still in flight.
        for peer in self.prop_acks.peers().collect::<Vec<_>>() {
            out.push(Output::ClearTimer(Timer::PropagationRetry(peer)));
        }

        let speed = incoming.horizontal_length();
        let start_pos = if start_id == self.info.id {
            self.info.position
        } else if let Some(member) = self.members.get(start_id) {
            member.position
        } else {
            warn!(node = self.info.id, start_id, "starting node unknown, wave not scheduled");
            return;
        };

        // First pass: immutable scan of the neighbor maps.
        struct Handoff {
            peer: u64,
            destination: Vec3,
            outgoing: Vec3,
        }
        let mut handoffs: Vec<Handoff> = Vec::new();

        for (&peer, grid) in &self.neighbor_distro {
            let Some(base) = self.neighbor_clusters.get(peer).map(|e| e.position) else {
                continue;
            };

            let mut best: Option<(f64, Vec3)> = None;
            for (i, j, _) in grid.dense_cells(DENSITY_THRESHOLD) {
                let cell = grid.world_cell(base, i, j);
                if !in_sector(start_pos, cell, incoming, SECTOR_RADIUS, self.config.propagation_theta)
                {
                    continue;
                }
                let dx = cell.x - start_pos.x;
                let dy = cell.y - start_pos.y;
                let distance = (dx * dx + dy * dy).sqrt();
                if best.map_or(true, |(d, _)| distance < d) {
                    best = Some((distance, cell));
                }
            }

            if let Some((distance, destination)) = best {
                let outgoing = Vec3::new(
                    speed * (destination.x - start_pos.x) / distance,
                    speed * (destination.y - start_pos.y) / distance,
                    0.0,
                );
                handoffs.push(Handoff { peer, destination, outgoing });
            }
        }

        // Second pass: emit the handoffs in staggered slots.
        let mut outcome_sum = Vec3::ZERO;
        let mut slot = self.config.tdma_window();
        for handoff in &handoffs {
            let frame = Message::InterClusterPropagation {
                cluster_id: self.info.cluster_id,
                starting_time: self.first_start,
                source: start_pos,
                destination: handoff.destination,
                direction: handoff.outgoing,
            };
            self.prop_acks.mark_pending(handoff.peer, frame);
            out.push(Output::SetTimer { timer: Timer::PropagationRetry(handoff.peer), delay: slot });
            slot += self.config.minimum_tdma_slot * 50;
            outcome_sum += handoff.outgoing;

            debug!(
                node = self.info.id,
                peer = handoff.peer,
                dest = %handoff.destination,
                "wave handoff selected"
            );
        }

        if !handoffs.is_empty() {
            let len = outcome_sum.horizontal_length();
            self.propagation_direction =
                Vec3::new(speed * outcome_sum.x / len, speed * outcome_sum.y / len, 0.0);
        } else {
            // No downstream cluster: the wave keeps its incoming course.
            self.propagation_direction = incoming;
        }

        // Members learn the wave parameters from the decide-phase beacon.
        if !self.members.is_empty() {
            self.schedule_beacon(out, slot);
        }

        let self_starts = start_id == self.info.id
            && (!self.config.disable_starting_node || self.info.is_starting_node);
        if self_starts {
            self.propagation_start = self.first_start;
            self.schedule_wave_start(now, out);
        }
    }

    // ---- wave ------------------------------------------------------------

    fn schedule_wave_start(&mut self, now: Timestamp, out: &mut Vec<Output>) {
        self.state = ClusterState::PropagationReady;
        if self.propagation_start == Timestamp::MAX || now > self.propagation_start {
            return;
        }

        out.push(Output::ClearTimer(Timer::PropagationStart));
        let delay = if self.config.reverse_propagation {
            Duration::from_millis(100)
        } else {
            self.propagation_start.saturating_duration_since(now)
        };
        out.push(Output::SetTimer { timer: Timer::PropagationStart, delay });
    }

    fn start_node_propagation(&mut self, now: Timestamp, out: &mut Vec<Output>) {
        self.state = ClusterState::PropagationRunning;
        debug!(node = self.info.id, start = %self.propagation_start, "wave running");

        self.broadcast(
            out,
            vec![Message::InterNodePropagation {
                cluster_id: self.info.id,
                starting_time: self.propagation_start,
                position: self.info.position,
                direction: self.propagation_direction,
            }],
        );

        if self.config.reverse_propagation {
            // Diagnostic oscillation: phase-offset each node by how far
            // behind the common start it fired, wrapped into a 20 s cycle.
            let mut offset_ns = now.as_nanos() as i128 - self.propagation_start.as_nanos() as i128;
            while offset_ns < 0 {
                offset_ns += 20_000_000_000;
            }
            offset_ns += 3_000_000_000;
            out.push(Output::SetTimer {
                timer: Timer::Activate,
                delay: Duration::from_nanos(offset_ns as u64),
            });
        } else {
            out.push(Output::SetTimer { timer: Timer::PropagationStop, delay: WAVE_RUN_TIME });
        }
    }

    // ---- helpers ---------------------------------------------------------

    fn acquire_mobility(&mut self, now: Timestamp) {
        self.info.ts = now;
        self.info.position = self.mobility.position();
    }

    fn within_range(&self, other: &NodeInfo) -> bool {
        self.info.position.distance(&other.position) < self.config.omni_range
    }

    fn become_head(&mut self) {
        self.info.degree = Degree::Ch;
        self.info.cluster_id = self.info.id;
        self.info.ch_address = self.info.address;
    }

    fn become_member(&mut self, head: &NodeInfo) {
        self.info.degree = Degree::Cm;
        self.info.cluster_id = head.cluster_id;
        self.info.ch_address = head.address;
    }

    /// Highest-id CH among neighbors, if any.
    fn merge_check(&self) -> Option<u64> {
        self.neighbors
            .values()
            .filter(|n| n.degree == Degree::Ch)
            .map(|n| n.id)
            .max()
    }

    /// The merge tie-break: join the highest-id known head when it beats
    /// our id; with no head in sight, a standalone holding the max id
    /// claims headship itself.
    fn merge_or_promote(&mut self, allow_promotion: bool, out: &mut Vec<Output>) {
        match self.merge_check() {
            Some(potential_id) if self.info.id < potential_id => {
                if let Some(head) = self.neighbors.get(potential_id).copied() {
                    debug!(node = self.info.id, head = potential_id, "merging into neighbor cluster");
                    self.become_member(&head);
                }
            }
            Some(_) => {}
            None if allow_promotion && self.has_max_id() => {
                debug!(node = self.info.id, "promoting to cluster head");
                self.become_head();
                self.state = ClusterState::ClusterUpdate;
                self.schedule_beacon(out, self.config.interval);
            }
            None => {}
        }
    }

    /// True when no non-member neighbor has a higher id.
    fn has_max_id(&self) -> bool {
        let mut max_id = self.info.id;
        for value in self.neighbors.values() {
            if value.id > max_id && value.degree != Degree::Cm {
                max_id = value.id;
            }
        }
        max_id == self.info.id
    }

    /// Record a remote cluster observed through a beacon.
    fn note_neighbor_cluster(&mut self, other: &NodeInfo, now: Timestamp) {
        if self.info.cluster_id == other.cluster_id {
            return;
        }
        if !matches!(other.degree, Degree::Ch | Degree::Cm) {
            return;
        }
        let head_address =
            if other.degree == Degree::Ch { other.address } else { other.ch_address };
        let entry = NodeInfo {
            ts: now,
            id: other.cluster_id,
            cluster_id: other.cluster_id,
            degree: Degree::Ch,
            is_starting_node: false,
            position: other.position,
            address: head_address,
            ch_address: head_address,
        };
        self.neighbor_clusters.upsert(other.cluster_id, entry);
    }

    /// Cluster node (member or self) nearest to `target`.
    fn find_node_by_position(&self, target: Vec3) -> (u64, Vec3) {
        let mut best_id = self.info.id;
        let mut best_pos = self.info.position;
        let mut best_dist = target.distance_squared(&self.info.position);

        for (id, member) in self.members.iter() {
            let dist = target.distance_squared(&member.position);
            if dist < best_dist {
                best_dist = dist;
                best_id = id;
                best_pos = member.position;
            }
        }
        (best_id, best_pos)
    }

    fn note_membership_change(&mut self, prev: (u64, Degree)) {
        if prev != (self.info.cluster_id, self.info.degree) {
            self.stats.membership_changes += 1;
            debug!(
                node = self.info.id,
                cluster = self.info.cluster_id,
                degree = %self.info.degree,
                "membership changed"
            );
        }
    }

    fn broadcast(&mut self, out: &mut Vec<Output>, batch: Vec<Message>) {
        self.stats.sent += batch.len() as u64;
        out.push(Output::Broadcast(batch));
    }

    fn send_to(&mut self, out: &mut Vec<Output>, cluster: u64, message: Message) {
        self.stats.sent += 1;
        out.push(Output::SendTo { cluster, message });
    }
}
