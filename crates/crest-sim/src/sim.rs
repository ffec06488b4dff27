//! The simulation harness: agents, virtual clock, radio and routing.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crest_cluster::{
    ClusterAgent, ClusterConfig, ConfigError, FixedMobility, Output, Timer, WorldContext,
};
use crest_geom::Vec3;
use crest_proto::{Codec, Message, PacketBuilder, Timestamp, TypeTag};

use crate::network::{Network, NetworkConfig};
use crate::queue::{EventId, EventQueue};

/// One unicast attempt, for post-run inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRecord {
    pub at: Timestamp,
    pub from: u64,
    pub to: u64,
    pub tag: TypeTag,
    pub delivered: bool,
}

enum Event {
    Timer { node: u64, timer: Timer },
    Broadcast { to: u64, packet: Bytes },
    Unicast { to: u64, packet: Bytes },
    Start { node: u64 },
    Stop { node: u64 },
}

/// A mesh of agents under one virtual clock.
pub struct Simulation {
    node_config: ClusterConfig,
    codec: Codec,
    now: Timestamp,
    queue: EventQueue<Event>,
    agents: BTreeMap<u64, ClusterAgent>,
    positions: BTreeMap<u64, Vec3>,
    world: WorldContext,
    network: Network,
    timers: HashMap<(u64, Timer), EventId>,
    next_seq: u32,
    unicast_log: Vec<MessageRecord>,
}

impl Simulation {
    pub fn new(node_config: ClusterConfig, net_config: NetworkConfig) -> Result<Self, ConfigError> {
        node_config.validate()?;
        let cells = node_config.distro_map_size * node_config.distro_map_size;
        Ok(Self {
            codec: Codec::new(cells),
            node_config,
            now: Timestamp::ZERO,
            queue: EventQueue::new(),
            agents: BTreeMap::new(),
            positions: BTreeMap::new(),
            world: WorldContext::new(),
            network: Network::new(net_config),
            timers: HashMap::new(),
            next_seq: 0,
            unicast_log: Vec::new(),
        })
    }

    /// Add a stationary node.
    pub fn add_node(&mut self, id: u64, position: Vec3) {
        let address = Ipv4Addr::new(10, (id >> 16) as u8, (id >> 8) as u8, id as u8);
        let agent = ClusterAgent::new(
            self.node_config.clone(),
            id,
            address,
            Box::new(FixedMobility(position)),
        )
        .expect("node config validated at simulation construction");
        self.agents.insert(id, agent);
        self.positions.insert(id, position);
    }

    /// Designate a wave origin with its base direction.
    pub fn set_starting_node(&mut self, id: u64, direction: Vec3) {
        if let Some(agent) = self.agents.get_mut(&id) {
            agent.set_starting_node(true);
            agent.set_base_direction(direction, &mut self.world);
        }
    }

    pub fn schedule_start(&mut self, id: u64, at: Timestamp) {
        self.queue.schedule(at, Event::Start { node: id });
    }

    pub fn schedule_stop(&mut self, id: u64, at: Timestamp) {
        self.queue.schedule(at, Event::Stop { node: id });
    }

    pub fn start_all(&mut self, at: Timestamp) {
        let ids: Vec<u64> = self.agents.keys().copied().collect();
        for id in ids {
            self.schedule_start(id, at);
        }
    }

    pub fn stop_all(&mut self, at: Timestamp) {
        let ids: Vec<u64> = self.agents.keys().copied().collect();
        for id in ids {
            self.schedule_stop(id, at);
        }
    }

    /// Remove a node mid-run; its packets stop and pending deliveries to
    /// it are discarded on arrival.
    pub fn halt_node(&mut self, id: u64) {
        self.agents.remove(&id);
        self.positions.remove(&id);
    }

    pub fn drop_next_unicasts(&mut self, from: u64, to: u64, count: u32) {
        self.network.drop_next_unicasts(from, to, count);
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn agent(&self, id: u64) -> Option<&ClusterAgent> {
        self.agents.get(&id)
    }

    pub fn unicast_log(&self) -> &[MessageRecord] {
        &self.unicast_log
    }

    /// Process every event up to and including `until`.
    pub fn run_until(&mut self, until: Timestamp) {
        while let Some(next) = self.queue.peek_time() {
            if next > until {
                break;
            }
            let Some((at, id, event)) = self.queue.pop() else {
                break;
            };
            self.now = at;
            self.dispatch(id, event);
        }
        self.now = until;
    }

    fn dispatch(&mut self, event_id: EventId, event: Event) {
        match event {
            Event::Timer { node, timer } => {
                if self.timers.get(&(node, timer)) == Some(&event_id) {
                    self.timers.remove(&(node, timer));
                }
                let Some(agent) = self.agents.get_mut(&node) else {
                    return;
                };
                let outputs = agent.handle_timer(timer, self.now, &mut self.world);
                self.apply(node, outputs);
            }

            Event::Broadcast { to, packet } => {
                let messages = match self.codec.decode_packet(&packet) {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(%err, to, "dropping undecodable carrier");
                        return;
                    }
                };
                let Some(agent) = self.agents.get_mut(&to) else {
                    return;
                };
                let mut outputs = Vec::new();
                for message in messages {
                    outputs.extend(agent.handle_broadcast(message, self.now));
                }
                self.apply(to, outputs);
            }

            Event::Unicast { to, packet } => {
                let messages = match self.codec.decode_packet(&packet) {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(%err, to, "dropping undecodable unicast");
                        return;
                    }
                };
                let Some(agent) = self.agents.get_mut(&to) else {
                    return;
                };
                let mut outputs = Vec::new();
                for message in messages {
                    outputs.extend(agent.handle_peer_message(message, self.now));
                }
                self.apply(to, outputs);
            }

            Event::Start { node } => {
                let Some(agent) = self.agents.get_mut(&node) else {
                    return;
                };
                let outputs = agent.start_clustering(self.now);
                self.apply(node, outputs);
            }

            Event::Stop { node } => {
                let Some(agent) = self.agents.get_mut(&node) else {
                    return;
                };
                let outputs = agent.stop_clustering(self.now, &mut self.world);
                self.apply(node, outputs);
            }
        }
    }

    fn apply(&mut self, node: u64, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Broadcast(batch) => self.broadcast(node, &batch),
                Output::SendTo { cluster, message } => self.unicast(node, cluster, message),
                // Unicast is routed by cluster id; channel lifecycle
                // needs no bookkeeping here.
                Output::ConnectPeers(_) | Output::DisconnectPeers => {}
                Output::SetTimer { timer, delay } => {
                    let id = self.queue.schedule(self.now + delay, Event::Timer { node, timer });
                    if let Some(old) = self.timers.insert((node, timer), id) {
                        self.queue.cancel(old);
                    }
                }
                Output::ClearTimer(timer) => {
                    if let Some(old) = self.timers.remove(&(node, timer)) {
                        self.queue.cancel(old);
                    }
                }
            }
        }
    }

    fn broadcast(&mut self, from: u64, batch: &[Message]) {
        let Some(&from_pos) = self.positions.get(&from) else {
            return;
        };

        let mut builder = PacketBuilder::new(self.codec);
        for message in batch {
            let seq = self.bump_seq();
            builder.push(message, seq);
        }
        let carriers = builder.finish();

        let deliver_at = self.now + self.network.latency();
        let targets: Vec<(u64, Vec3)> = self
            .positions
            .iter()
            .filter(|(&to, _)| to != from)
            .map(|(&to, &pos)| (to, pos))
            .collect();

        for carrier in &carriers {
            for &(to, pos) in &targets {
                if from_pos.distance(&pos) >= self.network.broadcast_range() {
                    continue;
                }
                if self.network.broadcast_lost() {
                    continue;
                }
                self.queue.schedule(deliver_at, Event::Broadcast { to, packet: carrier.clone() });
            }
        }
    }

    fn unicast(&mut self, from: u64, cluster: u64, message: Message) {
        let tag = message.tag();
        let seq = self.bump_seq();
        let mut buf = BytesMut::new();
        self.codec.encode(&message, seq, &mut buf);

        let exists = self.agents.contains_key(&cluster);
        let lost = self.network.unicast_lost(from, cluster);
        let delivered = exists && !lost;

        self.unicast_log.push(MessageRecord {
            at: self.now,
            from,
            to: cluster,
            tag,
            delivered,
        });

        if delivered {
            self.queue.schedule(
                self.now + self.network.latency(),
                Event::Unicast { to: cluster, packet: buf.freeze() },
            );
        }
    }

    fn bump_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crest_cluster::{ClusterState, Degree};

    #[test]
    fn lone_node_elects_itself() {
        let mut sim =
            Simulation::new(ClusterConfig::default(), NetworkConfig::default()).unwrap();
        sim.add_node(1, Vec3::ZERO);
        sim.start_all(Timestamp::ZERO);
        sim.run_until(Timestamp::from_secs_f64(2.0));

        let agent = sim.agent(1).unwrap();
        assert_eq!(agent.info().degree, Degree::Ch);
        assert_eq!(agent.info().cluster_id, 1);
        assert_eq!(agent.state(), ClusterState::ClusterUpdate);
    }

    #[test]
    fn halted_node_stops_participating() {
        let mut sim =
            Simulation::new(ClusterConfig::default(), NetworkConfig::default()).unwrap();
        sim.add_node(1, Vec3::ZERO);
        sim.add_node(2, Vec3::new(10.0, 0.0, 0.0));
        sim.start_all(Timestamp::ZERO);
        sim.run_until(Timestamp::from_secs_f64(2.0));

        sim.halt_node(2);
        sim.run_until(Timestamp::from_secs_f64(3.0));
        assert!(sim.agent(2).is_none());
        assert!(sim.agent(1).is_some());
    }
}
