//! Single-task event loop wrapping one agent.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crest_cluster::{ClusterAgent, Output, Timer, WorldContext};
use crest_proto::{Codec, Message, PacketBuilder, Timestamp};

use crate::transport::UdpTransport;

enum Command {
    Timer(Timer),
    Beacon(Vec<u8>),
    Control(Vec<u8>),
    StartClustering,
    StopClustering,
    FormCluster,
    Shutdown,
}

/// Commands a runtime accepts while running.
#[derive(Clone)]
pub struct RuntimeHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RuntimeHandle {
    pub fn start_clustering(&self) {
        let _ = self.tx.send(Command::StartClustering);
    }

    pub fn stop_clustering(&self) {
        let _ = self.tx.send(Command::StopClustering);
    }

    pub fn form_cluster(&self) {
        let _ = self.tx.send(Command::FormCluster);
    }

    /// Stop the event loop; `run` returns the agent for inspection.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Owns one agent, its sockets and its timers.
///
/// All agent callbacks run on the event loop task, so the agent keeps
/// its single-threaded run-to-completion semantics on a real clock.
pub struct NodeRuntime {
    agent: ClusterAgent,
    transport: Arc<UdpTransport>,
    codec: Codec,
    world: WorldContext,
    peers: HashMap<u64, Ipv4Addr>,
    timers: HashMap<Timer, JoinHandle<()>>,
    epoch: Instant,
    seq: u32,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl NodeRuntime {
    pub fn new(agent: ClusterAgent, transport: UdpTransport, grid_cells: usize) -> (Self, RuntimeHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RuntimeHandle { tx: tx.clone() };
        let runtime = Self {
            agent,
            transport: Arc::new(transport),
            codec: Codec::new(grid_cells),
            world: WorldContext::new(),
            peers: HashMap::new(),
            timers: HashMap::new(),
            epoch: Instant::now(),
            seq: 0,
            tx,
            rx,
        };
        (runtime, handle)
    }

    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.epoch.elapsed().as_nanos() as u64)
    }

    /// Run until shutdown; returns the agent for final inspection.
    pub async fn run(mut self) -> anyhow::Result<ClusterAgent> {
        let beacon_task = spawn_receiver(self.transport.beacon_socket(), self.tx.clone(), true);
        let control_task = spawn_receiver(self.transport.control_socket(), self.tx.clone(), false);

        while let Some(command) = self.rx.recv().await {
            let now = self.now();
            let outputs = match command {
                Command::Timer(timer) => self.agent.handle_timer(timer, now, &mut self.world),
                Command::Beacon(data) => self.handle_packet(&data, now, true),
                Command::Control(data) => self.handle_packet(&data, now, false),
                Command::StartClustering => self.agent.start_clustering(now),
                Command::StopClustering => self.agent.stop_clustering(now, &mut self.world),
                Command::FormCluster => self.agent.form_cluster(),
                Command::Shutdown => break,
            };
            self.apply(outputs).await;
        }

        beacon_task.abort();
        control_task.abort();
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        debug!(node = self.agent.id(), "runtime stopped");
        Ok(self.agent)
    }

    fn handle_packet(&mut self, data: &[u8], now: Timestamp, beacon: bool) -> Vec<Output> {
        let messages = match self.codec.decode_packet(data) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(node = self.agent.id(), %err, "dropping undecodable packet");
                return Vec::new();
            }
        };

        let own_id = self.agent.id();
        let mut outputs = Vec::new();
        for message in messages {
            // Broadcast sockets may loop our own carriers back.
            if is_own_frame(&message, own_id) {
                continue;
            }
            if beacon {
                outputs.extend(self.agent.handle_broadcast(message, now));
            } else {
                outputs.extend(self.agent.handle_peer_message(message, now));
            }
        }
        outputs
    }

    async fn apply(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Broadcast(batch) => {
                    let mut builder = PacketBuilder::new(self.codec);
                    for message in &batch {
                        let seq = self.seq;
                        self.seq = self.seq.wrapping_add(1);
                        builder.push(message, seq);
                    }
                    for carrier in builder.finish() {
                        if let Err(err) = self.transport.send_broadcast(&carrier).await {
                            warn!(node = self.agent.id(), %err, "beacon send failed");
                        }
                    }
                }

                Output::SendTo { cluster, message } => {
                    let Some(&peer) = self.peers.get(&cluster) else {
                        warn!(node = self.agent.id(), cluster, "no channel to peer head");
                        continue;
                    };
                    let mut buf = BytesMut::new();
                    let seq = self.seq;
                    self.seq = self.seq.wrapping_add(1);
                    self.codec.encode(&message, seq, &mut buf);
                    if let Err(err) = self.transport.send_control(peer, &buf).await {
                        warn!(node = self.agent.id(), %err, cluster, "control send failed");
                    }
                }

                Output::ConnectPeers(endpoints) => {
                    for endpoint in endpoints {
                        self.peers.insert(endpoint.cluster_id, endpoint.address);
                    }
                }

                Output::DisconnectPeers => self.peers.clear(),

                Output::SetTimer { timer, delay } => {
                    let tx = self.tx.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(Command::Timer(timer));
                    });
                    if let Some(old) = self.timers.insert(timer, task) {
                        old.abort();
                    }
                }

                Output::ClearTimer(timer) => {
                    if let Some(task) = self.timers.remove(&timer) {
                        task.abort();
                    }
                }
            }
        }
    }
}

fn is_own_frame(message: &Message, own_id: u64) -> bool {
    match message {
        Message::ClusterInfo { info }
        | Message::FormCluster { info }
        | Message::InitiateCluster { info, .. } => info.id == own_id,
        Message::InterNodePropagation { cluster_id, .. } => *cluster_id == own_id,
        _ => false,
    }
}

fn spawn_receiver(
    socket: Arc<UdpSocket>,
    tx: mpsc::UnboundedSender<Command>,
    beacon: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, _from)) => {
                    let data = buf[..len].to_vec();
                    let command =
                        if beacon { Command::Beacon(data) } else { Command::Control(data) };
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "socket receive failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use crest_cluster::{ClusterConfig, Degree, FixedMobility};
    use crest_geom::Vec3;

    use crate::transport::TransportConfig;

    fn fast_config() -> ClusterConfig {
        // Short time window so the election finishes quickly; the beacon
        // interval stays at its default so the 2 * interval aging bound
        // comfortably covers the formation-phase beacon gaps.
        ClusterConfig { time_window: Duration::from_millis(50), ..Default::default() }
    }

    async fn loopback_transport() -> UdpTransport {
        UdpTransport::bind(TransportConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            broadcast: "127.0.0.1:1".parse().unwrap(),
            control_port: 0,
            ..Default::default()
        })
        .await
        .unwrap()
    }

    fn agent(id: u64, x: f64) -> ClusterAgent {
        ClusterAgent::new(
            fast_config(),
            id,
            Ipv4Addr::new(127, 0, 0, 1),
            Box::new(FixedMobility(Vec3::new(x, 0.0, 0.0))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn two_runtimes_elect_a_head_over_loopback() {
        let mut t1 = loopback_transport().await;
        let mut t2 = loopback_transport().await;
        // Point each node's "broadcast" at the other's beacon socket.
        let a1 = t1.beacon_addr().unwrap();
        let a2 = t2.beacon_addr().unwrap();
        t1.set_broadcast(a2);
        t2.set_broadcast(a1);

        let cells = 16 * 16;
        let (r1, h1) = NodeRuntime::new(agent(1, 0.0), t1, cells);
        let (r2, h2) = NodeRuntime::new(agent(2, 10.0), t2, cells);

        let task1 = tokio::spawn(r1.run());
        let task2 = tokio::spawn(r2.run());
        h1.start_clustering();
        h2.start_clustering();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        h1.shutdown();
        h2.shutdown();

        let n1 = task1.await.unwrap().unwrap();
        let n2 = task2.await.unwrap().unwrap();

        assert_eq!(n2.info().degree, Degree::Ch);
        assert_eq!(n2.info().cluster_id, 2);
        assert_eq!(n1.info().degree, Degree::Cm);
        assert_eq!(n1.info().cluster_id, 2);
        assert!(n2.members().contains(1));
    }
}
