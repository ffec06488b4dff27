//! Crest node binary
//!
//! Runs one clustering agent on the local network. Clustering starts
//! immediately and stops (entering the decision phase) after the given
//! number of seconds.
//!
//! Usage: crest-node <id> <x> <y> [formation-secs]

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crest_cluster::{ClusterAgent, ClusterConfig, FixedMobility};
use crest_geom::Vec3;
use crest_net::{NodeRuntime, TransportConfig, UdpTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let id: u64 = args.next().ok_or("usage: crest-node <id> <x> <y> [formation-secs]")?.parse()?;
    let x: f64 = args.next().ok_or("missing x coordinate")?.parse()?;
    let y: f64 = args.next().ok_or("missing y coordinate")?.parse()?;
    let formation_secs: u64 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(30);

    tracing::info!(id, x, y, "starting crest node");

    let config = ClusterConfig::default();
    let grid_cells = config.distro_map_size * config.distro_map_size;
    let agent = ClusterAgent::new(
        config,
        id,
        Ipv4Addr::UNSPECIFIED,
        Box::new(FixedMobility(Vec3::new(x, y, 0.0))),
    )?;

    let transport = UdpTransport::bind(TransportConfig::default()).await?;
    let (runtime, handle) = NodeRuntime::new(agent, transport, grid_cells);
    let task = tokio::spawn(runtime.run());

    handle.start_clustering();
    tokio::time::sleep(Duration::from_secs(formation_secs)).await;
    handle.stop_clustering();

    tokio::signal::ctrl_c().await?;
    handle.shutdown();

    let agent = task.await??;
    agent.status_report();
    tracing::info!(id = agent.id(), state = %agent.state(), "node stopped");
    Ok(())
}
