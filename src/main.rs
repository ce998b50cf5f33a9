use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::time::{sleep, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use arras::{IdSpace, LocalBus, MemoryBlobStore, MeshClient, MeshConfig, MeshNode, PeerRef};

#[derive(Parser, Debug)]
#[command(name = "arras")]
#[command(author, version, about = "In-process object location mesh demo", long_about = None)]
struct Args {
    /// Number of peers in the demo mesh.
    #[arg(short, long, default_value = "8")]
    peers: usize,

    /// Number of keys to store and resolve.
    #[arg(short, long, default_value = "5")]
    keys: usize,

    /// Identifier digit base.
    #[arg(long, default_value = "4")]
    base: u8,

    /// Identifier length in digits.
    #[arg(long, default_value = "8")]
    digits: usize,

    /// Kill one peer mid-run to show republish recovery.
    #[arg(long)]
    fail_one: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let space = IdSpace::new(args.base, args.digits);
    let config = MeshConfig {
        space,
        ..MeshConfig::default()
    };
    let bus = LocalBus::new();

    let mut nodes: Vec<MeshNode<LocalBus>> = Vec::with_capacity(args.peers);
    for index in 0..args.peers {
        let peer = PeerRef::new(
            space.random(),
            SocketAddr::from(([127, 0, 0, 1], 9000 + index as u16)),
        );
        let node = MeshNode::new(
            peer,
            config.clone(),
            bus.clone(),
            Arc::new(MemoryBlobStore::new()),
        );
        bus.register(node.clone()).await;
        if let Some(gateway) = nodes.first() {
            node.join(gateway.peer()).await?;
        }
        info!(peer = %node.peer(), "peer up");
        nodes.push(node);
    }

    let writer = MeshClient::connect(bus.clone(), nodes[0].peer().clone()).await?;
    for i in 0..args.keys {
        let key = format!("object-{i}");
        writer
            .store(&key, format!("payload for {key}").into_bytes())
            .await?;
        info!(key, "stored");
    }

    if args.fail_one && nodes.len() > 1 {
        let victim = nodes.remove(nodes.len() / 2);
        info!(peer = %victim.peer(), "killing one peer without warning");
        bus.set_down(&victim.peer().id, true);
        // Pointers rooted at the victim lapse; the holders' republish
        // cycle re-registers them at the surviving surrogate roots.
        let wait = config.republish_interval + Duration::from_millis(500);
        info!(?wait, "waiting for republish");
        sleep(wait).await;
    }

    if nodes.len() > 1 {
        if let Some(departing) = nodes.pop() {
            info!(peer = %departing.peer(), "peer leaving cleanly");
            departing.leave().await?;
            bus.deregister(&departing.peer().id).await;
        }
    }

    for i in 0..args.keys {
        let key = format!("object-{i}");
        let entry = nodes[i % nodes.len()].peer().clone();
        let reader = MeshClient::connect(bus.clone(), entry).await?;
        let value = reader.get(&key).await?;
        let holders = reader.lookup(&key).await?;
        info!(key, holders = holders.len(), bytes = value.len(), "resolved");
    }

    info!("demo complete");
    Ok(())
}
