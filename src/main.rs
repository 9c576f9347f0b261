use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use drogulus::{ContentType, DhtConfig, Keypair, Node};

/// `IP:PORT` or `IP:PORT/NODE_ID`. With an id, the peer must answer as that id.
#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    identity: Option<String>,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = match s.rsplit_once('/') {
            Some((addr, id)) => (addr, Some(id)),
            None => (s, None),
        };

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;

        if let Some(id) = id_part {
            let id_bytes = hex::decode(id).context("invalid hex node id")?;
            if id_bytes.len() != 32 {
                anyhow::bail!("node id must be 64 hex characters (32 bytes)");
            }
        }

        Ok(BootstrapPeer {
            addr,
            identity: id_part.map(str::to_string),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "drogulus")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Address peers should use to reach this node.
    #[arg(long)]
    advertise: Option<String>,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Replication factor (bucket size).
    #[arg(short, long, default_value_t = drogulus::DEFAULT_K)]
    k: usize,

    /// Parallel queries per lookup round.
    #[arg(short, long, default_value_t = drogulus::DEFAULT_ALPHA)]
    alpha: usize,

    /// Publish `NAME=VALUE` as a text item after bootstrapping.
    #[arg(short, long, value_name = "NAME=VALUE")]
    publish: Option<String>,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
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

    let config = DhtConfig {
        k: args.k.max(1),
        alpha: args.alpha.max(1),
        ..DhtConfig::default()
    };
    let keypair = Keypair::generate();
    let bind = args.bind.to_string();
    let node = match &args.advertise {
        Some(advertise) => Node::bind_advertising(&bind, advertise, keypair, config).await?,
        None => Node::bind_with_config(&bind, keypair, config).await?,
    };
    info!("Node identity: {}", node.identity());
    info!("Node address: {}", node.contact().addr);

    for peer in &args.bootstrap {
        let addr = peer.addr.to_string();
        let result = match &peer.identity {
            Some(identity) => {
                info!("Bootstrapping from {}/{}", peer.addr, &identity[..16]);
                node.bootstrap(identity, &addr).await
            }
            None => {
                info!("Bootstrapping from {}", peer.addr);
                node.bootstrap_addr(&addr).await
            }
        };
        match result {
            Ok(()) => info!("Bootstrap complete"),
            Err(e) => warn!(error = %e, "Bootstrap failed"),
        }
    }

    if let Some(entry) = &args.publish {
        let (name, value) = entry.split_once('=').context("--publish expects NAME=VALUE")?;
        match node
            .publish(Some(name), value.as_bytes().to_vec(), ContentType::text())
            .await
        {
            Ok(item) => info!(key = %item.key, version = item.version, "published {name}"),
            Err(e) => warn!(error = %e, "publish failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.telemetry().await;
                info!(
                    contacts = snapshot.routing_contacts,
                    owned = snapshot.owned_items,
                    cached = snapshot.cached_items,
                    blocked = snapshot.blocked_peers,
                    k = snapshot.replication_factor,
                    alpha = snapshot.concurrency,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
