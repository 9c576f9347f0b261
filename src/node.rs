//! # High-Level Node API
//!
//! A [`Node`] binds a TCP listener, runs the DHT over it and exposes the
//! signed-item operations.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("127.0.0.1:0").await?;
//! node.bootstrap_addr("127.0.0.1:4000").await?;
//!
//! let item = node.publish(Some("profile"), b"hello".to_vec(), ContentType::text()).await?;
//! let found = node.get(&item.key).await?;
//! ```
//!
//! ## Component Integration
//!
//! - **RpcNode**: TCP transport, signs every outbound request
//! - **DhtNode**: routing, lookups, item cache and reputation
//! - **serve**: inbound accept loop feeding `DhtNode::handle_request`

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::dht::{
    DhtConfig, DhtNode, LookupError, PublishError, PutError, TelemetrySnapshot,
};
use crate::identity::{Contact, Keypair, NodeId};
use crate::item::{ContentType, Item};
use crate::protocols::ItemApi;
use crate::reputation::PeerRecord;
use crate::rpc::{self, RpcNode};

pub struct Node {
    keypair: Keypair,
    contact: Contact,
    local_addr: SocketAddr,
    dhtnode: DhtNode<RpcNode>,
    listener: tokio::task::JoinHandle<()>,
}

impl Node {
    /// Create a node with a fresh identity and default configuration.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::create(addr, None, Keypair::generate(), DhtConfig::default()).await
    }

    pub async fn bind_with_keypair(addr: &str, keypair: Keypair) -> Result<Self> {
        Self::create(addr, None, keypair, DhtConfig::default()).await
    }

    pub async fn bind_with_config(addr: &str, keypair: Keypair, config: DhtConfig) -> Result<Self> {
        Self::create(addr, None, keypair, config).await
    }

    /// Bind to `addr` but tell peers to reach us at `advertise`, for nodes
    /// behind a port mapping or bound to an unspecified address.
    pub async fn bind_advertising(
        addr: &str,
        advertise: &str,
        keypair: Keypair,
        config: DhtConfig,
    ) -> Result<Self> {
        Self::create(addr, Some(advertise.to_string()), keypair, config).await
    }

    async fn create(
        addr: &str,
        advertise: Option<String>,
        keypair: Keypair,
        config: DhtConfig,
    ) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;

        let advertised = match advertise {
            Some(advertised) => advertised,
            None if local_addr.ip().is_unspecified() => {
                let loopback =
                    SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), local_addr.port());
                warn!(
                    bound = %local_addr,
                    advertised = %loopback,
                    "unspecified bind with no advertised address, peers will see loopback"
                );
                loopback.to_string()
            }
            None => local_addr.to_string(),
        };

        let contact = keypair.create_contact(advertised);
        let rpcnode =
            RpcNode::new(keypair.clone(), contact.clone()).with_timeout(config.query_timeout);
        let dhtnode = DhtNode::new(keypair.clone(), contact.clone(), rpcnode, config);

        let listener = tokio::spawn(rpc::serve(listener, dhtnode.clone()));

        info!(
            node = %keypair.node_id(),
            addr = %contact.addr,
            "node listening"
        );

        Ok(Self {
            keypair,
            contact,
            local_addr,
            dhtnode,
            listener,
        })
    }

    /// Returns the node's id as a hex-encoded string.
    pub fn identity(&self) -> String {
        self.keypair.node_id().to_hex()
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub async fn add_peer(&self, contact: Contact) {
        self.dhtnode.observe_contact(contact).await
    }

    /// Join through a peer whose id is known. The id the peer answers with
    /// must match.
    pub async fn bootstrap(&self, identity: &str, addr: &str) -> Result<()> {
        let expected =
            NodeId::from_hex(identity).context("invalid identity: must be 64 hex characters")?;
        let seed = self.dhtnode.network().introduce(addr).await?;
        if seed.node_id != expected {
            anyhow::bail!(
                "bootstrap peer at {addr} is {}, expected {}",
                seed.node_id,
                expected
            );
        }
        self.join(seed).await
    }

    /// Join through a peer known only by address.
    pub async fn bootstrap_addr(&self, addr: &str) -> Result<()> {
        let seed = self.dhtnode.network().introduce(addr).await?;
        self.join(seed).await
    }

    async fn join(&self, seed: Contact) -> Result<()> {
        let found = self.dhtnode.bootstrap(seed.clone()).await?;
        debug!(seed = %seed.node_id, found = found.len(), "bootstrap lookup done");
        Ok(())
    }

    /// Sign `value` as the next version of our item under `name` (or our
    /// bare public key when `None`) and store it.
    pub async fn publish(
        &self,
        name: Option<&str>,
        value: Vec<u8>,
        content_type: ContentType,
    ) -> Result<Item, PublishError> {
        self.dhtnode.publish(name, value, content_type).await
    }

    /// Store an already signed item. Returns how many peers accepted it.
    pub async fn put(&self, item: Item) -> Result<usize, PutError> {
        self.dhtnode.put(item).await
    }

    pub async fn get(&self, key: &NodeId) -> Result<Option<Item>, LookupError> {
        self.dhtnode.get(key).await
    }

    pub async fn find_peers(&self, target: NodeId) -> Result<Vec<Contact>, LookupError> {
        self.dhtnode.iterative_find_node(target).await
    }

    pub async fn peer_record(&self, peer: &NodeId) -> Option<PeerRecord> {
        self.dhtnode.peer_record(peer).await
    }

    pub async fn is_blocked(&self, peer: &NodeId) -> bool {
        self.dhtnode.is_blocked(peer).await
    }

    pub fn can_publish(&self) -> bool {
        self.dhtnode.can_publish()
    }

    pub async fn telemetry(&self) -> TelemetrySnapshot {
        self.dhtnode.telemetry_snapshot().await
    }

    /// Refuse new operations, wait for in-flight ones, then stop serving.
    pub async fn shutdown(&self) {
        self.dhtnode.shutdown().await;
        self.listener.abort();
        info!(node = %self.node_id(), "node stopped");
    }
}

#[async_trait]
impl ItemApi for Node {
    async fn get(&self, key: &NodeId) -> Option<Item> {
        match Node::get(self, key).await {
            Ok(found) => found,
            Err(e) => {
                debug!(key = %key, error = %e, "item lookup failed");
                None
            }
        }
    }

    async fn put(&self, item: Item) -> Result<(), PutError> {
        Node::put(self, item).await.map(|_| ())
    }
}
