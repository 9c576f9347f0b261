//! # Signed-item Kademlia DHT
//!
//! Iterative node and value lookups, item propagation, republish and expiry,
//! layered over the routing table, item cache and peer reputation.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `put(item)` | Validate, store locally, send to the k closest peers |
//! | `publish(name, value)` | Sign a new version with the local key, then `put` |
//! | `get(key)` | Local copy, else iterative FIND_VALUE |
//! | `iterative_find_node(id)` | k closest contacts to an id |
//! | `bootstrap(contact)` | Join the network via a known peer |
//!
//! ## Actor Architecture
//!
//! - [`DhtNode`]: cheap, cloneable handle; runs lookups on the caller's task
//! - `DhtNodeActor`: single task owning the routing table, item cache and
//!   reputation tracker; every mutation is a [`Command`] on its queue
//!
//! Serialising all mutations through one task means two concurrent lookups
//! can never both see a free slot in the same bucket.
//!
//! ## Lookup state machine
//!
//! `Init → Querying → (Converged | TimedOut)`. Each round sends at most
//! `alpha` queries and waits for all of them (or their timeouts) before the
//! next round starts. A value lookup stops at the first valid item and aborts
//! the rest of its round.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::identity::{Contact, Keypair, NodeId, distance_cmp, now_ms};
use crate::item::{ContentType, FreshnessPolicy, Item, ItemError};
use crate::messages::{DhtRequest, DhtResponse, MAX_CONTACTS_PER_RESPONSE, MAX_VALUE_SIZE};
use crate::protocols::{DhtNodeRpc, FindValueResult, is_local_failure};
use crate::reputation::{
    InvalidOutcome, PeerRecord, ReputationConfig, ReputationTracker, TimeoutOutcome,
};
use crate::routing::{PendingBucketUpdate, RoutingTable, random_id_for_bucket};
use crate::storage::{Accepted, DEFAULT_CACHE_CAPACITY, ItemStore, Origin, ttl_for_distance};

/// Default Kademlia replication factor (bucket size).
pub const DEFAULT_K: usize = 20;

/// Default Kademlia concurrency factor (parallel queries per round).
pub const DEFAULT_ALPHA: usize = 3;

/// Permits in the operation gate; far above any realistic concurrency.
const OPERATION_PERMITS: u32 = 1 << 16;

#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    /// Deadline for every outbound query.
    pub query_timeout: Duration,
    pub max_lookup_rounds: usize,
    /// Wall-clock budget for a whole lookup.
    pub lookup_timeout: Duration,
    pub republish_interval: Duration,
    /// TTL for peer-supplied items when we are among the k closest to the key.
    pub item_ttl: Duration,
    pub min_item_ttl: Duration,
    pub expiry_check_interval: Duration,
    /// Buckets untouched for this long get a refresh lookup.
    pub bucket_refresh_interval: Duration,
    pub cache_capacity: usize,
    pub freshness: FreshnessPolicy,
    pub reputation: ReputationConfig,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            query_timeout: Duration::from_secs(3),
            max_lookup_rounds: 20,
            lookup_timeout: Duration::from_secs(10),
            republish_interval: Duration::from_secs(60 * 60),
            item_ttl: Duration::from_secs(24 * 60 * 60),
            min_item_ttl: Duration::from_secs(60 * 60),
            expiry_check_interval: Duration::from_secs(60),
            bucket_refresh_interval: Duration::from_secs(15 * 60),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            freshness: FreshnessPolicy::default(),
            reputation: ReputationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// No peer was known, or none answered within the round and time budget.
    /// Retry later with backoff.
    #[error("lookup failed: no peer responded")]
    LookupFailed,
    #[error("node is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PutError {
    /// Rejected by local validation; nothing was stored or sent.
    #[error(transparent)]
    Item(#[from] ItemError),
    #[error("node is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The local key can no longer sign. Publishing stays disabled for the
    /// life of the node; lookups keep working.
    #[error("local key material is corrupted; publishing disabled")]
    KeyMaterialCorrupted,
    #[error("value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Item(#[from] ItemError),
    #[error("node is shutting down")]
    ShuttingDown,
}

impl From<PutError> for PublishError {
    fn from(err: PutError) -> Self {
        match err {
            PutError::Item(e) => PublishError::Item(e),
            PutError::ShuttingDown => PublishError::ShuttingDown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    Init,
    Querying,
    Converged,
    TimedOut,
}

#[derive(Clone, Debug)]
pub struct LookupResult {
    pub closest: Vec<Contact>,
    pub state: LookupState,
    pub rounds: usize,
}

/// Result of an inbound STORE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Rejected(ItemError),
    /// Sender is blocked; the item was not looked at.
    Dropped,
}

#[derive(Clone, Debug, Default)]
pub struct TelemetrySnapshot {
    pub routing_contacts: usize,
    pub owned_items: usize,
    pub cached_items: usize,
    pub blocked_peers: usize,
    pub replication_factor: usize,
    pub concurrency: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepublishStats {
    pub owned: usize,
    pub cached: usize,
    /// Successful STOREs across all republished items.
    pub replicas: usize,
}

/// Tracks in-flight operations so shutdown can wait for them.
struct OperationGate {
    closing: AtomicBool,
    permits: Arc<Semaphore>,
}

impl OperationGate {
    fn new() -> Self {
        Self {
            closing: AtomicBool::new(false),
            permits: Arc::new(Semaphore::new(OPERATION_PERMITS as usize)),
        }
    }

    async fn enter(&self) -> Option<OwnedSemaphorePermit> {
        if self.closing.load(Ordering::Acquire) {
            return None;
        }
        self.permits.clone().acquire_owned().await.ok()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Refuse new operations and wait for running ones to finish.
    async fn drain(&self) {
        self.closing.store(true, Ordering::Release);
        if let Ok(all) = self.permits.acquire_many(OPERATION_PERMITS).await {
            drop(all);
        }
        self.permits.close();
    }
}

pub struct DhtNode<N: DhtNodeRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: NodeId,
    keypair: Arc<Keypair>,
    self_contact: Contact,
    network: Arc<N>,
    config: Arc<DhtConfig>,
    gate: Arc<OperationGate>,
    key_healthy: Arc<AtomicBool>,
}

impl<N: DhtNodeRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            keypair: self.keypair.clone(),
            self_contact: self.self_contact.clone(),
            network: self.network.clone(),
            config: self.config.clone(),
            gate: self.gate.clone(),
            key_healthy: self.key_healthy.clone(),
        }
    }
}

struct DhtNodeActor<N: DhtNodeRpc> {
    routing: RoutingTable,
    store: ItemStore,
    reputation: ReputationTracker,
    config: Arc<DhtConfig>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    id: NodeId,
    /// Items signed with this key are owned; anything else is cached.
    public_key: [u8; 32],
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Local,
    Remote,
}

enum Command {
    // State updates
    ObserveContact(Contact),
    ReportSuccess(Contact),
    ReportTimeout(NodeId),
    ReportInvalid(NodeId, ItemError),

    // Queries
    GetLookupParams(NodeId, oneshot::Sender<Vec<Contact>>),
    FilterUsable(Vec<Contact>, oneshot::Sender<Vec<Contact>>),
    GetLocal(NodeId, oneshot::Sender<Option<Item>>),
    AcceptItem(
        Item,
        Source,
        Option<NodeId>,
        oneshot::Sender<Result<Accepted, ItemError>>,
    ),
    IsBlocked(NodeId, oneshot::Sender<bool>),
    GetPeerRecord(NodeId, oneshot::Sender<Option<PeerRecord>>),
    GetTelemetry(oneshot::Sender<TelemetrySnapshot>),

    // RPC Handlers
    HandleFindNode(Contact, NodeId, oneshot::Sender<Option<Vec<Contact>>>),
    HandleFindValue(Contact, NodeId, oneshot::Sender<Option<FindValueResult>>),
    HandleStore(Contact, Item, oneshot::Sender<StoreOutcome>),
    HandlePing(Contact, oneshot::Sender<bool>),

    // Maintenance
    GetStaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    ApplyPingResult(PendingBucketUpdate, bool),
    GetRepublishSet(oneshot::Sender<(Vec<Item>, Vec<Item>)>),
    ExpireItems,

    Quit,
}

fn sort_by_distance(contacts: &mut [Contact], target: &NodeId) {
    contacts.sort_by(|a, b| {
        let da = a.node_id.xor_distance(target);
        let db = b.node_id.xor_distance(target);
        distance_cmp(&da, &db)
    });
}

impl<N: DhtNodeRpc + 'static> DhtNode<N> {
    pub fn new(keypair: Keypair, self_contact: Contact, network: N, config: DhtConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let network = Arc::new(network);
        let config = Arc::new(config);
        let id = keypair.node_id();

        let actor = DhtNodeActor {
            routing: RoutingTable::new(id, config.k),
            store: ItemStore::new(config.cache_capacity, config.freshness),
            reputation: ReputationTracker::new(config.reputation),
            config: config.clone(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            id,
            public_key: keypair.public_key_bytes(),
        };

        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            id,
            keypair: Arc::new(keypair),
            self_contact,
            network,
            config,
            gate: Arc::new(OperationGate::new()),
            key_healthy: Arc::new(AtomicBool::new(true)),
        };

        node.spawn_periodic_bucket_refresh();
        node.spawn_periodic_republish();
        node.spawn_periodic_expiry();
        node
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn contact(&self) -> Contact {
        self.self_contact.clone()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub async fn observe_contact(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::ObserveContact(contact)).await;
    }

    async fn report_success(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::ReportSuccess(contact)).await;
    }

    async fn report_timeout(&self, peer: NodeId) {
        let _ = self.cmd_tx.send(Command::ReportTimeout(peer)).await;
    }

    pub async fn is_blocked(&self, peer: &NodeId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::IsBlocked(*peer, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn peer_record(&self, peer: &NodeId) -> Option<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetPeerRecord(*peer, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn get_local(&self, key: &NodeId) -> Option<Item> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetLocal(*key, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    async fn accept_item(
        &self,
        item: Item,
        source: Source,
        from: Option<NodeId>,
    ) -> Result<Accepted, PutError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AcceptItem(item, source, from, tx))
            .await
            .map_err(|_| PutError::ShuttingDown)?;
        let accepted = rx.await.map_err(|_| PutError::ShuttingDown)??;
        Ok(accepted)
    }

    async fn filter_usable(&self, contacts: Vec<Contact>) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::FilterUsable(contacts, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetTelemetry(tx)).await.is_err() {
            return TelemetrySnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Inbound requests
    // ------------------------------------------------------------------------

    /// Answer one inbound request. `None` means the sender is blocked and the
    /// request is dropped unanswered.
    pub async fn handle_request(&self, from: &Contact, request: DhtRequest) -> Option<DhtResponse> {
        match request {
            DhtRequest::Ping => self
                .handle_ping_request(from)
                .await
                .then(|| DhtResponse::Pong(self.self_contact.clone())),
            DhtRequest::FindNode { target } => self
                .handle_find_node_request(from, target)
                .await
                .map(DhtResponse::Nodes),
            DhtRequest::FindValue { key } => {
                self.handle_find_value_request(from, key)
                    .await
                    .map(|result| match result {
                        FindValueResult::Found(item) => DhtResponse::Value(item),
                        FindValueResult::Closer(nodes) => DhtResponse::Nodes(nodes),
                    })
            }
            DhtRequest::Store { item } => match self.handle_store_request(from, item).await {
                StoreOutcome::Stored => Some(DhtResponse::Stored),
                StoreOutcome::Rejected(err) => Some(DhtResponse::Rejected {
                    reason: err.to_string(),
                }),
                StoreOutcome::Dropped => None,
            },
        }
    }

    pub async fn handle_ping_request(&self, from: &Contact) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HandlePing(from.clone(), tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn handle_find_node_request(
        &self,
        from: &Contact,
        target: NodeId,
    ) -> Option<Vec<Contact>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::HandleFindNode(from.clone(), target, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn handle_find_value_request(
        &self,
        from: &Contact,
        key: NodeId,
    ) -> Option<FindValueResult> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::HandleFindValue(from.clone(), key, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn handle_store_request(&self, from: &Contact, item: Item) -> StoreOutcome {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HandleStore(from.clone(), item, tx)).await.is_err() {
            return StoreOutcome::Dropped;
        }
        rx.await.unwrap_or(StoreOutcome::Dropped)
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub async fn iterative_find_node(&self, target: NodeId) -> Result<Vec<Contact>, LookupError> {
        let _permit = self.gate.enter().await.ok_or(LookupError::ShuttingDown)?;
        let result = self.lookup_nodes(target, Vec::new()).await?;
        Ok(result.closest)
    }

    /// Join the network through `seed`, then look up our own id to fill the
    /// buckets near us.
    pub async fn bootstrap(&self, seed: Contact) -> Result<Vec<Contact>, LookupError> {
        let _permit = self.gate.enter().await.ok_or(LookupError::ShuttingDown)?;
        self.observe_contact(seed.clone()).await;
        let result = self.lookup_nodes(self.id, vec![seed]).await?;
        Ok(result.closest)
    }

    async fn initial_shortlist(
        &self,
        target: NodeId,
        seeds: Vec<Contact>,
    ) -> Result<Vec<Contact>, LookupError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetLookupParams(target, tx))
            .await
            .map_err(|_| LookupError::ShuttingDown)?;
        let mut shortlist = rx.await.map_err(|_| LookupError::ShuttingDown)?;

        for seed in seeds {
            if seed.node_id != self.id
                && seed.is_usable()
                && !shortlist.iter().any(|c| c.node_id == seed.node_id)
            {
                shortlist.push(seed);
            }
        }
        sort_by_distance(&mut shortlist, &target);
        Ok(shortlist)
    }

    async fn lookup_nodes(
        &self,
        target: NodeId,
        seeds: Vec<Contact>,
    ) -> Result<LookupResult, LookupError> {
        let lookup_start = Instant::now();
        let k = self.config.k;
        let alpha = self.config.alpha.max(1);
        let mut state = LookupState::Init;

        let mut shortlist = self.initial_shortlist(target, seeds).await?;
        if shortlist.is_empty() {
            debug!(target = %target.short(), "lookup with no known peers");
            return Err(LookupError::LookupFailed);
        }
        shortlist.truncate(k);

        let mut seen: HashSet<NodeId> = shortlist.iter().map(|c| c.node_id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut responded = false;
        let mut rounds = 0;

        trace!(
            target = %target.short(),
            from = ?state,
            to = ?LookupState::Querying,
            "lookup state"
        );
        state = LookupState::Querying;

        loop {
            if rounds >= self.config.max_lookup_rounds {
                warn!(target = %target.short(), rounds, "iterative lookup exceeded max rounds");
                break;
            }
            if lookup_start.elapsed() > self.config.lookup_timeout {
                debug!(
                    target = %target.short(),
                    elapsed_ms = lookup_start.elapsed().as_millis(),
                    found = shortlist.len(),
                    "iterative lookup timeout, returning current results"
                );
                break;
            }

            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.node_id))
                .take(alpha)
                .cloned()
                .collect();

            if candidates.is_empty() {
                // Every one of the k closest has been asked.
                state = LookupState::Converged;
                break;
            }
            rounds += 1;

            let mut join_set = JoinSet::new();
            for contact in candidates {
                queried.insert(contact.node_id);
                let net = self.network.clone();
                let timeout = self.config.query_timeout;
                join_set.spawn(async move {
                    let query = net.find_node(&contact, target);
                    let result = match tokio::time::timeout(timeout, query).await {
                        Ok(r) => r,
                        Err(_) => Err(anyhow!("query timeout")),
                    };
                    (contact, result)
                });
            }

            // Round barrier: every query resolves or times out before merging.
            let mut learned = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                let Ok((contact, result)) = joined else { continue };
                match result {
                    Ok(mut nodes) => {
                        responded = true;
                        self.report_success(contact).await;
                        nodes.truncate(MAX_CONTACTS_PER_RESPONSE);
                        learned.extend(nodes);
                    }
                    Err(e) if is_local_failure(&e) => {
                        debug!(peer = %contact.node_id.short(), error = %e, "find_node not sent");
                    }
                    Err(e) => {
                        trace!(
                            peer = %contact.node_id.short(),
                            error = %e,
                            "find_node query failed"
                        );
                        self.report_timeout(contact.node_id).await;
                    }
                }
            }

            for n in self.filter_usable(learned).await {
                if seen.insert(n.node_id) {
                    shortlist.push(n);
                }
            }
            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);
        }

        let from = state;
        if !responded {
            state = LookupState::TimedOut;
        } else if state == LookupState::Querying {
            // Budget exhausted with partial results; still usable.
            state = LookupState::Converged;
        }
        trace!(target = %target.short(), from = ?from, to = ?state, "lookup state");

        debug!(
            target = %target.short(),
            found = shortlist.len(),
            queried = queried.len(),
            rounds,
            state = ?state,
            "iterative lookup completed"
        );

        match state {
            LookupState::TimedOut => Err(LookupError::LookupFailed),
            _ => Ok(LookupResult {
                closest: shortlist,
                state,
                rounds,
            }),
        }
    }

    /// Iterative FIND_VALUE. Stops at the first item that validates against
    /// our cache; invalid items are reported against the peer that sent them.
    async fn lookup_value(&self, key: NodeId) -> Result<Option<Item>, LookupError> {
        let lookup_start = Instant::now();
        let k = self.config.k;
        let alpha = self.config.alpha.max(1);

        let mut shortlist = self.initial_shortlist(key, Vec::new()).await?;
        if shortlist.is_empty() {
            debug!(key = %key.short(), "value lookup with no known peers");
            return Err(LookupError::LookupFailed);
        }
        shortlist.truncate(k);

        let mut seen: HashSet<NodeId> = shortlist.iter().map(|c| c.node_id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut without_value: Vec<Contact> = Vec::new();
        let mut responded = false;
        let mut rounds = 0;
        let mut found: Option<Item> = None;

        while found.is_none()
            && rounds < self.config.max_lookup_rounds
            && lookup_start.elapsed() <= self.config.lookup_timeout
        {
            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.node_id))
                .take(alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            rounds += 1;

            let mut join_set = JoinSet::new();
            for contact in candidates {
                queried.insert(contact.node_id);
                let net = self.network.clone();
                let timeout = self.config.query_timeout;
                join_set.spawn(async move {
                    let query = net.find_value(&contact, key);
                    let result = match tokio::time::timeout(timeout, query).await {
                        Ok(r) => r,
                        Err(_) => Err(anyhow!("query timeout")),
                    };
                    (contact, result)
                });
            }

            let mut learned = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                let Ok((contact, result)) = joined else { continue };
                match result {
                    Ok(FindValueResult::Found(item)) => {
                        responded = true;
                        let peer = contact.node_id;
                        self.report_success(contact).await;
                        if item.key != key {
                            debug!(
                                peer = %peer.short(),
                                key = %key.short(),
                                "peer answered with an item for another key"
                            );
                            self.report_invalid(peer, ItemError::BadKeyBinding).await;
                            continue;
                        }
                        match self.accept_item(item.clone(), Source::Remote, Some(peer)).await {
                            Ok(_) => {
                                found = Some(item);
                                join_set.abort_all();
                                break;
                            }
                            Err(e) => {
                                debug!(
                                    peer = %peer.short(),
                                    key = %key.short(),
                                    error = %e,
                                    "rejected item from lookup"
                                );
                            }
                        }
                    }
                    Ok(FindValueResult::Closer(mut nodes)) => {
                        responded = true;
                        without_value.push(contact.clone());
                        self.report_success(contact).await;
                        nodes.truncate(MAX_CONTACTS_PER_RESPONSE);
                        learned.extend(nodes);
                    }
                    Err(e) if is_local_failure(&e) => {
                        debug!(peer = %contact.node_id.short(), error = %e, "find_value not sent");
                    }
                    Err(e) => {
                        trace!(
                            peer = %contact.node_id.short(),
                            error = %e,
                            "find_value query failed"
                        );
                        self.report_timeout(contact.node_id).await;
                    }
                }
            }

            if found.is_some() {
                break;
            }

            for n in self.filter_usable(learned).await {
                if seen.insert(n.node_id) {
                    shortlist.push(n);
                }
            }
            sort_by_distance(&mut shortlist, &key);
            shortlist.truncate(k);
        }

        debug!(
            key = %key.short(),
            found = found.is_some(),
            queried = queried.len(),
            rounds,
            "value lookup completed"
        );

        if let Some(item) = &found {
            sort_by_distance(&mut without_value, &key);
            if let Some(cache_at) = without_value.into_iter().next() {
                self.spawn_path_cache(cache_at, item.clone()).await;
            }
            return Ok(found);
        }

        if !responded {
            return Err(LookupError::LookupFailed);
        }
        Ok(None)
    }

    async fn report_invalid(&self, peer: NodeId, error: ItemError) {
        let _ = self.cmd_tx.send(Command::ReportInvalid(peer, error)).await;
    }

    /// Store a found item at the closest queried peer that lacked it.
    async fn spawn_path_cache(&self, to: Contact, item: Item) {
        let Some(permit) = self.gate.enter().await else { return };
        let net = self.network.clone();
        let timeout = self.config.query_timeout;
        tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(timeout, net.store(&to, item)).await {
                Ok(Ok(_)) => trace!(peer = %to.node_id.short(), "cached item along lookup path"),
                _ => trace!(peer = %to.node_id.short(), "path cache store failed"),
            }
        });
    }

    // ------------------------------------------------------------------------
    // Store / get / publish
    // ------------------------------------------------------------------------

    /// Send `item` to the k closest peers to its key. Returns how many accepted.
    async fn propagate(&self, item: &Item) -> usize {
        let closest = match self.lookup_nodes(item.key, Vec::new()).await {
            Ok(result) => result.closest,
            Err(e) => {
                debug!(
                    key = %item.key.short(),
                    error = %e,
                    "no peers to propagate to, kept locally"
                );
                return 0;
            }
        };

        let mut join_set = JoinSet::new();
        for contact in closest.into_iter().take(self.config.k) {
            let net = self.network.clone();
            let item = item.clone();
            let timeout = self.config.query_timeout;
            join_set.spawn(async move {
                let result = tokio::time::timeout(timeout, net.store(&contact, item)).await;
                (contact, result)
            });
        }

        let mut accepted = 0;
        while let Some(joined) = join_set.join_next().await {
            let Ok((contact, result)) = joined else { continue };
            match result {
                Ok(Ok(stored)) => {
                    if stored {
                        accepted += 1;
                    }
                    self.report_success(contact).await;
                }
                Ok(Err(e)) if is_local_failure(&e) => {
                    debug!(peer = %contact.node_id.short(), error = %e, "store not sent");
                }
                Ok(Err(_)) | Err(_) => self.report_timeout(contact.node_id).await,
            }
        }

        debug!(key = %item.key.short(), version = item.version, accepted, "item propagated");
        accepted
    }

    /// Validate and store `item` locally, then send it to the k closest peers.
    /// Returns how many peers accepted it. Zero peers is not an error: the
    /// item is kept and republished later.
    ///
    /// Items signed with this node's key are owned and kept until replaced.
    /// Anyone else's item is cached with the same distance-scaled TTL as a
    /// copy received from a peer.
    pub async fn put(&self, item: Item) -> Result<usize, PutError> {
        let _permit = self.gate.enter().await.ok_or(PutError::ShuttingDown)?;
        self.accept_item(item.clone(), Source::Local, None).await?;
        Ok(self.propagate(&item).await)
    }

    pub async fn get(&self, key: &NodeId) -> Result<Option<Item>, LookupError> {
        if let Some(item) = self.get_local(key).await {
            return Ok(Some(item));
        }
        let _permit = self.gate.enter().await.ok_or(LookupError::ShuttingDown)?;
        self.lookup_value(*key).await
    }

    /// Sign `value` as the next version of our item at `name` and `put` it.
    pub async fn publish(
        &self,
        name: Option<&str>,
        value: Vec<u8>,
        content_type: ContentType,
    ) -> Result<Item, PublishError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(PublishError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.ensure_key_material()?;

        let key = Item::key_for(&self.keypair.public_key_bytes(), name);
        let version = self
            .get_local(&key)
            .await
            .map_or(1, |current| current.version.saturating_add(1));
        let item = Item::sign_new(&self.keypair, name, value, content_type, version);
        let replicas = self.put(item.clone()).await?;
        info!(key = %key.short(), version, replicas, "published item");
        Ok(item)
    }

    fn ensure_key_material(&self) -> Result<(), PublishError> {
        if !self.key_healthy.load(Ordering::Acquire) {
            return Err(PublishError::KeyMaterialCorrupted);
        }
        if !self.keypair.self_test() {
            self.key_healthy.store(false, Ordering::Release);
            error!("key material failed self test; publishing disabled");
            return Err(PublishError::KeyMaterialCorrupted);
        }
        Ok(())
    }

    pub fn can_publish(&self) -> bool {
        self.key_healthy.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn poison_key_material(&self) {
        self.key_healthy.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Push owned items (re-signed with a fresh timestamp) and live cached
    /// items back out to their k closest peers.
    pub async fn republish(&self) -> Result<RepublishStats, LookupError> {
        let _permit = self.gate.enter().await.ok_or(LookupError::ShuttingDown)?;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetRepublishSet(tx))
            .await
            .map_err(|_| LookupError::ShuttingDown)?;
        let (owned, cached) = rx.await.map_err(|_| LookupError::ShuttingDown)?;

        let mut stats = RepublishStats::default();
        if !owned.is_empty() && self.ensure_key_material().is_err() {
            warn!(owned = owned.len(), "skipping republish of owned items: key material unusable");
        } else {
            for item in owned {
                let fresh = item.refreshed(&self.keypair);
                if let Err(e) = self.accept_item(fresh.clone(), Source::Local, None).await {
                    debug!(key = %item.key.short(), error = %e, "refresh superseded, skipping");
                    continue;
                }
                stats.replicas += self.propagate(&fresh).await;
                stats.owned += 1;
            }
        }

        for item in cached {
            stats.replicas += self.propagate(&item).await;
            stats.cached += 1;
        }

        debug!(
            owned = stats.owned,
            cached = stats.cached,
            replicas = stats.replicas,
            "republish pass done"
        );
        Ok(stats)
    }

    fn spawn_periodic_republish(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.republish_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if node.republish().await.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_periodic_expiry(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.expiry_check_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if node.gate.is_closing() || node.cmd_tx.send(Command::ExpireItems).await.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_periodic_bucket_refresh(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.bucket_refresh_interval);
            interval.tick().await;
            loop {
                interval.tick().await;

                let (tx, rx) = oneshot::channel();
                let threshold = node.config.bucket_refresh_interval;
                if node.cmd_tx.send(Command::GetStaleBuckets(threshold, tx)).await.is_err() {
                    break;
                }

                let stale_buckets = match rx.await {
                    Ok(buckets) => buckets,
                    Err(_) => break,
                };

                if stale_buckets.is_empty() {
                    continue;
                }

                debug!(count = stale_buckets.len(), "refreshing stale routing buckets");

                for bucket_idx in stale_buckets {
                    let target = random_id_for_bucket(&node.id, bucket_idx);

                    match node.iterative_find_node(target).await {
                        Err(LookupError::ShuttingDown) => return,
                        Err(e) => {
                            debug!(bucket = bucket_idx, error = %e, "bucket refresh lookup failed")
                        }
                        Ok(_) => {}
                    }

                    let _ = node.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
                }
            }
        });
    }

    /// Stop accepting new operations, let in-flight ones finish (each is
    /// bounded by its query timeouts), then stop the actor.
    pub async fn shutdown(&self) {
        self.gate.drain().await;
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<N: DhtNodeRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObserveContact(contact) => {
                    self.handle_observe_contact(contact);
                }
                Command::ReportSuccess(contact) => {
                    self.reputation.report_success(contact.node_id);
                    self.handle_observe_contact(contact);
                }
                Command::ReportTimeout(peer) => {
                    self.handle_report_timeout(peer);
                }
                Command::ReportInvalid(peer, error) => {
                    self.handle_report_invalid(peer, &error);
                }
                Command::GetLookupParams(target, reply) => {
                    let closest = self.routing.closest(&target, self.config.k);
                    let _ = reply.send(closest);
                }
                Command::FilterUsable(contacts, reply) => {
                    let usable = contacts
                        .into_iter()
                        .filter(|c| {
                            c.node_id != self.id
                                && c.is_usable()
                                && !self.reputation.is_blocked(&c.node_id)
                        })
                        .collect();
                    let _ = reply.send(usable);
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.store.get(&key));
                }
                Command::AcceptItem(item, source, from, reply) => {
                    let result = self.handle_accept(item, source, from);
                    let _ = reply.send(result);
                }
                Command::IsBlocked(peer, reply) => {
                    let _ = reply.send(self.reputation.is_blocked(&peer));
                }
                Command::GetPeerRecord(peer, reply) => {
                    let _ = reply.send(self.reputation.record(&peer));
                }
                Command::GetTelemetry(reply) => {
                    let snapshot = TelemetrySnapshot {
                        routing_contacts: self.routing.len(),
                        owned_items: self.store.owned_len(),
                        cached_items: self.store.cached_len(),
                        blocked_peers: self.reputation.blocked_count(),
                        replication_factor: self.config.k,
                        concurrency: self.config.alpha,
                    };
                    let _ = reply.send(snapshot);
                }
                Command::HandlePing(from, reply) => {
                    let allowed = !self.reputation.is_blocked(&from.node_id);
                    if allowed {
                        self.handle_observe_contact(from);
                    }
                    let _ = reply.send(allowed);
                }
                Command::HandleFindNode(from, target, reply) => {
                    if self.reputation.is_blocked(&from.node_id) {
                        let _ = reply.send(None);
                        continue;
                    }
                    self.handle_observe_contact(from);
                    let closest = self.routing.closest(&target, self.config.k);
                    let _ = reply.send(Some(closest));
                }
                Command::HandleFindValue(from, key, reply) => {
                    if self.reputation.is_blocked(&from.node_id) {
                        let _ = reply.send(None);
                        continue;
                    }
                    self.handle_observe_contact(from);
                    let result = match self.store.get(&key) {
                        Some(item) => FindValueResult::Found(item),
                        None => FindValueResult::Closer(self.routing.closest(&key, self.config.k)),
                    };
                    let _ = reply.send(Some(result));
                }
                Command::HandleStore(from, item, reply) => {
                    if self.reputation.is_blocked(&from.node_id) {
                        let _ = reply.send(StoreOutcome::Dropped);
                        continue;
                    }
                    let sender = from.node_id;
                    self.handle_observe_contact(from);
                    let outcome = match self.handle_accept(item, Source::Remote, Some(sender)) {
                        Ok(_) => StoreOutcome::Stored,
                        Err(e) => StoreOutcome::Rejected(e),
                    };
                    let _ = reply.send(outcome);
                }
                Command::GetStaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.routing.stale_bucket_indices(threshold));
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.routing.mark_bucket_refreshed(idx);
                }
                Command::ApplyPingResult(pending, alive) => {
                    if !alive {
                        self.handle_report_timeout(pending.oldest.node_id);
                    }
                    self.routing.apply_ping_result(pending, alive);
                }
                Command::GetRepublishSet(reply) => {
                    let _ = reply.send((self.store.owned_items(), self.store.live_cached_items()));
                }
                Command::ExpireItems => {
                    let removed = self.store.expire();
                    if removed > 0 {
                        debug!(removed, remaining = self.store.len(), "expired cached items");
                    }
                }
                Command::Quit => {
                    debug!(node = %self.id.short(), "dht actor stopping");
                    break;
                }
            }
        }
    }

    fn handle_observe_contact(&mut self, contact: Contact) {
        if contact.node_id == self.id || self.reputation.is_blocked(&contact.node_id) {
            return;
        }
        if !contact.is_usable() {
            trace!(peer = %contact.node_id.short(), "ignoring contact with bad id binding");
            return;
        }
        self.reputation.observe(contact.node_id, Some(&contact.addr));

        if let Some(update) = self.routing.update_with_pending(contact) {
            let network = self.network.clone();
            let tx = self.cmd_tx.clone();
            let timeout = self.config.query_timeout;
            tokio::spawn(async move {
                let alive = matches!(
                    tokio::time::timeout(timeout, network.ping(&update.oldest)).await,
                    Ok(Ok(()))
                );
                let _ = tx.send(Command::ApplyPingResult(update, alive)).await;
            });
        }
    }

    fn handle_accept(
        &mut self,
        item: Item,
        source: Source,
        from: Option<NodeId>,
    ) -> Result<Accepted, ItemError> {
        let key = item.key;
        let version = item.version;
        let origin = match source {
            Source::Local if item.public_key == self.public_key => Origin::Local,
            _ => {
                let closer = self.routing.count_closer_than_self(&key);
                let config = &self.config;
                Origin::Remote {
                    ttl: ttl_for_distance(closer, config.k, config.item_ttl, config.min_item_ttl),
                }
            }
        };

        match self.store.accept(item, origin, now_ms()) {
            Ok(accepted) => {
                trace!(key = %key.short(), version, ?accepted, "item accepted");
                Ok(accepted)
            }
            Err(e) => {
                if let Some(peer) = from {
                    self.handle_report_invalid(peer, &e);
                }
                Err(e)
            }
        }
    }

    fn handle_report_invalid(&mut self, peer: NodeId, error: &ItemError) {
        if let InvalidOutcome::Blocked = self.reputation.report_invalid(peer, error) {
            self.routing.remove(&peer);
        }
    }

    fn handle_report_timeout(&mut self, peer: NodeId) {
        if let TimeoutOutcome::Evict = self.reputation.report_timeout(peer) {
            self.routing.remove(&peer);
        }
    }
}
