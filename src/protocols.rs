//! Trait seams between the DHT core and its collaborators.
//!
//! | Trait | Direction | Purpose |
//! |-------|-----------|---------|
//! | [`DhtNodeRpc`] | core → transport | Outbound PING / FIND_NODE / FIND_VALUE / STORE |
//! | [`ItemApi`] | execution layer → core | `get` / `put` over signed items |
//!
//! The core depends only on these traits. The TCP transport in `rpc` is one
//! implementation of [`DhtNodeRpc`]; tests use an in-memory one.

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::identity::{Contact, NodeId};
use crate::dht::PutError;
use crate::item::Item;

/// Answer to a FIND_VALUE query.
#[derive(Debug, Clone)]
pub enum FindValueResult {
    Found(Item),
    Closer(Vec<Contact>),
}

/// A request the transport could not encode. It never left this node, so the
/// addressed peer is not at fault.
#[derive(Debug, Error)]
#[error("request could not be encoded: {0}")]
pub struct EncodeError(String);

impl EncodeError {
    pub fn new(reason: impl std::fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// Whether a transport error happened before anything was sent.
pub(crate) fn is_local_failure(error: &anyhow::Error) -> bool {
    error.downcast_ref::<EncodeError>().is_some()
}

/// Outbound DHT operations. Errors are network-level (unreachable, timed out,
/// malformed reply) and are treated as soft failures by the caller, except
/// for an [`EncodeError`], which is never charged to the peer.
#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    /// Ping a node to check liveness.
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// Find the k closest nodes the peer knows to `target`.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Ask for the item at `key`, or closer nodes if the peer doesn't hold it.
    async fn find_value(&self, to: &Contact, key: NodeId) -> Result<FindValueResult>;

    /// Offer an item. `Ok(false)` means the peer answered but rejected it.
    async fn store(&self, to: &Contact, item: Item) -> Result<bool>;
}

/// The only surface the execution layer sees. It never calls back into the
/// core through any other path.
#[async_trait]
pub trait ItemApi: Send + Sync {
    /// Local copy if present, otherwise a network value lookup. Lookup failures
    /// read as "not found".
    async fn get(&self, key: &NodeId) -> Option<Item>;

    /// Validate, store locally and propagate to the k closest peers. A
    /// rejected item surfaces as `PutError::Item` with the precise reason.
    async fn put(&self, item: Item) -> Result<(), PutError>;
}
