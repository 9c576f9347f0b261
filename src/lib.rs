//! # Drogulus - Signed-Item Kademlia DHT
//!
//! Drogulus stores self-authenticating items in a Kademlia distributed hash
//! table. Every item carries its owner's public key and an Ed25519 signature,
//! so any node can check an item without trusting the peer that relayed it.
//!
//! - **Identity**: Ed25519 keypairs; node ids are BLAKE3 digests of the public key
//! - **Items**: signed, versioned, timestamped values bound to their key
//! - **DHT**: XOR-metric routing, iterative lookups, replication to the k closest
//! - **Reputation**: peers relaying forgeries are blocked, slow peers evicted
//!
//! ## Architecture
//!
//! The DHT uses the **Actor Pattern** for its mutable state:
//! - [`DhtNode`] is a cheap-to-clone handle that runs lookups on the caller's task
//! - A single actor task owns the routing table, item cache and reputation tracker
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: bind, bootstrap, publish, get |
//! | `crypto` | Key generation, signing, id derivation |
//! | `identity` | Keypairs, NodeIds, Contacts |
//! | `item` | Signed items and their validation |
//! | `routing` | k-bucket routing table |
//! | `storage` | Bounded item cache with expiry |
//! | `reputation` | Per-peer misbehaviour tracking |
//! | `dht` | Lookups, replication, republish, inbound handlers |
//! | `protocols` | Trait seams (`DhtNodeRpc`, `ItemApi`) |
//! | `rpc` | TCP transport implementing `DhtNodeRpc` |
//! | `messages` | Wire types and bounded encoding |

mod crypto;
mod dht;
mod identity;
mod item;
mod messages;
mod node;
mod protocols;
mod reputation;
mod routing;
mod rpc;
mod storage;

pub use crypto::{KeyError, derive_id, derive_named_id, generate_key_pair, sign, verify};
pub use dht::{
    DhtConfig, DhtNode, LookupError, LookupResult, LookupState, PublishError, PutError,
    RepublishStats, StoreOutcome, TelemetrySnapshot, DEFAULT_ALPHA, DEFAULT_K,
};
pub use identity::{Contact, Keypair, NodeId, distance_cmp};
pub use item::{ContentType, FreshnessPolicy, Item, ItemError, validate};
pub use messages::{DhtRequest, DhtResponse, MAX_VALUE_SIZE};
pub use node::Node;
pub use protocols::{DhtNodeRpc, EncodeError, FindValueResult, ItemApi};
pub use reputation::{PeerRecord, ReputationConfig};
pub use rpc::RpcNode;
