//! Local item cache.
//!
//! Two tiers:
//!
//! - **owned** items are signed with this node's own key. They never expire
//!   locally; the owner re-signs and republishes them on every tick.
//! - **cached** items arrived from peers. They live in a bounded LRU and carry
//!   an expiry derived from how close this node is to the item's key.
//!
//! Every insert goes through [`crate::item::validate`] against the copy
//! already held for the key, so a lower version can never replace a higher
//! one and an invalid item is never stored.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::identity::NodeId;
use crate::item::{FreshnessPolicy, Item, ItemError, validate};

/// Default number of peer-supplied items kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Clone)]
struct CachedItem {
    item: Item,
    expires_at: Instant,
}

/// Where an item being accepted came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Signed with this node's own key.
    Local,
    /// Received from a peer; kept for `ttl` unless refreshed.
    Remote { ttl: Duration },
}

/// Effect of a successful [`ItemStore::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Inserted,
    Replaced { previous_version: u64 },
}

pub struct ItemStore {
    owned: HashMap<NodeId, Item>,
    cached: LruCache<NodeId, CachedItem>,
    policy: FreshnessPolicy,
}

impl ItemStore {
    pub fn new(capacity: usize, policy: FreshnessPolicy) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            owned: HashMap::new(),
            cached: LruCache::new(capacity),
            policy,
        }
    }

    /// Validate `item` against the current copy and store it on success.
    ///
    /// An owned key stays owned when a newer version arrives from a peer.
    pub fn accept(
        &mut self,
        item: Item,
        origin: Origin,
        now_ms: u64,
    ) -> Result<Accepted, ItemError> {
        let key = item.key;
        let current = self.peek(&key).cloned();
        validate(&item, current.as_ref(), &self.policy, now_ms)?;

        let outcome = match &current {
            Some(prev) => Accepted::Replaced { previous_version: prev.version },
            None => Accepted::Inserted,
        };

        if self.owned.contains_key(&key) || origin == Origin::Local {
            self.cached.pop(&key);
            self.owned.insert(key, item);
            return Ok(outcome);
        }

        let Origin::Remote { ttl } = origin else {
            return Ok(outcome);
        };
        let mut expires_at = Instant::now() + ttl;
        if let Some(existing) = self.cached.peek(&key) {
            expires_at = expires_at.max(existing.expires_at);
        }
        if let Some((evicted, _)) = self.cached.push(key, CachedItem { item, expires_at })
            && evicted != key
        {
            trace!(key = %evicted.short(), "item cache full, evicted least recently used");
        }
        Ok(outcome)
    }

    /// Current copy for `key`, counting an expired cache entry as absent.
    pub fn get(&mut self, key: &NodeId) -> Option<Item> {
        if let Some(item) = self.owned.get(key) {
            return Some(item.clone());
        }
        let expired = match self.cached.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.item.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.cached.pop(key);
        }
        None
    }

    fn peek(&self, key: &NodeId) -> Option<&Item> {
        self.owned
            .get(key)
            .or_else(|| self.cached.peek(key).map(|entry| &entry.item))
    }

    pub fn is_owned(&self, key: &NodeId) -> bool {
        self.owned.contains_key(key)
    }

    /// Drop cached items past their expiry. Returns how many were removed.
    pub fn expire(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<NodeId> = self
            .cached
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.cached.pop(key);
        }
        expired.len()
    }

    pub fn owned_items(&self) -> Vec<Item> {
        self.owned.values().cloned().collect()
    }

    /// Cached items that have not yet expired.
    pub fn live_cached_items(&self) -> Vec<Item> {
        let now = Instant::now();
        self.cached
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(_, entry)| entry.item.clone())
            .collect()
    }

    pub fn owned_len(&self) -> usize {
        self.owned.len()
    }

    pub fn cached_len(&self) -> usize {
        self.cached.len()
    }

    pub fn len(&self) -> usize {
        self.owned.len() + self.cached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Expiry for a peer-supplied item.
///
/// Full `base` TTL while fewer than `k` known peers are closer to the key than
/// we are; halved for every further `k` closer peers, never below `min`.
pub fn ttl_for_distance(closer_peers: usize, k: usize, base: Duration, min: Duration) -> Duration {
    let k = k.max(1);
    let halvings = (closer_peers / k).min(31) as u32;
    let ttl = base / 2u32.pow(halvings);
    ttl.max(min)
}
