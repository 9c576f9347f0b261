//! Kademlia routing table.
//!
//! `NodeId::BITS` buckets; bucket `i` holds peers whose XOR distance to the
//! local id has its highest set bit at position `i` (counting from the least
//! significant bit), i.e. distances in `[2^i, 2^(i+1))`. Bucket 255 covers the
//! half of the id space farthest from us.
//!
//! Each bucket keeps at most `k` contacts ordered from least to most recently
//! seen. When a bucket is full the least recently seen contact is pinged by the
//! owner of the table; see [`PendingBucketUpdate`].

use std::collections::{BinaryHeap, HashSet};

use tokio::time::{Duration, Instant};

use crate::identity::{Contact, NodeId, distance_cmp};

#[derive(Debug, Clone)]
struct RoutingBucket {
    index: usize,
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

#[derive(Debug)]
pub(crate) enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full {
        new_contact: Box<Contact>,
        oldest: Box<Contact>,
    },
}

/// A full bucket waiting on a liveness ping of its oldest contact.
#[derive(Clone, Debug)]
pub(crate) struct PendingBucketUpdate {
    pub bucket_index: usize,
    pub oldest: Contact,
    pub new_contact: Contact,
}

impl RoutingBucket {
    fn new(index: usize) -> Self {
        Self {
            index,
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    /// Whether `distance` falls in this bucket's `[2^i, 2^(i+1))` range.
    fn key_in_range(&self, distance: &[u8; 32]) -> bool {
        highest_bit(distance) == Some(self.index)
    }

    fn touch(&mut self, contact: Contact, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.node_id == contact.node_id) {
            self.contacts.remove(pos);
            // Latest observation wins; the address may have changed.
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Inserted;
        }

        match self.contacts.first().cloned() {
            Some(oldest) => BucketTouchOutcome::Full {
                new_contact: Box::new(contact),
                oldest: Box::new(oldest),
            },
            // k == 0: nothing can ever be stored.
            None => BucketTouchOutcome::Refreshed,
        }
    }

    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.node_id == id) {
            let existing = self.contacts.remove(pos);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.node_id == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }

    /// Up to `count` contacts (all of them for `count == 0`), most recently
    /// seen first, skipping `exclude`.
    fn get_contacts(&self, count: usize, exclude: Option<&NodeId>) -> Vec<Contact> {
        let limit = if count == 0 { self.contacts.len() } else { count };
        self.contacts
            .iter()
            .rev()
            .filter(|c| Some(&c.node_id) != exclude)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Position of the highest set bit of a big-endian 256-bit distance, counting
/// from the least significant bit. `None` for a zero distance.
fn highest_bit(distance: &[u8; 32]) -> Option<usize> {
    for (byte_idx, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let from_msb = byte_idx * 8 + byte.leading_zeros() as usize;
            return Some(NodeId::BITS - 1 - from_msb);
        }
    }
    None
}

pub(crate) fn bucket_index(self_id: &NodeId, other: &NodeId) -> Option<usize> {
    highest_bit(&self_id.xor_distance(other))
}

/// Random id whose distance to `self_id` lands in bucket `bucket_idx`.
pub(crate) fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let self_bytes = self_id.as_bytes();
    let bucket_idx = bucket_idx.min(NodeId::BITS - 1);

    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_bytes[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    let from_msb = NodeId::BITS - 1 - bucket_idx;
    let byte_idx = from_msb / 8;
    let bit_pos = from_msb % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_bytes[i] ^ distance[i];
    }

    NodeId::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<RoutingBucket>,
    /// Buckets with a liveness ping in flight. Newcomers for these buckets
    /// are dropped until the ping resolves.
    pending_pings: HashSet<usize>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let buckets = (0..NodeId::BITS).map(RoutingBucket::new).collect();
        Self {
            self_id,
            k,
            buckets,
            pending_pings: HashSet::new(),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn update(&mut self, contact: Contact) {
        let _ = self.update_with_pending(contact);
    }

    /// Record that `contact` was seen. Returns a pending update when the
    /// contact's bucket is full and its oldest entry must be pinged.
    pub(crate) fn update_with_pending(&mut self, contact: Contact) -> Option<PendingBucketUpdate> {
        if contact.node_id == self.self_id || !contact.is_usable() {
            return None;
        }
        let idx = bucket_index(&self.self_id, &contact.node_id)?;
        let bucket = &mut self.buckets[idx];
        debug_assert!(bucket.key_in_range(&self.self_id.xor_distance(&contact.node_id)));
        match bucket.touch(contact, self.k) {
            BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => None,
            BucketTouchOutcome::Full {
                new_contact,
                oldest,
            } => {
                if !self.pending_pings.insert(idx) {
                    return None;
                }
                Some(PendingBucketUpdate {
                    bucket_index: idx,
                    oldest: *oldest,
                    new_contact: *new_contact,
                })
            }
        }
    }

    /// The `k` known contacts closest to `target`, nearest first.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Contact> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistContact {
            dist: [u8; 32],
            contact: Contact,
        }

        impl Ord for DistContact {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistContact {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistContact> = BinaryHeap::with_capacity(k + 1);

        for bucket in &self.buckets {
            for contact in &bucket.contacts {
                let dist = contact.node_id.xor_distance(target);

                if heap.len() < k {
                    heap.push(DistContact { dist, contact: contact.clone() });
                } else if let Some(max_entry) = heap.peek()
                    && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
                {
                    heap.push(DistContact { dist, contact: contact.clone() });
                    heap.pop();
                }
            }
        }

        let mut result: Vec<_> = heap.into_sorted_vec().into_iter().map(|dc| dc.contact).collect();
        result.truncate(k);
        result
    }

    /// Number of known contacts strictly closer to `key` than the local node.
    pub fn count_closer_than_self(&self, key: &NodeId) -> usize {
        let own = self.self_id.xor_distance(key);
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .filter(|c| {
                distance_cmp(&c.node_id.xor_distance(key), &own) == std::cmp::Ordering::Less
            })
            .count()
    }

    pub(crate) fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        self.pending_pings.remove(&pending.bucket_index);
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.node_id);
            return;
        }

        let _ = bucket.remove(&pending.oldest.node_id);
        let already_present = bucket
            .contacts
            .iter()
            .any(|contact| contact.node_id == pending.new_contact.node_id);
        if already_present {
            return;
        }
        if bucket.contacts.len() < self.k {
            bucket.contacts.push(pending.new_contact);
            bucket.mark_refreshed();
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        match bucket_index(&self.self_id, id) {
            Some(idx) => self.buckets[idx].remove(id),
            None => false,
        }
    }

    pub(crate) fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .filter(|bucket| !bucket.contacts.is_empty() && bucket.is_stale(threshold))
            .map(|bucket| bucket.index)
            .collect()
    }

    pub(crate) fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }

    pub fn lookup_contact(&self, id: &NodeId) -> Option<Contact> {
        let idx = bucket_index(&self.self_id, id)?;
        self.buckets[idx]
            .contacts
            .iter()
            .find(|c| c.node_id == *id)
            .cloned()
    }

    /// Contacts from one bucket, most recently seen first.
    pub fn bucket_contacts(
        &self,
        bucket_idx: usize,
        count: usize,
        exclude: Option<&NodeId>,
    ) -> Vec<Contact> {
        self.buckets
            .get(bucket_idx)
            .map(|b| b.get_contacts(count, exclude))
            .unwrap_or_default()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets.iter().flat_map(|b| b.contacts.iter().cloned()).collect()
    }
}
