//! Per-peer misbehaviour tracking.
//!
//! Purely local state: every node decides on its own whom to ignore. Honest
//! nodes that see the same forgeries converge on blocking the same peers.
//!
//! Two independent counters per peer, each over a sliding time window:
//!
//! - **invalid items**: forged or corrupted items the peer relayed. More than
//!   `invalid_threshold` inside the window blocks the peer permanently.
//! - **timeouts**: unanswered queries, each worth `timeout_weight`. Enough of
//!   them evicts the peer from the routing table, but never blocks it.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::identity::NodeId;
use crate::item::ItemError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReputationConfig {
    /// Invalid items tolerated inside `window`; one more blocks the peer.
    pub invalid_threshold: usize,
    pub window: Duration,
    /// Weight of one timeout relative to one invalid item.
    pub timeout_weight: f64,
    /// Weighted timeout score at which the peer is dropped from routing.
    pub timeout_eviction_score: f64,
    /// Unblocked peers tracked at once; least recently seen are forgotten.
    pub max_tracked_peers: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            invalid_threshold: 3,
            window: Duration::from_secs(10 * 60),
            timeout_weight: 0.25,
            timeout_eviction_score: 2.0,
            max_tracked_peers: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub address: Option<String>,
    pub last_seen: Instant,
    /// Invalid (forged) items ever reported against the peer.
    pub failure_count: u32,
    pub timeout_count: u32,
    /// Stale, expired or oversized copies relayed; informational only.
    pub stale_count: u32,
    pub blocked: bool,
    invalid_window: VecDeque<Instant>,
    timeout_window: VecDeque<Instant>,
}

impl PeerRecord {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            address: None,
            last_seen: Instant::now(),
            failure_count: 0,
            timeout_count: 0,
            stale_count: 0,
            blocked: false,
            invalid_window: VecDeque::new(),
            timeout_window: VecDeque::new(),
        }
    }

    fn trim(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(front) = self.invalid_window.front() {
            if now.duration_since(*front) > window {
                self.invalid_window.pop_front();
            } else {
                break;
            }
        }
        while let Some(front) = self.timeout_window.front() {
            if now.duration_since(*front) > window {
                self.timeout_window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Invalid items inside the current window.
    pub fn recent_invalid(&self) -> usize {
        self.invalid_window.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidOutcome {
    /// Counted; the peer stays usable.
    Recorded,
    /// Not evidence of forgery; noted but not counted toward blocking.
    Tolerated,
    /// This report crossed the threshold.
    Blocked,
    AlreadyBlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    Recorded,
    /// Weighted timeouts reached the eviction score.
    Evict,
}

pub struct ReputationTracker {
    records: LruCache<NodeId, PeerRecord>,
    /// Blocked ids live outside the LRU so that blocking is never forgotten.
    blocked: HashSet<NodeId>,
    config: ReputationConfig,
}

impl ReputationTracker {
    pub fn new(config: ReputationConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_tracked_peers).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: LruCache::new(capacity),
            blocked: HashSet::new(),
            config,
        }
    }

    fn record_mut(&mut self, node_id: NodeId) -> &mut PeerRecord {
        self.records.get_or_insert_mut(node_id, || PeerRecord::new(node_id))
    }

    /// Note any interaction with a peer.
    pub fn observe(&mut self, node_id: NodeId, address: Option<&str>) {
        let record = self.record_mut(node_id);
        record.last_seen = Instant::now();
        if let Some(addr) = address {
            record.address = Some(addr.to_owned());
        }
    }

    pub fn report_invalid(&mut self, node_id: NodeId, error: &ItemError) -> InvalidOutcome {
        if self.blocked.contains(&node_id) {
            return InvalidOutcome::AlreadyBlocked;
        }
        let window = self.config.window;
        let threshold = self.config.invalid_threshold;
        let record = self.record_mut(node_id);
        record.last_seen = Instant::now();

        if !error.is_forgery() {
            record.stale_count = record.stale_count.saturating_add(1);
            return InvalidOutcome::Tolerated;
        }

        record.failure_count = record.failure_count.saturating_add(1);
        record.invalid_window.push_back(Instant::now());
        record.trim(window);
        let recent = record.recent_invalid();

        if recent > threshold {
            record.blocked = true;
            self.blocked.insert(node_id);
            warn!(
                peer = %node_id.short(),
                recent,
                threshold,
                error = %error,
                "blocking peer after repeated invalid items"
            );
            InvalidOutcome::Blocked
        } else {
            debug!(peer = %node_id.short(), recent, error = %error, "invalid item reported");
            InvalidOutcome::Recorded
        }
    }

    pub fn report_timeout(&mut self, node_id: NodeId) -> TimeoutOutcome {
        let window = self.config.window;
        let weight = self.config.timeout_weight;
        let eviction = self.config.timeout_eviction_score;
        let record = self.record_mut(node_id);

        record.timeout_count = record.timeout_count.saturating_add(1);
        record.timeout_window.push_back(Instant::now());
        record.trim(window);

        let score = record.timeout_window.len() as f64 * weight;
        if score >= eviction {
            record.timeout_window.clear();
            debug!(
                peer = %node_id.short(),
                score,
                "peer timing out repeatedly, evicting from routing"
            );
            TimeoutOutcome::Evict
        } else {
            TimeoutOutcome::Recorded
        }
    }

    /// A successful exchange clears the peer's pending timeouts.
    pub fn report_success(&mut self, node_id: NodeId) {
        let record = self.record_mut(node_id);
        record.last_seen = Instant::now();
        record.timeout_window.clear();
    }

    pub fn is_blocked(&self, node_id: &NodeId) -> bool {
        self.blocked.contains(node_id)
    }

    pub fn record(&self, node_id: &NodeId) -> Option<PeerRecord> {
        match self.records.peek(node_id) {
            Some(record) => Some(record.clone()),
            None if self.blocked.contains(node_id) => {
                let mut record = PeerRecord::new(*node_id);
                record.blocked = true;
                Some(record)
            }
            None => None,
        }
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 32])
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_forgery_in_window_blocks() {
        let mut tracker = ReputationTracker::new(ReputationConfig::default());
        let p = peer(1);

        for _ in 0..3 {
            assert_eq!(
                tracker.report_invalid(p, &ItemError::BadSignature),
                InvalidOutcome::Recorded
            );
        }
        assert!(!tracker.is_blocked(&p));
        assert_eq!(tracker.report_invalid(p, &ItemError::BadSignature), InvalidOutcome::Blocked);
        assert!(tracker.is_blocked(&p));
        assert_eq!(
            tracker.report_invalid(p, &ItemError::BadKeyBinding),
            InvalidOutcome::AlreadyBlocked
        );

        let record = tracker.record(&p).expect("tracked");
        assert!(record.blocked);
        assert_eq!(record.failure_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn forgeries_outside_window_age_out() {
        let mut tracker = ReputationTracker::new(ReputationConfig::default());
        let p = peer(2);

        for _ in 0..3 {
            tracker.report_invalid(p, &ItemError::BadSignature);
        }
        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        assert_eq!(tracker.report_invalid(p, &ItemError::BadSignature), InvalidOutcome::Recorded);
        assert!(!tracker.is_blocked(&p));
        assert_eq!(tracker.record(&p).map(|r| r.recent_invalid()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_and_expired_items_never_block() {
        let mut tracker = ReputationTracker::new(ReputationConfig::default());
        let p = peer(3);
        for _ in 0..10 {
            assert_eq!(
                tracker.report_invalid(p, &ItemError::Stale { cached: 2, offered: 1 }),
                InvalidOutcome::Tolerated
            );
            tracker.report_invalid(p, &ItemError::Expired { timestamp: 0, now: 1 });
        }
        assert!(!tracker.is_blocked(&p));
        assert_eq!(tracker.record(&p).map(|r| r.stale_count), Some(20));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_evict_but_never_block() {
        let mut tracker = ReputationTracker::new(ReputationConfig::default());
        let p = peer(4);

        for _ in 0..7 {
            assert_eq!(tracker.report_timeout(p), TimeoutOutcome::Recorded);
        }
        assert_eq!(tracker.report_timeout(p), TimeoutOutcome::Evict);
        assert!(!tracker.is_blocked(&p));
        assert_eq!(tracker.record(&p).map(|r| r.timeout_count), Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_timeout_score() {
        let mut tracker = ReputationTracker::new(ReputationConfig::default());
        let p = peer(5);

        for _ in 0..7 {
            tracker.report_timeout(p);
        }
        tracker.report_success(p);
        assert_eq!(tracker.report_timeout(p), TimeoutOutcome::Recorded);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_survives_record_eviction() {
        let config = ReputationConfig {
            max_tracked_peers: 2,
            ..ReputationConfig::default()
        };
        let mut tracker = ReputationTracker::new(config);
        let bad = peer(6);
        for _ in 0..4 {
            tracker.report_invalid(bad, &ItemError::BadSignature);
        }
        for byte in 10..20 {
            tracker.observe(peer(byte), Some("127.0.0.1:1"));
        }
        assert!(tracker.is_blocked(&bad));
        assert!(tracker.record(&bad).is_some_and(|r| r.blocked));
        assert_eq!(tracker.blocked_count(), 1);
    }

    #[tokio::test]
    async fn observe_tracks_address() {
        let mut tracker = ReputationTracker::new(ReputationConfig::default());
        let p = peer(7);
        tracker.observe(p, Some("10.0.0.1:4000"));
        tracker.observe(p, None);
        assert_eq!(tracker.record(&p).and_then(|r| r.address), Some("10.0.0.1:4000".into()));
    }
}
