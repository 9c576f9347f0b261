//! Signed, versioned items: the unit of storage in the DHT.
//!
//! An [`Item`] is bound to its publisher twice over:
//!
//! 1. its key is derived from the publisher's public key (optionally plus a
//!    name), so nobody else can produce a key in that key space;
//! 2. its signature covers the canonical encoding of every field a reader
//!    relies on.
//!
//! [`validate`] checks both, then freshness, then ordering against whatever
//! version is already cached. Failures are precise ([`ItemError`]) so the
//! caller can turn them into reputation reports against the peer that sent
//! the item.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{
    derive_id, derive_named_id, sign_with_domain, verify_with_domain, ITEM_SIGNATURE_DOMAIN,
};
use crate::identity::{Keypair, NodeId, now_ms};
use crate::messages::MAX_VALUE_SIZE;

/// Longest accepted item name (namespaced keys).
pub const MAX_NAME_LEN: usize = 256;

/// Longest accepted content-type label.
pub const MAX_CONTENT_TYPE_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    /// The key is not derived from the item's public key (and name).
    #[error("item key is not bound to its public key")]
    BadKeyBinding,
    /// The signature does not cover the item's canonical encoding.
    #[error("item signature does not verify")]
    BadSignature,
    /// The timestamp is outside the accepted clock window.
    #[error("item timestamp {timestamp} is outside the accepted window (now {now})")]
    Expired { timestamp: u64, now: u64 },
    /// A newer copy of this key is already cached.
    #[error("item version {offered} is older than cached version {cached}")]
    Stale { cached: u64, offered: u64 },
    /// The value is larger than any node stores or relays.
    #[error("item value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge { size: usize, max: usize },
}

impl ItemError {
    /// Whether relaying an item that failed this way is evidence of forgery or
    /// corruption. Stale and expired copies are ordinary under eventual
    /// consistency and are not held against the sender, and neither is an
    /// oversized value.
    pub fn is_forgery(&self) -> bool {
        matches!(self, ItemError::BadKeyBinding | ItemError::BadSignature)
    }
}

/// Opaque content-type tag. The DHT never interprets the value; the tag is
/// carried (and signed) for the layer above.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentType(String);

impl ContentType {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn binary() -> Self {
        Self::new("application/octet-stream")
    }

    pub fn text() -> Self {
        Self::new("text/plain; charset=utf-8")
    }

    pub fn json() -> Self {
        Self::new("application/json")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContentType {
    fn default() -> Self {
        Self::binary()
    }
}

/// Clock window an item's timestamp must fall inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    /// How far ahead of the local clock a timestamp may be.
    pub max_future_skew: Duration,
    /// How old a timestamp may be. Owners re-sign on republish, so live items
    /// never reach this.
    pub max_age: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            max_future_skew: Duration::from_secs(5 * 60),
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub key: NodeId,
    /// Present for namespaced items, where `key = derive_named_id(public_key, name)`.
    pub name: Option<String>,
    pub value: Vec<u8>,
    pub content_type: ContentType,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
    /// Milliseconds since the Unix epoch, as claimed by the signer.
    pub timestamp: u64,
    pub version: u64,
}

impl Item {
    /// Create and sign an item owned by `keypair`, timestamped now.
    pub fn sign_new(
        keypair: &Keypair,
        name: Option<&str>,
        value: Vec<u8>,
        content_type: ContentType,
        version: u64,
    ) -> Self {
        Self::sign_at(keypair, name, value, content_type, version, now_ms())
    }

    pub fn sign_at(
        keypair: &Keypair,
        name: Option<&str>,
        value: Vec<u8>,
        content_type: ContentType,
        version: u64,
        timestamp: u64,
    ) -> Self {
        let public_key = keypair.public_key_bytes();
        let name = name.map(str::to_owned);
        let key = Self::key_for(&public_key, name.as_deref());
        let mut item = Self {
            key,
            name,
            value,
            content_type,
            public_key,
            signature: Vec::new(),
            timestamp,
            version,
        };
        item.signature =
            sign_with_domain(keypair, ITEM_SIGNATURE_DOMAIN, &item.signed_payload()).to_vec();
        item
    }

    /// Sign a successor of this item with a strictly greater version.
    pub fn next_version(&self, keypair: &Keypair, value: Vec<u8>) -> Result<Self, ItemError> {
        if keypair.public_key_bytes() != self.public_key {
            return Err(ItemError::BadKeyBinding);
        }
        Ok(Self::sign_new(
            keypair,
            self.name.as_deref(),
            value,
            self.content_type.clone(),
            self.version.saturating_add(1),
        ))
    }

    /// Re-sign the same version and value with a fresh timestamp. Used by the
    /// owner when republishing.
    pub fn refreshed(&self, keypair: &Keypair) -> Self {
        Self::sign_new(
            keypair,
            self.name.as_deref(),
            self.value.clone(),
            self.content_type.clone(),
            self.version,
        )
    }

    pub fn key_for(public_key: &[u8; 32], name: Option<&str>) -> NodeId {
        match name {
            Some(name) => derive_named_id(public_key, name),
            None => derive_id(public_key),
        }
    }

    pub fn is_owned_by(&self, keypair: &Keypair) -> bool {
        self.public_key == keypair.public_key_bytes()
    }

    /// Canonical bytes covered by the signature.
    ///
    /// Every variable-length field is length prefixed and integers are
    /// little endian, so no two distinct items share an encoding.
    pub fn signed_payload(&self) -> Vec<u8> {
        let name = self.name.as_deref().unwrap_or("");
        let content_type = self.content_type.as_str().as_bytes();
        let mut data = Vec::with_capacity(
            32 + 8 + 8 + 1 + 3 * 4 + name.len() + content_type.len() + self.value.len(),
        );
        data.extend_from_slice(self.key.as_bytes());
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&(content_type.len() as u32).to_le_bytes());
        data.extend_from_slice(content_type);
        data.push(u8::from(self.name.is_some()));
        data.extend_from_slice(&(name.len() as u32).to_le_bytes());
        data.extend_from_slice(name.as_bytes());
        data.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.value);
        data
    }

    pub fn verify_signature(&self) -> bool {
        verify_with_domain(
            &self.public_key,
            ITEM_SIGNATURE_DOMAIN,
            &self.signed_payload(),
            &self.signature,
        )
        .is_ok()
    }

    fn has_valid_shape(&self) -> bool {
        self.name.as_ref().is_none_or(|n| n.len() <= MAX_NAME_LEN)
            && self.content_type.as_str().len() <= MAX_CONTENT_TYPE_LEN
    }
}

/// Validate `item` against the cached copy at the same key, if any.
///
/// Checks run in a fixed order: value size, key binding, signature, clock
/// window, version. The first failure wins.
pub fn validate(
    item: &Item,
    cached: Option<&Item>,
    policy: &FreshnessPolicy,
    now: u64,
) -> Result<(), ItemError> {
    if item.value.len() > MAX_VALUE_SIZE {
        return Err(ItemError::ValueTooLarge {
            size: item.value.len(),
            max: MAX_VALUE_SIZE,
        });
    }

    let derived = Item::key_for(&item.public_key, item.name.as_deref());
    if !item.has_valid_shape() || derived != item.key {
        return Err(ItemError::BadKeyBinding);
    }

    if !item.verify_signature() {
        return Err(ItemError::BadSignature);
    }

    let max_future = policy.max_future_skew.as_millis() as u64;
    let max_age = policy.max_age.as_millis() as u64;
    if item.timestamp > now.saturating_add(max_future)
        || now.saturating_sub(item.timestamp) > max_age
    {
        return Err(ItemError::Expired {
            timestamp: item.timestamp,
            now,
        });
    }

    if let Some(cached) = cached {
        let older_version = item.version < cached.version;
        let older_refresh = item.version == cached.version && item.timestamp < cached.timestamp;
        if older_version || older_refresh {
            return Err(ItemError::Stale {
                cached: cached.version,
                offered: item.version,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FreshnessPolicy {
        FreshnessPolicy::default()
    }

    fn hello(keypair: &Keypair, version: u64) -> Item {
        Item::sign_new(keypair, None, b"hello".to_vec(), ContentType::text(), version)
    }

    #[test]
    fn freshly_signed_item_validates() {
        let kp = Keypair::generate();
        let item = hello(&kp, 1);
        assert_eq!(item.key, kp.node_id());
        assert_eq!(validate(&item, None, &policy(), now_ms()), Ok(()));
    }

    #[test]
    fn namespaced_item_validates_under_named_key() {
        let kp = Keypair::generate();
        let item = Item::sign_new(&kp, Some("profile"), b"{}".to_vec(), ContentType::json(), 1);
        assert_ne!(item.key, kp.node_id());
        assert_eq!(validate(&item, None, &policy(), now_ms()), Ok(()));
    }

    #[test]
    fn key_not_derived_from_public_key_is_bad_binding() {
        let kp = Keypair::generate();
        let mut item = hello(&kp, 1);
        item.key = Keypair::generate().node_id();
        assert_eq!(validate(&item, None, &policy(), now_ms()), Err(ItemError::BadKeyBinding));
    }

    #[test]
    fn swapping_name_breaks_binding() {
        let kp = Keypair::generate();
        let mut item = Item::sign_new(&kp, Some("a"), b"x".to_vec(), ContentType::binary(), 1);
        item.name = Some("b".into());
        assert_eq!(validate(&item, None, &policy(), now_ms()), Err(ItemError::BadKeyBinding));
    }

    #[test]
    fn another_key_cannot_sign_for_the_key_space() {
        let owner = Keypair::generate();
        let intruder = Keypair::generate();
        let genuine = hello(&owner, 1);

        // Re-signed by the intruder but keeping the owner's key and public key.
        let mut forged = genuine.clone();
        forged.value = b"evil".to_vec();
        forged.signature =
            sign_with_domain(&intruder, ITEM_SIGNATURE_DOMAIN, &forged.signed_payload()).to_vec();
        assert_eq!(validate(&forged, None, &policy(), now_ms()), Err(ItemError::BadSignature));

        // Claiming the intruder's public key moves the item to another key.
        let mut rebound = forged.clone();
        rebound.public_key = intruder.public_key_bytes();
        rebound.signature =
            sign_with_domain(&intruder, ITEM_SIGNATURE_DOMAIN, &rebound.signed_payload()).to_vec();
        assert_eq!(validate(&rebound, None, &policy(), now_ms()), Err(ItemError::BadKeyBinding));
    }

    #[test]
    fn tampering_with_any_signed_field_is_bad_signature() {
        let kp = Keypair::generate();
        let item = hello(&kp, 3);

        let mut value = item.clone();
        value.value.push(b'!');
        let mut version = item.clone();
        version.version = 4;
        let mut timestamp = item.clone();
        timestamp.timestamp -= 1;
        let mut content_type = item.clone();
        content_type.content_type = ContentType::binary();
        let mut garbage = item.clone();
        garbage.signature = vec![1, 2, 3];

        for tampered in [value, version, timestamp, content_type, garbage] {
            assert_eq!(
                validate(&tampered, None, &policy(), now_ms()),
                Err(ItemError::BadSignature)
            );
        }
    }

    #[test]
    fn timestamps_outside_window_are_expired() {
        let kp = Keypair::generate();
        let now = now_ms();
        let at = |timestamp| Item::sign_at(&kp, None, vec![1], ContentType::binary(), 1, timestamp);
        let future = at(now + 10 * 60 * 1000);
        let ancient = at(now - 25 * 60 * 60 * 1000);
        let slightly_ahead = at(now + 60 * 1000);

        assert!(matches!(
            validate(&future, None, &policy(), now),
            Err(ItemError::Expired { .. })
        ));
        assert!(matches!(
            validate(&ancient, None, &policy(), now),
            Err(ItemError::Expired { .. })
        ));
        assert_eq!(validate(&slightly_ahead, None, &policy(), now), Ok(()));
    }

    #[test]
    fn lower_version_than_cached_is_stale() {
        let kp = Keypair::generate();
        let v1 = hello(&kp, 1);
        let v2 = v1.next_version(&kp, b"hello again".to_vec()).unwrap();

        assert_eq!(validate(&v2, Some(&v1), &policy(), now_ms()), Ok(()));
        assert_eq!(
            validate(&v1, Some(&v2), &policy(), now_ms()),
            Err(ItemError::Stale { cached: 2, offered: 1 })
        );
    }

    #[test]
    fn same_item_twice_is_accepted() {
        let kp = Keypair::generate();
        let item = hello(&kp, 1);
        assert_eq!(validate(&item, Some(&item), &policy(), now_ms()), Ok(()));
    }

    #[test]
    fn owner_refresh_replaces_older_timestamp() {
        let kp = Keypair::generate();
        let now = now_ms();
        let old = Item::sign_at(&kp, None, vec![9], ContentType::binary(), 5, now - 60_000);
        let fresh = Item::sign_at(&kp, None, vec![9], ContentType::binary(), 5, now);

        assert_eq!(validate(&fresh, Some(&old), &policy(), now), Ok(()));
        assert!(matches!(
            validate(&old, Some(&fresh), &policy(), now),
            Err(ItemError::Stale { .. })
        ));
    }

    #[test]
    fn binding_is_checked_before_signature() {
        let kp = Keypair::generate();
        let mut item = hello(&kp, 1);
        item.key = NodeId::from_bytes([0u8; 32]);
        item.signature.clear();
        assert_eq!(validate(&item, None, &policy(), now_ms()), Err(ItemError::BadKeyBinding));
    }

    #[test]
    fn oversized_value_is_refused_before_any_crypto() {
        let kp = Keypair::generate();
        let mut item = Item::sign_new(
            &kp,
            None,
            vec![7u8; MAX_VALUE_SIZE + 1],
            ContentType::binary(),
            1,
        );
        assert_eq!(
            validate(&item, None, &policy(), now_ms()),
            Err(ItemError::ValueTooLarge {
                size: MAX_VALUE_SIZE + 1,
                max: MAX_VALUE_SIZE,
            })
        );

        // Size is checked first, even for an item that is also mis-bound.
        item.key = NodeId::from_bytes([0u8; 32]);
        assert!(matches!(
            validate(&item, None, &policy(), now_ms()),
            Err(ItemError::ValueTooLarge { .. })
        ));

        let at_limit =
            Item::sign_new(&kp, None, vec![7u8; MAX_VALUE_SIZE], ContentType::binary(), 1);
        assert_eq!(validate(&at_limit, None, &policy(), now_ms()), Ok(()));
    }

    #[test]
    fn next_version_requires_owner_key() {
        let kp = Keypair::generate();
        let item = hello(&kp, 1);
        assert_eq!(
            item.next_version(&Keypair::generate(), vec![]),
            Err(ItemError::BadKeyBinding)
        );
    }

    #[test]
    fn forgery_classification() {
        assert!(ItemError::BadSignature.is_forgery());
        assert!(ItemError::BadKeyBinding.is_forgery());
        assert!(!ItemError::Stale { cached: 2, offered: 1 }.is_forgery());
        assert!(!ItemError::Expired { timestamp: 0, now: 1 }.is_forgery());
        assert!(!ItemError::ValueTooLarge { size: 2, max: 1 }.is_forgery());
    }
}
