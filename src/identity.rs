//! # Identities and Contacts
//!
//! - [`Keypair`]: Ed25519 signing keypair owned by the local node
//! - [`NodeId`]: 256-bit identifier for peers and item keys
//! - [`Contact`]: how to reach a peer (id, public key, address)
//!
//! ## Identity Model
//!
//! A peer's NodeId is `BLAKE3(domain || public_key)` (see [`crate::crypto::derive_id`]).
//! Because the id is a hash rather than the key itself, every contact carries
//! its public key so that receivers can check the binding before trusting it.
//!
//! ## Invariants
//!
//! - `NodeId::from_bytes(bytes).as_bytes() == bytes`
//! - XOR distance is symmetric and zero only for identical ids
//! - A contact is only usable if `node_id == derive_id(public_key)`

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{
    derive_id, sign_with_domain, verify_with_domain, KeyError, PROBE_SIGNATURE_DOMAIN,
};

/// Longest address string accepted in a contact.
const MAX_ADDR_LEN: usize = 256;

#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Build a keypair from an untrusted byte slice.
    pub fn from_secret_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidKey("secret key must be 32 bytes"))?;
        Ok(Self::from_secret_key_bytes(&secret))
    }

    /// Rebuild a stored keypair, checking that the secret still produces the
    /// public key it was saved with.
    pub fn from_parts(secret: &[u8], public: &[u8]) -> Result<Self, KeyError> {
        let keypair = Self::from_secret_slice(secret)?;
        if keypair.public_key_bytes().as_slice() != public {
            return Err(KeyError::InvalidKey("secret key does not match public key"));
        }
        Ok(keypair)
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        derive_id(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }

    /// Sign and verify a fresh probe. A `false` here means the key material
    /// can no longer produce signatures its own public key accepts.
    pub fn self_test(&self) -> bool {
        let probe = now_ms().to_le_bytes();
        let signature = sign_with_domain(self, PROBE_SIGNATURE_DOMAIN, &probe);
        verify_with_domain(
            &self.public_key_bytes(),
            PROBE_SIGNATURE_DOMAIN,
            &probe,
            &signature,
        )
        .is_ok()
    }

    pub fn create_contact(&self, addr: impl Into<String>) -> Contact {
        Contact {
            node_id: self.node_id(),
            public_key: self.public_key_bytes(),
            addr: addr.into(),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id().to_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Width of the id space in bits; also the number of routing buckets.
    pub const BITS: usize = 256;

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First eight bytes as hex, for log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    pub public_key: [u8; 32],
    pub addr: String,
}

impl Contact {
    /// `node_id` must be the id derived from `public_key`; anything else is a
    /// forged or corrupted contact.
    pub fn verify_binding(&self) -> bool {
        derive_id(&self.public_key) == self.node_id
    }

    /// Bounds check for contacts decoded from the network. Does not check the
    /// id binding; see [`Contact::verify_binding`].
    pub fn validate_structure(&self) -> bool {
        !self.addr.is_empty() && self.addr.len() <= MAX_ADDR_LEN
    }

    pub fn is_usable(&self) -> bool {
        self.validate_structure() && self.verify_binding()
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}
