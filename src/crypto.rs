//! Signing primitives shared by every other module.
//!
//! Drogulus signs everything with Ed25519 and hashes identities with BLAKE3.
//! All signatures are domain separated: the signed bytes are always
//! `domain || payload`, so an item signature can never be replayed as an RPC
//! signature (or the other way round).
//!
//! | Function | Purpose |
//! |----------|---------|
//! | [`generate_key_pair`] | Fresh `(public, secret)` key bytes from the OS RNG |
//! | [`sign`] / [`verify`] | Raw-byte contract used at the node boundary |
//! | [`sign_with_domain`] / [`verify_with_domain`] | Typed helpers used internally |
//! | [`derive_id`] / [`derive_named_id`] | Public key (and optional name) to [`NodeId`] |
//!
//! `verify` is built on `verify_strict`, whose scalar and point arithmetic is
//! constant time in the signature contents. Malformed input makes it return
//! `false`; it never panics.

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::identity::{Keypair, NodeId};

/// Domain for deriving a NodeId from a bare public key.
pub const ID_DOMAIN: &[u8] = b"drogulus-id-v1:";

/// Domain for deriving a namespaced item key from `public key || name`.
pub const NAMED_ID_DOMAIN: &[u8] = b"drogulus-named-id-v1:";

/// Domain for item signatures.
pub const ITEM_SIGNATURE_DOMAIN: &[u8] = b"drogulus-item-v1:";

/// Domain for signatures over outbound RPC requests.
pub const RPC_SIGNATURE_DOMAIN: &[u8] = b"drogulus-rpc-v1:";

/// Domain for the key-material self test.
pub const PROBE_SIGNATURE_DOMAIN: &[u8] = b"drogulus-probe-v1:";

/// Bad caller-supplied key material. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),
}

/// Reason a domain-separated signature did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => {
                write!(f, "public key is not a valid Ed25519 point")
            }
        }
    }
}

impl std::error::Error for SignatureError {}

/// Generate a new key pair, returned as `(public_key, secret_key)` bytes.
pub fn generate_key_pair() -> ([u8; 32], [u8; 32]) {
    let signing_key = SigningKey::generate(&mut OsRng);
    (signing_key.verifying_key().to_bytes(), signing_key.to_bytes())
}

/// Sign `message` with a raw 32-byte Ed25519 secret key.
///
/// Fails with [`KeyError::InvalidKey`] when the secret is not exactly 32 bytes.
pub fn sign(secret_key: &[u8], message: &[u8]) -> Result<[u8; 64], KeyError> {
    let keypair = Keypair::from_secret_slice(secret_key)?;
    Ok(keypair.sign(message).to_bytes())
}

/// Verify `signature` over `message` against a raw public key.
///
/// Returns `false` for any malformed input (wrong lengths, a public key that is
/// not a curve point, non-canonical signatures) instead of raising.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(public_key) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key.verify_strict(message, &sig).is_ok()
}

/// Derive the NodeId owned by `public_key`.
///
/// Peers are addressed by this id, and an un-namespaced item published by the
/// key lives at this id.
pub fn derive_id(public_key: &[u8; 32]) -> NodeId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ID_DOMAIN);
    hasher.update(public_key);
    NodeId::from_bytes(*hasher.finalize().as_bytes())
}

/// Derive the key of a namespaced item: one public key owns one key per name.
///
/// The name is length prefixed so `("ab", key)` and `("a", key')` can never
/// collide by shifting bytes between the fields.
pub fn derive_named_id(public_key: &[u8; 32], name: &str) -> NodeId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(NAMED_ID_DOMAIN);
    hasher.update(public_key);
    hasher.update(&(name.len() as u64).to_le_bytes());
    hasher.update(name.as_bytes());
    NodeId::from_bytes(*hasher.finalize().as_bytes())
}

/// Sign data with domain separation.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> [u8; 64] {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes()
}

/// Verify a domain-separated signature.
///
/// Reconstructs `domain || data` and checks it with `verify_strict`.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }

    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}
