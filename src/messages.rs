//! Wire format.
//!
//! Every request travels in an [`RpcRequest`] envelope carrying:
//!
//! - a correlation id, echoed in the matching [`RpcResponse`];
//! - the sender's [`Contact`] (node id, public key, address);
//! - a signature by the sender over the correlation id, its contact and the body.
//!
//! Encoding is bincode with fixed-width integers. Decoding always goes through
//! [`deserialize_bounded`] so a hostile length prefix can't make us allocate
//! without limit.
//!
//! ## Limits
//!
//! - `MAX_VALUE_SIZE`: largest item value accepted (1 MiB)
//! - `MAX_CONTACTS_PER_RESPONSE`: contacts honoured in a single response
//! - `MAX_MESSAGE_SIZE`: largest encoded frame

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{RPC_SIGNATURE_DOMAIN, SignatureError, sign_with_domain, verify_with_domain};
use crate::identity::{Contact, Keypair, NodeId};
use crate::item::Item;

/// Largest item value that will be stored or relayed.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Contacts beyond this count in one response are ignored.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 64;

/// Largest encoded frame: one maximal value plus envelope and contact overhead.
pub const MAX_MESSAGE_SIZE: usize = MAX_VALUE_SIZE + 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_message<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    FindNode,
    FindValue,
    Store,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    FindNode { target: NodeId },
    FindValue { key: NodeId },
    Store { item: Item },
}

impl DhtRequest {
    pub fn kind(&self) -> MessageKind {
        match self {
            DhtRequest::Ping => MessageKind::Ping,
            DhtRequest::FindNode { .. } => MessageKind::FindNode,
            DhtRequest::FindValue { .. } => MessageKind::FindValue,
            DhtRequest::Store { .. } => MessageKind::Store,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtResponse {
    /// Carries the responder's contact so a peer known only by address can be
    /// added to routing.
    Pong(Contact),
    Nodes(Vec<Contact>),
    Value(Item),
    Stored,
    Rejected { reason: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub correlation_id: u64,
    pub from: Contact,
    pub body: DhtRequest,
    pub signature: Vec<u8>,
}

impl RpcRequest {
    pub fn new_signed(
        keypair: &Keypair,
        from: Contact,
        correlation_id: u64,
        body: DhtRequest,
    ) -> Result<Self, bincode::Error> {
        let payload = Self::signed_payload(correlation_id, &from, &body)?;
        let signature = sign_with_domain(keypair, RPC_SIGNATURE_DOMAIN, &payload).to_vec();
        Ok(Self {
            correlation_id,
            from,
            body,
            signature,
        })
    }

    pub fn sender_id(&self) -> NodeId {
        self.from.node_id
    }

    /// Check the sender's contact binding and the request signature.
    pub fn verify(&self) -> Result<(), SignatureError> {
        if !self.from.verify_binding() {
            return Err(SignatureError::InvalidPublicKey);
        }
        let payload = Self::signed_payload(self.correlation_id, &self.from, &self.body)
            .map_err(|_| SignatureError::VerificationFailed)?;
        verify_with_domain(&self.from.public_key, RPC_SIGNATURE_DOMAIN, &payload, &self.signature)
    }

    fn signed_payload(
        correlation_id: u64,
        from: &Contact,
        body: &DhtRequest,
    ) -> Result<Vec<u8>, bincode::Error> {
        let body = serialize_message(body)?;
        let addr = from.addr.as_bytes();
        let mut data = Vec::with_capacity(8 + 32 + 4 + addr.len() + body.len());
        data.extend_from_slice(&correlation_id.to_le_bytes());
        data.extend_from_slice(from.node_id.as_bytes());
        data.extend_from_slice(&(addr.len() as u32).to_le_bytes());
        data.extend_from_slice(addr);
        data.extend_from_slice(&body);
        Ok(data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub correlation_id: u64,
    pub body: DhtResponse,
}
