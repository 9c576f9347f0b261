//! # RPC Layer
//!
//! TCP transport for the DHT. Every call opens one connection, writes one
//! framed [`RpcRequest`], reads one framed [`RpcResponse`] and closes.
//!
//! ## Framing
//!
//! `u32` big-endian length followed by a bincode body. Frames longer than
//! `MAX_MESSAGE_SIZE` are refused before the body is read.
//!
//! ## Security
//!
//! - Requests are signed by the sender over the correlation id, its contact
//!   and the body; the server verifies before dispatching
//! - Requests from blocked peers are dropped before signature verification
//! - Responses must echo the request's correlation id
//! - Contacts in responses are capped and forged bindings are discarded

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use crate::dht::DhtNode;
use crate::identity::{Contact, Keypair, NodeId};
use crate::item::Item;
use crate::messages::{
    deserialize_bounded, serialize_message, DhtRequest, DhtResponse, RpcRequest, RpcResponse,
    MAX_CONTACTS_PER_RESPONSE, MAX_MESSAGE_SIZE, MAX_VALUE_SIZE,
};
use crate::protocols::{DhtNodeRpc, EncodeError, FindValueResult};

/// Deadline for connecting, writing the request and reading the response.
const RPC_STREAM_TIMEOUT: Duration = Duration::from_secs(3);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound connections handled concurrently; further accepts wait.
const MAX_INBOUND_CONNECTIONS: usize = 256;

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).context("frame length overflows u32")?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the declared length was over the limit
/// and nothing past the header was read.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Ok(None);
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub struct RpcNode {
    keypair: Keypair,
    self_contact: Contact,
    next_correlation_id: AtomicU64,
    timeout: Duration,
}

impl RpcNode {
    pub fn new(keypair: Keypair, self_contact: Contact) -> Self {
        Self {
            keypair,
            self_contact,
            next_correlation_id: AtomicU64::new(rand::random()),
            timeout: RPC_STREAM_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn self_contact(&self) -> &Contact {
        &self.self_contact
    }

    pub(crate) async fn rpc(&self, contact: &Contact, request: DhtRequest) -> Result<DhtResponse> {
        self.rpc_addr(&contact.addr, request).await
    }

    async fn rpc_addr(&self, addr: &str, body: DhtRequest) -> Result<DhtResponse> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let kind = body.kind();
        let request =
            RpcRequest::new_signed(&self.keypair, self.self_contact.clone(), correlation_id, body)
                .map_err(EncodeError::new)?;
        let request_bytes = serialize_message(&request).map_err(EncodeError::new)?;

        let response = tokio::time::timeout(self.timeout, async {
            let mut stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;
            write_frame(&mut stream, &request_bytes).await?;

            let Some(response_bytes) = read_frame(&mut stream).await? else {
                warn!(peer = %addr, max = MAX_MESSAGE_SIZE, "peer sent oversized response");
                bail!("response too large (max {MAX_MESSAGE_SIZE})");
            };
            let response: RpcResponse =
                deserialize_bounded(&response_bytes).context("failed to deserialize response")?;
            Ok::<_, anyhow::Error>(response)
        })
        .await
        .context("RPC timed out")??;

        if response.correlation_id != correlation_id {
            bail!(
                "correlation id mismatch: sent {correlation_id}, got {}",
                response.correlation_id
            );
        }
        trace!(peer = %addr, ?kind, correlation_id, "rpc completed");

        match response.body {
            DhtResponse::Error { message } => bail!("RPC error: {message}"),
            body => Ok(body),
        }
    }

    /// Ping a peer known only by address and learn its contact.
    pub async fn introduce(&self, addr: &str) -> Result<Contact> {
        match self.rpc_addr(addr, DhtRequest::Ping).await? {
            DhtResponse::Pong(contact) if contact.is_usable() => Ok(contact),
            DhtResponse::Pong(_) => bail!("peer at {addr} sent a contact with a forged id binding"),
            other => bail!("unexpected response to Ping: {other:?}"),
        }
    }
}

fn usable_contacts(to: &Contact, nodes: Vec<Contact>) -> Vec<Contact> {
    let total = nodes.len();
    if total > MAX_CONTACTS_PER_RESPONSE {
        warn!(
            peer = %to.addr,
            count = total,
            max = MAX_CONTACTS_PER_RESPONSE,
            "peer returned too many contacts, truncating"
        );
    }
    let usable: Vec<Contact> = nodes
        .into_iter()
        .take(MAX_CONTACTS_PER_RESPONSE)
        .filter(Contact::is_usable)
        .collect();
    if usable.len() < total.min(MAX_CONTACTS_PER_RESPONSE) {
        debug!(
            peer = %to.addr,
            dropped = total.min(MAX_CONTACTS_PER_RESPONSE) - usable.len(),
            "dropped unusable contacts"
        );
    }
    usable
}

#[async_trait]
impl DhtNodeRpc for RpcNode {
    async fn ping(&self, to: &Contact) -> Result<()> {
        match self.rpc(to, DhtRequest::Ping).await? {
            DhtResponse::Pong(contact) if contact.node_id == to.node_id => Ok(()),
            DhtResponse::Pong(_) => bail!("peer at {} answered with a different identity", to.addr),
            other => bail!("unexpected response to Ping: {other:?}"),
        }
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        match self.rpc(to, DhtRequest::FindNode { target }).await? {
            DhtResponse::Nodes(nodes) => Ok(usable_contacts(to, nodes)),
            other => bail!("unexpected response to FindNode: {other:?}"),
        }
    }

    async fn find_value(&self, to: &Contact, key: NodeId) -> Result<FindValueResult> {
        match self.rpc(to, DhtRequest::FindValue { key }).await? {
            DhtResponse::Value(item) => {
                if item.value.len() > MAX_VALUE_SIZE {
                    warn!(
                        peer = %to.addr,
                        size = item.value.len(),
                        max = MAX_VALUE_SIZE,
                        "peer returned oversized value, rejecting"
                    );
                    bail!("value too large: {} bytes (max {MAX_VALUE_SIZE})", item.value.len());
                }
                Ok(FindValueResult::Found(item))
            }
            DhtResponse::Nodes(nodes) => Ok(FindValueResult::Closer(usable_contacts(to, nodes))),
            other => bail!("unexpected response to FindValue: {other:?}"),
        }
    }

    async fn store(&self, to: &Contact, item: Item) -> Result<bool> {
        match self.rpc(to, DhtRequest::Store { item }).await? {
            DhtResponse::Stored => Ok(true),
            DhtResponse::Rejected { reason } => {
                debug!(peer = %to.addr, %reason, "store rejected");
                Ok(false)
            }
            other => bail!("unexpected response to Store: {other:?}"),
        }
    }
}

/// Accept connections until the task is aborted.
pub async fn serve<N: DhtNodeRpc>(listener: TcpListener, node: DhtNode<N>) {
    let limit = Arc::new(Semaphore::new(MAX_INBOUND_CONNECTIONS));
    loop {
        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(error = %e, "accept failed");
                continue;
            }
        };

        let node = node.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_stream(node, stream).await {
                debug!(remote = %remote, error = ?e, "stream error");
            }
        });
    }
}

async fn respond(stream: &mut TcpStream, correlation_id: u64, body: DhtResponse) -> Result<()> {
    let response = RpcResponse { correlation_id, body };
    let bytes = serialize_message(&response).context("failed to serialize response")?;
    write_frame(stream, &bytes).await
}

async fn handle_stream<N: DhtNodeRpc>(node: DhtNode<N>, mut stream: TcpStream) -> Result<()> {
    let remote = stream.peer_addr()?;
    let frame = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| anyhow::anyhow!("request read timed out"))??;

    let Some(request_bytes) = frame else {
        warn!(remote = %remote, max = MAX_MESSAGE_SIZE, "rejecting oversized request");
        return respond(
            &mut stream,
            0,
            DhtResponse::Error {
                message: format!("request too large (max {MAX_MESSAGE_SIZE})"),
            },
        )
        .await;
    };

    let request: RpcRequest =
        deserialize_bounded(&request_bytes).context("failed to deserialize request")?;
    let sender = request.sender_id();

    if node.is_blocked(&sender).await {
        trace!(remote = %remote, peer = %sender.short(), "dropping request from blocked peer");
        return Ok(());
    }

    if let Err(e) = request.verify() {
        warn!(
            remote = %remote,
            peer = %sender.short(),
            error = %e,
            "rejecting request with bad signature"
        );
        return respond(
            &mut stream,
            request.correlation_id,
            DhtResponse::Error {
                message: format!("request signature invalid: {e}"),
            },
        )
        .await;
    }

    let kind = request.body.kind();
    trace!(remote = %remote, peer = %sender.short(), ?kind, "handling request");

    let response = match tokio::time::timeout(
        REQUEST_PROCESS_TIMEOUT,
        node.handle_request(&request.from, request.body),
    )
    .await
    {
        Ok(Some(body)) => body,
        Ok(None) => {
            trace!(peer = %sender.short(), "request dropped by dht");
            return Ok(());
        }
        Err(_) => {
            warn!(remote = %remote, "request processing timed out");
            DhtResponse::Error {
                message: "request processing timeout".to_string(),
            }
        }
    };

    respond(&mut stream, request.correlation_id, response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::DhtConfig;
    use crate::item::ContentType;

    struct Served {
        node: DhtNode<RpcNode>,
        contact: Contact,
        server: tokio::task::JoinHandle<()>,
    }

    async fn spawn_node() -> Served {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let keypair = Keypair::generate();
        let contact = keypair.create_contact(addr.to_string());
        let rpc = RpcNode::new(keypair.clone(), contact.clone());
        let node = DhtNode::new(keypair, contact.clone(), rpc, DhtConfig::default());
        let server = tokio::spawn(serve(listener, node.clone()));
        Served { node, contact, server }
    }

    fn client() -> (Keypair, RpcNode) {
        let keypair = Keypair::generate();
        let contact = keypair.create_contact("127.0.0.1:1");
        (keypair.clone(), RpcNode::new(keypair, contact))
    }

    #[tokio::test]
    async fn ping_and_introduce_over_tcp() {
        let served = spawn_node().await;
        let (_, rpc) = client();

        rpc.ping(&served.contact).await.expect("ping");
        let learned = rpc.introduce(&served.contact.addr).await.expect("introduce");
        assert_eq!(learned.node_id, served.contact.node_id);
        assert!(learned.verify_binding());
        served.server.abort();
    }

    #[tokio::test]
    async fn ping_detects_wrong_identity() {
        let served = spawn_node().await;
        let (_, rpc) = client();

        let impostor = Keypair::generate().create_contact(served.contact.addr.clone());
        assert!(rpc.ping(&impostor).await.is_err());
        served.server.abort();
    }

    #[tokio::test]
    async fn store_then_find_value_over_tcp() {
        let served = spawn_node().await;
        let (_, rpc) = client();

        let owner = Keypair::generate();
        let item = Item::sign_new(&owner, Some("greeting"), b"hi".to_vec(), ContentType::text(), 1);
        assert!(rpc.store(&served.contact, item.clone()).await.unwrap());

        match rpc.find_value(&served.contact, item.key).await.unwrap() {
            FindValueResult::Found(found) => assert_eq!(found, item),
            FindValueResult::Closer(_) => panic!("expected the stored item"),
        }

        let mut forged = item.clone();
        forged.value = b"bye".to_vec();
        forged.version = 2;
        assert!(!rpc.store(&served.contact, forged).await.unwrap());
        served.server.abort();
    }

    #[tokio::test]
    async fn find_node_returns_known_contacts() {
        let served = spawn_node().await;
        let (client_kp, rpc) = client();

        let other = Keypair::generate().create_contact("127.0.0.1:2");
        served.node.observe_contact(other.clone()).await;

        let nodes = rpc.find_node(&served.contact, other.node_id).await.unwrap();
        assert!(nodes.iter().any(|c| c.node_id == other.node_id));
        // The caller itself was recorded too.
        let nodes = rpc.find_node(&served.contact, client_kp.node_id()).await.unwrap();
        assert!(nodes.iter().any(|c| c.node_id == client_kp.node_id()));
        served.server.abort();
    }

    #[tokio::test]
    async fn blocked_sender_gets_no_answer() {
        let served = spawn_node().await;
        let (client_kp, rpc) = client();
        let client_contact = rpc.self_contact().clone();

        let victim = Keypair::generate();
        for i in 0..4 {
            let mut forged =
                Item::sign_new(&victim, None, b"real".to_vec(), ContentType::binary(), 1);
            forged.value = vec![i];
            served.node.handle_store_request(&client_contact, forged).await;
        }
        assert!(served.node.is_blocked(&client_kp.node_id()).await);
        assert!(rpc.ping(&served.contact).await.is_err());
        served.server.abort();
    }

    #[tokio::test]
    async fn tampered_request_is_refused() {
        let served = spawn_node().await;
        let (client_kp, rpc) = client();

        let mut request =
            RpcRequest::new_signed(&client_kp, rpc.self_contact().clone(), 9, DhtRequest::Ping)
                .unwrap();
        request.body = DhtRequest::FindNode { target: client_kp.node_id() };

        let mut stream = TcpStream::connect(&served.contact.addr).await.unwrap();
        write_frame(&mut stream, &serialize_message(&request).unwrap()).await.unwrap();
        let bytes = read_frame(&mut stream).await.unwrap().expect("bounded frame");
        let response: RpcResponse = deserialize_bounded(&bytes).unwrap();

        assert_eq!(response.correlation_id, 9);
        assert!(matches!(response.body, DhtResponse::Error { .. }));
        // Rejected before dispatch, so the sender never entered routing.
        assert_eq!(served.node.telemetry_snapshot().await.routing_contacts, 0);
        served.server.abort();
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let served = spawn_node().await;

        let mut stream = TcpStream::connect(&served.contact.addr).await.unwrap();
        stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let bytes = read_frame(&mut stream).await.unwrap().expect("bounded frame");
        let response: RpcResponse = deserialize_bounded(&bytes).unwrap();
        assert!(matches!(response.body, DhtResponse::Error { .. }));
        served.server.abort();
    }

    #[tokio::test]
    async fn unreachable_peer_errors() {
        let (_, rpc) = client();
        let rpc = rpc.with_timeout(Duration::from_millis(300));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dead = Keypair::generate().create_contact(addr.to_string());
        assert!(rpc.ping(&dead).await.is_err());
    }
}
