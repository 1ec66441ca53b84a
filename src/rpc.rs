//! # RPC Framework
//!
//! Topic-addressed request/response over multiplexed QUIC streams.
//!
//! ## Wire shape
//!
//! Every request opens a fresh bidirectional stream:
//!
//! ```text
//! request:  varint-len ‖ topic ‖ [varint-len ‖ payload]
//! response: code(1) ‖ [varint-len ‖ payload]
//! ```
//!
//! Response code 0 means success and the payload decodes as the expected
//! type; any other code means the payload is an [`ErrorResponse`] record.
//! The metadata topic is the one request that carries no payload.
//!
//! ## Dispatch
//!
//! Handlers are registered at startup into a topic → closure table. The
//! generic [`RpcRegistry::register`] wraps the typed decode, so dispatch
//! is a table lookup plus a tagged decode — no runtime reflection. Every
//! handler runs under [`HANDLE_TIMEOUT`], every request under
//! [`REQ_TIMEOUT`], and reads/writes carry explicit deadlines
//! ([`TTFB_TIMEOUT`], [`RESP_TIMEOUT`]) rather than relying on transport
//! defaults.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::crypto;
use crate::encoding::{read_raw_frame, write_raw_frame, Encoding};
use crate::gater::ConnectionGater;
use crate::identity::{Keypair, NodeId};
use crate::peers::Direction;

// ---------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------

pub const RPC_GOODBYE: &str = "/dagnet/req/goodbye/1";
pub const RPC_PING: &str = "/dagnet/req/ping/1";
pub const RPC_METADATA: &str = "/dagnet/req/metadata/1";
pub const RPC_CHAIN_STATE: &str = "/dagnet/req/chainstate/1";
pub const RPC_GET_BLOCKS: &str = "/dagnet/req/getblocks/1";
pub const RPC_GET_BLOCK_DATAS: &str = "/dagnet/req/getblockdatas/1";
pub const RPC_SYNC_DAG: &str = "/dagnet/req/syncdag/1";
pub const RPC_TRANSACTION: &str = "/dagnet/req/transaction/1";
pub const RPC_INVENTORY: &str = "/dagnet/req/inventory/1";
pub const RPC_GRAPH_STATE: &str = "/dagnet/req/graphstate/1";
pub const RPC_SYNC_RECORD: &str = "/dagnet/req/syncrecord/1";
pub const RPC_MEMPOOL: &str = "/dagnet/req/mempool/1";
pub const RPC_GET_DATA: &str = "/dagnet/req/getdata/1";

/// Time to first byte of a response.
pub const TTFB_TIMEOUT: Duration = Duration::from_secs(6);
/// Maximum time for a complete response transfer.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum time for a complete request transfer.
pub const REQ_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum time a handler may run.
pub const HANDLE_TIMEOUT: Duration = Duration::from_secs(6);

/// Upper bound on a topic string read off the wire.
const MAX_TOPIC_LEN: usize = 128;

/// Bound on cached outbound connections.
const MAX_CACHED_CONNECTIONS: usize = 1_000;

/// Capacity of the host event channel.
const HOST_EVENT_CHANNEL_SIZE: usize = 256;

/// Full wire topic: base topic, network qualifier, encoding suffix.
/// Chain-state and goodbye predate network qualification and stay bare.
pub fn full_topic(base: &str, network: &str, encoding: Encoding) -> String {
    if base == RPC_CHAIN_STATE || base == RPC_GOODBYE {
        format!("{base}{}", encoding.protocol_suffix())
    } else {
        format!("{base}/{network}{}", encoding.protocol_suffix())
    }
}

// ---------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------

/// Response and goodbye codes shared across the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    Generic = 1,
    StreamRead = 2,
    StreamWrite = 3,
    Message = 4,
    /// Chain-state validation failed: wrong genesis, old protocol, or an
    /// empty graph. Doubles as the goodbye reason for those.
    DagConsensus = 5,
    BadPeer = 6,
    PeerUnknown = 7,
}

impl ErrorCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ErrorCode::None)
    }

    pub fn from_u8(code: u8) -> ErrorCode {
        match code {
            0 => ErrorCode::None,
            2 => ErrorCode::StreamRead,
            3 => ErrorCode::StreamWrite,
            4 => ErrorCode::Message,
            5 => ErrorCode::DagConsensus,
            6 => ErrorCode::BadPeer,
            7 => ErrorCode::PeerUnknown,
            _ => ErrorCode::Generic,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::None => "none",
            ErrorCode::Generic => "generic error",
            ErrorCode::StreamRead => "stream read",
            ErrorCode::StreamWrite => "stream write",
            ErrorCode::Message => "bad message",
            ErrorCode::DagConsensus => "invalid chain state",
            ErrorCode::BadPeer => "bad peer",
            ErrorCode::PeerUnknown => "peer unknown",
        };
        write!(f, "{name}")
    }
}

/// Error payload carried by non-success responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// A failed request or handler, with the protocol code to report.
#[derive(Debug)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::Message, message.to_string())
    }

    pub fn peer_unknown() -> Self {
        Self::new(ErrorCode::PeerUnknown, "peer unknown")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<crate::encoding::CodecError> for RpcError {
    fn from(e: crate::encoding::CodecError) -> Self {
        RpcError::new(ErrorCode::StreamRead, e.to_string())
    }
}

// ---------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------

/// What a handler sends back: a code and an optional pre-encoded body.
#[derive(Debug)]
pub struct Response {
    pub code: ErrorCode,
    pub body: Option<Vec<u8>>,
}

impl Response {
    /// Success with an encoded message body.
    pub fn success<T: Serialize>(encoding: Encoding, msg: &T) -> Result<Response, RpcError> {
        Ok(Response {
            code: ErrorCode::None,
            body: Some(encoding.encode(msg)?),
        })
    }

    /// Success with no body (bare acknowledgement).
    pub fn empty() -> Response {
        Response {
            code: ErrorCode::None,
            body: None,
        }
    }

    /// Non-success code with a typed body (e.g. answering an invalid
    /// chain state with our own status).
    pub fn with_code<T: Serialize>(
        code: ErrorCode,
        encoding: Encoding,
        msg: &T,
    ) -> Result<Response, RpcError> {
        Ok(Response {
            code,
            body: Some(encoding.encode(msg)?),
        })
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response, RpcError>> + Send>>;
type BoxedHandler = Box<dyn Fn(NodeId, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Topic → handler table, built once at startup.
#[derive(Default)]
pub struct RpcRegistry {
    handlers: HashMap<String, BoxedHandler>,
    encoding: Encoding,
    network: String,
}

impl RpcRegistry {
    pub fn new(network: impl Into<String>, encoding: Encoding) -> Self {
        Self {
            handlers: HashMap::new(),
            encoding,
            network: network.into(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Bind a base topic to a typed handler. The wrapper decodes the
    /// payload into `T` before invoking `handler`; a decode failure is
    /// answered with a stream-read error and never reaches the handler.
    pub fn register<T, F, Fut>(&mut self, base_topic: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(NodeId, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, RpcError>> + Send + 'static,
    {
        let encoding = self.encoding;
        let topic = full_topic(base_topic, &self.network, encoding);
        self.handlers.insert(
            topic,
            Box::new(move |peer, payload| {
                let decoded: Result<T, _> = encoding.decode(&payload);
                match decoded {
                    Ok(msg) => Box::pin(handler(peer, msg)),
                    Err(e) => Box::pin(async move {
                        Err(RpcError::new(ErrorCode::StreamRead, e.to_string()))
                    }),
                }
            }),
        );
    }

    /// Bind a topic whose requests carry no payload (metadata).
    pub fn register_no_payload<F, Fut>(&mut self, base_topic: &str, handler: F)
    where
        F: Fn(NodeId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, RpcError>> + Send + 'static,
    {
        let topic = full_topic(base_topic, &self.network, self.encoding);
        self.handlers
            .insert(topic, Box::new(move |peer, _payload| Box::pin(handler(peer))));
    }

    fn get(&self, topic: &str) -> Option<&BoxedHandler> {
        self.handlers.get(topic)
    }

    fn expects_payload(&self, topic: &str) -> bool {
        !topic.starts_with(RPC_METADATA)
    }
}

// ---------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------

/// Connection lifecycle notifications surfaced to the sync layer.
#[derive(Debug)]
pub enum HostEvent {
    Connected {
        peer: NodeId,
        public_key: [u8; 32],
        addr: SocketAddr,
        direction: Direction,
    },
    Disconnected {
        peer: NodeId,
    },
}

/// The QUIC host: endpoint, connection cache, and inbound dispatch.
pub struct Host {
    keypair: Keypair,
    endpoint: Endpoint,
    client_config: quinn::ClientConfig,
    conns: Mutex<LruCache<NodeId, Connection>>,
    event_tx: mpsc::Sender<HostEvent>,
    registry: Arc<RpcRegistry>,
    gater: Arc<ConnectionGater>,
}

impl Host {
    /// Bind the endpoint and start accepting connections and streams.
    pub async fn listen(
        bind: SocketAddr,
        keypair: Keypair,
        registry: Arc<RpcRegistry>,
        gater: Arc<ConnectionGater>,
    ) -> anyhow::Result<(Arc<Host>, mpsc::Receiver<HostEvent>)> {
        let (certs, key) = crypto::generate_cert(&keypair)?;
        let server_config = crypto::server_config(certs.clone(), key.clone_key())?;
        let client_config = crypto::client_config(certs, key)?;

        let endpoint = Endpoint::server(server_config, bind)?;
        let (event_tx, event_rx) = mpsc::channel(HOST_EVENT_CHANNEL_SIZE);

        let host = Arc::new(Host {
            keypair,
            endpoint,
            client_config,
            conns: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_CONNECTIONS).expect("nonzero"),
            )),
            event_tx,
            registry,
            gater,
        });
        tokio::spawn(host.clone().accept_loop());
        Ok((host, event_rx))
    }

    pub fn local_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Stop accepting and close every connection.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }

    /// The live connection to a peer, if any.
    pub fn connection_of(&self, id: &NodeId) -> Option<Connection> {
        let mut conns = self.conns.lock().expect("conn cache lock");
        let conn = conns.get(id)?;
        if conn.close_reason().is_some() {
            conns.pop(id);
            return None;
        }
        Some(conn.clone())
    }

    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.connection_of(id).is_some()
    }

    /// Dial a peer by public key. Reuses a cached connection when open.
    pub async fn connect(
        self: &Arc<Self>,
        public_key: &[u8; 32],
        addr: SocketAddr,
    ) -> anyhow::Result<Connection> {
        let id = NodeId::from_public_key(public_key);
        if let Some(conn) = self.connection_of(&id) {
            return Ok(conn);
        }
        if !self.gater.intercept_peer_dial(&id) || !self.gater.intercept_addr_dial(&id, addr.ip()) {
            anyhow::bail!("dial to {id} gated");
        }

        let sni = crypto::public_key_to_sni(public_key);
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &sni)?;
        let conn = connecting.await?;

        let Some((verified_id, verified_key)) = crypto::verified_peer(&conn) else {
            conn.close(1u32.into(), b"unverifiable identity");
            anyhow::bail!("peer at {addr} presented no verifiable identity");
        };
        if verified_id != id {
            conn.close(1u32.into(), b"identity mismatch");
            anyhow::bail!("peer at {addr} is {verified_id}, expected {id}");
        }

        self.install(conn.clone(), verified_id, verified_key, addr, Direction::Outbound);
        // Outbound connections serve inbound streams too.
        let host = self.clone();
        let serve_conn = conn.clone();
        tokio::spawn(async move {
            host.connection_loop(serve_conn, verified_id).await;
        });
        Ok(conn)
    }

    /// Close the connection to a peer, releasing all its streams.
    pub fn disconnect(&self, id: &NodeId) {
        let conn = self.conns.lock().expect("conn cache lock").pop(id);
        if let Some(conn) = conn {
            conn.close(0u32.into(), b"goodbye");
        }
    }

    fn install(
        &self,
        conn: Connection,
        id: NodeId,
        public_key: [u8; 32],
        addr: SocketAddr,
        direction: Direction,
    ) {
        self.conns.lock().expect("conn cache lock").put(id, conn.clone());
        let _ = self.event_tx.try_send(HostEvent::Connected {
            peer: id,
            public_key,
            addr,
            direction,
        });
    }

    async fn accept_loop(self: Arc<Self>) {
        while let Some(incoming) = self.endpoint.accept().await {
            let remote = incoming.remote_address();
            if !self.gater.intercept_accept(remote.ip()) {
                incoming.refuse();
                continue;
            }
            let host = self.clone();
            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        trace!(addr = %remote, "inbound connection failed: {e}");
                        return;
                    }
                };
                let Some((id, public_key)) = crypto::verified_peer(&conn) else {
                    conn.close(1u32.into(), b"unverifiable identity");
                    return;
                };
                host.install(conn.clone(), id, public_key, remote, Direction::Inbound);
                host.connection_loop(conn, id).await;
            });
        }
    }

    /// Serve streams on one connection until it closes, then emit the
    /// disconnect event.
    async fn connection_loop(self: Arc<Self>, conn: Connection, peer: NodeId) {
        loop {
            match conn.accept_bi().await {
                Ok((send, recv)) => {
                    let host = self.clone();
                    tokio::spawn(async move {
                        host.handle_stream(peer, send, recv).await;
                    });
                }
                Err(e) => {
                    trace!(peer = %peer, "connection closed: {e}");
                    break;
                }
            }
        }
        self.conns.lock().expect("conn cache lock").pop(&peer);
        let _ = self.event_tx.try_send(HostEvent::Disconnected { peer });
    }

    /// One inbound stream: topic, payload, handler, framed response.
    async fn handle_stream(&self, peer: NodeId, mut send: SendStream, mut recv: RecvStream) {
        let topic = match timeout(TTFB_TIMEOUT, read_topic(&mut recv)).await {
            Ok(Ok(topic)) => topic,
            Ok(Err(e)) => {
                trace!(peer = %peer, "failed to read topic: {e}");
                return;
            }
            Err(_) => {
                trace!(peer = %peer, "timed out reading topic");
                return;
            }
        };

        let Some(handler) = self.registry.get(&topic) else {
            debug!(peer = %peer, topic, "no handler for topic");
            let _ = write_response_parts(
                &mut send,
                ErrorCode::Generic,
                Some(&encode_error(self.registry.encoding(), "unknown topic")),
            )
            .await;
            return;
        };

        let payload = if self.registry.expects_payload(&topic) {
            match timeout(TTFB_TIMEOUT, read_raw_frame(&mut recv)).await {
                Ok(Ok(payload)) => payload,
                Ok(Err(e)) => {
                    debug!(peer = %peer, topic, "failed to decode stream message: {e}");
                    return;
                }
                Err(_) => {
                    trace!(peer = %peer, topic, "timed out reading request payload");
                    return;
                }
            }
        } else {
            Vec::new()
        };

        let outcome = match timeout(HANDLE_TIMEOUT, handler(peer, payload)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::new(ErrorCode::Generic, "handler timed out")),
        };

        let write_result = match outcome {
            Ok(response) => {
                write_response_parts(&mut send, response.code, response.body.as_deref()).await
            }
            Err(e) => {
                if e.code != ErrorCode::DagConsensus {
                    debug!(peer = %peer, topic, code = %e.code, "handler error: {}", e.message);
                }
                write_response_parts(
                    &mut send,
                    e.code,
                    Some(&encode_error(self.registry.encoding(), &e.message)),
                )
                .await
            }
        };
        if let Err(e) = write_result {
            trace!(peer = %peer, topic, "failed to write response: {e}");
        }
        let _ = send.finish();
    }
}

fn encode_error(encoding: Encoding, message: &str) -> Vec<u8> {
    encoding
        .encode(&ErrorResponse {
            message: message.to_string(),
        })
        .unwrap_or_default()
}

async fn read_topic(recv: &mut RecvStream) -> Result<String, RpcError> {
    let raw = read_raw_frame(recv).await?;
    if raw.len() > MAX_TOPIC_LEN {
        return Err(RpcError::new(ErrorCode::StreamRead, "topic too long"));
    }
    String::from_utf8(raw).map_err(|_| RpcError::new(ErrorCode::StreamRead, "topic not utf-8"))
}

async fn write_response_parts(
    send: &mut SendStream,
    code: ErrorCode,
    body: Option<&[u8]>,
) -> Result<(), RpcError> {
    let write = async {
        tokio::io::AsyncWriteExt::write_all(send, &[code as u8])
            .await
            .map_err(|e| RpcError::new(ErrorCode::StreamWrite, e.to_string()))?;
        if let Some(body) = body {
            write_raw_frame(send, body).await?;
        }
        Ok(())
    };
    timeout(RESP_TIMEOUT, write)
        .await
        .map_err(|_| RpcError::new(ErrorCode::StreamWrite, "response write timed out"))?
}

// ---------------------------------------------------------------------
// Request side
// ---------------------------------------------------------------------

/// Open a stream to `peer` and send a request on `base_topic`. The write
/// side is finished; the returned stream is for reading the response.
/// Dropping it releases the stream.
pub async fn send_request(
    conn: &Connection,
    registry_network: &str,
    encoding: Encoding,
    base_topic: &str,
    payload: Option<&[u8]>,
) -> Result<RecvStream, RpcError> {
    let topic = full_topic(base_topic, registry_network, encoding);
    let open_and_write = async {
        let (mut send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| RpcError::new(ErrorCode::StreamWrite, e.to_string()))?;
        write_raw_frame(&mut send, topic.as_bytes()).await?;
        if let Some(payload) = payload {
            write_raw_frame(&mut send, payload).await?;
        }
        send.finish()
            .map_err(|e| RpcError::new(ErrorCode::StreamWrite, e.to_string()))?;
        Ok::<RecvStream, RpcError>(recv)
    };
    timeout(REQ_TIMEOUT, open_and_write)
        .await
        .map_err(|_| RpcError::new(ErrorCode::StreamWrite, "request send timed out"))?
}

/// Read the response code byte, and the error message for non-success.
pub async fn read_response_code(
    recv: &mut RecvStream,
    encoding: Encoding,
) -> Result<(ErrorCode, String), RpcError> {
    let code_byte = timeout(TTFB_TIMEOUT, tokio::io::AsyncReadExt::read_u8(recv))
        .await
        .map_err(|_| RpcError::new(ErrorCode::StreamRead, "response timed out"))?
        .map_err(|e| RpcError::new(ErrorCode::StreamRead, e.to_string()))?;
    let code = ErrorCode::from_u8(code_byte);
    if code.is_success() {
        return Ok((code, String::new()));
    }
    let message = match timeout(RESP_TIMEOUT, encoding.read_frame::<_, ErrorResponse>(recv)).await {
        Ok(Ok(err)) => err.message,
        _ => String::new(),
    };
    Ok((code, message))
}

/// Read a success-coded response body, converting non-success codes into
/// errors. For the caller that expects a typed answer.
pub async fn read_response<T: DeserializeOwned>(
    recv: &mut RecvStream,
    encoding: Encoding,
) -> Result<T, RpcError> {
    let (code, message) = read_response_code(recv, encoding).await?;
    if !code.is_success() {
        return Err(RpcError::new(code, message));
    }
    timeout(RESP_TIMEOUT, encoding.read_frame::<_, T>(recv))
        .await
        .map_err(|_| RpcError::new(ErrorCode::StreamRead, "response body timed out"))?
        .map_err(RpcError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_composition() {
        assert_eq!(
            full_topic(RPC_PING, "mainnet", Encoding::Snappy),
            "/dagnet/req/ping/1/mainnet/bin_snappy"
        );
        assert_eq!(
            full_topic(RPC_PING, "testnet", Encoding::Plain),
            "/dagnet/req/ping/1/testnet/bin"
        );
        // Chain state and goodbye carry no network qualifier.
        assert_eq!(
            full_topic(RPC_CHAIN_STATE, "mainnet", Encoding::Snappy),
            "/dagnet/req/chainstate/1/bin_snappy"
        );
        assert_eq!(
            full_topic(RPC_GOODBYE, "mainnet", Encoding::Plain),
            "/dagnet/req/goodbye/1/bin"
        );
    }

    #[test]
    fn error_code_roundtrip() {
        for code in [
            ErrorCode::None,
            ErrorCode::Generic,
            ErrorCode::StreamRead,
            ErrorCode::StreamWrite,
            ErrorCode::Message,
            ErrorCode::DagConsensus,
            ErrorCode::BadPeer,
            ErrorCode::PeerUnknown,
        ] {
            assert_eq!(ErrorCode::from_u8(code as u8), code);
        }
        assert!(ErrorCode::None.is_success());
        assert!(!ErrorCode::DagConsensus.is_success());
        // Unknown codes collapse to generic.
        assert_eq!(ErrorCode::from_u8(200), ErrorCode::Generic);
    }

    #[tokio::test]
    async fn registry_dispatch_decodes_typed_payload() {
        let mut registry = RpcRegistry::new("mainnet", Encoding::Plain);
        registry.register::<u64, _, _>(RPC_PING, |_peer, seq| async move {
            assert_eq!(seq, 42);
            Response::success(Encoding::Plain, &(seq + 1))
        });

        let topic = full_topic(RPC_PING, "mainnet", Encoding::Plain);
        let handler = registry.get(&topic).expect("registered");
        let payload = Encoding::Plain.encode(&42u64).unwrap();
        let peer = crate::identity::Keypair::generate().node_id();
        let response = handler(peer, payload).await.unwrap();
        assert_eq!(response.code, ErrorCode::None);
        let echoed: u64 = Encoding::Plain.decode(&response.body.unwrap()).unwrap();
        assert_eq!(echoed, 43);
    }

    #[tokio::test]
    async fn registry_dispatch_rejects_garbage() {
        let mut registry = RpcRegistry::new("mainnet", Encoding::Plain);
        registry.register::<crate::message::ChainState, _, _>(
            RPC_CHAIN_STATE,
            |_peer, _msg| async move { Ok(Response::empty()) },
        );
        let topic = full_topic(RPC_CHAIN_STATE, "mainnet", Encoding::Plain);
        let handler = registry.get(&topic).expect("registered");
        let peer = crate::identity::Keypair::generate().node_id();
        let err = handler(peer, vec![0xFF, 0x01]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::StreamRead);
    }

    #[test]
    fn metadata_topic_expects_no_payload() {
        let registry = RpcRegistry::new("mainnet", Encoding::Plain);
        let metadata_topic = full_topic(RPC_METADATA, "mainnet", Encoding::Plain);
        assert!(!registry.expects_payload(&metadata_topic));
        let ping_topic = full_topic(RPC_PING, "mainnet", Encoding::Plain);
        assert!(registry.expects_payload(&ping_topic));
    }
}
