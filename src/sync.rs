//! # Sync Manager
//!
//! The request/response side of the sync protocol: topic handlers, their
//! matching request senders, chain-state validation, and the handshake
//! state machine that drives a fresh connection to `Connected`.
//!
//! ## Handshake
//!
//! The dialing side actively sends a chain-state request (and a ping)
//! once the connection notification arrives. The accepting side waits for
//! the remote to initiate within [`HANDSHAKE_TIMEOUT`] and disconnects if
//! nothing arrives. This asymmetry keeps the two ends from racing each
//! other with duplicate handshakes; a per-peer async guard serializes the
//! connection notifications that libp2p-style hosts may fire in parallel.
//!
//! Protocol violations never propagate as process errors: they increment
//! the offending peer's bad-response counter or end in a goodbye message
//! plus disconnect.

use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use quinn::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::chain::{BlockChain, DagSync, SyncMode, TxMemPool};
use crate::config::Config;
use crate::encoding::Encoding;
use crate::gater::ConnectionGater;
use crate::identity::NodeId;
use crate::message::{
    ChainState, DagBlocks, GetBlockDatas, GetBlocks, GraphState, Hash, Inventory, Metadata,
    Services, SubDag, SyncDag, SyncRecord, Transaction, INITIAL_PROTOCOL_VERSION,
};
use crate::peers::{ConnectionState, Direction, Peer, PeerRegistry};
use crate::peersync::{PeerSyncHandle, MAX_BLOCK_LOCATORS_PER_MSG};
use crate::record::{LocalNode, Node, SchemePolicy};
use crate::rpc::{
    read_response, read_response_code, send_request, ErrorCode, Host, Response,
    RpcError, RpcRegistry, RESP_TIMEOUT, RPC_CHAIN_STATE, RPC_GET_BLOCKS, RPC_GET_BLOCK_DATAS,
    RPC_GET_DATA, RPC_GOODBYE, RPC_GRAPH_STATE, RPC_INVENTORY, RPC_MEMPOOL, RPC_METADATA,
    RPC_PING, RPC_SYNC_DAG, RPC_SYNC_RECORD, RPC_TRANSACTION,
};

/// Grace window an inbound peer has to initiate the chain-state exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the peer-status maintenance sweep; also the staleness bound
/// for a peer's chain state.
pub const PEER_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// How long a peer stays disconnected before re-lookup is attempted.
pub const RECONNECTION_TIME: Duration = Duration::from_secs(30);

/// Sync progress tracked jointly by the sync manager and the peer-sync
/// engine: the current sync target, when it last made progress, and
/// whether the node is in long-sync mode.
#[derive(Debug)]
pub(crate) struct SyncState {
    sync_peer: RwLock<Option<NodeId>>,
    last_sync: RwLock<std::time::Instant>,
    long_sync: std::sync::atomic::AtomicBool,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            sync_peer: RwLock::new(None),
            last_sync: RwLock::new(std::time::Instant::now()),
            long_sync: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

/// Outcome of chain-state validation.
enum ChainStateIssue {
    /// Malformed in a way that is not worth a goodbye (bad-response only).
    Generic(String),
    /// Hard failure: answer with our status, goodbye, disconnect.
    Invalid(String),
}

/// Ties topics to handlers and drives handshakes. One per service.
pub struct SyncManager {
    config: Config,
    genesis: Hash,
    registry: Arc<PeerRegistry>,
    gater: Arc<ConnectionGater>,
    chain: Arc<dyn BlockChain>,
    mempool: Arc<dyn TxMemPool>,
    dag_sync: Arc<dyn DagSync>,
    local_node: Arc<LocalNode>,
    local_metadata: RwLock<Metadata>,
    host: OnceLock<Arc<Host>>,
    peersync: PeerSyncHandle,
    pub(crate) sync_state: SyncState,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        registry: Arc<PeerRegistry>,
        gater: Arc<ConnectionGater>,
        chain: Arc<dyn BlockChain>,
        mempool: Arc<dyn TxMemPool>,
        dag_sync: Arc<dyn DagSync>,
        local_node: Arc<LocalNode>,
        peersync: PeerSyncHandle,
    ) -> Self {
        let genesis = chain.genesis_hash();
        Self {
            config,
            genesis,
            registry,
            gater,
            chain,
            mempool,
            dag_sync,
            local_node,
            local_metadata: RwLock::new(Metadata::default()),
            host: OnceLock::new(),
            peersync,
            sync_state: SyncState::default(),
        }
    }

    /// Attach the host once it is listening. Must happen before any
    /// request is sent; handlers only run once the host serves streams, so
    /// ordering is safe.
    pub fn set_host(&self, host: Arc<Host>) {
        if self.host.set(host).is_err() {
            warn!("sync manager host already set");
        }
    }

    fn host(&self) -> &Arc<Host> {
        self.host.get().expect("host attached before use")
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn chain(&self) -> &Arc<dyn BlockChain> {
        &self.chain
    }

    pub fn mempool(&self) -> &Arc<dyn TxMemPool> {
        &self.mempool
    }

    pub fn dag_sync(&self) -> &Arc<dyn DagSync> {
        &self.dag_sync
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local_node
    }

    pub fn peersync(&self) -> &PeerSyncHandle {
        &self.peersync
    }

    pub fn encoding(&self) -> Encoding {
        self.config.encoding
    }

    pub fn network(&self) -> &str {
        &self.config.network_name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Local state
    // ------------------------------------------------------------------

    pub fn metadata_seq(&self) -> u64 {
        self.local_metadata.read().expect("metadata lock").seq_number
    }

    pub fn local_metadata(&self) -> Metadata {
        self.local_metadata.read().expect("metadata lock").clone()
    }

    /// Replace the subnet bitfield, bumping the metadata sequence.
    pub fn update_subnets(&self, subnets: Vec<u8>) {
        let mut md = self.local_metadata.write().expect("metadata lock");
        md.subnets = subnets;
        md.seq_number += 1;
    }

    pub fn local_graph_state(&self) -> GraphState {
        self.chain.best_snapshot().graph_state
    }

    pub fn local_chain_state(&self) -> ChainState {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        ChainState {
            genesis_hash: self.genesis,
            protocol_version: self.config.protocol_version,
            timestamp,
            services: self.config.services,
            graph_state: self.local_graph_state(),
            user_agent: self.config.user_agent.clone().into_bytes(),
            disable_relay_tx: self.config.disable_relay_tx,
        }
    }

    // ------------------------------------------------------------------
    // Sync-peer bookkeeping (shared with the peer-sync engine)
    // ------------------------------------------------------------------

    pub fn sync_peer(&self) -> Option<NodeId> {
        *self.sync_state.sync_peer.read().expect("sync peer lock")
    }

    pub fn has_sync_peer(&self) -> bool {
        self.sync_peer().is_some()
    }

    pub fn is_sync_peer(&self, id: &NodeId) -> bool {
        self.sync_peer().as_ref() == Some(id)
    }

    pub(crate) fn set_sync_peer(&self, peer: Option<NodeId>) {
        *self.sync_state.sync_peer.write().expect("sync peer lock") = peer;
        if peer.is_some() {
            self.touch_sync_progress();
        }
    }

    pub(crate) fn touch_sync_progress(&self) {
        *self.sync_state.last_sync.write().expect("last sync lock") = std::time::Instant::now();
    }

    pub(crate) fn last_sync(&self) -> std::time::Instant {
        *self.sync_state.last_sync.read().expect("last sync lock")
    }

    pub(crate) fn long_sync(&self) -> bool {
        self.sync_state
            .long_sync
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn set_long_sync(&self, on: bool) {
        self.sync_state
            .long_sync
            .store(on, std::sync::atomic::Ordering::Relaxed);
    }

    /// Whether we believe we are synced: the chain reports current and the
    /// sync target (if any) is not strictly ahead of us.
    pub fn is_current(&self) -> bool {
        if !self.chain.is_current() {
            return false;
        }
        self.is_complete_for_sync_peer()
    }

    /// Whether the sync target has nothing left to teach us. True with no
    /// sync peer: if the chain thinks we are current it is probably right.
    pub fn is_complete_for_sync_peer(&self) -> bool {
        let Some(sp) = self.sync_peer() else {
            return true;
        };
        let Some(pe) = self.registry.get(&sp) else {
            return true;
        };
        let Some(gs) = pe.graph_state() else {
            return true;
        };
        !gs.is_excellent(&self.local_graph_state())
    }

    // ------------------------------------------------------------------
    // Chain-state validation
    // ------------------------------------------------------------------

    fn validate_chain_state(&self, msg: &ChainState, pe: &Peer) -> Result<(), ChainStateIssue> {
        // Relay and observer peers are not full DAG participants and skip
        // the consensus checks.
        if msg.services.has(Services::RELAY) || msg.services.has(Services::OBSERVER) {
            return Ok(());
        }
        if msg.genesis_hash != self.genesis {
            return Err(ChainStateIssue::Invalid("invalid genesis".into()));
        }
        if msg.protocol_version < INITIAL_PROTOCOL_VERSION {
            return Err(ChainStateIssue::Invalid(format!(
                "protocol version must be {INITIAL_PROTOCOL_VERSION} or greater"
            )));
        }
        if msg.graph_state.total == 0 {
            return Err(ChainStateIssue::Invalid("invalid graph state".into()));
        }
        if pe.direction() == Direction::Inbound && !msg.services.has(Services::FULL) {
            let missing = msg.services.missing(Services::FULL);
            return Err(ChainStateIssue::Invalid(format!(
                "rejecting peer {} with services {:?}: missing {:?}",
                pe.id(),
                msg.services,
                missing
            )));
        }
        Ok(())
    }

    fn update_chain_state(self: &Arc<Self>, pe: &Arc<Peer>, chain_state: ChainState, action: bool) {
        pe.set_chain_state(chain_state);
        if !action {
            return;
        }
        let sm = self.clone();
        let pe = pe.clone();
        tokio::spawn(async move {
            sm.immediately_connected(pe).await;
        });
    }

    fn validate_sequence_num(&self, seq: u64, pe: &Peer) -> bool {
        match pe.metadata() {
            Some(md) => md.seq_number == seq,
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Handler registration
    // ------------------------------------------------------------------

    /// Build the topic dispatch table. Called once at startup, before the
    /// host starts serving streams.
    pub fn build_registry(self: &Arc<Self>) -> RpcRegistry {
        let mut registry = RpcRegistry::new(self.network(), self.encoding());
        let enc = self.encoding();

        let sm = self.clone();
        registry.register::<u64, _, _>(RPC_GOODBYE, move |peer, code| {
            let sm = sm.clone();
            async move {
                debug!(peer = %peer, "peer said goodbye: {}", ErrorCode::from_u8(code as u8));
                if let Some(pe) = sm.registry.get(&peer) {
                    sm.disconnect_peer(&pe);
                }
                Ok(Response::empty())
            }
        });

        let sm = self.clone();
        registry.register::<u64, _, _>(RPC_PING, move |peer, seq| {
            let sm = sm.clone();
            async move {
                let pe = sm.registry.get(&peer).ok_or_else(RpcError::peer_unknown)?;
                let valid = sm.validate_sequence_num(seq, &pe);
                let resp = Response::success(enc, &sm.metadata_seq())?;
                if !valid {
                    // Stale or absent metadata: fetch it out of band so the
                    // response is not held up.
                    let sm2 = sm.clone();
                    tokio::spawn(async move {
                        match sm2.send_metadata_request(peer).await {
                            Ok(md) => pe.set_metadata(md),
                            Err(e) => {
                                debug!(peer = %peer, "metadata request failed: {e}");
                            }
                        }
                    });
                }
                Ok(resp)
            }
        });

        let sm = self.clone();
        registry.register_no_payload(RPC_METADATA, move |_peer| {
            let sm = sm.clone();
            async move { Response::success(enc, &sm.local_metadata()) }
        });

        let sm = self.clone();
        registry.register::<ChainState, _, _>(RPC_CHAIN_STATE, move |peer, msg| {
            let sm = sm.clone();
            async move { sm.chain_state_handler(peer, msg).await }
        });

        let sm = self.clone();
        registry.register::<GetBlocks, _, _>(RPC_GET_BLOCKS, move |_peer, msg| {
            let sm = sm.clone();
            async move {
                let (blocks, _) = sm.dag_sync.calc_sync_blocks(
                    None,
                    &msg.locator,
                    SyncMode::Direct,
                    MAX_BLOCK_LOCATORS_PER_MSG,
                );
                Response::success(enc, &DagBlocks { blocks })
            }
        });

        let sm = self.clone();
        registry.register::<GetBlockDatas, _, _>(RPC_GET_BLOCK_DATAS, move |peer, msg| {
            let sm = sm.clone();
            async move {
                let mut locator = Vec::with_capacity(msg.locator.len());
                for hash in &msg.locator {
                    match sm.chain.fetch_block_bytes(hash) {
                        Ok(block_bytes) => {
                            locator.push(crate::message::BlockData { block_bytes })
                        }
                        Err(e) => {
                            trace!(peer = %peer, %hash, "cannot serve block: {e}");
                        }
                    }
                }
                Response::success(enc, &crate::message::BlockDatas { locator })
            }
        });

        let sm = self.clone();
        registry.register::<SyncDag, _, _>(RPC_SYNC_DAG, move |peer, msg| {
            let sm = sm.clone();
            async move {
                let pe = sm.registry.get(&peer).ok_or_else(RpcError::peer_unknown)?;
                pe.update_graph_state(msg.graph_state);
                let gs = pe.graph_state();
                let (blocks, sync_point) = sm.dag_sync.calc_sync_blocks(
                    gs.as_ref(),
                    &msg.main_locator,
                    SyncMode::SubDag,
                    MAX_BLOCK_LOCATORS_PER_MSG,
                );
                pe.update_sync_point(sync_point);
                Response::success(
                    enc,
                    &SubDag {
                        sync_point,
                        graph_state: sm.local_graph_state(),
                        blocks,
                    },
                )
            }
        });

        let sm = self.clone();
        registry.register::<Hash, _, _>(RPC_TRANSACTION, move |_peer, txhash| {
            let sm = sm.clone();
            async move {
                let tx_bytes = sm
                    .mempool
                    .fetch_transaction(&txhash)
                    .map_err(|e| RpcError::message(e))?;
                Response::success(enc, &Transaction { tx_bytes })
            }
        });

        let sm = self.clone();
        registry.register::<Inventory, _, _>(RPC_INVENTORY, move |peer, msg| {
            let sm = sm.clone();
            async move {
                let pe = sm.registry.get(&peer).ok_or_else(RpcError::peer_unknown)?;
                sm.handle_inventory(&pe, msg);
                Ok(Response::empty())
            }
        });

        let sm = self.clone();
        registry.register::<GraphState, _, _>(RPC_GRAPH_STATE, move |peer, gs| {
            let sm = sm.clone();
            async move {
                let pe = sm.registry.get(&peer).ok_or_else(RpcError::peer_unknown)?;
                pe.update_graph_state(gs);
                sm.peersync.peer_update(peer);
                Response::success(enc, &sm.local_graph_state())
            }
        });

        let sm = self.clone();
        registry.register::<SyncRecord, _, _>(RPC_SYNC_RECORD, move |peer, msg| {
            let sm = sm.clone();
            async move {
                let pe = sm.registry.get(&peer).ok_or_else(RpcError::peer_unknown)?;
                let node = Node::new(SchemePolicy::Production, msg.record)
                    .map_err(|e| RpcError::message(e))?;
                pe.set_record(node.record().clone());
                Response::success(
                    enc,
                    &SyncRecord {
                        record: sm.local_node.node().record().clone(),
                    },
                )
            }
        });

        let sm = self.clone();
        registry.register::<crate::message::MemPoolRequest, _, _>(RPC_MEMPOOL, move |peer, _msg| {
            let sm = sm.clone();
            async move {
                if sm.registry.get(&peer).is_none() {
                    return Err(RpcError::peer_unknown());
                }
                sm.peersync.on_mempool(peer);
                Ok(Response::empty())
            }
        });

        let sm = self.clone();
        registry.register::<Inventory, _, _>(RPC_GET_DATA, move |peer, msg| {
            let sm = sm.clone();
            async move {
                if sm.registry.get(&peer).is_none() {
                    return Err(RpcError::peer_unknown());
                }
                sm.peersync.get_data(peer, msg.invs);
                Ok(Response::empty())
            }
        });

        registry
    }

    async fn chain_state_handler(
        self: &Arc<Self>,
        peer: NodeId,
        msg: ChainState,
    ) -> Result<Response, RpcError> {
        // The connection is mutually authenticated, so a chain state may
        // legitimately arrive before the connection notification; create
        // the entry rather than racing the notification pump.
        let pe = self.registry.fetch(peer);
        trace!(peer = %peer, "chain state handler");
        match self.validate_chain_state(&msg, &pe) {
            Ok(()) => {
                self.update_chain_state(&pe, msg, true);
                Response::success(self.encoding(), &self.local_chain_state())
            }
            Err(ChainStateIssue::Invalid(reason)) => {
                debug!(peer = %peer, "invalid chain state: {reason}");
                // Respond once with our own status so the remote can see
                // the divergence, then expect it to go away.
                self.update_chain_state(&pe, msg, false);
                Response::with_code(
                    ErrorCode::DagConsensus,
                    self.encoding(),
                    &self.local_chain_state(),
                )
            }
            Err(ChainStateIssue::Generic(reason)) => {
                self.registry
                    .increment_bad_responses(&peer, "chain state handler");
                Err(RpcError::message(reason))
            }
        }
    }

    /// Inbound inventory push: blocks mean the sender is ahead (trigger a
    /// graph-state refresh); unseen transactions are fetched.
    fn handle_inventory(&self, pe: &Arc<Peer>, msg: Inventory) {
        if msg.invs.is_empty() {
            return;
        }
        let mut txs = Vec::new();
        let mut has_blocks = false;
        for inv in &msg.invs {
            match inv.inv_type {
                crate::message::InvType::Block | crate::message::InvType::FilteredBlock => {
                    has_blocks = true;
                }
                crate::message::InvType::Tx => {
                    if self.config.disable_relay_tx {
                        continue;
                    }
                    if self.mempool.have_transaction(&inv.hash) {
                        continue;
                    }
                    txs.push(inv.hash);
                }
            }
        }
        if has_blocks {
            self.peersync.update_graph_state(pe.id());
        }
        if !txs.is_empty() {
            self.peersync.get_txs(pe.id(), txs);
        }
    }

    // ------------------------------------------------------------------
    // Request senders
    // ------------------------------------------------------------------

    fn connection_of(&self, id: &NodeId) -> Result<Connection, RpcError> {
        self.host()
            .connection_of(id)
            .ok_or_else(|| RpcError::new(ErrorCode::StreamWrite, format!("no connection to {id}")))
    }

    async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        id: NodeId,
        base_topic: &str,
        req: &Req,
        bad_response_tag: &str,
    ) -> Result<Resp, RpcError> {
        let enc = self.encoding();
        let conn = self.connection_of(&id)?;
        let payload = enc.encode(req)?;
        let mut recv = send_request(&conn, self.network(), enc, base_topic, Some(&payload)).await?;
        match read_response::<Resp>(&mut recv, enc).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                if e.code != ErrorCode::StreamRead && e.code != ErrorCode::StreamWrite {
                    self.registry.increment_bad_responses(&id, bad_response_tag);
                }
                Err(e)
            }
        }
    }

    /// Exchange chain states with a peer. Runs the full validation dance
    /// on the response, including the goodbye path for hard mismatches.
    pub async fn send_chain_state_request(self: &Arc<Self>, id: NodeId) -> Result<(), RpcError> {
        let pe = self.registry.get(&id).ok_or_else(RpcError::peer_unknown)?;
        trace!(peer = %id, "send chain state request");
        let enc = self.encoding();
        let conn = self.connection_of(&id)?;
        let payload = enc.encode(&self.local_chain_state())?;
        let mut recv =
            send_request(&conn, self.network(), enc, RPC_CHAIN_STATE, Some(&payload)).await?;
        let (code, err_msg) = read_response_code(&mut recv, enc).await?;
        if !code.is_success() && code != ErrorCode::DagConsensus {
            self.registry
                .increment_bad_responses(&id, "chain state request");
            return Err(RpcError::new(code, err_msg));
        }
        let msg: ChainState = timeout(RESP_TIMEOUT, enc.read_frame(&mut recv))
            .await
            .map_err(|_| RpcError::new(ErrorCode::StreamRead, "chain state body timed out"))?
            .map_err(RpcError::from)?;

        self.update_chain_state(&pe, msg.clone(), code.is_success());
        if code == ErrorCode::DagConsensus {
            self.send_goodbye_and_disconnect(ErrorCode::DagConsensus, id)
                .await;
            return Err(RpcError::new(code, err_msg));
        }
        if let Err(issue) = self.validate_chain_state(&msg, &pe) {
            return match issue {
                ChainStateIssue::Invalid(reason) => {
                    self.send_goodbye_and_disconnect(ErrorCode::DagConsensus, id)
                        .await;
                    Err(RpcError::new(ErrorCode::DagConsensus, reason))
                }
                ChainStateIssue::Generic(reason) => {
                    self.registry
                        .increment_bad_responses(&id, "chain state resp");
                    Err(RpcError::message(reason))
                }
            };
        }
        Ok(())
    }

    /// Liveness ping carrying our metadata sequence; follows up with a
    /// metadata fetch when the remote's sequence moved.
    pub async fn send_ping_request(&self, id: NodeId) -> Result<(), RpcError> {
        let pe = self.registry.get(&id).ok_or_else(RpcError::peer_unknown)?;
        let seq: u64 = self
            .request(id, RPC_PING, &self.metadata_seq(), "ping request")
            .await?;
        if self.validate_sequence_num(seq, &pe) {
            return Ok(());
        }
        let md = self.send_metadata_request(id).await?;
        pe.set_metadata(md);
        Ok(())
    }

    pub async fn send_metadata_request(&self, id: NodeId) -> Result<Metadata, RpcError> {
        let enc = self.encoding();
        let conn = self.connection_of(&id)?;
        let mut recv = send_request(&conn, self.network(), enc, RPC_METADATA, None).await?;
        read_response(&mut recv, enc).await
    }

    pub async fn send_get_blocks_request(
        &self,
        id: NodeId,
        blocks: GetBlocks,
    ) -> Result<DagBlocks, RpcError> {
        self.request(id, RPC_GET_BLOCKS, &blocks, "get blocks request")
            .await
    }

    pub async fn send_get_block_datas_request(
        &self,
        id: NodeId,
        locator: GetBlockDatas,
    ) -> Result<crate::message::BlockDatas, RpcError> {
        self.request(id, RPC_GET_BLOCK_DATAS, &locator, "get block datas request")
            .await
    }

    pub async fn send_sync_dag_request(&self, id: NodeId, sd: SyncDag) -> Result<SubDag, RpcError> {
        self.request(id, RPC_SYNC_DAG, &sd, "sync DAG request").await
    }

    pub async fn send_tx_request(&self, id: NodeId, txhash: Hash) -> Result<Transaction, RpcError> {
        self.request(id, RPC_TRANSACTION, &txhash, "tx request").await
    }

    pub async fn send_inventory_request(&self, id: NodeId, inv: Inventory) -> Result<(), RpcError> {
        let enc = self.encoding();
        let conn = self.connection_of(&id)?;
        let payload = enc.encode(&inv)?;
        let mut recv =
            send_request(&conn, self.network(), enc, RPC_INVENTORY, Some(&payload)).await?;
        let (code, err_msg) = read_response_code(&mut recv, enc).await?;
        if !code.is_success() {
            self.registry.increment_bad_responses(&id, "inventory request");
            return Err(RpcError::new(code, err_msg));
        }
        Ok(())
    }

    pub async fn send_graph_state_request(
        &self,
        id: NodeId,
        gs: GraphState,
    ) -> Result<GraphState, RpcError> {
        self.request(id, RPC_GRAPH_STATE, &gs, "graph state request")
            .await
    }

    pub async fn send_sync_record_request(
        &self,
        id: NodeId,
        record: SyncRecord,
    ) -> Result<SyncRecord, RpcError> {
        self.request(id, RPC_SYNC_RECORD, &record, "sync record request")
            .await
    }

    pub async fn send_mempool_request(&self, id: NodeId) -> Result<(), RpcError> {
        let enc = self.encoding();
        let conn = self.connection_of(&id)?;
        let payload = enc.encode(&crate::message::MemPoolRequest {})?;
        let mut recv = send_request(&conn, self.network(), enc, RPC_MEMPOOL, Some(&payload)).await?;
        let (code, err_msg) = read_response_code(&mut recv, enc).await?;
        if !code.is_success() {
            return Err(RpcError::new(code, err_msg));
        }
        Ok(())
    }

    /// Best-effort goodbye, then disconnect regardless of the outcome.
    pub async fn send_goodbye_and_disconnect(&self, code: ErrorCode, id: NodeId) {
        let enc = self.encoding();
        if let Ok(conn) = self.connection_of(&id) {
            let goodbye = async {
                let payload = enc.encode(&(code as u8 as u64))?;
                let mut recv =
                    send_request(&conn, self.network(), enc, RPC_GOODBYE, Some(&payload)).await?;
                let _ = read_response_code(&mut recv, enc).await;
                Ok::<(), RpcError>(())
            };
            if let Err(e) = goodbye.await {
                trace!(peer = %id, "goodbye failed: {e}");
            }
        }
        if let Some(pe) = self.registry.get(&id) {
            self.disconnect_peer(&pe);
        }
    }

    // ------------------------------------------------------------------
    // Handshake state machine
    // ------------------------------------------------------------------

    /// Connection notification from the host. Serialized per peer by the
    /// handshake guard.
    pub async fn process_connected(
        self: &Arc<Self>,
        id: NodeId,
        addr: std::net::SocketAddr,
        direction: Direction,
    ) {
        let pe = self.registry.fetch(id);
        let _guard = pe.hs_guard.lock().await;

        if pe.is_active() {
            trace!(peer = %id, "already active, ignoring connection notification");
            return;
        }
        self.registry.add(None, id, addr.to_string(), direction);
        if pe.is_bad() && !self.gater.is_white_peer(&id) {
            trace!(peer = %id, "bad peer, refusing handshake");
            self.disconnect_peer(&pe);
            return;
        }
        if let Some(t) = pe.connection_time() {
            if t.elapsed() <= Duration::from_secs(1) {
                self.registry
                    .increment_bad_responses(&id, "connection too frequent");
            }
        }
        pe.set_connection_state(ConnectionState::Connecting);

        if direction == Direction::Inbound {
            // Accept side: the dialer initiates. Give it a grace window
            // and drop the connection if nothing arrives.
            let sm = self.clone();
            let pe = pe.clone();
            tokio::spawn(async move {
                tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
                let _guard = pe.hs_guard.lock().await;
                if pe.connection_state().is_connecting() {
                    debug!(peer = %pe.id(), "inbound peer never initiated handshake");
                    sm.disconnect_peer(&pe);
                }
            });
            return;
        }

        if let Err(e) = self.revalidate_peer(id).await {
            trace!(peer = %id, "handshake failed: {e}");
            self.disconnect_peer(&pe);
            return;
        }
        self.connection(&pe);
    }

    /// Chain-state and ping exchange used both for the dial-side handshake
    /// and for periodic revalidation.
    pub async fn revalidate_peer(self: &Arc<Self>, id: NodeId) -> Result<(), RpcError> {
        self.send_chain_state_request(id).await?;
        self.send_ping_request(id).await
    }

    /// Called when a chain-state exchange completed. Promotes the peer to
    /// `Connected`, running the fresh-connection path if the notification
    /// has not landed yet.
    pub async fn immediately_connected(self: &Arc<Self>, pe: Arc<Peer>) {
        let _guard = pe.hs_guard.lock().await;
        match pe.connection_state() {
            ConnectionState::Connecting => self.connection(&pe),
            ConnectionState::Connected => {
                self.peersync.peer_update(pe.id());
            }
            ConnectionState::Disconnected => {
                // The chain-state exchange won the race against the
                // connection notification; treat it as the notification.
                pe.set_connection_state(ConnectionState::Connecting);
                self.connection(&pe);
            }
            ConnectionState::Disconnecting => {}
        }
    }

    fn connection(&self, pe: &Arc<Peer>) {
        if pe.connection_state().is_connected() {
            return;
        }
        pe.set_connection_state(ConnectionState::Connected);
        if !pe.is_consensus() {
            info!(
                peer = %pe.id(),
                direction = ?pe.direction(),
                addr = pe.address().unwrap_or_default(),
                "non-consensus peer connected"
            );
            return;
        }
        info!(
            peer = %pe.id(),
            direction = ?pe.direction(),
            addr = pe.address().unwrap_or_default(),
            active = self.registry.active().len(),
            "peer connected"
        );
        self.peersync.on_connected(pe.id());
    }

    /// Tear a peer down: Disconnecting, host-level close, Disconnected,
    /// and a sync-engine notification for consensus peers.
    pub fn disconnect_peer(&self, pe: &Arc<Peer>) {
        if !pe.is_active() {
            return;
        }
        pe.set_connection_state(ConnectionState::Disconnecting);
        if let Some(host) = self.host.get() {
            host.disconnect(&pe.id());
        }
        pe.set_connection_state(ConnectionState::Disconnected);
        trace!(peer = %pe.id(), "disconnected");
        if pe.is_consensus() {
            self.peersync.on_disconnected(pe.id());
        }
    }

    /// Disconnection notification from the host.
    pub async fn process_disconnected(self: &Arc<Self>, id: NodeId) {
        let Some(pe) = self.registry.get(&id) else {
            return;
        };
        let _guard = pe.hs_guard.lock().await;
        if pe.connection_state().is_disconnected() {
            return;
        }
        // The host may have re-established a connection in the meantime.
        if self.host().is_connected(&id) {
            return;
        }
        let prior = pe.connection_state();
        pe.set_connection_state(ConnectionState::Disconnected);
        if prior.is_connected() {
            info!(peer = %id, active = self.registry.active().len(), "peer disconnected");
            if pe.is_consensus() {
                self.peersync.on_disconnected(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Periodic peer-status sweep: drop stale connections, goodbye bad
    /// peers, revalidate aging chain state, and fetch missing records.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let sm = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(sm) = sm.upgrade() else { return };
                sm.maintain_peer_statuses(interval);
            }
        })
    }

    fn maintain_peer_statuses(self: &Arc<Self>, interval: Duration) {
        for pe in self.registry.connected() {
            let sm = self.clone();
            tokio::spawn(async move {
                let id = pe.id();
                if !sm.host().is_connected(&id) {
                    sm.disconnect_peer(&pe);
                    return;
                }
                if pe.is_bad() && !sm.gater.is_white_peer(&id) {
                    sm.send_goodbye_and_disconnect(ErrorCode::BadPeer, id).await;
                    return;
                }
                if !pe.is_consensus() {
                    return;
                }
                let stale = pe
                    .chain_state_last_updated()
                    .map(|t| t.elapsed() > interval)
                    .unwrap_or(true);
                if stale {
                    if let Err(e) = sm.revalidate_peer(id).await {
                        debug!(peer = %id, "failed to revalidate peer: {e}");
                        sm.registry
                            .increment_bad_responses(&id, "maintenance revalidation");
                    }
                }
                if pe.record().is_none() {
                    let since_conn = pe
                        .connection_time()
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if since_conn > RECONNECTION_TIME {
                        sm.peersync.sync_record(id);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MemoryChain, MemoryDagSync, MemoryMempool};
    use crate::identity::Keypair;
    use crate::peersync::PeerSyncHandle;

    fn manager(genesis: Hash) -> Arc<SyncManager> {
        let config = Config::default();
        let registry = Arc::new(PeerRegistry::new(config.max_bad_responses));
        let gater = Arc::new(ConnectionGater::new(&config, registry.clone()).unwrap());
        let chain = Arc::new(MemoryChain::new(genesis));
        let dag_sync = Arc::new(MemoryDagSync::new(chain.order()));
        let local = Arc::new(LocalNode::new(Keypair::generate(), None, 0, 0));
        let (handle, _rx) = PeerSyncHandle::channel();
        Arc::new(SyncManager::new(
            config,
            registry,
            gater,
            chain,
            Arc::new(MemoryMempool::new()),
            dag_sync,
            local,
            handle,
        ))
    }

    fn valid_state(sm: &SyncManager) -> ChainState {
        let mut cs = sm.local_chain_state();
        cs.graph_state.total = 10;
        cs
    }

    #[tokio::test]
    async fn chain_state_validation_accepts_matching() {
        let sm = manager(Hash::of(b"genesis"));
        let pe = sm.peers().fetch(Keypair::generate().node_id());
        assert!(sm.validate_chain_state(&valid_state(&sm), &pe).is_ok());
    }

    #[tokio::test]
    async fn chain_state_validation_rejects_wrong_genesis() {
        let sm = manager(Hash::of(b"genesis"));
        let pe = sm.peers().fetch(Keypair::generate().node_id());
        let mut cs = valid_state(&sm);
        cs.genesis_hash = Hash::of(b"other-genesis");
        assert!(matches!(
            sm.validate_chain_state(&cs, &pe),
            Err(ChainStateIssue::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn chain_state_validation_rejects_old_protocol() {
        let sm = manager(Hash::of(b"genesis"));
        let pe = sm.peers().fetch(Keypair::generate().node_id());
        let mut cs = valid_state(&sm);
        cs.protocol_version = INITIAL_PROTOCOL_VERSION - 1;
        assert!(matches!(
            sm.validate_chain_state(&cs, &pe),
            Err(ChainStateIssue::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn chain_state_validation_rejects_empty_graph() {
        let sm = manager(Hash::of(b"genesis"));
        let pe = sm.peers().fetch(Keypair::generate().node_id());
        let mut cs = valid_state(&sm);
        cs.graph_state.total = 0;
        assert!(matches!(
            sm.validate_chain_state(&cs, &pe),
            Err(ChainStateIssue::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn relay_peers_bypass_consensus_checks() {
        let sm = manager(Hash::of(b"genesis"));
        let pe = sm.peers().fetch(Keypair::generate().node_id());
        let mut cs = valid_state(&sm);
        cs.genesis_hash = Hash::of(b"other-genesis");
        cs.graph_state.total = 0;
        cs.services = Services::RELAY;
        assert!(sm.validate_chain_state(&cs, &pe).is_ok());
    }

    #[tokio::test]
    async fn inbound_peers_must_be_full_nodes() {
        let sm = manager(Hash::of(b"genesis"));
        let pe = sm.peers().fetch(Keypair::generate().node_id());
        pe.update_addr_dir(None, "addr".into(), Direction::Inbound);
        let mut cs = valid_state(&sm);
        cs.services = Services::BLOOM;
        assert!(matches!(
            sm.validate_chain_state(&cs, &pe),
            Err(ChainStateIssue::Invalid(_))
        ));
        // The same services are fine on an outbound peer.
        pe.update_addr_dir(None, "addr".into(), Direction::Outbound);
        assert!(sm.validate_chain_state(&cs, &pe).is_ok());
    }

    #[tokio::test]
    async fn is_current_with_no_sync_peer_tracks_chain() {
        let sm = manager(Hash::of(b"genesis"));
        assert!(sm.is_current());
        assert!(sm.is_complete_for_sync_peer());
    }

    #[tokio::test]
    async fn is_current_false_when_sync_peer_is_ahead() {
        let sm = manager(Hash::of(b"genesis"));
        let id = Keypair::generate().node_id();
        let pe = sm.peers().fetch(id);
        pe.update_graph_state(GraphState {
            total: 1000,
            layer: 1000,
            main_height: 999,
            main_order: 999,
            tips: vec![],
        });
        sm.set_sync_peer(Some(id));
        assert!(!sm.is_current());
    }

    #[tokio::test]
    async fn metadata_seq_bumps_on_subnet_change() {
        let sm = manager(Hash::of(b"genesis"));
        assert_eq!(sm.metadata_seq(), 0);
        sm.update_subnets(vec![0b1]);
        assert_eq!(sm.metadata_seq(), 1);
        assert_eq!(sm.local_metadata().subnet_indices(), vec![0]);
    }
}
