//! # Peer Synchronization Engine
//!
//! Picks a sync target among connected peers and drives block-by-block
//! DAG catch-up against it: locator exchange, sub-DAG reconciliation,
//! block-body fetch, and orphan-directed requests.
//!
//! The engine is an actor: one task owns all sync decisions and consumes
//! a bounded command channel. Everything else (handlers, maintenance
//! loops, the rebroadcast engine) talks to it through a cheap-to-clone
//! [`PeerSyncHandle`] whose sends never block; when the channel is full
//! the command is dropped with a trace log and the periodic stall check
//! picks up the slack.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::chain::{TxDesc, MAX_ORPHAN_BLOCKS};
use crate::identity::NodeId;
use crate::message::{
    GetBlockDatas, GetBlocks, Hash, InvType, InvVect, Inventory, SyncDag, SyncRecord,
};
use crate::peers::Peer;
use crate::record::{Node, SchemePolicy};
use crate::sync::{SyncManager, PEER_INTERVAL};

/// Maximum block locator hashes allowed per message.
pub const MAX_BLOCK_LOCATORS_PER_MSG: usize = 500;

/// The interval at which we check whether sync has stalled.
pub const STALL_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the engine's command channel.
const SYNC_CHANNEL_SIZE: usize = 256;

enum SyncMessage {
    Connected(NodeId),
    Disconnected(NodeId),
    PeerUpdate(NodeId),
    UpdateGraphState(NodeId),
    SyncDagBlocks(NodeId),
    GetBlocks(NodeId, Vec<Hash>),
    GetBlockDatas(NodeId, Vec<Hash>),
    GetTxs(NodeId, Vec<Hash>),
    GetData(NodeId, Vec<InvVect>),
    MemPool(NodeId),
    SyncRecord(NodeId),
    RelayInventory(Vec<TxDesc>),
    Quit,
}

/// Handle to the peer-sync actor. Clones share the command channel.
#[derive(Clone)]
pub struct PeerSyncHandle {
    tx: mpsc::Sender<SyncMessage>,
}

impl PeerSyncHandle {
    /// Create the command channel. The receiver goes to [`PeerSync::spawn`].
    pub fn channel() -> (PeerSyncHandle, PeerSyncReceiver) {
        let (tx, rx) = mpsc::channel(SYNC_CHANNEL_SIZE);
        (PeerSyncHandle { tx }, PeerSyncReceiver { rx })
    }

    fn send(&self, msg: SyncMessage) {
        if let Err(e) = self.tx.try_send(msg) {
            trace!("peer sync command dropped: {e}");
        }
    }

    pub fn on_connected(&self, peer: NodeId) {
        self.send(SyncMessage::Connected(peer));
    }

    pub fn on_disconnected(&self, peer: NodeId) {
        self.send(SyncMessage::Disconnected(peer));
    }

    pub fn peer_update(&self, peer: NodeId) {
        self.send(SyncMessage::PeerUpdate(peer));
    }

    pub fn update_graph_state(&self, peer: NodeId) {
        self.send(SyncMessage::UpdateGraphState(peer));
    }

    pub fn sync_dag_blocks(&self, peer: NodeId) {
        self.send(SyncMessage::SyncDagBlocks(peer));
    }

    pub fn get_blocks(&self, peer: NodeId, blocks: Vec<Hash>) {
        self.send(SyncMessage::GetBlocks(peer, blocks));
    }

    pub fn get_block_datas(&self, peer: NodeId, blocks: Vec<Hash>) {
        self.send(SyncMessage::GetBlockDatas(peer, blocks));
    }

    pub fn get_txs(&self, peer: NodeId, txs: Vec<Hash>) {
        self.send(SyncMessage::GetTxs(peer, txs));
    }

    pub fn get_data(&self, peer: NodeId, invs: Vec<InvVect>) {
        self.send(SyncMessage::GetData(peer, invs));
    }

    pub fn on_mempool(&self, peer: NodeId) {
        self.send(SyncMessage::MemPool(peer));
    }

    pub fn sync_record(&self, peer: NodeId) {
        self.send(SyncMessage::SyncRecord(peer));
    }

    pub fn relay_inventory(&self, txs: Vec<TxDesc>) {
        self.send(SyncMessage::RelayInventory(txs));
    }

    pub fn stop(&self) {
        self.send(SyncMessage::Quit);
    }
}

/// The receiving half of the command channel; consumed by the actor.
pub struct PeerSyncReceiver {
    rx: mpsc::Receiver<SyncMessage>,
}

/// The sync engine actor.
pub struct PeerSync {
    sm: Arc<SyncManager>,
    rx: mpsc::Receiver<SyncMessage>,
}

impl PeerSync {
    /// Spawn the engine task. It runs until `Quit` or every handle drops.
    pub fn spawn(sm: Arc<SyncManager>, rx: PeerSyncReceiver) -> tokio::task::JoinHandle<()> {
        let engine = PeerSync { sm, rx: rx.rx };
        tokio::spawn(engine.run())
    }

    async fn run(mut self) {
        info!("peer sync engine started");
        let mut stall = tokio::time::interval(STALL_SAMPLE_INTERVAL);
        stall.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stall.tick().await;
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        None | Some(SyncMessage::Quit) => break,
                        Some(msg) => self.dispatch(msg).await,
                    }
                }
                _ = stall.tick() => self.handle_stall_sample(),
            }
        }
        info!("peer sync engine stopped");
    }

    async fn dispatch(&mut self, msg: SyncMessage) {
        match msg {
            SyncMessage::Connected(id) => self.on_peer_connected(id),
            SyncMessage::Disconnected(id) => self.on_peer_disconnected(id),
            SyncMessage::PeerUpdate(id) => {
                trace!(peer = %id, "peer update");
                self.update_sync_peer(false);
            }
            SyncMessage::UpdateGraphState(id) => {
                if let Err(e) = self.process_update_graph_state(id).await {
                    trace!(peer = %id, "graph state update failed: {e}");
                }
            }
            SyncMessage::SyncDagBlocks(id) => {
                if let Err(e) = self.process_sync_dag_blocks(id).await {
                    debug!(peer = %id, "sync DAG failed: {e}");
                }
            }
            SyncMessage::GetBlocks(id, blocks) => {
                if let Err(e) = self.process_get_blocks(id, blocks).await {
                    debug!(peer = %id, "get blocks failed: {e}");
                }
            }
            SyncMessage::GetBlockDatas(id, blocks) => {
                if let Err(e) = self.process_get_block_datas(id, blocks).await {
                    debug!(peer = %id, "get block datas failed: {e}");
                }
            }
            SyncMessage::GetTxs(id, txs) => {
                if let Err(e) = self.process_get_txs(id, txs).await {
                    debug!(peer = %id, "tx fetch failed: {e}");
                }
            }
            SyncMessage::GetData(id, invs) => {
                if let Err(e) = self.on_get_data(id, invs).await {
                    debug!(peer = %id, "get data failed: {e}");
                }
            }
            SyncMessage::MemPool(id) => self.on_mempool(id),
            SyncMessage::SyncRecord(id) => {
                if let Err(e) = self.process_sync_record(id).await {
                    warn!(peer = %id, "record exchange failed: {e}");
                }
            }
            SyncMessage::RelayInventory(txs) => self.relay_inventory(&txs),
            SyncMessage::Quit => unreachable!("Quit is handled in run() before dispatch"),
        }
    }

    // ------------------------------------------------------------------
    // Sync-peer selection
    // ------------------------------------------------------------------

    fn on_peer_connected(&self, id: NodeId) {
        trace!(peer = %id, "sync engine: peer connected");
        self.update_sync_peer(false);
    }

    fn on_peer_disconnected(&self, id: NodeId) {
        if self.sm.is_sync_peer(&id) {
            self.update_sync_peer(true);
        }
    }

    fn handle_stall_sample(&self) {
        if self.sm.has_sync_peer() && self.sm.last_sync().elapsed() >= PEER_INTERVAL {
            debug!("sync stalled, forcing sync peer re-selection");
            self.update_sync_peer(true);
        }
    }

    fn update_sync_peer(&self, force: bool) {
        if force {
            self.sm.set_sync_peer(None);
        }
        self.start_sync();
    }

    /// Choose the best peer to sync from and kick off catch-up. Returns
    /// quietly when a sync is already running or no candidate is ahead.
    fn start_sync(&self) {
        if self.sm.has_sync_peer() {
            return;
        }
        let best = self.sm.local_graph_state();
        let Some(best_peer) = self.get_best_peer() else {
            trace!("already up to date, no synchronization required");
            return;
        };
        let Some(pe) = self.sm.peers().get(&best_peer) else {
            return;
        };
        let Some(gs) = pe.graph_state() else {
            return;
        };
        info!(
            peer = %best_peer,
            target = %gs,
            local = %best,
            "syncing from peer"
        );
        self.sm.set_sync_peer(Some(best_peer));
        self.intellect_sync_blocks(true, best_peer);
        self.sm.dag_sync().set_graph_state(&gs);
    }

    /// The most-advanced connected consensus peer strictly ahead of us.
    /// Ties among equally-best peers break deterministically toward the
    /// greatest peer id.
    fn get_best_peer(&self) -> Option<NodeId> {
        let local = self.sm.local_graph_state();
        let mut best: Option<crate::message::GraphState> = None;
        let mut equal: Vec<Arc<Peer>> = Vec::new();
        for pe in self.sm.peers().connected() {
            if !pe.is_consensus() {
                continue;
            }
            let Some(gs) = pe.graph_state() else {
                continue;
            };
            if !gs.is_excellent(&local) {
                continue;
            }
            match &best {
                None => {
                    best = Some(gs);
                    equal = vec![pe];
                }
                Some(bgs) => {
                    if gs.is_excellent(bgs) {
                        best = Some(gs);
                        equal = vec![pe];
                    } else if gs.is_equal(bgs) {
                        equal.push(pe);
                    }
                }
            }
        }
        equal
            .into_iter()
            .map(|pe| pe.id())
            .max_by(|a, b| a.as_bytes().cmp(b.as_bytes()))
    }

    // ------------------------------------------------------------------
    // Catch-up driving
    // ------------------------------------------------------------------

    /// Decide how to catch up from `peer`: targeted orphan-parent fetch if
    /// the orphan pool points anywhere, full sub-DAG reconciliation
    /// otherwise.
    fn intellect_sync_blocks(&self, refresh: bool, peer: NodeId) {
        let chain = self.sm.chain();
        if chain.get_orphans_total() >= MAX_ORPHAN_BLOCKS || refresh {
            if let Err(e) = chain.refresh_orphans() {
                trace!("failed to refresh orphans: {e}");
            }
        }
        let orphan_parents = chain.get_recent_orphan_parents();
        if !orphan_parents.is_empty() {
            trace!(peer = %peer, orphans = orphan_parents.len(), "requesting orphan parents");
            self.sm.peersync().get_blocks(peer, orphan_parents);
        } else {
            trace!(peer = %peer, "requesting sub-DAG sync");
            self.sm.peersync().sync_dag_blocks(peer);
        }
    }

    /// After the batch outcome is known, decide whether to keep the
    /// current target or re-select.
    fn continue_sync(&self, orphan: bool) {
        let Some(sp) = self.sm.sync_peer() else {
            self.update_sync_peer(false);
            return;
        };
        let still_best = self
            .sm
            .peers()
            .get(&sp)
            .map(|pe| pe.is_connected() && pe.graph_state().is_some())
            .unwrap_or(false)
            && self.get_best_peer() == Some(sp);
        if !still_best {
            self.update_sync_peer(true);
            return;
        }
        self.intellect_sync_blocks(orphan, sp);
    }

    fn is_usable_sync_peer(&self, id: &NodeId) -> Option<Arc<Peer>> {
        if !self.sm.is_sync_peer(id) {
            return None;
        }
        self.sm.peers().get(id).filter(|pe| pe.is_connected())
    }

    /// Targeted block request: ask for specific hashes (orphan parents),
    /// then fetch the bodies of whatever the responder can serve.
    async fn process_get_blocks(&self, id: NodeId, blocks: Vec<Hash>) -> anyhow::Result<()> {
        if blocks.is_empty() {
            anyhow::bail!("no blocks requested");
        }
        if self.is_usable_sync_peer(&id).is_none() {
            anyhow::bail!("no sync peer");
        }
        if blocks.len() == 1 {
            return self.process_get_block_datas(id, blocks).await;
        }
        let db = self
            .sm
            .send_get_blocks_request(id, GetBlocks { locator: blocks })
            .await?;
        if db.blocks.is_empty() {
            debug!(peer = %id, "no block need to get");
            return Ok(());
        }
        self.sm.peersync().get_block_datas(id, db.blocks);
        Ok(())
    }

    /// Locator-based sub-DAG reconciliation with the sync peer. Any
    /// failure resets the sync peer so the next tick re-selects.
    async fn process_sync_dag_blocks(&self, id: NodeId) -> anyhow::Result<()> {
        let Some(pe) = self.is_usable_sync_peer(&id) else {
            anyhow::bail!("no sync peer");
        };
        let point = pe.sync_point();
        let main_locator = self.sm.dag_sync().get_main_locator(point.as_ref());
        let sd = SyncDag {
            main_locator,
            graph_state: self.sm.local_graph_state(),
        };
        let subd = match self.sm.send_sync_dag_request(id, sd).await {
            Ok(subd) => subd,
            Err(e) => {
                self.update_sync_peer(true);
                anyhow::bail!("sync DAG request failed: {e}");
            }
        };
        trace!(
            peer = %id,
            point = %subd.sync_point,
            blocks = subd.blocks.len(),
            "sub-DAG received"
        );
        pe.update_sync_point(subd.sync_point);
        pe.update_graph_state(subd.graph_state);
        if subd.blocks.is_empty() {
            self.update_sync_peer(true);
            anyhow::bail!("no sync DAG blocks");
        }
        self.sm.peersync().get_block_datas(id, subd.blocks);
        Ok(())
    }

    /// Fetch block bodies and feed them to the chain. An orphan result
    /// halts the batch; partial success announces our refreshed graph
    /// state to the peer before the next round is chosen.
    async fn process_get_block_datas(&self, id: NodeId, blocks: Vec<Hash>) -> anyhow::Result<()> {
        let Some(pe) = self.is_usable_sync_peer(&id) else {
            anyhow::bail!("no sync peer");
        };
        let chain = self.sm.chain();
        let needed: Vec<Hash> = blocks
            .iter()
            .filter(|h| !chain.have_block(h))
            .cloned()
            .collect();
        if needed.is_empty() {
            self.continue_sync(false);
            return Ok(());
        }

        if !self.sm.long_sync() {
            if let Some(gs) = pe.graph_state() {
                let local_total = self.sm.local_graph_state().total;
                if gs.total as usize >= local_total as usize + MAX_BLOCK_LOCATORS_PER_MSG {
                    debug!(peer = %id, "entering long sync mode");
                    self.sm.set_long_sync(true);
                }
            }
        }

        let total = needed.len();
        let bd = match self
            .sm
            .send_get_block_datas_request(id, GetBlockDatas { locator: needed })
            .await
        {
            Ok(bd) => bd,
            Err(e) => {
                warn!(peer = %id, "get block datas send: {e}");
                self.update_sync_peer(true);
                anyhow::bail!("block data request failed: {e}");
            }
        };

        let mut added = 0usize;
        let mut has_orphan = false;
        for data in &bd.locator {
            match chain.process_block(&data.block_bytes, crate::chain::BehaviorFlags::P2P_ADD) {
                Err(e) => {
                    error!("failed to process block: {e}");
                    break;
                }
                Ok(true) => {
                    has_orphan = true;
                    break;
                }
                Ok(false) => {
                    added += 1;
                    self.sm.touch_sync_progress();
                }
            }
        }
        debug!(peer = %id, "block datas: {added}/{total}");

        if added > 0 {
            self.sm.mempool().prune_expired_tx();
            if self.sm.long_sync() {
                if self.sm.is_complete_for_sync_peer() {
                    info!("synchronization completed");
                    self.sm.set_long_sync(false);
                }
                if self.sm.is_current() {
                    info!("you're up to date now");
                    self.sm.set_long_sync(false);
                }
            }
            if has_orphan || added < bd.locator.len() {
                // Partial batch: let the peer see where we got to.
                self.sm.peersync().update_graph_state(id);
            }
            self.continue_sync(has_orphan);
            Ok(())
        } else {
            self.continue_sync(has_orphan);
            anyhow::bail!("no blocks added");
        }
    }

    // ------------------------------------------------------------------
    // Graph state, transactions, inventory
    // ------------------------------------------------------------------

    async fn process_update_graph_state(&self, id: NodeId) -> anyhow::Result<()> {
        let Some(pe) = self.sm.peers().get(&id).filter(|pe| pe.is_connected()) else {
            anyhow::bail!("peer not connected");
        };
        let gs = self
            .sm
            .send_graph_state_request(id, self.sm.local_graph_state())
            .await?;
        pe.update_graph_state(gs);
        self.update_sync_peer(false);
        Ok(())
    }

    /// Fetch each transaction body and admit it to the mempool; accepted
    /// transactions are relayed onward.
    async fn process_get_txs(&self, id: NodeId, txs: Vec<Hash>) -> anyhow::Result<()> {
        let mempool = self.sm.mempool();
        let mut accepted: Vec<TxDesc> = Vec::new();
        for txhash in txs {
            let tx = self.sm.send_tx_request(id, txhash).await?;
            match mempool.process_transaction(&tx.tx_bytes, false, true) {
                Ok(hashes) => {
                    accepted.extend(hashes.into_iter().map(|hash| TxDesc {
                        hash,
                        added: std::time::Instant::now(),
                        fee_per_kb: 0,
                    }));
                }
                Err(e) => {
                    debug!(peer = %id, %txhash, "mempool rejected transaction: {e}");
                    self.sm
                        .peers()
                        .increment_bad_responses(&id, "rejected transaction");
                }
            }
        }
        if !accepted.is_empty() {
            self.relay_inventory(&accepted);
        }
        Ok(())
    }

    /// Inventory-driven delivery request from a peer: serve transactions
    /// from the mempool and block bodies from the chain.
    async fn on_get_data(&self, id: NodeId, invs: Vec<InvVect>) -> anyhow::Result<()> {
        let mut txs = Vec::new();
        let mut blocks = Vec::new();
        for inv in invs {
            match inv.inv_type {
                InvType::Tx => txs.push(inv.hash),
                InvType::Block | InvType::FilteredBlock => blocks.push(inv.hash),
            }
        }
        if !txs.is_empty() {
            self.process_get_txs(id, txs).await?;
        }
        if !blocks.is_empty() {
            self.process_get_block_datas(id, blocks).await?;
        }
        Ok(())
    }

    /// Mempool announce request: send the peer our full pending set as
    /// inventory, bounded and deduplicated per peer.
    fn on_mempool(&self, id: NodeId) {
        let Some(pe) = self.sm.peers().get(&id) else {
            return;
        };
        let mut invs = Vec::new();
        for desc in self.sm.mempool().tx_descs() {
            let key = desc.hash.to_string();
            if pe.has_broadcast(&key) {
                continue;
            }
            pe.mark_broadcast(&key);
            invs.push(InvVect::new(InvType::Tx, desc.hash));
            if invs.len() >= MAX_BLOCK_LOCATORS_PER_MSG {
                break;
            }
        }
        if invs.is_empty() {
            return;
        }
        let sm = self.sm.clone();
        tokio::spawn(async move {
            if let Err(e) = sm.send_inventory_request(id, Inventory { invs }).await {
                trace!(peer = %id, "mempool inventory push failed: {e}");
            }
        });
    }

    /// Record exchange: offer our signed record, verify the peer's reply
    /// binds to its identity, and store it.
    async fn process_sync_record(&self, id: NodeId) -> anyhow::Result<()> {
        let Some(pe) = self.sm.peers().get(&id) else {
            anyhow::bail!("peer unknown");
        };
        let ours = SyncRecord {
            record: self.sm.local_node().node().record().clone(),
        };
        let theirs = self.sm.send_sync_record_request(id, ours).await?;
        let node = Node::new(SchemePolicy::Production, theirs.record)
            .map_err(|e| anyhow::anyhow!("invalid record: {e}"))?;
        if node.id() != id {
            self.sm
                .peers()
                .increment_bad_responses(&id, "record identity mismatch");
            anyhow::bail!("record binds to {} instead of {id}", node.id());
        }
        pe.set_record(node.record().clone());
        Ok(())
    }

    /// Announce transaction inventory to every connected peer, honoring
    /// per-peer dedup and relay-disable flags.
    fn relay_inventory(&self, txs: &[TxDesc]) {
        for pe in self.sm.peers().connected() {
            if pe.disable_relay_tx() {
                continue;
            }
            let mut invs = Vec::new();
            for desc in txs {
                let key = desc.hash.to_string();
                if pe.has_broadcast(&key) {
                    continue;
                }
                pe.mark_broadcast(&key);
                invs.push(InvVect::new(InvType::Tx, desc.hash));
            }
            if invs.is_empty() {
                continue;
            }
            let sm = self.sm.clone();
            let id = pe.id();
            tokio::spawn(async move {
                trace!(peer = %id, count = invs.len(), "relaying inventory");
                if let Err(e) = sm.send_inventory_request(id, Inventory { invs }).await {
                    trace!(peer = %id, "inventory relay failed: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MemoryChain, MemoryDagSync, MemoryMempool};
    use crate::config::Config;
    use crate::gater::ConnectionGater;
    use crate::identity::Keypair;
    use crate::message::GraphState;
    use crate::peers::{ConnectionState, PeerRegistry};
    use crate::record::LocalNode;

    fn gs(order: u32) -> GraphState {
        GraphState {
            total: order + 1,
            layer: order,
            main_height: order,
            main_order: order,
            tips: vec![],
        }
    }

    fn engine() -> (PeerSync, Arc<SyncManager>) {
        let config = Config::default();
        let registry = Arc::new(PeerRegistry::new(config.max_bad_responses));
        let gater = Arc::new(ConnectionGater::new(&config, registry.clone()).unwrap());
        let chain = Arc::new(MemoryChain::new(Hash::of(b"genesis")));
        let dag_sync = Arc::new(MemoryDagSync::new(chain.order()));
        let local = Arc::new(LocalNode::new(Keypair::generate(), None, 0, 0));
        let (handle, rx) = PeerSyncHandle::channel();
        let sm = Arc::new(SyncManager::new(
            config,
            registry,
            gater,
            chain,
            Arc::new(MemoryMempool::new()),
            dag_sync,
            local,
            handle,
        ));
        (PeerSync { sm: sm.clone(), rx: rx.rx }, sm)
    }

    fn connect_peer(sm: &SyncManager, order: u32) -> NodeId {
        let id = Keypair::generate().node_id();
        let pe = sm.peers().fetch(id);
        pe.set_connection_state(ConnectionState::Connected);
        let mut cs = sm.local_chain_state();
        cs.graph_state = gs(order);
        pe.set_chain_state(cs);
        id
    }

    #[tokio::test]
    async fn best_peer_none_without_candidates() {
        let (engine, sm) = engine();
        assert_eq!(engine.get_best_peer(), None);

        // A peer that is not ahead of us is not a candidate.
        let behind = connect_peer(&sm, 0);
        assert!(sm.peers().get(&behind).unwrap().graph_state().is_some());
        assert_eq!(engine.get_best_peer(), None);
    }

    #[tokio::test]
    async fn best_peer_picks_strict_maximum() {
        let (engine, sm) = engine();
        connect_peer(&sm, 10);
        let ahead = connect_peer(&sm, 50);
        connect_peer(&sm, 30);
        assert_eq!(engine.get_best_peer(), Some(ahead));
    }

    #[tokio::test]
    async fn best_peer_tie_breaks_to_greatest_id() {
        let (engine, sm) = engine();
        let a = connect_peer(&sm, 40);
        let b = connect_peer(&sm, 40);
        let expect = if a.as_bytes() > b.as_bytes() { a } else { b };
        assert_eq!(engine.get_best_peer(), Some(expect));
    }

    #[tokio::test]
    async fn best_peer_skips_non_consensus() {
        let (engine, sm) = engine();
        let id = Keypair::generate().node_id();
        let pe = sm.peers().fetch(id);
        pe.set_connection_state(ConnectionState::Connected);
        let mut cs = sm.local_chain_state();
        cs.graph_state = gs(99);
        cs.services = crate::message::Services::RELAY;
        pe.set_chain_state(cs);
        assert_eq!(engine.get_best_peer(), None);
    }

    #[tokio::test]
    async fn start_sync_without_peers_leaves_sync_peer_unset() {
        let (engine, sm) = engine();
        engine.start_sync();
        assert!(!sm.has_sync_peer());
        // Current tracks the chain alone when no sync peer exists.
        assert!(sm.is_current());
    }

    #[tokio::test]
    async fn start_sync_selects_and_records_target() {
        let (engine, sm) = engine();
        let ahead = connect_peer(&sm, 77);
        engine.start_sync();
        assert_eq!(sm.sync_peer(), Some(ahead));
        // The DAG sync helper saw the target graph state.
        assert!(!sm.is_current());
    }

    #[tokio::test]
    async fn disconnect_of_sync_peer_forces_reselection() {
        let (mut engine, sm) = engine();
        let ahead = connect_peer(&sm, 77);
        engine.start_sync();
        assert_eq!(sm.sync_peer(), Some(ahead));

        sm.peers()
            .get(&ahead)
            .unwrap()
            .set_connection_state(ConnectionState::Disconnected);
        engine.dispatch(SyncMessage::Disconnected(ahead)).await;
        assert_eq!(sm.sync_peer(), None);
    }

    #[tokio::test]
    async fn handle_dropped_commands_do_not_panic() {
        let (handle, rx) = PeerSyncHandle::channel();
        drop(rx);
        // Channel closed: sends become trace-logged no-ops.
        handle.peer_update(Keypair::generate().node_id());
        handle.stop();
    }
}
