//! # Chain Collaborators
//!
//! Traits for everything the networking core consumes but does not own:
//! the block chain / DAG, the transaction mempool, and the DAG locator
//! helper that computes sync points. The real implementations live in the
//! consensus engine; the in-memory versions here back the tests and local
//! tooling.
//!
//! The chain object is a shared resource mutated concurrently by the
//! consensus engine. Nothing in this crate assumes exclusive access:
//! every check-then-act sequence (e.g. `have_block` before a fetch)
//! tolerates the answer changing in between.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use crate::message::{GraphState, Hash};

/// Orphan pool size that triggers an orphan refresh during sync.
pub const MAX_ORPHAN_BLOCKS: usize = 500;

/// Block-processing behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BehaviorFlags(pub u32);

impl BehaviorFlags {
    pub const NONE: BehaviorFlags = BehaviorFlags(0);
    /// The block arrived over the P2P network rather than local mining or
    /// an explicit submission.
    pub const P2P_ADD: BehaviorFlags = BehaviorFlags(1 << 0);
}

/// Point-in-time view of the best chain state.
#[derive(Debug, Clone)]
pub struct BestSnapshot {
    pub graph_state: GraphState,
}

/// The block chain / DAG consumed by the sync engine.
pub trait BlockChain: Send + Sync + 'static {
    fn best_snapshot(&self) -> BestSnapshot;
    fn genesis_hash(&self) -> Hash;
    fn have_block(&self, hash: &Hash) -> bool;
    /// Serialized block body, if present.
    fn fetch_block_bytes(&self, hash: &Hash) -> anyhow::Result<Vec<u8>>;
    /// Process a block received from the network. Returns whether the
    /// block was an orphan (parents unknown).
    fn process_block(&self, block_bytes: &[u8], flags: BehaviorFlags) -> anyhow::Result<bool>;
    fn get_orphans_total(&self) -> usize;
    fn refresh_orphans(&self) -> anyhow::Result<()>;
    fn get_recent_orphan_parents(&self) -> Vec<Hash>;
    /// Whether the chain believes it is caught up with the network.
    fn is_current(&self) -> bool;
}

/// Locator comparison mode for [`DagSync::calc_sync_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// The locator lists exactly the blocks wanted.
    Direct,
    /// The locator describes the requester's main chain; compute the
    /// divergence point and the sub-DAG past it.
    SubDag,
}

/// DAG locator helper bound to the local DAG.
pub trait DagSync: Send + Sync + 'static {
    /// Compute the blocks to send a peer and the agreed sync point, from
    /// the peer's graph state and locator, bounded to `max` entries.
    fn calc_sync_blocks(
        &self,
        peer_state: Option<&GraphState>,
        locator: &[Hash],
        mode: SyncMode,
        max: usize,
    ) -> (Vec<Hash>, Hash);

    /// Main-chain locator starting from `point` (or from the tip when
    /// `point` is unknown).
    fn get_main_locator(&self, point: Option<&Hash>) -> Vec<Hash>;

    /// Record the graph state we are syncing toward.
    fn set_graph_state(&self, gs: &GraphState);
}

/// A transaction as tracked by the mempool.
#[derive(Debug, Clone)]
pub struct TxDesc {
    pub hash: Hash,
    pub added: Instant,
    pub fee_per_kb: i64,
}

/// The transaction mempool consumed by relay and rebroadcast.
pub trait TxMemPool: Send + Sync + 'static {
    fn have_transaction(&self, hash: &Hash) -> bool;
    fn tx_descs(&self) -> Vec<TxDesc>;
    /// Validate and insert a transaction body. Returns hashes accepted
    /// into the pool (the transaction plus any orphans it released).
    fn process_transaction(
        &self,
        tx_bytes: &[u8],
        allow_orphans: bool,
        rate_limit: bool,
    ) -> anyhow::Result<Vec<Hash>>;
    fn fetch_transaction(&self, hash: &Hash) -> anyhow::Result<Vec<u8>>;
    fn prune_expired_tx(&self);
}

// ---------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------

/// In-memory chain: a hash-addressed block store with a linear main
/// order. Backs tests and local tooling.
pub struct MemoryChain {
    genesis: Hash,
    inner: RwLock<MemoryChainState>,
}

struct MemoryChainState {
    blocks: HashMap<Hash, Vec<u8>>,
    order: Vec<Hash>,
    orphans: HashSet<Hash>,
    orphan_parents: Vec<Hash>,
    current: bool,
}

impl MemoryChain {
    pub fn new(genesis: Hash) -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(genesis, genesis.as_bytes().to_vec());
        Self {
            genesis,
            inner: RwLock::new(MemoryChainState {
                blocks,
                order: vec![genesis],
                orphans: HashSet::new(),
                orphan_parents: Vec::new(),
                current: true,
            }),
        }
    }

    /// Append a block directly, as local mining would.
    pub fn add_block(&self, hash: Hash, bytes: Vec<u8>) {
        let mut inner = self.inner.write().expect("chain lock");
        if inner.blocks.insert(hash, bytes).is_none() {
            inner.order.push(hash);
        }
    }

    pub fn set_current(&self, current: bool) {
        self.inner.write().expect("chain lock").current = current;
    }

    pub fn set_orphan_parents(&self, parents: Vec<Hash>) {
        self.inner.write().expect("chain lock").orphan_parents = parents;
    }

    /// Mark a hash so the next `process_block` of it reports an orphan.
    pub fn mark_orphan(&self, hash: Hash) {
        self.inner.write().expect("chain lock").orphans.insert(hash);
    }

    pub fn order(&self) -> Vec<Hash> {
        self.inner.read().expect("chain lock").order.clone()
    }
}

impl BlockChain for MemoryChain {
    fn best_snapshot(&self) -> BestSnapshot {
        let inner = self.inner.read().expect("chain lock");
        let total = inner.order.len() as u32;
        BestSnapshot {
            graph_state: GraphState {
                total,
                layer: total,
                main_height: total.saturating_sub(1),
                main_order: total.saturating_sub(1),
                tips: inner.order.last().map(|h| vec![*h]).unwrap_or_default(),
            },
        }
    }

    fn genesis_hash(&self) -> Hash {
        self.genesis
    }

    fn have_block(&self, hash: &Hash) -> bool {
        self.inner.read().expect("chain lock").blocks.contains_key(hash)
    }

    fn fetch_block_bytes(&self, hash: &Hash) -> anyhow::Result<Vec<u8>> {
        self.inner
            .read()
            .expect("chain lock")
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("block {hash} not found"))
    }

    fn process_block(&self, block_bytes: &[u8], _flags: BehaviorFlags) -> anyhow::Result<bool> {
        let hash = Hash::of(block_bytes);
        let mut inner = self.inner.write().expect("chain lock");
        if inner.orphans.contains(&hash) {
            return Ok(true);
        }
        if inner.blocks.insert(hash, block_bytes.to_vec()).is_none() {
            inner.order.push(hash);
        }
        Ok(false)
    }

    fn get_orphans_total(&self) -> usize {
        self.inner.read().expect("chain lock").orphans.len()
    }

    fn refresh_orphans(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_recent_orphan_parents(&self) -> Vec<Hash> {
        self.inner.read().expect("chain lock").orphan_parents.clone()
    }

    fn is_current(&self) -> bool {
        self.inner.read().expect("chain lock").current
    }
}

/// Locator helper over a [`MemoryChain`]'s linear order.
pub struct MemoryDagSync {
    order: Mutex<Vec<Hash>>,
    target: Mutex<Option<GraphState>>,
}

impl MemoryDagSync {
    pub fn new(order: Vec<Hash>) -> Self {
        Self {
            order: Mutex::new(order),
            target: Mutex::new(None),
        }
    }

    pub fn set_order(&self, order: Vec<Hash>) {
        *self.order.lock().expect("dagsync lock") = order;
    }

    pub fn target(&self) -> Option<GraphState> {
        self.target.lock().expect("dagsync lock").clone()
    }
}

impl DagSync for MemoryDagSync {
    fn calc_sync_blocks(
        &self,
        _peer_state: Option<&GraphState>,
        locator: &[Hash],
        mode: SyncMode,
        max: usize,
    ) -> (Vec<Hash>, Hash) {
        let order = self.order.lock().expect("dagsync lock");
        match mode {
            SyncMode::Direct => {
                let have: Vec<Hash> = locator
                    .iter()
                    .filter(|h| order.contains(h))
                    .take(max)
                    .cloned()
                    .collect();
                let point = order.first().copied().unwrap_or(Hash::ZERO);
                (have, point)
            }
            SyncMode::SubDag => {
                // The divergence point is the deepest locator entry we
                // share; everything after it is the candidate sub-DAG.
                let point_pos = locator
                    .iter()
                    .filter_map(|h| order.iter().position(|o| o == h))
                    .max()
                    .unwrap_or(0);
                let point = order.get(point_pos).copied().unwrap_or(Hash::ZERO);
                let blocks = order
                    .iter()
                    .skip(point_pos + 1)
                    .take(max)
                    .cloned()
                    .collect();
                (blocks, point)
            }
        }
    }

    fn get_main_locator(&self, point: Option<&Hash>) -> Vec<Hash> {
        let order = self.order.lock().expect("dagsync lock");
        let start = point
            .and_then(|p| order.iter().position(|o| o == p))
            .unwrap_or(0);
        // From the tip back toward the sync point, newest first.
        order.iter().skip(start).rev().take(32).cloned().collect()
    }

    fn set_graph_state(&self, gs: &GraphState) {
        *self.target.lock().expect("dagsync lock") = Some(gs.clone());
    }
}

/// In-memory mempool.
#[derive(Default)]
pub struct MemoryMempool {
    txs: RwLock<HashMap<Hash, Vec<u8>>>,
}

impl MemoryMempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, hash: Hash, bytes: Vec<u8>) {
        self.txs.write().expect("mempool lock").insert(hash, bytes);
    }

    pub fn remove(&self, hash: &Hash) {
        self.txs.write().expect("mempool lock").remove(hash);
    }

    pub fn len(&self) -> usize {
        self.txs.read().expect("mempool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TxMemPool for MemoryMempool {
    fn have_transaction(&self, hash: &Hash) -> bool {
        self.txs.read().expect("mempool lock").contains_key(hash)
    }

    fn tx_descs(&self) -> Vec<TxDesc> {
        self.txs
            .read()
            .expect("mempool lock")
            .keys()
            .map(|hash| TxDesc {
                hash: *hash,
                added: Instant::now(),
                fee_per_kb: 0,
            })
            .collect()
    }

    fn process_transaction(
        &self,
        tx_bytes: &[u8],
        _allow_orphans: bool,
        _rate_limit: bool,
    ) -> anyhow::Result<Vec<Hash>> {
        let hash = Hash::of(tx_bytes);
        self.txs
            .write()
            .expect("mempool lock")
            .insert(hash, tx_bytes.to_vec());
        Ok(vec![hash])
    }

    fn fetch_transaction(&self, hash: &Hash) -> anyhow::Result<Vec<u8>> {
        self.txs
            .read()
            .expect("mempool lock")
            .get(hash)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("transaction {hash} not in pool"))
    }

    fn prune_expired_tx(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_chain_process_and_fetch() {
        let chain = MemoryChain::new(Hash::of(b"genesis"));
        let body = b"block-1".to_vec();
        let hash = Hash::of(&body);

        assert!(!chain.have_block(&hash));
        let orphan = chain.process_block(&body, BehaviorFlags::P2P_ADD).unwrap();
        assert!(!orphan);
        assert!(chain.have_block(&hash));
        assert_eq!(chain.fetch_block_bytes(&hash).unwrap(), body);
        assert_eq!(chain.best_snapshot().graph_state.total, 2);
    }

    #[test]
    fn memory_chain_orphan_reporting() {
        let chain = MemoryChain::new(Hash::of(b"genesis"));
        let body = b"orphan-block".to_vec();
        chain.mark_orphan(Hash::of(&body));
        assert!(chain.process_block(&body, BehaviorFlags::P2P_ADD).unwrap());
        assert!(!chain.have_block(&Hash::of(&body)));
    }

    #[test]
    fn dag_sync_subdag_divergence() {
        let order: Vec<Hash> = (0..10u8).map(|i| Hash::of(&[i])).collect();
        let ds = MemoryDagSync::new(order.clone());

        // Peer knows up to index 4; we serve 5.. with the sync point at 4.
        let locator = vec![order[4], order[2]];
        let (blocks, point) = ds.calc_sync_blocks(None, &locator, SyncMode::SubDag, 500);
        assert_eq!(point, order[4]);
        assert_eq!(blocks, order[5..].to_vec());

        // Bounded by max.
        let (blocks, _) = ds.calc_sync_blocks(None, &locator, SyncMode::SubDag, 2);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn dag_sync_direct_mode_filters_unknown() {
        let order: Vec<Hash> = (0..4u8).map(|i| Hash::of(&[i])).collect();
        let ds = MemoryDagSync::new(order.clone());
        let locator = vec![order[1], Hash::of(b"unknown"), order[3]];
        let (blocks, _) = ds.calc_sync_blocks(None, &locator, SyncMode::Direct, 500);
        assert_eq!(blocks, vec![order[1], order[3]]);
    }

    #[test]
    fn main_locator_newest_first() {
        let order: Vec<Hash> = (0..8u8).map(|i| Hash::of(&[i])).collect();
        let ds = MemoryDagSync::new(order.clone());
        let locator = ds.get_main_locator(None);
        assert_eq!(locator.first(), Some(&order[7]));

        let from_point = ds.get_main_locator(Some(&order[5]));
        assert_eq!(from_point, vec![order[7], order[6], order[5]]);
    }

    #[test]
    fn mempool_roundtrip() {
        let pool = MemoryMempool::new();
        let tx = b"tx-1".to_vec();
        let accepted = pool.process_transaction(&tx, true, true).unwrap();
        assert_eq!(accepted.len(), 1);
        assert!(pool.have_transaction(&accepted[0]));
        assert_eq!(pool.fetch_transaction(&accepted[0]).unwrap(), tx);
        pool.remove(&accepted[0]);
        assert!(!pool.have_transaction(&accepted[0]));
    }
}
