//! # RPC Wire Messages
//!
//! Serializable types for the request/response sync protocol. Everything
//! here crosses a trust boundary and is decoded with the bounded codec in
//! [`crate::encoding`]; validation beyond structure (genesis match, graph
//! state sanity) happens in the handlers.

use serde::{Deserialize, Serialize};

use crate::record::NodeRecord;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 27;

/// Minimum protocol version accepted from peers.
pub const INITIAL_PROTOCOL_VERSION: u32 = 18;

/// A 32-byte block or transaction hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", &hex::encode(self.0)[..16])
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Advertised service bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Services(pub u64);

impl Services {
    pub const UNKNOWN: Services = Services(0);
    /// Full DAG participant: serves blocks and validates.
    pub const FULL: Services = Services(1 << 0);
    /// Relay-only node, not a consensus participant.
    pub const RELAY: Services = Services(1 << 1);
    /// Observer node, consumes but does not serve.
    pub const OBSERVER: Services = Services(1 << 2);
    /// Bloom-filter service for light clients.
    pub const BLOOM: Services = Services(1 << 3);

    #[inline]
    pub fn has(&self, flag: Services) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn missing(&self, wanted: Services) -> Services {
        Services(wanted.0 & !self.0)
    }

    /// Whether these services mark a consensus participant (full node
    /// rather than a relay or observer).
    pub fn is_consensus(&self) -> bool {
        self.has(Services::FULL)
    }
}

impl std::ops::BitOr for Services {
    type Output = Services;
    fn bitor(self, rhs: Services) -> Services {
        Services(self.0 | rhs.0)
    }
}

/// Comparable snapshot of DAG sync progress.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphState {
    pub total: u32,
    pub layer: u32,
    pub main_height: u32,
    pub main_order: u32,
    pub tips: Vec<Hash>,
}

impl GraphState {
    /// Strict dominance order used to pick a sync target: `self` is
    /// excellent relative to `other` iff it is strictly further along.
    /// Main-chain order is the primary measure of progress; the remaining
    /// fields break ties so the relation stays a strict total order on the
    /// numeric snapshot.
    pub fn is_excellent(&self, other: &GraphState) -> bool {
        let lhs = (self.main_order, self.main_height, self.layer, self.total);
        let rhs = (other.main_order, other.main_height, other.layer, other.total);
        lhs > rhs
    }

    /// Numeric equality, ignoring the tip set.
    pub fn is_equal(&self, other: &GraphState) -> bool {
        (self.main_order, self.main_height, self.layer, self.total)
            == (other.main_order, other.main_height, other.layer, other.total)
    }
}

impl std::fmt::Display for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({},{},{},{},tips={})",
            self.total,
            self.layer,
            self.main_height,
            self.main_order,
            self.tips.len()
        )
    }
}

/// Chain-state message exchanged at handshake and on revalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub genesis_hash: Hash,
    pub protocol_version: u32,
    pub timestamp: u64,
    pub services: Services,
    pub graph_state: GraphState,
    pub user_agent: Vec<u8>,
    pub disable_relay_tx: bool,
}

/// Peer metadata: monotone sequence plus subnet subscription bitfield.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub seq_number: u64,
    pub subnets: Vec<u8>,
}

impl Metadata {
    /// Indices of set bits in the subnet bitfield.
    pub fn subnet_indices(&self) -> Vec<u64> {
        let mut out = Vec::new();
        for (byte_idx, byte) in self.subnets.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    out.push((byte_idx * 8 + bit) as u64);
                }
            }
        }
        out
    }
}

/// Direct block request by locator hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocks {
    pub locator: Vec<Hash>,
}

/// Response to [`GetBlocks`]: hashes the responder can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagBlocks {
    pub blocks: Vec<Hash>,
}

/// Block body fetch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockDatas {
    pub locator: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub block_bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDatas {
    pub locator: Vec<BlockData>,
}

/// Sub-DAG reconciliation request: our main-chain locator plus our view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDag {
    pub main_locator: Vec<Hash>,
    pub graph_state: GraphState,
}

/// Sub-DAG reconciliation answer: agreed sync point, responder view, and
/// the candidate block hashes past the sync point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDag {
    pub sync_point: Hash,
    pub graph_state: GraphState,
    pub blocks: Vec<Hash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvType {
    Tx,
    Block,
    FilteredBlock,
}

impl std::fmt::Display for InvType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvType::Tx => write!(f, "tx"),
            InvType::Block => write!(f, "block"),
            InvType::FilteredBlock => write!(f, "filtered-block"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvVect {
    pub inv_type: InvType,
    pub hash: Hash,
}

impl InvVect {
    pub fn new(inv_type: InvType, hash: Hash) -> Self {
        Self { inv_type, hash }
    }
}

/// Inventory announcement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Inventory {
    pub invs: Vec<InvVect>,
}

/// Serialized transaction body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_bytes: Vec<u8>,
}

/// Mempool announcement request (no payload beyond the marker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemPoolRequest {}

/// Node-record exchange: ask a peer for its signed record, sending ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub record: NodeRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Encoding;

    fn gs(total: u32, layer: u32, height: u32, order: u32) -> GraphState {
        GraphState {
            total,
            layer,
            main_height: height,
            main_order: order,
            tips: vec![],
        }
    }

    #[test]
    fn graph_state_dominance() {
        let local = gs(100, 10, 50, 50);
        let ahead = gs(120, 12, 60, 60);
        let behind = gs(80, 8, 40, 40);

        assert!(ahead.is_excellent(&local));
        assert!(!behind.is_excellent(&local));
        assert!(!local.is_excellent(&local));
    }

    #[test]
    fn graph_state_order_is_strict_and_total() {
        let a = gs(100, 10, 50, 50);
        let b = gs(100, 10, 50, 51);
        // Exactly one direction holds for unequal states.
        assert!(b.is_excellent(&a));
        assert!(!a.is_excellent(&b));
        // Antisymmetry around equality.
        assert!(a.is_equal(&a));
        assert!(!a.is_equal(&b));
    }

    #[test]
    fn graph_state_equality_ignores_tips() {
        let mut a = gs(10, 1, 5, 5);
        let mut b = gs(10, 1, 5, 5);
        a.tips = vec![Hash::of(b"x")];
        b.tips = vec![Hash::of(b"y")];
        assert!(a.is_equal(&b));
    }

    #[test]
    fn services_flags() {
        let s = Services::FULL | Services::BLOOM;
        assert!(s.has(Services::FULL));
        assert!(s.has(Services::BLOOM));
        assert!(!s.has(Services::RELAY));
        assert!(s.is_consensus());
        assert_eq!(s.missing(Services::FULL | Services::RELAY), Services::RELAY);
        assert!(!Services::RELAY.is_consensus());
    }

    #[test]
    fn metadata_subnet_indices() {
        let md = Metadata {
            seq_number: 3,
            subnets: vec![0b0000_0101, 0b1000_0000],
        };
        assert_eq!(md.subnet_indices(), vec![0, 2, 15]);
    }

    #[test]
    fn chain_state_roundtrip() {
        let cs = ChainState {
            genesis_hash: Hash::of(b"genesis"),
            protocol_version: PROTOCOL_VERSION,
            timestamp: 1_700_000_000,
            services: Services::FULL,
            graph_state: gs(1, 1, 1, 1),
            user_agent: b"dagnet/0.3.0".to_vec(),
            disable_relay_tx: false,
        };
        for enc in [Encoding::Plain, Encoding::Snappy] {
            let bytes = enc.encode(&cs).unwrap();
            let back: ChainState = enc.decode(&bytes).unwrap();
            assert_eq!(back, cs);
        }
    }

    #[test]
    fn sync_dag_roundtrip() {
        let sd = SyncDag {
            main_locator: vec![Hash::of(b"a"), Hash::of(b"b")],
            graph_state: gs(5, 2, 3, 3),
        };
        let bytes = Encoding::Snappy.encode(&sd).unwrap();
        let back: SyncDag = Encoding::Snappy.decode(&bytes).unwrap();
        assert_eq!(back, sd);
    }
}
