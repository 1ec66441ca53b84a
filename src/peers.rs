//! # Peer Status Registry
//!
//! Concurrency-safe bookkeeping for every peer this node has ever seen.
//! The registry owns all peer records by id; other components hold
//! [`NodeId`]s and resolve through the registry, so no component ever
//! holds a back-reference into another.
//!
//! Entries are never pruned: a peer that misbehaved keeps its bad-response
//! score across reconnects, decaying one point per decay tick. The map
//! grows with every seen peer for the process lifetime, which is bounded
//! in practice by the connection gater's peer limits.
//!
//! Query methods scan the full table under the read lock. Mutation rate is
//! low relative to read cadence; note the scans are O(n) per call, not
//! indexed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::identity::NodeId;
use crate::message::{ChainState, GraphState, Hash, Metadata, Services};
use crate::record::NodeRecord;

/// Bad responses after which a peer is considered bad.
pub const DEFAULT_MAX_BAD_RESPONSES: u32 = 50;

/// Cadence of the bad-response decay sweep.
pub const DECAY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Broadcast dedup records younger than this are kept.
pub const BROADCAST_RECORD_LIFE: Duration = Duration::from_secs(30 * 60);
/// Broadcast records below this count are kept regardless of age.
pub const MIN_BROADCAST_RECORD: usize = 10;

/// Sentinel for operations referencing a peer the registry has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrPeerUnknown;

impl std::fmt::Display for ErrPeerUnknown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer unknown")
    }
}

impl std::error::Error for ErrPeerUnknown {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Disconnecting,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }

    pub fn is_disconnecting(&self) -> bool {
        matches!(self, ConnectionState::Disconnecting)
    }

    /// A peer is active iff it is connected or connecting.
    pub fn is_active(&self) -> bool {
        self.is_connected() || self.is_connecting()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Unknown,
    Inbound,
    Outbound,
}

#[derive(Debug, Default)]
struct PeerState {
    address: Option<String>,
    direction: Direction,
    record: Option<NodeRecord>,
    conn_state: ConnectionState,
    chain_state: Option<ChainState>,
    chain_state_updated: Option<Instant>,
    graph_state_time: Option<Instant>,
    metadata: Option<Metadata>,
    sync_point: Option<Hash>,
    bad_responses: u32,
    bytes_sent: u64,
    bytes_recv: u64,
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
    con_time: Option<Instant>,
    time_offset: i64,
    /// Inventory keys recently announced to this peer, for dedup.
    broadcast: HashMap<String, Instant>,
}

/// A remote peer. All state sits behind one lock; the handshake guard is
/// a separate async mutex held across the whole handshake so concurrent
/// connection notifications for the same peer serialize.
pub struct Peer {
    id: NodeId,
    max_bad_responses: u32,
    state: RwLock<PeerState>,
    /// Per-peer handshake serialization.
    pub hs_guard: tokio::sync::Mutex<()>,
}

impl Peer {
    fn new(id: NodeId, max_bad_responses: u32) -> Self {
        Self {
            id,
            max_bad_responses,
            state: RwLock::new(PeerState::default()),
            hs_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PeerState> {
        self.state.read().expect("peer lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PeerState> {
        self.state.write().expect("peer lock poisoned")
    }

    // -- connection state ------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        self.read().conn_state
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        let mut s = self.write();
        s.conn_state = state;
        if state.is_connected() || state.is_disconnected() {
            s.con_time = Some(Instant::now());
        }
    }

    pub fn is_active(&self) -> bool {
        self.read().conn_state.is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.read().conn_state.is_connected()
    }

    pub fn connection_time(&self) -> Option<Instant> {
        self.read().con_time
    }

    // -- identity / addressing -------------------------------------------

    pub fn update_addr_dir(&self, record: Option<NodeRecord>, address: String, direction: Direction) {
        let mut s = self.write();
        s.address = Some(address);
        s.direction = direction;
        if record.is_some() {
            s.record = record;
        }
    }

    pub fn address(&self) -> Option<String> {
        self.read().address.clone()
    }

    pub fn direction(&self) -> Direction {
        self.read().direction
    }

    pub fn record(&self) -> Option<NodeRecord> {
        self.read().record.clone()
    }

    pub fn set_record(&self, record: NodeRecord) {
        self.write().record = Some(record);
    }

    // -- bad responses ---------------------------------------------------

    pub fn bad_responses(&self) -> u32 {
        self.read().bad_responses
    }

    /// A peer is bad iff its bad-response count reached the limit.
    /// Unknown peers are never bad, so the registry-level query can treat
    /// absence as good.
    pub fn is_bad(&self) -> bool {
        self.read().bad_responses >= self.max_bad_responses
    }

    pub fn increment_bad_responses(&self, reason: &str) {
        let mut s = self.write();
        s.bad_responses += 1;
        if s.bad_responses >= self.max_bad_responses {
            info!(peer = %self.id, reason, "peer crossed the bad threshold");
        } else {
            debug!(peer = %self.id, reason, count = s.bad_responses, "bad response");
        }
    }

    /// One decay tick: walk a positive counter one step back toward good.
    pub fn decay_bad_responses(&self) {
        let mut s = self.write();
        if s.bad_responses > 0 {
            s.bad_responses -= 1;
        }
    }

    pub fn reset_bad_responses(&self) {
        self.write().bad_responses = 0;
    }

    // -- chain state -----------------------------------------------------

    pub fn set_chain_state(&self, chain_state: ChainState) {
        let mut s = self.write();
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        s.time_offset = chain_state.timestamp as i64 - now_unix;
        s.chain_state = Some(chain_state);
        s.chain_state_updated = Some(Instant::now());
        s.graph_state_time = Some(Instant::now());
    }

    pub fn chain_state(&self) -> Option<ChainState> {
        self.read().chain_state.clone()
    }

    pub fn chain_state_last_updated(&self) -> Option<Instant> {
        self.read().chain_state_updated
    }

    /// Remote wall-clock timestamp from the last chain state, if any.
    pub fn timestamp(&self) -> Option<u64> {
        self.read().chain_state.as_ref().map(|cs| cs.timestamp)
    }

    pub fn time_offset(&self) -> i64 {
        self.read().time_offset
    }

    pub fn graph_state(&self) -> Option<GraphState> {
        self.read().chain_state.as_ref().map(|cs| cs.graph_state.clone())
    }

    pub fn update_graph_state(&self, gs: GraphState) {
        let mut s = self.write();
        match &mut s.chain_state {
            Some(cs) => cs.graph_state = gs,
            None => {
                // First contact through a graph-state push; synthesize a
                // minimal chain state to hang it on.
                s.chain_state = Some(ChainState {
                    genesis_hash: Hash::ZERO,
                    protocol_version: 0,
                    timestamp: 0,
                    services: Services::UNKNOWN,
                    graph_state: gs,
                    user_agent: Vec::new(),
                    disable_relay_tx: false,
                });
            }
        }
        s.graph_state_time = Some(Instant::now());
    }

    pub fn services(&self) -> Services {
        self.read()
            .chain_state
            .as_ref()
            .map(|cs| cs.services)
            .unwrap_or(Services::UNKNOWN)
    }

    pub fn is_relay(&self) -> bool {
        self.services().has(Services::RELAY)
    }

    /// Whether this peer participates in DAG consensus (a full node as
    /// opposed to a relay or observer).
    pub fn is_consensus(&self) -> bool {
        self.services().is_consensus()
    }

    pub fn disable_relay_tx(&self) -> bool {
        self.read()
            .chain_state
            .as_ref()
            .map(|cs| cs.disable_relay_tx)
            .unwrap_or(false)
    }

    pub fn protocol_version(&self) -> u32 {
        self.read()
            .chain_state
            .as_ref()
            .map(|cs| cs.protocol_version)
            .unwrap_or(0)
    }

    pub fn user_agent(&self) -> String {
        self.read()
            .chain_state
            .as_ref()
            .map(|cs| String::from_utf8_lossy(&cs.user_agent).into_owned())
            .unwrap_or_default()
    }

    // -- metadata / sync point ------------------------------------------

    pub fn metadata(&self) -> Option<Metadata> {
        self.read().metadata.clone()
    }

    pub fn set_metadata(&self, metadata: Metadata) {
        self.write().metadata = Some(metadata);
    }

    pub fn sync_point(&self) -> Option<Hash> {
        self.read().sync_point
    }

    pub fn update_sync_point(&self, point: Hash) {
        self.write().sync_point = Some(point);
    }

    // -- traffic accounting ---------------------------------------------

    pub fn increase_bytes_sent(&self, size: usize) {
        let mut s = self.write();
        s.bytes_sent += size as u64;
        s.last_send = Some(Instant::now());
    }

    pub fn increase_bytes_recv(&self, size: usize) {
        let mut s = self.write();
        s.bytes_recv += size as u64;
        s.last_recv = Some(Instant::now());
    }

    pub fn bytes_sent(&self) -> u64 {
        self.read().bytes_sent
    }

    pub fn bytes_recv(&self) -> u64 {
        self.read().bytes_recv
    }

    // -- broadcast dedup -------------------------------------------------

    pub fn mark_broadcast(&self, key: &str) {
        self.write()
            .broadcast
            .insert(key.to_string(), Instant::now());
    }

    pub fn has_broadcast(&self, key: &str) -> bool {
        self.read().broadcast.contains_key(key)
    }

    /// Drop broadcast records past their lifetime, keeping a small floor
    /// so recently idle peers do not lose all dedup state at once.
    pub fn update_broadcast(&self) {
        let mut s = self.write();
        if s.broadcast.len() <= MIN_BROADCAST_RECORD {
            return;
        }
        s.broadcast
            .retain(|_, added| added.elapsed() <= BROADCAST_RECORD_LIFE);
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let s = self.read();
        StatsSnapshot {
            peer_id: self.id,
            state: s.conn_state,
            direction: s.direction,
            protocol_version: s
                .chain_state
                .as_ref()
                .map(|cs| cs.protocol_version)
                .unwrap_or(0),
            services: s
                .chain_state
                .as_ref()
                .map(|cs| cs.services)
                .unwrap_or(Services::UNKNOWN),
            graph_state: s.chain_state.as_ref().map(|cs| cs.graph_state.clone()),
            bad_responses: s.bad_responses,
            bytes_sent: s.bytes_sent,
            bytes_recv: s.bytes_recv,
            time_offset: s.time_offset,
        }
    }
}

/// Point-in-time view of one peer for operator introspection.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub peer_id: NodeId,
    pub state: ConnectionState,
    pub direction: Direction,
    pub protocol_version: u32,
    pub services: Services,
    pub graph_state: Option<GraphState>,
    pub bad_responses: u32,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub time_offset: i64,
}

/// The registry: single owner of all peer records, keyed by id.
pub struct PeerRegistry {
    max_bad_responses: u32,
    peers: RwLock<HashMap<NodeId, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new(max_bad_responses: u32) -> Self {
        Self {
            max_bad_responses,
            peers: RwLock::new(HashMap::new()),
        }
    }

    fn map_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<NodeId, Arc<Peer>>> {
        self.peers.read().expect("registry lock poisoned")
    }

    /// Get the peer, creating a fresh disconnected entry if never seen.
    pub fn fetch(&self, id: NodeId) -> Arc<Peer> {
        if let Some(peer) = self.map_read().get(&id) {
            return peer.clone();
        }
        let mut map = self.peers.write().expect("registry lock poisoned");
        map.entry(id)
            .or_insert_with(|| Arc::new(Peer::new(id, self.max_bad_responses)))
            .clone()
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.map_read().get(id).cloned()
    }

    /// Idempotent upsert of address, direction, and record. Never resets
    /// connection state or the bad-response counter.
    pub fn add(&self, record: Option<NodeRecord>, id: NodeId, address: String, direction: Direction) {
        let peer = self.fetch(id);
        peer.update_addr_dir(record, address, direction);
    }

    pub fn connection_state(&self, id: &NodeId) -> Result<ConnectionState, ErrPeerUnknown> {
        self.get(id)
            .map(|p| p.connection_state())
            .ok_or(ErrPeerUnknown)
    }

    pub fn increment_bad_responses(&self, id: &NodeId, reason: &str) {
        if let Some(peer) = self.get(id) {
            peer.increment_bad_responses(reason);
        }
    }

    /// Whether the peer is bad. Unknown peers are never bad.
    pub fn is_bad(&self, id: &NodeId) -> bool {
        self.get(id).map(|p| p.is_bad()).unwrap_or(false)
    }

    /// One decay tick over all peers with positive counters.
    pub fn decay_all(&self) {
        for peer in self.map_read().values() {
            peer.decay_bad_responses();
        }
    }

    /// Prune broadcast dedup records on every peer.
    pub fn update_broadcasts(&self) {
        for peer in self.map_read().values() {
            peer.update_broadcast();
        }
    }

    fn filter(&self, predicate: impl Fn(&Peer) -> bool) -> Vec<Arc<Peer>> {
        self.map_read()
            .values()
            .filter(|p| predicate(p))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.map_read().values().cloned().collect()
    }

    pub fn connected(&self) -> Vec<Arc<Peer>> {
        self.filter(|p| p.connection_state().is_connected())
    }

    pub fn connecting(&self) -> Vec<Arc<Peer>> {
        self.filter(|p| p.connection_state().is_connecting())
    }

    pub fn active(&self) -> Vec<Arc<Peer>> {
        self.filter(|p| p.is_active())
    }

    pub fn inactive(&self) -> Vec<Arc<Peer>> {
        self.filter(|p| !p.is_active())
    }

    pub fn disconnected(&self) -> Vec<Arc<Peer>> {
        self.filter(|p| p.connection_state().is_disconnected())
    }

    pub fn bad(&self) -> Vec<Arc<Peer>> {
        self.filter(|p| p.is_bad())
    }

    pub fn dir_inbound(&self) -> Vec<Arc<Peer>> {
        self.filter(|p| p.is_active() && p.direction() == Direction::Inbound)
    }

    /// Run `f` for every peer in the given connection state.
    pub fn for_peers(&self, state: ConnectionState, f: impl FnMut(&Arc<Peer>)) {
        let mut f = f;
        for peer in self.filter(|p| p.connection_state() == state) {
            f(&peer);
        }
    }

    /// Spawn the hourly decay sweep. Runs until the registry is dropped.
    pub fn spawn_decay_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                registry.decay_all();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn registry() -> PeerRegistry {
        PeerRegistry::new(3)
    }

    fn chain_state(order: u32) -> ChainState {
        ChainState {
            genesis_hash: Hash::of(b"genesis"),
            protocol_version: 27,
            timestamp: 1_700_000_000,
            services: Services::FULL,
            graph_state: GraphState {
                total: order,
                layer: 1,
                main_height: order,
                main_order: order,
                tips: vec![],
            },
            user_agent: b"dagnet".to_vec(),
            disable_relay_tx: false,
        }
    }

    #[test]
    fn unknown_peer_sentinel() {
        let reg = registry();
        let ghost = Keypair::generate().node_id();
        assert_eq!(reg.connection_state(&ghost), Err(ErrPeerUnknown));
        assert!(!reg.is_bad(&ghost));
    }

    #[test]
    fn add_is_idempotent_for_state_and_score() {
        let reg = registry();
        let id = Keypair::generate().node_id();

        reg.add(None, id, "10.0.0.1:1234".into(), Direction::Outbound);
        let peer = reg.get(&id).unwrap();
        peer.set_connection_state(ConnectionState::Connected);
        peer.increment_bad_responses("test");

        // Re-adding with a different address updates addressing only.
        reg.add(None, id, "10.0.0.2:5678".into(), Direction::Inbound);
        let peer = reg.get(&id).unwrap();
        assert_eq!(peer.address().as_deref(), Some("10.0.0.2:5678"));
        assert_eq!(peer.direction(), Direction::Inbound);
        assert!(peer.connection_state().is_connected());
        assert_eq!(peer.bad_responses(), 1);
    }

    #[test]
    fn bad_threshold_exact_and_decay() {
        let reg = registry();
        let id = Keypair::generate().node_id();
        let peer = reg.fetch(id);

        peer.increment_bad_responses("one");
        peer.increment_bad_responses("two");
        assert!(!peer.is_bad());

        // Bad exactly when the count first reaches the limit.
        peer.increment_bad_responses("three");
        assert!(peer.is_bad());

        // Un-bad exactly when decayed back below it.
        reg.decay_all();
        assert!(!peer.is_bad());
        assert_eq!(peer.bad_responses(), 2);

        // Decay never underflows.
        for _ in 0..5 {
            reg.decay_all();
        }
        assert_eq!(peer.bad_responses(), 0);
    }

    #[test]
    fn connection_state_queries() {
        let reg = registry();
        let a = reg.fetch(Keypair::generate().node_id());
        let b = reg.fetch(Keypair::generate().node_id());
        let c = reg.fetch(Keypair::generate().node_id());

        a.set_connection_state(ConnectionState::Connected);
        b.set_connection_state(ConnectionState::Connecting);
        c.set_connection_state(ConnectionState::Disconnected);

        assert_eq!(reg.connected().len(), 1);
        assert_eq!(reg.connecting().len(), 1);
        assert_eq!(reg.active().len(), 2);
        assert_eq!(reg.inactive().len(), 1);
        assert_eq!(reg.all().len(), 3);

        assert!(a.is_active());
        assert!(b.is_active());
        assert!(!c.is_active());
    }

    #[test]
    fn dir_inbound_counts_active_only() {
        let reg = registry();
        let a = reg.fetch(Keypair::generate().node_id());
        let b = reg.fetch(Keypair::generate().node_id());
        a.update_addr_dir(None, "x".into(), Direction::Inbound);
        b.update_addr_dir(None, "y".into(), Direction::Inbound);
        a.set_connection_state(ConnectionState::Connected);
        // b stays disconnected.
        assert_eq!(reg.dir_inbound().len(), 1);
    }

    #[test]
    fn chain_state_updates_graph_and_services() {
        let reg = registry();
        let peer = reg.fetch(Keypair::generate().node_id());
        assert!(peer.graph_state().is_none());
        assert!(!peer.is_consensus());

        peer.set_chain_state(chain_state(42));
        assert_eq!(peer.graph_state().unwrap().main_order, 42);
        assert!(peer.is_consensus());
        assert!(peer.chain_state_last_updated().is_some());

        peer.update_graph_state(GraphState {
            total: 50,
            layer: 2,
            main_height: 50,
            main_order: 50,
            tips: vec![],
        });
        assert_eq!(peer.graph_state().unwrap().main_order, 50);
        // Chain state fields other than the graph survive.
        assert_eq!(peer.protocol_version(), 27);
    }

    #[test]
    fn graph_state_push_before_chain_state() {
        let reg = registry();
        let peer = reg.fetch(Keypair::generate().node_id());
        peer.update_graph_state(GraphState {
            total: 5,
            layer: 1,
            main_height: 5,
            main_order: 5,
            tips: vec![],
        });
        assert_eq!(peer.graph_state().unwrap().total, 5);
        // Still not a consensus peer: services are unknown.
        assert!(!peer.is_consensus());
    }

    #[test]
    fn broadcast_dedup_and_pruning() {
        let reg = registry();
        let peer = reg.fetch(Keypair::generate().node_id());

        peer.mark_broadcast("tx-1");
        assert!(peer.has_broadcast("tx-1"));
        assert!(!peer.has_broadcast("tx-2"));

        // Below the floor nothing is pruned, whatever the age.
        peer.update_broadcast();
        assert!(peer.has_broadcast("tx-1"));
    }

    #[test]
    fn stats_snapshot_reflects_state() {
        let reg = registry();
        let peer = reg.fetch(Keypair::generate().node_id());
        peer.set_chain_state(chain_state(7));
        peer.set_connection_state(ConnectionState::Connected);
        peer.increase_bytes_sent(100);
        peer.increase_bytes_recv(50);

        let snap = peer.stats_snapshot();
        assert_eq!(snap.state, ConnectionState::Connected);
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.bytes_recv, 50);
        assert_eq!(snap.graph_state.unwrap().main_order, 7);
    }
}
