//! # Routing Table
//!
//! A bounded, IP-diverse set of known nodes ordered by liveness, bucketed
//! by XOR bit-distance from the local id.
//!
//! ## Structure
//!
//! 256 buckets indexed by the highest differing bit of the distance. Each
//! bucket holds at most [`BUCKET_SIZE`] entries ordered most-recently-live
//! first, plus a small replacement cache of recently seen fallbacks.
//!
//! ## Insertion policy
//!
//! - `add_seen_node`: a node we heard from but have not proven live.
//!   Appended to the bucket tail if there is room; otherwise parked in the
//!   replacement cache. Never refreshes the position of a known entry.
//! - `add_verified_node`: a node that just proved liveness (valid pong or
//!   answered ping). Moved to the bucket head if present; inserted at the
//!   head if there is room; otherwise parked as a replacement — eviction
//!   is lazy, driven by revalidation, never eager on insert.
//! - Revalidation: the owner periodically pings the *last* entry of a
//!   random non-empty bucket. A live entry is bumped to the head with its
//!   liveness counter incremented; a dead one is evicted and the newest
//!   replacement takes its place.
//!
//! ## IP diversity invariant
//!
//! At all times: per bucket at most [`BUCKET_IP_LIMIT`] entries share a
//! /24, and table-wide at most [`TABLE_IP_LIMIT`]. Violating inserts are
//! rejected, not logged-and-allowed.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::identity::{distance_cmp, NodeId};
use crate::packet::RpcNode;
use crate::record::NodeRecord;

pub const BUCKET_COUNT: usize = 256;
pub const BUCKET_SIZE: usize = 16;
/// Replacement cache size per bucket.
pub const MAX_REPLACEMENTS: usize = 10;

/// Maximum entries sharing a /24 within one bucket.
pub const BUCKET_IP_LIMIT: usize = 2;
/// Maximum entries sharing a /24 across the whole table.
pub const TABLE_IP_LIMIT: usize = 10;

/// Subnet prefix length used for the diversity limits.
const SUBNET_BITS: u8 = 24;

/// A node as tracked by the routing table: contact endpoints, the optional
/// signed record once fetched, and liveness bookkeeping.
#[derive(Debug, Clone)]
pub struct DiscNode {
    id: NodeId,
    pub public_key: [u8; 32],
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
    /// Signed record, once resolved. `seq` mirrors its sequence number.
    pub record: Option<NodeRecord>,
    pub seq: u64,
    pub added_at: Instant,
    pub liveness_checks: u32,
}

impl DiscNode {
    pub fn new(id: NodeId, public_key: [u8; 32], ip: IpAddr, udp: u16, tcp: u16) -> Self {
        Self {
            id,
            public_key,
            ip,
            udp,
            tcp,
            record: None,
            seq: 0,
            added_at: Instant::now(),
            liveness_checks: 0,
        }
    }

    pub fn from_rpc(rpc: &RpcNode) -> Self {
        Self::new(rpc.id(), rpc.public_key, rpc.ip, rpc.udp, rpc.tcp)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp)
    }

    pub fn to_rpc(&self) -> RpcNode {
        RpcNode {
            public_key: self.public_key,
            ip: self.ip,
            udp: self.udp,
            tcp: self.tcp,
        }
    }
}

/// Truncate an IP to its diversity subnet key.
fn subnet_key(ip: &IpAddr) -> u64 {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            let bits = u32::from_be_bytes(octets) >> (32 - SUBNET_BITS as u32);
            bits as u64
        }
        IpAddr::V6(v6) => {
            // /48 for IPv6: same operational granularity as /24 for v4.
            let segs = v6.segments();
            ((segs[0] as u64) << 32) | ((segs[1] as u64) << 16) | segs[2] as u64 | (1 << 63)
        }
    }
}

/// Counting set of IPs with a per-subnet limit.
#[derive(Debug, Default)]
struct SubnetSet {
    limit: usize,
    counts: HashMap<u64, usize>,
}

impl SubnetSet {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
        }
    }

    /// Add `ip` if its subnet is below the limit. Returns false (and does
    /// not add) when the subnet is saturated.
    fn add(&mut self, ip: &IpAddr) -> bool {
        let key = subnet_key(ip);
        let count = self.counts.entry(key).or_insert(0);
        if *count >= self.limit {
            return false;
        }
        *count += 1;
        true
    }

    fn remove(&mut self, ip: &IpAddr) {
        let key = subnet_key(ip);
        if let Some(count) = self.counts.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&key);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    /// Live entries, most-recently-live first.
    entries: Vec<DiscNode>,
    /// Recently seen fallbacks for lazy eviction.
    replacements: Vec<DiscNode>,
    ips: SubnetSet,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            replacements: Vec::new(),
            ips: SubnetSet::new(BUCKET_IP_LIMIT),
        }
    }

    fn bump(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.entries.iter().position(|n| n.id == *id) {
            let mut node = self.entries.remove(pos);
            node.liveness_checks = node.liveness_checks.max(1);
            self.entries.insert(0, node);
            return true;
        }
        false
    }
}

pub struct Table {
    self_id: NodeId,
    buckets: Vec<Bucket>,
    table_ips: SubnetSet,
}

impl Table {
    pub fn new(self_id: NodeId) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(Bucket::new());
        }
        Self {
            self_id,
            buckets,
            table_ips: SubnetSet::new(TABLE_IP_LIMIT),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.self_id.bucket_index(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&DiscNode> {
        let idx = self.bucket_index(id);
        self.buckets[idx].entries.iter().find(|n| n.id == *id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut DiscNode> {
        let idx = self.bucket_index(id);
        self.buckets[idx].entries.iter_mut().find(|n| n.id == *id)
    }

    /// Add a node we heard from but have not proven live. No-op when
    /// already present (does not refresh position). Appends at the tail,
    /// subject to room and IP limits; a full bucket parks the node in the
    /// replacement cache instead.
    pub fn add_seen_node(&mut self, node: DiscNode) {
        if node.id == self.self_id {
            return;
        }
        let idx = self.bucket_index(&node.id);
        let bucket = &mut self.buckets[idx];
        if bucket.entries.iter().any(|n| n.id == node.id) {
            return;
        }
        if bucket.entries.len() >= BUCKET_SIZE {
            Self::add_replacement(bucket, node);
            return;
        }
        if !bucket.ips.add(&node.ip) {
            return;
        }
        if !self.table_ips.add(&node.ip) {
            bucket.ips.remove(&node.ip);
            return;
        }
        bucket.entries.push(node);
    }

    /// Add a node that just proved liveness. Moves a known entry to the
    /// bucket head; otherwise inserts at the head, or parks the node as a
    /// replacement when the bucket is full (lazy eviction).
    pub fn add_verified_node(&mut self, mut node: DiscNode) {
        if node.id == self.self_id {
            return;
        }
        node.liveness_checks = node.liveness_checks.max(1);
        let idx = self.bucket_index(&node.id);
        let bucket = &mut self.buckets[idx];
        if bucket.bump(&node.id) {
            return;
        }
        if bucket.entries.len() >= BUCKET_SIZE {
            Self::add_replacement(bucket, node);
            return;
        }
        if !bucket.ips.add(&node.ip) {
            return;
        }
        if !self.table_ips.add(&node.ip) {
            bucket.ips.remove(&node.ip);
            return;
        }
        bucket.entries.insert(0, node);
    }

    fn add_replacement(bucket: &mut Bucket, node: DiscNode) {
        if bucket.replacements.iter().any(|n| n.id == node.id) {
            return;
        }
        bucket.replacements.insert(0, node);
        bucket.replacements.truncate(MAX_REPLACEMENTS);
    }

    pub fn remove(&mut self, id: &NodeId) {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.entries.iter().position(|n| n.id == *id) {
            let node = bucket.entries.remove(pos);
            bucket.ips.remove(&node.ip);
            self.table_ips.remove(&node.ip);
        }
    }

    /// Pick the last (least-recently-live) entry of a random non-empty
    /// bucket, the candidate for the next revalidation ping.
    pub fn revalidation_target(&self, rng_seed: u64) -> Option<(usize, DiscNode)> {
        let non_empty: Vec<usize> = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty())
            .map(|(i, _)| i)
            .collect();
        if non_empty.is_empty() {
            return None;
        }
        let idx = non_empty[(rng_seed as usize) % non_empty.len()];
        let node = self.buckets[idx].entries.last()?.clone();
        Some((idx, node))
    }

    /// Apply the outcome of a revalidation ping to the bucket's last
    /// entry. A live node is bumped to the head; a dead one is evicted and
    /// the newest replacement (if any) takes the vacant slot.
    pub fn handle_revalidation(&mut self, bucket_idx: usize, id: &NodeId, alive: bool, seq: Option<u64>) {
        let bucket = &mut self.buckets[bucket_idx];
        let Some(pos) = bucket.entries.iter().position(|n| n.id == *id) else {
            return;
        };
        if alive {
            let mut node = bucket.entries.remove(pos);
            node.liveness_checks += 1;
            if let Some(seq) = seq {
                if seq > node.seq {
                    // Record went stale relative to the live node; drop it
                    // so the next record fetch refreshes.
                    node.seq = seq;
                    node.record = None;
                }
            }
            bucket.entries.insert(0, node);
            return;
        }
        let dead = bucket.entries.remove(pos);
        bucket.ips.remove(&dead.ip);
        self.table_ips.remove(&dead.ip);
        // Promote the most recent replacement that still fits the limits.
        while let Some(candidate) = bucket.replacements.first().cloned() {
            bucket.replacements.remove(0);
            if !bucket.ips.add(&candidate.ip) {
                continue;
            }
            if !self.table_ips.add(&candidate.ip) {
                bucket.ips.remove(&candidate.ip);
                continue;
            }
            bucket.entries.push(candidate);
            break;
        }
    }

    /// The `n` nodes closest to `target` by XOR distance, ascending, no
    /// duplicates. With `only_alive`, entries that never passed a
    /// liveness check are skipped.
    pub fn closest(&self, target: &NodeId, n: usize, only_alive: bool) -> Vec<DiscNode> {
        if n == 0 {
            return Vec::new();
        }
        let mut best: Vec<(&DiscNode, [u8; 32])> = Vec::with_capacity(n + 1);
        for bucket in &self.buckets {
            for node in &bucket.entries {
                if only_alive && node.liveness_checks == 0 {
                    continue;
                }
                let dist = node.id.xor_distance(target);
                let pos = best
                    .binary_search_by(|(_, d)| distance_cmp(d, &dist))
                    .unwrap_or_else(|p| p);
                if pos < n {
                    best.insert(pos, (node, dist));
                    best.truncate(n);
                }
            }
        }
        best.into_iter().map(|(node, _)| node.clone()).collect()
    }

    pub fn all(&self) -> Vec<DiscNode> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect()
    }

    /// Verify the IP diversity invariant; test support.
    #[cfg(test)]
    fn check_ip_invariant(&self) {
        let mut table_counts: HashMap<u64, usize> = HashMap::new();
        for bucket in &self.buckets {
            let mut bucket_counts: HashMap<u64, usize> = HashMap::new();
            for node in &bucket.entries {
                let key = subnet_key(&node.ip);
                *bucket_counts.entry(key).or_insert(0) += 1;
                *table_counts.entry(key).or_insert(0) += 1;
            }
            for count in bucket_counts.values() {
                assert!(*count <= BUCKET_IP_LIMIT, "bucket IP limit violated");
            }
        }
        for count in table_counts.values() {
            assert!(*count <= TABLE_IP_LIMIT, "table IP limit violated");
        }
    }
}

/// Per-(node, IP) endpoint-proof bookkeeping: last ping/pong times and
/// find-node failure counts. Same query surface as a persistent node
/// database, held in memory for the process lifetime.
#[derive(Debug, Default)]
pub struct NodeDb {
    entries: HashMap<(NodeId, IpAddr), NodeDbEntry>,
}

#[derive(Debug, Default, Clone)]
struct NodeDbEntry {
    last_ping_received: Option<Instant>,
    last_pong_received: Option<Instant>,
    find_fails: u32,
}

impl NodeDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_last_ping_received(&mut self, id: NodeId, ip: IpAddr) {
        self.entries.entry((id, ip)).or_default().last_ping_received = Some(Instant::now());
    }

    pub fn update_last_pong_received(&mut self, id: NodeId, ip: IpAddr) {
        self.entries.entry((id, ip)).or_default().last_pong_received = Some(Instant::now());
    }

    /// Elapsed time since the last pong from this endpoint, or `None` if
    /// we never received one.
    pub fn since_last_pong(&self, id: NodeId, ip: IpAddr) -> Option<Duration> {
        self.entries
            .get(&(id, ip))?
            .last_pong_received
            .map(|t| t.elapsed())
    }

    pub fn since_last_ping(&self, id: NodeId, ip: IpAddr) -> Option<Duration> {
        self.entries
            .get(&(id, ip))?
            .last_ping_received
            .map(|t| t.elapsed())
    }

    pub fn find_fails(&self, id: NodeId, ip: IpAddr) -> u32 {
        self.entries
            .get(&(id, ip))
            .map(|e| e.find_fails)
            .unwrap_or(0)
    }

    pub fn update_find_fails(&mut self, id: NodeId, ip: IpAddr, fails: u32) {
        self.entries.entry((id, ip)).or_default().find_fails = fails;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id_with_prefix(first: u8, salt: u8) -> NodeId {
        let mut bytes = [salt; 32];
        bytes[0] = first;
        NodeId::from_bytes(bytes)
    }

    fn node(id: NodeId, ip: [u8; 4]) -> DiscNode {
        DiscNode::new(
            id,
            *id.as_bytes(),
            IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
            30301,
            30302,
        )
    }

    fn table() -> Table {
        Table::new(NodeId::from_bytes([0u8; 32]))
    }

    #[test]
    fn add_seen_appends_to_tail() {
        let mut tab = table();
        // Same bucket (both start with 0x80), distinct subnets.
        let n1 = node(id_with_prefix(0x80, 1), [10, 0, 1, 1]);
        let n2 = node(id_with_prefix(0x80, 2), [10, 0, 2, 1]);
        tab.add_seen_node(n1.clone());
        tab.add_seen_node(n2.clone());

        let all = tab.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id(), n1.id());
        assert_eq!(all[1].id(), n2.id());

        // Re-adding does not refresh position.
        tab.add_seen_node(node(n1.id(), [10, 0, 3, 1]));
        let all = tab.all();
        assert_eq!(all[0].id(), n1.id());
        tab.check_ip_invariant();
    }

    #[test]
    fn add_verified_moves_to_front() {
        let mut tab = table();
        let n1 = node(id_with_prefix(0x80, 1), [10, 0, 1, 1]);
        let n2 = node(id_with_prefix(0x80, 2), [10, 0, 2, 1]);
        tab.add_seen_node(n1.clone());
        tab.add_seen_node(n2.clone());

        tab.add_verified_node(node(n2.id(), [10, 0, 2, 1]));
        let all = tab.all();
        assert_eq!(all[0].id(), n2.id());
        assert_eq!(all[1].id(), n1.id());
        tab.check_ip_invariant();
    }

    #[test]
    fn no_duplicate_entries() {
        let mut tab = table();
        let n = node(id_with_prefix(0x80, 1), [10, 0, 1, 1]);
        tab.add_seen_node(n.clone());
        tab.add_seen_node(n.clone());
        tab.add_verified_node(n.clone());
        assert_eq!(tab.len(), 1);
    }

    #[test]
    fn full_bucket_parks_replacements() {
        let mut tab = table();
        for i in 0..BUCKET_SIZE as u8 {
            // Distinct subnets to stay inside IP limits.
            tab.add_seen_node(node(id_with_prefix(0x80, i + 1), [10, i, 0, 1]));
        }
        assert_eq!(tab.len(), BUCKET_SIZE);

        // Overflow node is not inserted...
        let overflow = node(id_with_prefix(0x80, 99), [10, 99, 0, 1]);
        tab.add_verified_node(overflow.clone());
        assert_eq!(tab.len(), BUCKET_SIZE);
        assert!(tab.get(&overflow.id()).is_none());

        // ...until revalidation kills the tail.
        let (idx, tail) = {
            let all = tab.all();
            let tail = all.last().unwrap().clone();
            (tab.bucket_index(&tail.id()), tail)
        };
        tab.handle_revalidation(idx, &tail.id(), false, None);
        assert!(tab.get(&overflow.id()).is_some());
        assert!(tab.get(&tail.id()).is_none());
        tab.check_ip_invariant();
    }

    #[test]
    fn revalidation_bumps_live_tail() {
        let mut tab = table();
        let n1 = node(id_with_prefix(0x80, 1), [10, 0, 1, 1]);
        let n2 = node(id_with_prefix(0x80, 2), [10, 0, 2, 1]);
        tab.add_seen_node(n1.clone());
        tab.add_seen_node(n2.clone());

        let idx = tab.bucket_index(&n2.id());
        tab.handle_revalidation(idx, &n2.id(), true, None);
        let all = tab.all();
        assert_eq!(all[0].id(), n2.id());
        assert_eq!(all[0].liveness_checks, 1);
    }

    #[test]
    fn revalidation_refreshes_stale_record_seq() {
        let mut tab = table();
        let mut n = node(id_with_prefix(0x80, 1), [10, 0, 1, 1]);
        n.seq = 3;
        n.record = Some(NodeRecord::new());
        tab.add_seen_node(n.clone());

        let idx = tab.bucket_index(&n.id());
        tab.handle_revalidation(idx, &n.id(), true, Some(7));
        let held = tab.get(&n.id()).unwrap();
        assert_eq!(held.seq, 7);
        assert!(held.record.is_none());
    }

    #[test]
    fn bucket_ip_limit_enforced() {
        let mut tab = table();
        let mut inserted = 0;
        for i in 0..(BUCKET_IP_LIMIT + 3) as u8 {
            // Same /24 for everyone, same bucket.
            tab.add_seen_node(node(id_with_prefix(0x80, i + 1), [10, 0, 0, i + 1]));
            inserted += 1;
        }
        assert!(inserted > BUCKET_IP_LIMIT);
        assert_eq!(tab.len(), BUCKET_IP_LIMIT);
        tab.check_ip_invariant();
    }

    #[test]
    fn table_ip_limit_enforced() {
        let mut tab = table();
        // Spread over many buckets, all in one /24.
        for i in 0..(TABLE_IP_LIMIT + 5) as u8 {
            let mut bytes = [0u8; 32];
            bytes[0] = 1 << (i % 8);
            bytes[1] = i;
            bytes[31] = i;
            tab.add_seen_node(node(NodeId::from_bytes(bytes), [192, 168, 1, i + 1]));
        }
        assert!(tab.len() <= TABLE_IP_LIMIT);
        tab.check_ip_invariant();
    }

    #[test]
    fn closest_is_sorted_and_correct() {
        let mut tab = table();
        let mut ids = Vec::new();
        for i in 1..=40u8 {
            let mut bytes = [0u8; 32];
            bytes[0] = i;
            bytes[31] = i;
            let id = NodeId::from_bytes(bytes);
            ids.push(id);
            tab.add_seen_node(node(id, [10, i, 0, 1]));
        }
        let target = NodeId::from_bytes([0x13; 32]);
        let got = tab.closest(&target, 8, false);
        assert_eq!(got.len(), 8);

        // Sorted ascending by distance, no duplicates.
        for pair in got.windows(2) {
            let d0 = pair[0].id().xor_distance(&target);
            let d1 = pair[1].id().xor_distance(&target);
            assert_ne!(pair[0].id(), pair[1].id());
            assert!(distance_cmp(&d0, &d1) != std::cmp::Ordering::Greater);
        }

        // No excluded node is strictly closer than the farthest returned.
        let farthest = got.last().unwrap().id().xor_distance(&target);
        let included: Vec<NodeId> = got.iter().map(|n| n.id()).collect();
        for id in &ids {
            if included.contains(id) {
                continue;
            }
            let d = id.xor_distance(&target);
            assert!(distance_cmp(&d, &farthest) != std::cmp::Ordering::Less);
        }
    }

    #[test]
    fn closest_respects_count_and_aliveness() {
        let mut tab = table();
        let n1 = node(id_with_prefix(0x80, 1), [10, 0, 1, 1]);
        let mut n2 = node(id_with_prefix(0x80, 2), [10, 0, 2, 1]);
        n2.liveness_checks = 1;
        tab.add_seen_node(n1.clone());
        tab.add_seen_node(n2.clone());

        let target = NodeId::from_bytes([0x80; 32]);
        assert_eq!(tab.closest(&target, 10, false).len(), 2);
        let alive = tab.closest(&target, 10, true);
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id(), n2.id());
        assert!(tab.closest(&target, 0, false).is_empty());
    }

    #[test]
    fn self_never_inserted() {
        let mut tab = table();
        let own = node(tab.self_id(), [10, 0, 0, 1]);
        tab.add_seen_node(own.clone());
        tab.add_verified_node(own);
        assert_eq!(tab.len(), 0);
    }

    #[test]
    fn node_db_roundtrip() {
        let mut db = NodeDb::new();
        let id = id_with_prefix(1, 1);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(db.since_last_pong(id, ip).is_none());
        db.update_last_pong_received(id, ip);
        assert!(db.since_last_pong(id, ip).unwrap() < Duration::from_secs(1));

        db.update_last_ping_received(id, ip);
        assert!(db.since_last_ping(id, ip).is_some());

        assert_eq!(db.find_fails(id, ip), 0);
        db.update_find_fails(id, ip, 3);
        assert_eq!(db.find_fails(id, ip), 3);
    }
}
