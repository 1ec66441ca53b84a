//! # Discovery Transport
//!
//! UDP transport for the discovery protocol: sends signed packets, matches
//! replies to pending requests, maintains the routing table, and answers
//! queries from bonded peers.
//!
//! ## Reply matching
//!
//! Outbound requests register a matcher `(from, ip, packet type, deadline,
//! callback)`. A single actor task owns the pending-matcher list; every
//! other task communicates through its bounded command channel, so the
//! list needs no lock. Incoming reply packets are dispatched to all
//! matchers for the same `(sender, ip, type)`; a matcher whose callback
//! declares completion is resolved with the reply, and matchers whose
//! deadline passes resolve with [`DiscError::Timeout`].
//!
//! ## Bonding
//!
//! FINDNODE and RECORD-REQUEST are answered only for senders with a live
//! endpoint proof (a pong received within [`BOND_EXPIRATION`]). Absent
//! that, the sender is treated as unknown, which keeps the protocol
//! useless as a traffic amplifier.
//!
//! ## Preverify / handle split
//!
//! Each packet type first passes a stateless check (expiration, bond,
//! solicited-reply) and only then reaches the stateful handler that may
//! touch the table or answer.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::identity::{distance_cmp, NodeId};
use crate::packet::{
    decode_packet, encode_packet, expiration_timestamp, expired, max_neighbors, Endpoint, FindNode,
    Neighbors, Packet, Ping, Pong, RecordRequest, RecordResponse, RpcNode, MAX_PACKET_SIZE,
};
use crate::record::{LocalNode, Node, SchemePolicy};
use crate::table::{DiscNode, NodeDb, Table, BUCKET_SIZE};

/// How long we wait for a single reply packet.
pub const RESP_TIMEOUT: Duration = Duration::from_millis(500);

/// How long an endpoint proof stays valid.
#[cfg(not(feature = "test-timing"))]
pub const BOND_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);
#[cfg(feature = "test-timing")]
pub const BOND_EXPIRATION: Duration = Duration::from_secs(2);

/// Nodes exceeding this many consecutive findnode failures are dropped
/// from bonding consideration until they prove themselves again.
pub const MAX_FINDNODE_FAILURES: u32 = 5;

/// Consecutive reply timeouts after which to suspect clock drift.
const NTP_FAILURE_THRESHOLD: u32 = 32;
/// Minimum time between repeated clock-drift warnings.
const NTP_WARNING_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// Cadence of the table revalidation loop.
const REVALIDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Cadence of the bootstrap/refresh loop.
const REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Lookup concurrency factor.
const LOOKUP_ALPHA: usize = 3;

/// Capacity of the matcher actor's command channel. Sends beyond this
/// apply backpressure to request issuers rather than growing a queue.
const MATCHER_CHANNEL_SIZE: usize = 256;

/// Deadline sweep granularity for pending matchers.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum DiscError {
    Timeout,
    Closed,
    LowPort,
    BadRelayIp,
    Record(crate::record::RecordError),
    MismatchedRecordId,
    Io(std::io::Error),
}

impl std::fmt::Display for DiscError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscError::Timeout => write!(f, "discovery RPC timeout"),
            DiscError::Closed => write!(f, "discovery socket closed"),
            DiscError::LowPort => write!(f, "low port"),
            DiscError::BadRelayIp => write!(f, "relayed IP not believable from sender"),
            DiscError::Record(e) => write!(f, "record: {e}"),
            DiscError::MismatchedRecordId => write!(f, "record binds to a different id"),
            DiscError::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for DiscError {}

impl From<std::io::Error> for DiscError {
    fn from(e: std::io::Error) -> Self {
        DiscError::Io(e)
    }
}

/// Callback deciding whether a reply packet matches and whether the
/// request is complete: `(matched, request_done)`.
type ReplyMatchFn = Box<dyn FnMut(&Packet) -> (bool, bool) + Send>;

struct ReplyMatcher {
    from: NodeId,
    ip: IpAddr,
    ptype: u8,
    deadline: Instant,
    callback: ReplyMatchFn,
    reply_tx: oneshot::Sender<Result<Packet, DiscError>>,
}

enum MatcherCommand {
    Add(ReplyMatcher),
    GotReply {
        from: NodeId,
        ip: IpAddr,
        packet: Packet,
        matched_tx: oneshot::Sender<bool>,
    },
    Quit,
}

/// The pending-matcher actor: sole owner of the matcher list. Commands
/// arrive on a bounded channel; deadlines are swept on a short interval.
async fn matcher_loop(mut rx: mpsc::Receiver<MatcherCommand>) {
    let mut pending: Vec<ReplyMatcher> = Vec::new();
    let mut cont_timeouts: u32 = 0;
    let mut last_ntp_warn: Option<Instant> = None;
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(MatcherCommand::Add(mut matcher)) => {
                        matcher.deadline = Instant::now() + RESP_TIMEOUT;
                        pending.push(matcher);
                    }
                    Some(MatcherCommand::GotReply { from, ip, packet, matched_tx }) => {
                        let mut any_matched = false;
                        let mut i = 0;
                        while i < pending.len() {
                            let m = &mut pending[i];
                            if m.from == from && m.ptype == packet.kind() && m.ip == ip {
                                let (matched, done) = (m.callback)(&packet);
                                any_matched |= matched;
                                if done {
                                    let m = pending.remove(i);
                                    let _ = m.reply_tx.send(Ok(packet.clone()));
                                    cont_timeouts = 0;
                                    continue;
                                }
                                if matched {
                                    cont_timeouts = 0;
                                }
                            }
                            i += 1;
                        }
                        let _ = matched_tx.send(any_matched);
                    }
                    Some(MatcherCommand::Quit) | None => {
                        for m in pending.drain(..) {
                            let _ = m.reply_tx.send(Err(DiscError::Closed));
                        }
                        return;
                    }
                }
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                let mut i = 0;
                while i < pending.len() {
                    if pending[i].deadline <= now {
                        let m = pending.remove(i);
                        let _ = m.reply_tx.send(Err(DiscError::Timeout));
                        cont_timeouts += 1;
                        continue;
                    }
                    i += 1;
                }
                if cont_timeouts > NTP_FAILURE_THRESHOLD {
                    let warn_due = last_ntp_warn
                        .map(|t| t.elapsed() >= NTP_WARNING_COOLDOWN)
                        .unwrap_or(true);
                    if warn_due {
                        last_ntp_warn = Some(Instant::now());
                        warn!("many consecutive discovery timeouts; check the system clock");
                    }
                    cont_timeouts = 0;
                }
            }
        }
    }
}

/// Discovery transport handle. Cheap to clone; clones share one socket,
/// table, node database, and matcher actor.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

struct DiscoveryInner {
    socket: Arc<UdpSocket>,
    local: Arc<LocalNode>,
    table: RwLock<Table>,
    db: Mutex<NodeDb>,
    matcher_tx: mpsc::Sender<MatcherCommand>,
    shutdown_tx: watch::Sender<bool>,
    bootnodes: Vec<DiscNode>,
}

impl Discovery {
    /// Bind the discovery socket and spawn the matcher, read, revalidation
    /// and refresh loops.
    pub async fn listen(
        bind: SocketAddr,
        local: Arc<LocalNode>,
        bootnodes: Vec<DiscNode>,
    ) -> Result<Self, DiscError> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let (matcher_tx, matcher_rx) = mpsc::channel(MATCHER_CHANNEL_SIZE);
        let (shutdown_tx, _) = watch::channel(false);

        let disc = Discovery {
            inner: Arc::new(DiscoveryInner {
                socket,
                table: RwLock::new(Table::new(local.id())),
                db: Mutex::new(NodeDb::new()),
                local,
                matcher_tx,
                shutdown_tx,
                bootnodes,
            }),
        };

        tokio::spawn(matcher_loop(matcher_rx));
        tokio::spawn(disc.clone().read_loop());
        tokio::spawn(disc.clone().revalidation_loop());
        tokio::spawn(disc.clone().refresh_loop());
        Ok(disc)
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local.id()
    }

    pub fn local_node(&self) -> Node {
        self.inner.local.node()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscError> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Stop all loops and resolve every pending request with `Closed`.
    pub fn close(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let _ = self.inner.matcher_tx.try_send(MatcherCommand::Quit);
    }

    pub fn table_len(&self) -> usize {
        self.inner.table.read().expect("table lock").len()
    }

    pub fn table_nodes(&self) -> Vec<DiscNode> {
        self.inner.table.read().expect("table lock").all()
    }

    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<DiscNode> {
        self.inner
            .table
            .read()
            .expect("table lock")
            .closest(target, n, false)
    }

    // ------------------------------------------------------------------
    // Outbound requests
    // ------------------------------------------------------------------

    /// Ping a node and wait for the matching pong. Returns the remote
    /// record sequence carried by the pong.
    pub async fn ping(&self, to_id: NodeId, to_addr: SocketAddr) -> Result<u64, DiscError> {
        let rx = self.send_ping(to_id, to_addr, None).await?;
        match rx.await.map_err(|_| DiscError::Closed)?? {
            Packet::Pong(pong) => Ok(pong.seq),
            _ => Err(DiscError::Closed),
        }
    }

    /// Send a ping and register a pong matcher. `on_match` fires when the
    /// matching pong arrives, before the request resolves.
    async fn send_ping(
        &self,
        to_id: NodeId,
        to_addr: SocketAddr,
        on_match: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<oneshot::Receiver<Result<Packet, DiscError>>, DiscError> {
        let ping = Packet::Ping(Ping {
            version: 4,
            from: self.our_endpoint(),
            to: Endpoint::new(to_addr, 0),
            expiration: expiration_timestamp(),
            seq: self.inner.local.seq(),
        });
        let (bytes, hash) = encode_packet(self.inner.local.keypair(), &ping)
            .map_err(|_| DiscError::Closed)?;

        let mut on_match = on_match;
        let rx = self
            .pending(to_id, to_addr.ip(), 2 /* pong */, move |packet| {
                let matched = matches!(packet, Packet::Pong(p) if p.reply_tok == hash);
                if matched {
                    if let Some(cb) = on_match.take() {
                        cb();
                    }
                }
                (matched, matched)
            })
            .await?;
        self.inner.socket.send_to(&bytes, to_addr).await?;
        trace!(to = %to_id, addr = %to_addr, "PING/v4 >>");
        Ok(rx)
    }

    /// Ask `node` for its neighbors closest to `target`. Collects across
    /// chunked replies until enough nodes arrived or the request times
    /// out; a timeout with partial results returns the partial set.
    pub async fn find_node(
        &self,
        node: &DiscNode,
        target: NodeId,
    ) -> Result<Vec<DiscNode>, DiscError> {
        let to_addr = node.udp_addr();
        self.ensure_bond(node.id(), to_addr).await;

        let collected: Arc<Mutex<Vec<DiscNode>>> = Arc::new(Mutex::new(Vec::new()));
        let acc = collected.clone();
        let this = self.clone();
        let sender_addr = to_addr;
        let mut received = 0usize;
        let rx = self
            .pending(node.id(), to_addr.ip(), 4 /* neighbors */, move |packet| {
                let Packet::Neighbors(reply) = packet else {
                    return (false, false);
                };
                for rpc in &reply.nodes {
                    received += 1;
                    match this.node_from_rpc(sender_addr, rpc) {
                        Ok(n) => acc.lock().expect("acc lock").push(n),
                        Err(e) => {
                            trace!(addr = %sender_addr, "invalid neighbor node: {e}");
                        }
                    }
                }
                (true, received >= BUCKET_SIZE)
            })
            .await?;

        let find = Packet::FindNode(FindNode {
            target,
            expiration: expiration_timestamp(),
        });
        let (bytes, _) = encode_packet(self.inner.local.keypair(), &find)
            .map_err(|_| DiscError::Closed)?;
        self.inner.socket.send_to(&bytes, to_addr).await?;
        trace!(to = %node.id(), addr = %to_addr, "FINDNODE/v4 >>");

        let outcome = rx.await.map_err(|_| DiscError::Closed)?;
        let nodes = collected.lock().expect("acc lock").clone();
        match outcome {
            Ok(_) => {
                let mut db = self.inner.db.lock().expect("db lock");
                db.update_find_fails(node.id(), to_addr.ip(), 0);
                Ok(nodes)
            }
            Err(DiscError::Timeout) if !nodes.is_empty() => Ok(nodes),
            Err(e) => {
                let mut db = self.inner.db.lock().expect("db lock");
                let fails = db.find_fails(node.id(), to_addr.ip()) + 1;
                db.update_find_fails(node.id(), to_addr.ip(), fails);
                Err(e)
            }
        }
    }

    /// Fetch the signed record of `node` and validate it: signature,
    /// identity binding, and sequence monotonicity against what we hold.
    pub async fn request_record(&self, node: &DiscNode) -> Result<Node, DiscError> {
        let to_addr = node.udp_addr();
        self.ensure_bond(node.id(), to_addr).await;

        let request = Packet::RecordRequest(RecordRequest {
            expiration: expiration_timestamp(),
        });
        let (bytes, hash) = encode_packet(self.inner.local.keypair(), &request)
            .map_err(|_| DiscError::Closed)?;

        let rx = self
            .pending(node.id(), to_addr.ip(), 6 /* record response */, move |packet| {
                let matched =
                    matches!(packet, Packet::RecordResponse(r) if r.reply_tok == hash);
                (matched, matched)
            })
            .await?;
        self.inner.socket.send_to(&bytes, to_addr).await?;
        trace!(to = %node.id(), addr = %to_addr, "RECORDREQUEST/v4 >>");

        let Packet::RecordResponse(resp) = rx.await.map_err(|_| DiscError::Closed)?? else {
            return Err(DiscError::Closed);
        };
        let verified =
            Node::new(SchemePolicy::Production, resp.record).map_err(DiscError::Record)?;
        if verified.id() != node.id() {
            return Err(DiscError::MismatchedRecordId);
        }
        if verified.seq() < node.seq {
            // Response record is older than what we already know; keep ours.
            return Err(DiscError::Record(crate::record::RecordError::StaleSequence {
                held: node.seq,
                incoming: verified.seq(),
            }));
        }
        {
            let mut table = self.inner.table.write().expect("table lock");
            if let Some(entry) = table.get_mut(&node.id()) {
                entry.seq = verified.seq();
                entry.record = Some(verified.record().clone());
            }
        }
        Ok(verified)
    }

    /// Resolve the freshest record of a node: ask it directly, fall back
    /// to a network lookup for a better endpoint.
    pub async fn resolve(&self, node: &DiscNode) -> Option<Node> {
        if let Ok(found) = self.request_record(node).await {
            return Some(found);
        }
        for candidate in self.lookup(node.id()).await {
            if candidate.id() == node.id() {
                if let Ok(found) = self.request_record(&candidate).await {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Iterative Kademlia lookup: repeatedly query the closest unasked
    /// nodes for the target until no closer node surfaces, seeding from
    /// the local table. Discovered nodes enter the table as seen.
    pub async fn lookup(&self, target: NodeId) -> Vec<DiscNode> {
        let mut shortlist: Vec<DiscNode> = self.closest(&target, BUCKET_SIZE);
        let mut asked: HashSet<NodeId> = HashSet::new();
        let mut seen: HashSet<NodeId> = shortlist.iter().map(|n| n.id()).collect();

        loop {
            let batch: Vec<DiscNode> = shortlist
                .iter()
                .filter(|n| !asked.contains(&n.id()))
                .take(LOOKUP_ALPHA)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }

            let mut join = tokio::task::JoinSet::new();
            for node in batch {
                asked.insert(node.id());
                let this = self.clone();
                join.spawn(async move { this.find_node(&node, target).await });
            }
            let mut progress = false;
            while let Some(res) = join.join_next().await {
                let Ok(Ok(found)) = res else { continue };
                for node in found {
                    if !seen.insert(node.id()) {
                        continue;
                    }
                    progress = true;
                    self.inner
                        .table
                        .write()
                        .expect("table lock")
                        .add_seen_node(node.clone());
                    shortlist.push(node);
                }
            }
            shortlist.sort_by(|a, b| {
                distance_cmp(&a.id().xor_distance(&target), &b.id().xor_distance(&target))
            });
            shortlist.truncate(BUCKET_SIZE);
            if !progress {
                break;
            }
        }
        shortlist
    }

    pub async fn lookup_self(&self) -> Vec<DiscNode> {
        self.lookup(self.local_id()).await
    }

    pub async fn lookup_random(&self) -> Vec<DiscNode> {
        let mut bytes = [0u8; 32];
        if getrandom::getrandom(&mut bytes).is_err() {
            bytes = *self.local_id().as_bytes();
            bytes[0] = bytes[0].wrapping_add(1);
        }
        self.lookup(NodeId::from_bytes(bytes)).await
    }

    // ------------------------------------------------------------------
    // Bonding
    // ------------------------------------------------------------------

    /// Whether `id` has a live endpoint proof: a pong from that endpoint
    /// within the bond window.
    fn check_bond(&self, id: NodeId, ip: IpAddr) -> bool {
        self.inner
            .db
            .lock()
            .expect("db lock")
            .since_last_pong(id, ip)
            .map(|since| since < BOND_EXPIRATION)
            .unwrap_or(false)
    }

    /// Solicit a ping from a node if we have not seen one for a while, so
    /// a valid endpoint proof exists on the remote end before we send it
    /// a query it only answers for bonded peers.
    async fn ensure_bond(&self, to_id: NodeId, to_addr: SocketAddr) {
        let (too_old, fails) = {
            let db = self.inner.db.lock().expect("db lock");
            let too_old = db
                .since_last_ping(to_id, to_addr.ip())
                .map(|since| since > BOND_EXPIRATION)
                .unwrap_or(true);
            (too_old, db.find_fails(to_id, to_addr.ip()))
        };
        if too_old || fails > MAX_FINDNODE_FAILURES {
            if let Ok(rx) = self.send_ping(to_id, to_addr, None).await {
                let _ = rx.await;
            }
            // Wait for them to ping back and for our pong to land.
            tokio::time::sleep(RESP_TIMEOUT).await;
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn our_endpoint(&self) -> Endpoint {
        let node = self.inner.local.node();
        let ip = node
            .record()
            .ip()
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        Endpoint {
            ip,
            udp: node.record().udp().unwrap_or(0),
            tcp: node.record().tcp().unwrap_or(0),
        }
    }

    async fn pending<F>(
        &self,
        from: NodeId,
        ip: IpAddr,
        ptype: u8,
        callback: F,
    ) -> Result<oneshot::Receiver<Result<Packet, DiscError>>, DiscError>
    where
        F: FnMut(&Packet) -> (bool, bool) + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let matcher = ReplyMatcher {
            from,
            ip,
            ptype,
            deadline: Instant::now() + RESP_TIMEOUT,
            callback: Box::new(callback),
            reply_tx,
        };
        self.inner
            .matcher_tx
            .send(MatcherCommand::Add(matcher))
            .await
            .map_err(|_| DiscError::Closed)?;
        Ok(reply_rx)
    }

    /// Dispatch a reply packet to the matcher actor. Returns whether any
    /// pending matcher accepted it.
    async fn handle_reply(&self, from: NodeId, ip: IpAddr, packet: Packet) -> bool {
        let (matched_tx, matched_rx) = oneshot::channel();
        if self
            .inner
            .matcher_tx
            .send(MatcherCommand::GotReply {
                from,
                ip,
                packet,
                matched_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        matched_rx.await.unwrap_or(false)
    }

    async fn send_packet(&self, to: SocketAddr, packet: &Packet) -> Result<[u8; 32], DiscError> {
        let (bytes, hash) = encode_packet(self.inner.local.keypair(), packet)
            .map_err(|_| DiscError::Closed)?;
        self.inner.socket.send_to(&bytes, to).await?;
        trace!(addr = %to, "{} >>", packet.name());
        Ok(hash)
    }

    /// Validate a neighbor entry from a reply before it may enter the
    /// table: no privileged ports, and the claimed IP must be believable
    /// coming from the packet's sender.
    fn node_from_rpc(&self, sender: SocketAddr, rpc: &RpcNode) -> Result<DiscNode, DiscError> {
        if rpc.udp <= 1024 {
            return Err(DiscError::LowPort);
        }
        if !check_relay_ip(sender.ip(), rpc.ip) {
            return Err(DiscError::BadRelayIp);
        }
        Ok(DiscNode::from_rpc(rpc))
    }

    async fn read_loop(self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                res = self.inner.socket.recv_from(&mut buf) => {
                    let (n, from) = match res {
                        Ok(pair) => pair,
                        Err(e) => {
                            // Temporary errors are retried at the next
                            // datagram; the loop only exits on shutdown.
                            debug!("UDP read error: {e}");
                            continue;
                        }
                    };
                    self.handle_datagram(from, &buf[..n]).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, from: SocketAddr, buf: &[u8]) {
        let decoded = match decode_packet(buf) {
            Ok(d) => d,
            Err(e) => {
                debug!(addr = %from, "bad discovery packet: {e}");
                return;
            }
        };
        trace!(addr = %from, id = %decoded.from_id, "{} <<", decoded.packet.name());

        // Preverify: stateless checks before any state is touched.
        if let Some(ts) = decoded.packet.expiration() {
            if expired(ts) {
                trace!(addr = %from, "expired {}", decoded.packet.name());
                return;
            }
        }

        match &decoded.packet {
            Packet::Ping(ping) => self.handle_ping(from, &decoded, ping.clone()).await,
            Packet::Pong(pong) => {
                if !self
                    .handle_reply(decoded.from_id, from.ip(), decoded.packet.clone())
                    .await
                {
                    trace!(addr = %from, "unsolicited PONG/v4");
                    return;
                }
                self.inner.local.udp_endpoint_statement(pong.to.udp_addr());
                self.inner
                    .db
                    .lock()
                    .expect("db lock")
                    .update_last_pong_received(decoded.from_id, from.ip());
            }
            Packet::FindNode(find) => self.handle_findnode(from, &decoded, find.target).await,
            Packet::Neighbors(_) | Packet::RecordResponse(_) => {
                if !self
                    .handle_reply(decoded.from_id, from.ip(), decoded.packet.clone())
                    .await
                {
                    trace!(addr = %from, "unsolicited {}", decoded.packet.name());
                }
            }
            Packet::RecordRequest(_) => self.handle_record_request(from, &decoded).await,
        }
    }

    async fn handle_ping(&self, from: SocketAddr, decoded: &crate::packet::DecodedPacket, ping: Ping) {
        let pong = Packet::Pong(Pong {
            to: Endpoint::new(from, ping.from.tcp),
            reply_tok: decoded.hash,
            expiration: expiration_timestamp(),
            seq: self.inner.local.seq(),
        });
        if let Err(e) = self.send_packet(from, &pong).await {
            debug!(addr = %from, "failed to answer ping: {e}");
        }

        // Insert the sender once it is verified live: directly when bonded,
        // otherwise after it answers the ping we send back.
        let node = DiscNode::new(
            decoded.from_id,
            decoded.public_key,
            from.ip(),
            from.port(),
            ping.from.tcp,
        );
        if self.check_bond(decoded.from_id, from.ip()) {
            self.inner
                .table
                .write()
                .expect("table lock")
                .add_verified_node(node);
        } else {
            let this = self.clone();
            let _ = self
                .send_ping(
                    decoded.from_id,
                    from,
                    Some(Box::new(move || {
                        this.inner
                            .table
                            .write()
                            .expect("table lock")
                            .add_verified_node(node);
                    })),
                )
                .await;
        }

        self.inner
            .db
            .lock()
            .expect("db lock")
            .update_last_ping_received(decoded.from_id, from.ip());
        // The ping's `to` field is our endpoint as the sender saw it.
        self.inner.local.udp_endpoint_statement(ping.to.udp_addr());
    }

    async fn handle_findnode(
        &self,
        from: SocketAddr,
        decoded: &crate::packet::DecodedPacket,
        target: NodeId,
    ) {
        if !self.check_bond(decoded.from_id, from.ip()) {
            // No endpoint proof; answering would let the protocol amplify
            // traffic toward spoofed sources.
            trace!(addr = %from, id = %decoded.from_id, "unbonded FINDNODE/v4 ignored");
            return;
        }

        let closest = {
            let table = self.inner.table.read().expect("table lock");
            table.closest(&target, BUCKET_SIZE, true)
        };

        let chunk_size = max_neighbors();
        let mut nodes: Vec<RpcNode> = Vec::with_capacity(chunk_size);
        let mut sent = false;
        for node in &closest {
            if !check_relay_ip(from.ip(), node.ip) {
                continue;
            }
            nodes.push(node.to_rpc());
            if nodes.len() == chunk_size {
                let packet = Packet::Neighbors(Neighbors {
                    nodes: std::mem::take(&mut nodes),
                    expiration: expiration_timestamp(),
                });
                let _ = self.send_packet(from, &packet).await;
                sent = true;
            }
        }
        if !nodes.is_empty() || !sent {
            let packet = Packet::Neighbors(Neighbors {
                nodes,
                expiration: expiration_timestamp(),
            });
            let _ = self.send_packet(from, &packet).await;
        }
    }

    async fn handle_record_request(&self, from: SocketAddr, decoded: &crate::packet::DecodedPacket) {
        if !self.check_bond(decoded.from_id, from.ip()) {
            trace!(addr = %from, id = %decoded.from_id, "unbonded RECORDREQUEST/v4 ignored");
            return;
        }
        let response = Packet::RecordResponse(RecordResponse {
            reply_tok: decoded.hash,
            record: self.inner.local.node().record().clone(),
        });
        let _ = self.send_packet(from, &response).await;
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    /// Periodically ping the least-recently-live entry of a random
    /// non-empty bucket and apply the outcome.
    async fn revalidation_loop(self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(REVALIDATE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {}
            }
            let seed = rand::thread_rng().gen::<u64>();
            let target = {
                let table = self.inner.table.read().expect("table lock");
                table.revalidation_target(seed)
            };
            let Some((bucket_idx, node)) = target else {
                continue;
            };
            let result = self.ping(node.id(), node.udp_addr()).await;
            let mut table = self.inner.table.write().expect("table lock");
            match result {
                Ok(seq) => {
                    trace!(id = %node.id(), "revalidated");
                    table.handle_revalidation(bucket_idx, &node.id(), true, Some(seq));
                }
                Err(_) => {
                    debug!(id = %node.id(), "revalidation failed, evicting");
                    table.handle_revalidation(bucket_idx, &node.id(), false, None);
                }
            }
        }
    }

    /// Bootstrap at start and refresh periodically: ping bootnodes, then
    /// walk toward ourselves and a few random targets.
    async fn refresh_loop(self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            for bootnode in &self.inner.bootnodes {
                self.inner
                    .table
                    .write()
                    .expect("table lock")
                    .add_seen_node(bootnode.clone());
                if let Err(e) = self.ping(bootnode.id(), bootnode.udp_addr()).await {
                    debug!(id = %bootnode.id(), "bootnode ping failed: {e}");
                }
            }
            self.lookup_self().await;
            for _ in 0..2 {
                self.lookup_random().await;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
            }
        }
    }
}

/// Whether `claimed` is a believable address when reported by `sender`:
/// special-purpose ranges are rejected, and a public sender may not point
/// us at loopback or RFC1918 space.
fn check_relay_ip(sender: IpAddr, claimed: IpAddr) -> bool {
    if claimed.is_unspecified() || claimed.is_multicast() {
        return false;
    }
    if claimed.is_loopback() {
        return sender.is_loopback();
    }
    if is_private(claimed) {
        return is_private(sender) || sender.is_loopback();
    }
    true
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use std::net::Ipv4Addr;

    async fn spawn_node(bootnodes: Vec<DiscNode>) -> (Discovery, Arc<LocalNode>) {
        let kp = Keypair::generate();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        // Port filled in after bind; the record advertises the real one.
        let local = Arc::new(LocalNode::new(
            kp,
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            0,
            0,
        ));
        let disc = Discovery::listen(bind, local.clone(), bootnodes)
            .await
            .unwrap();
        (disc, local)
    }

    fn disc_node_of(disc: &Discovery) -> DiscNode {
        let addr = disc.local_addr().unwrap();
        DiscNode::new(
            disc.local_id(),
            disc.inner.local.keypair().public_bytes(),
            addr.ip(),
            addr.port(),
            0,
        )
    }

    #[tokio::test]
    async fn ping_pong_roundtrip() {
        let (a, _) = spawn_node(vec![]).await;
        let (b, _) = spawn_node(vec![]).await;
        let b_node = disc_node_of(&b);

        // The pong carries B's record sequence as of the answer.
        let seq = a.ping(b_node.id(), b_node.udp_addr()).await.unwrap();
        assert_eq!(seq, 1);

        // The pong gave A an endpoint proof for B.
        assert!(a.check_bond(b_node.id(), b_node.udp_addr().ip()));

        // B pinged back (A was unbonded at B) and adds A once the pong
        // lands.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(b.table_nodes().iter().any(|n| n.id() == a.local_id()));

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn ping_timeout_on_dead_peer() {
        let (a, _) = spawn_node(vec![]).await;
        let ghost = Keypair::generate().node_id();
        let dead: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = a.ping(ghost, dead).await.unwrap_err();
        assert!(matches!(err, DiscError::Timeout));
        a.close();
    }

    #[tokio::test]
    async fn ping_alone_does_not_populate_our_table() {
        let (a, _) = spawn_node(vec![]).await;

        // A raw responder that answers with a pong and nothing else, so no
        // bonding ping-back can race the assertion.
        let c_kp = Keypair::generate();
        let c_id = c_kp.node_id();
        let c_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let c_addr = c_sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            let (n, from) = c_sock.recv_from(&mut buf).await.unwrap();
            let decoded = decode_packet(&buf[..n]).unwrap();
            if let Packet::Ping(_) = &decoded.packet {
                let pong = Packet::Pong(Pong {
                    to: Endpoint::new(from, 0),
                    reply_tok: decoded.hash,
                    expiration: expiration_timestamp(),
                    seq: 1,
                });
                let (bytes, _) = encode_packet(&c_kp, &pong).unwrap();
                c_sock.send_to(&bytes, from).await.unwrap();
            }
        });

        a.ping(c_id, c_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Our outbound ping inserts nothing locally; insertion happens on
        // the responder side of a received ping.
        assert!(!a.table_nodes().iter().any(|n| n.id() == c_id));
        a.close();
    }

    #[tokio::test]
    async fn findnode_answered_only_when_bonded() {
        let (a, _) = spawn_node(vec![]).await;
        let (b, _) = spawn_node(vec![]).await;
        let (c, _) = spawn_node(vec![]).await;
        let a_node = disc_node_of(&a);
        let c_node = disc_node_of(&c);

        // Seed A's table so a findnode answer has content. C pings A,
        // which bonds C and inserts it at A.
        c.ping(a_node.id(), a_node.udp_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(a.table_nodes().iter().any(|n| n.id() == c_node.id()));

        // B was never seen by A: find_node bonds first (ping exchange),
        // then the query succeeds.
        let found = b.find_node(&a_node, c_node.id()).await.unwrap();
        assert!(found.iter().any(|n| n.id() == c_node.id()));

        a.close();
        b.close();
        c.close();
    }

    #[tokio::test]
    async fn record_request_roundtrip() {
        let (a, _) = spawn_node(vec![]).await;
        let (b, _) = spawn_node(vec![]).await;
        let b_node = disc_node_of(&b);

        let node = a.request_record(&b_node).await.unwrap();
        assert_eq!(node.id(), b_node.id());
        assert!(node.seq() >= 1);

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn lookup_walks_the_graph() {
        // a knows b, b knows c; a lookup from a surfaces c.
        let (c, _) = spawn_node(vec![]).await;
        let c_node = disc_node_of(&c);

        let (b, _) = spawn_node(vec![]).await;
        let b_node = disc_node_of(&b);
        // Bond and insert c at b.
        c.ping(b_node.id(), b_node.udp_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(b.table_nodes().iter().any(|n| n.id() == c_node.id()));

        let (a, _) = spawn_node(vec![b_node.clone()]).await;
        a.inner
            .table
            .write()
            .expect("table lock")
            .add_seen_node(b_node.clone());

        let found = a.lookup(c_node.id()).await;
        assert!(found.iter().any(|n| n.id() == c_node.id()));

        a.close();
        b.close();
        c.close();
    }

    #[test]
    fn relay_ip_rules() {
        let public: IpAddr = "8.8.8.8".parse().unwrap();
        let private: IpAddr = "10.1.2.3".parse().unwrap();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let unspecified: IpAddr = "0.0.0.0".parse().unwrap();

        assert!(check_relay_ip(public, public));
        assert!(check_relay_ip(loopback, loopback));
        assert!(check_relay_ip(private, private));
        assert!(check_relay_ip(loopback, private));

        assert!(!check_relay_ip(public, loopback));
        assert!(!check_relay_ip(public, private));
        assert!(!check_relay_ip(public, unspecified));
    }

    #[tokio::test]
    async fn low_port_neighbors_rejected() {
        let (a, _) = spawn_node(vec![]).await;
        let kp = Keypair::generate();
        let rpc = RpcNode {
            public_key: kp.public_bytes(),
            ip: "127.0.0.1".parse().unwrap(),
            udp: 80,
            tcp: 0,
        };
        let sender: SocketAddr = "127.0.0.1:30301".parse().unwrap();
        assert!(matches!(
            a.node_from_rpc(sender, &rpc),
            Err(DiscError::LowPort)
        ));
        a.close();
    }
}
