//! # Signed Node Records
//!
//! A [`NodeRecord`] is a versioned, signed set of key-value entries
//! describing how to reach a node: its public key, IP address, UDP and TCP
//! ports, plus arbitrary application entries. Records travel over the
//! discovery wire and are exchanged over RPC, so nothing in a record is
//! trusted until its signature verifies under the declared identity scheme.
//!
//! ## Schemes
//!
//! | Scheme | Signature | Accepted from the network |
//! |--------|-----------|---------------------------|
//! | `v4`   | Ed25519 over the canonical entry encoding | yes |
//! | `null` | none (identity stored in an entry) | no — local/test use only |
//!
//! ## Invariants
//!
//! - A record's signature must validate before any entry is trusted.
//! - Sequence numbers are monotonically non-decreasing per identity: a
//!   record with a lower sequence than one already held is rejected.
//! - Signing copies the record and swaps the signed copy in only on
//!   success, so a failed signing attempt never leaves a half-mutated
//!   record behind.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::identity::{verify_with_domain, Keypair, NodeId, SignatureError, RECORD_SIGNATURE_DOMAIN};

/// Scheme tag for Ed25519-signed records.
pub const SCHEME_V4: &str = "v4";
/// Scheme tag for unsigned records (tests and local tooling only).
pub const SCHEME_NULL: &str = "null";

/// Entry key holding the raw node id under the null scheme.
const NULL_ADDR_ENTRY: &str = "nulladdr";

/// Which identity schemes a decoder accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemePolicy {
    /// Only `v4`. The policy for anything that arrived over a socket.
    Production,
    /// `v4` and `null`. Never use for network input.
    Testing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    UnknownScheme,
    SchemeNotAllowed,
    MissingPublicKey,
    Signature(SignatureError),
    /// Incoming sequence number is lower than the one already held.
    StaleSequence { held: u64, incoming: u64 },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::UnknownScheme => write!(f, "unknown identity scheme"),
            RecordError::SchemeNotAllowed => write!(f, "identity scheme not allowed here"),
            RecordError::MissingPublicKey => write!(f, "record has no public key entry"),
            RecordError::Signature(e) => write!(f, "record signature: {e}"),
            RecordError::StaleSequence { held, incoming } => {
                write!(f, "stale record sequence {incoming} (holding {held})")
            }
        }
    }
}

impl std::error::Error for RecordError {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    seq: u64,
    scheme: String,
    public_key: Option<[u8; 32]>,
    ip: Option<IpAddr>,
    udp: Option<u16>,
    tcp: Option<u16>,
    /// Application entries, canonically ordered by key.
    extra: BTreeMap<String, Vec<u8>>,
    signature: Vec<u8>,
}

impl NodeRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn public_key(&self) -> Option<&[u8; 32]> {
        self.public_key.as_ref()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn udp(&self) -> Option<u16> {
        self.udp
    }

    pub fn tcp(&self) -> Option<u16> {
        self.tcp
    }

    pub fn extra(&self, key: &str) -> Option<&[u8]> {
        self.extra.get(key).map(|v| v.as_slice())
    }

    pub fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
        self.signature.clear();
    }

    pub fn set_ip(&mut self, ip: IpAddr) {
        self.ip = Some(ip);
        self.signature.clear();
    }

    pub fn set_udp(&mut self, udp: u16) {
        self.udp = Some(udp);
        self.signature.clear();
    }

    pub fn set_tcp(&mut self, tcp: u16) {
        self.tcp = Some(tcp);
        self.signature.clear();
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.extra.insert(key.into(), value);
        self.signature.clear();
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip?, self.udp?))
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip?, self.tcp?))
    }

    /// Canonical byte encoding of the signed portion: everything except
    /// the signature itself, fields in declaration order, extras sorted by
    /// key with length prefixes.
    fn signed_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(&self.seq.to_le_bytes());
        push_bytes(&mut out, self.scheme.as_bytes());
        match &self.public_key {
            Some(pk) => push_bytes(&mut out, pk),
            None => push_bytes(&mut out, &[]),
        }
        match &self.ip {
            Some(IpAddr::V4(v4)) => push_bytes(&mut out, &v4.octets()),
            Some(IpAddr::V6(v6)) => push_bytes(&mut out, &v6.octets()),
            None => push_bytes(&mut out, &[]),
        }
        out.extend_from_slice(&self.udp.unwrap_or(0).to_le_bytes());
        out.extend_from_slice(&self.tcp.unwrap_or(0).to_le_bytes());
        out.extend_from_slice(&(self.extra.len() as u32).to_le_bytes());
        for (key, value) in &self.extra {
            push_bytes(&mut out, key.as_bytes());
            push_bytes(&mut out, value);
        }
        out
    }

    /// Sign under the `v4` scheme. Copies the record, sets the scheme tag
    /// and public key entry, signs the canonical encoding, and swaps the
    /// signed copy in only if everything succeeded.
    pub fn sign_v4(&mut self, keypair: &Keypair) -> Result<(), RecordError> {
        let mut copy = self.clone();
        copy.scheme = SCHEME_V4.to_string();
        copy.public_key = Some(keypair.public_bytes());
        let payload = copy.signed_payload();
        let sig = keypair.sign_with_domain(RECORD_SIGNATURE_DOMAIN, &payload);
        copy.signature = sig.to_vec();
        *self = copy;
        Ok(())
    }

    /// Store the identity unsigned under the `null` scheme.
    pub fn sign_null(&mut self, id: NodeId) {
        self.scheme = SCHEME_NULL.to_string();
        self.extra
            .insert(NULL_ADDR_ENTRY.to_string(), id.as_bytes().to_vec());
        self.signature.clear();
    }

    /// Verify the record under the given scheme policy and return the node
    /// id it binds to. Any failure is a hard reject: the caller must not
    /// use any entry of a record that did not verify.
    pub fn verify(&self, policy: SchemePolicy) -> Result<NodeId, RecordError> {
        match self.scheme.as_str() {
            SCHEME_V4 => {
                let pk = self.public_key.ok_or(RecordError::MissingPublicKey)?;
                verify_with_domain(
                    &pk,
                    RECORD_SIGNATURE_DOMAIN,
                    &self.signed_payload(),
                    &self.signature,
                )
                .map_err(RecordError::Signature)?;
                Ok(NodeId::from_public_key(&pk))
            }
            SCHEME_NULL => {
                if policy != SchemePolicy::Testing {
                    return Err(RecordError::SchemeNotAllowed);
                }
                let raw = self
                    .extra
                    .get(NULL_ADDR_ENTRY)
                    .ok_or(RecordError::MissingPublicKey)?;
                let arr: [u8; 32] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| RecordError::MissingPublicKey)?;
                Ok(NodeId::from_bytes(arr))
            }
            _ => Err(RecordError::UnknownScheme),
        }
    }
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// A verified record together with the node id it binds to.
///
/// Holds the record as a plain field; the id is computed once at
/// construction and never changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    record: NodeRecord,
    id: NodeId,
}

impl Node {
    /// Verify `record` under `policy` and wrap it. The only way to obtain
    /// a `Node`, so holding one implies the record verified.
    pub fn new(policy: SchemePolicy, record: NodeRecord) -> Result<Self, RecordError> {
        let id = record.verify(policy)?;
        Ok(Self { record, id })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    pub fn seq(&self) -> u64 {
        self.record.seq
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.record.udp_addr()
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.record.tcp_addr()
    }

    /// Accept `incoming` as a replacement for this node's record.
    ///
    /// The incoming record must bind to the same identity and carry a
    /// sequence number that is not lower than the held one.
    pub fn accept(&mut self, incoming: Node) -> Result<(), RecordError> {
        if incoming.id != self.id {
            return Err(RecordError::Signature(SignatureError::VerificationFailed));
        }
        if incoming.seq() < self.seq() {
            return Err(RecordError::StaleSequence {
                held: self.seq(),
                incoming: incoming.seq(),
            });
        }
        self.record = incoming.record;
        Ok(())
    }
}

/// The local node: keypair plus the record we advertise, re-signed with an
/// incremented sequence whenever a network-observable attribute changes.
///
/// Endpoint prediction: each pong tells us what the remote side saw as our
/// address. The statement seen most often becomes the advertised endpoint,
/// falling back to the statically configured one.
pub struct LocalNode {
    keypair: Keypair,
    inner: RwLock<LocalNodeInner>,
}

struct LocalNodeInner {
    record: NodeRecord,
    fallback_ip: Option<IpAddr>,
    fallback_udp: u16,
    endpoint_votes: BTreeMap<SocketAddr, u32>,
}

impl LocalNode {
    pub fn new(keypair: Keypair, fallback_ip: Option<IpAddr>, udp_port: u16, tcp_port: u16) -> Self {
        let mut record = NodeRecord::new();
        record.set_seq(1);
        if let Some(ip) = fallback_ip {
            record.set_ip(ip);
        }
        record.set_udp(udp_port);
        record.set_tcp(tcp_port);
        record
            .sign_v4(&keypair)
            .expect("signing a fresh local record cannot fail");
        Self {
            keypair,
            inner: RwLock::new(LocalNodeInner {
                record,
                fallback_ip,
                fallback_udp: udp_port,
                endpoint_votes: BTreeMap::new(),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn node(&self) -> Node {
        let inner = self.inner.read().expect("local node lock poisoned");
        Node::new(SchemePolicy::Production, inner.record.clone())
            .expect("local record is always signed")
    }

    pub fn seq(&self) -> u64 {
        self.inner.read().expect("local node lock poisoned").record.seq()
    }

    /// Record an endpoint statement from a pong: `observed` is what the
    /// remote side saw as our UDP endpoint. Re-signs the record when the
    /// predicted endpoint changes.
    pub fn udp_endpoint_statement(&self, observed: SocketAddr) {
        let mut inner = self.inner.write().expect("local node lock poisoned");
        *inner.endpoint_votes.entry(observed).or_insert(0) += 1;
        let predicted = inner
            .endpoint_votes
            .iter()
            .max_by_key(|(_, votes)| **votes)
            .map(|(addr, _)| *addr);
        let (ip, udp) = match predicted {
            Some(addr) => (Some(addr.ip()), addr.port()),
            None => (inner.fallback_ip, inner.fallback_udp),
        };
        let changed = inner.record.ip() != ip || inner.record.udp() != Some(udp);
        if !changed {
            return;
        }
        let mut record = inner.record.clone();
        record.set_seq(record.seq() + 1);
        if let Some(ip) = ip {
            record.set_ip(ip);
        }
        record.set_udp(udp);
        if record.sign_v4(&self.keypair).is_ok() {
            inner.record = record;
        }
    }
}
