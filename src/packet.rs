//! # Discovery Wire Packets
//!
//! Signed UDP datagrams for the discovery protocol. Every packet is
//!
//! ```text
//! hash(32) ‖ pubkey(32) ‖ sig(64) ‖ type(1) ‖ body
//! ```
//!
//! where `hash = BLAKE3(pubkey ‖ sig ‖ type ‖ body)` and `sig` is the
//! sender's domain-separated Ed25519 signature over `type ‖ body`. The
//! sender's public key rides in the envelope because Ed25519 signatures are
//! not key-recoverable; the receiver derives the sender's [`NodeId`] from
//! it after the signature verifies.
//!
//! Decode failures are typed: a corrupt envelope is [`PacketError::BadHash`],
//! a forged one [`PacketError::BadSignature`]. Bodies carry an absolute
//! expiration timestamp; the transport rejects expired packets before any
//! stateful handling, which bounds the replay window to [`EXPIRATION`].

use std::net::{IpAddr, SocketAddr};

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::{
    verify_with_domain, Keypair, NodeId, SignatureError, PACKET_SIGNATURE_DOMAIN,
};
use crate::record::NodeRecord;

/// Discovery packets are defined to be no larger than this. Larger input
/// is cut by the receive buffer and fails the envelope hash check.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Packet validity window.
pub const EXPIRATION: std::time::Duration = std::time::Duration::from_secs(20);

/// Envelope overhead in bytes: hash + pubkey + signature + type.
pub const HEAD_SIZE: usize = 32 + 32 + 64 + 1;

const TYPE_PING: u8 = 1;
const TYPE_PONG: u8 = 2;
const TYPE_FINDNODE: u8 = 3;
const TYPE_NEIGHBORS: u8 = 4;
const TYPE_RECORD_REQUEST: u8 = 5;
const TYPE_RECORD_RESPONSE: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    TooSmall,
    BadHash,
    BadSignature(SignatureError),
    UnknownType(u8),
    BadBody,
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::TooSmall => write!(f, "packet too small"),
            PacketError::BadHash => write!(f, "bad hash"),
            PacketError::BadSignature(e) => write!(f, "bad signature: {e}"),
            PacketError::UnknownType(t) => write!(f, "unknown packet type: {t}"),
            PacketError::BadBody => write!(f, "malformed packet body"),
        }
    }
}

impl std::error::Error for PacketError {}

/// A UDP endpoint as carried inside packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, tcp: u16) -> Self {
        Self {
            ip: addr.ip(),
            udp: addr.port(),
            tcp,
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp)
    }
}

/// A node as carried in a neighbors reply: enough to contact it and derive
/// its id, but unsigned. A signed record is fetched separately when needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcNode {
    pub public_key: [u8; 32],
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
}

impl RpcNode {
    pub fn id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub version: u32,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
    /// Local record sequence, so the receiver can notice stale knowledge.
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Mirror of the UDP envelope address of the ping; feeds the sender's
    /// external-endpoint prediction.
    pub to: Endpoint,
    /// Hash of the ping packet this answers.
    pub reply_tok: [u8; 32],
    pub expiration: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNode {
    pub target: NodeId,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbors {
    pub nodes: Vec<RpcNode>,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRequest {
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResponse {
    /// Hash of the record request this answers.
    pub reply_tok: [u8; 32],
    pub record: NodeRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
    RecordRequest(RecordRequest),
    RecordResponse(RecordResponse),
}

impl Packet {
    pub fn kind(&self) -> u8 {
        match self {
            Packet::Ping(_) => TYPE_PING,
            Packet::Pong(_) => TYPE_PONG,
            Packet::FindNode(_) => TYPE_FINDNODE,
            Packet::Neighbors(_) => TYPE_NEIGHBORS,
            Packet::RecordRequest(_) => TYPE_RECORD_REQUEST,
            Packet::RecordResponse(_) => TYPE_RECORD_RESPONSE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Ping(_) => "PING/v4",
            Packet::Pong(_) => "PONG/v4",
            Packet::FindNode(_) => "FINDNODE/v4",
            Packet::Neighbors(_) => "NEIGHBORS/v4",
            Packet::RecordRequest(_) => "RECORDREQUEST/v4",
            Packet::RecordResponse(_) => "RECORDRESPONSE/v4",
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, bincode::Error> {
        let opts = body_options();
        match self {
            Packet::Ping(b) => opts.serialize(b),
            Packet::Pong(b) => opts.serialize(b),
            Packet::FindNode(b) => opts.serialize(b),
            Packet::Neighbors(b) => opts.serialize(b),
            Packet::RecordRequest(b) => opts.serialize(b),
            Packet::RecordResponse(b) => opts.serialize(b),
        }
    }

    fn decode_body(kind: u8, body: &[u8]) -> Result<Packet, PacketError> {
        let opts = body_options();
        let packet = match kind {
            TYPE_PING => Packet::Ping(opts.deserialize(body).map_err(|_| PacketError::BadBody)?),
            TYPE_PONG => Packet::Pong(opts.deserialize(body).map_err(|_| PacketError::BadBody)?),
            TYPE_FINDNODE => {
                Packet::FindNode(opts.deserialize(body).map_err(|_| PacketError::BadBody)?)
            }
            TYPE_NEIGHBORS => {
                Packet::Neighbors(opts.deserialize(body).map_err(|_| PacketError::BadBody)?)
            }
            TYPE_RECORD_REQUEST => {
                Packet::RecordRequest(opts.deserialize(body).map_err(|_| PacketError::BadBody)?)
            }
            TYPE_RECORD_RESPONSE => {
                Packet::RecordResponse(opts.deserialize(body).map_err(|_| PacketError::BadBody)?)
            }
            other => return Err(PacketError::UnknownType(other)),
        };
        Ok(packet)
    }

    /// Expiration timestamp carried by this packet's body, if any.
    pub fn expiration(&self) -> Option<u64> {
        match self {
            Packet::Ping(b) => Some(b.expiration),
            Packet::Pong(b) => Some(b.expiration),
            Packet::FindNode(b) => Some(b.expiration),
            Packet::Neighbors(b) => Some(b.expiration),
            Packet::RecordRequest(b) => Some(b.expiration),
            Packet::RecordResponse(_) => None,
        }
    }
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PACKET_SIZE as u64)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// A decoded, signature-verified packet with its authenticated origin.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub packet: Packet,
    pub from_id: NodeId,
    pub public_key: [u8; 32],
    /// Envelope hash: the reply token replies must echo.
    pub hash: [u8; 32],
}

/// Encode and sign a packet. Returns the wire bytes and the envelope hash
/// (the reply token a matching reply will echo).
pub fn encode_packet(keypair: &Keypair, packet: &Packet) -> Result<(Vec<u8>, [u8; 32]), PacketError> {
    let body = packet.encode_body().map_err(|_| PacketError::BadBody)?;

    let mut signed_portion = Vec::with_capacity(1 + body.len());
    signed_portion.push(packet.kind());
    signed_portion.extend_from_slice(&body);
    let sig = keypair.sign_with_domain(PACKET_SIGNATURE_DOMAIN, &signed_portion);

    let mut out = Vec::with_capacity(HEAD_SIZE + body.len());
    out.extend_from_slice(&[0u8; 32]); // hash placeholder
    out.extend_from_slice(&keypair.public_bytes());
    out.extend_from_slice(&sig);
    out.push(packet.kind());
    out.extend_from_slice(&body);

    let hash = *blake3::hash(&out[32..]).as_bytes();
    out[..32].copy_from_slice(&hash);
    Ok((out, hash))
}

/// Decode and verify a packet envelope. The returned packet may still be
/// expired or unsolicited; those checks belong to the transport's
/// preverify step.
pub fn decode_packet(buf: &[u8]) -> Result<DecodedPacket, PacketError> {
    if buf.len() < HEAD_SIZE {
        return Err(PacketError::TooSmall);
    }
    let (hash, rest) = buf.split_at(32);
    let should_hash = blake3::hash(rest);
    if hash != should_hash.as_bytes() {
        return Err(PacketError::BadHash);
    }

    let public_key: [u8; 32] = buf[32..64].try_into().expect("fixed slice");
    let sig = &buf[64..128];
    let signed_portion = &buf[128..];
    verify_with_domain(&public_key, PACKET_SIGNATURE_DOMAIN, signed_portion, sig)
        .map_err(PacketError::BadSignature)?;

    let kind = buf[128];
    let packet = Packet::decode_body(kind, &buf[HEAD_SIZE..])?;
    Ok(DecodedPacket {
        packet,
        from_id: NodeId::from_public_key(&public_key),
        public_key,
        hash: (*should_hash.as_bytes()),
    })
}

/// Absolute expiration timestamp `EXPIRATION` from now.
pub fn expiration_timestamp() -> u64 {
    unix_now() + EXPIRATION.as_secs()
}

/// Whether the given UNIX timestamp is in the past.
pub fn expired(ts: u64) -> bool {
    ts < unix_now()
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Maximum nodes per neighbors packet, computed once by stuffing a
/// synthetic packet with maximal entries until it would overflow
/// [`MAX_PACKET_SIZE`].
pub fn max_neighbors() -> usize {
    static MAX_NEIGHBORS: std::sync::LazyLock<usize> = std::sync::LazyLock::new(|| {
        let max_node = RpcNode {
            public_key: [0xFF; 32],
            ip: IpAddr::V6(std::net::Ipv6Addr::new(
                0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF,
            )),
            udp: u16::MAX,
            tcp: u16::MAX,
        };
        let mut probe = Neighbors {
            nodes: Vec::new(),
            expiration: u64::MAX,
        };
        loop {
            probe.nodes.push(max_node.clone());
            let size = body_options()
                .serialize(&probe)
                .map(|b| b.len())
                .unwrap_or(MAX_PACKET_SIZE);
            if HEAD_SIZE + size >= MAX_PACKET_SIZE {
                return probe.nodes.len() - 1;
            }
        }
    });
    *MAX_NEIGHBORS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoint(last: u8, port: u16) -> Endpoint {
        Endpoint {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
            udp: port,
            tcp: port + 1,
        }
    }

    fn ping() -> Packet {
        Packet::Ping(Ping {
            version: 4,
            from: endpoint(1, 30301),
            to: endpoint(2, 30301),
            expiration: expiration_timestamp(),
            seq: 1,
        })
    }

    #[test]
    fn encode_decode_roundtrip() {
        let kp = Keypair::generate();
        let (bytes, hash) = encode_packet(&kp, &ping()).unwrap();
        assert!(bytes.len() <= MAX_PACKET_SIZE);

        let decoded = decode_packet(&bytes).unwrap();
        assert_eq!(decoded.packet, ping());
        assert_eq!(decoded.from_id, kp.node_id());
        assert_eq!(decoded.hash, hash);
    }

    #[test]
    fn corrupt_hash_rejected() {
        let kp = Keypair::generate();
        let (mut bytes, _) = encode_packet(&kp, &ping()).unwrap();
        bytes[0] ^= 1;
        assert!(matches!(decode_packet(&bytes), Err(PacketError::BadHash)));
    }

    #[test]
    fn corrupt_body_rejected_as_bad_hash() {
        let kp = Keypair::generate();
        let (mut bytes, _) = encode_packet(&kp, &ping()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        // Body corruption invalidates the envelope hash first.
        assert!(matches!(decode_packet(&bytes), Err(PacketError::BadHash)));
    }

    #[test]
    fn forged_signature_rejected() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let (mut bytes, _) = encode_packet(&kp, &ping()).unwrap();
        // Swap in another identity's public key and re-seal the hash.
        bytes[32..64].copy_from_slice(&other.public_bytes());
        let hash = *blake3::hash(&bytes[32..]).as_bytes();
        bytes[..32].copy_from_slice(&hash);
        assert!(matches!(
            decode_packet(&bytes),
            Err(PacketError::BadSignature(_))
        ));
    }

    #[test]
    fn truncated_packet_rejected() {
        assert!(matches!(
            decode_packet(&[0u8; HEAD_SIZE - 1]),
            Err(PacketError::TooSmall)
        ));
    }

    #[test]
    fn unknown_type_rejected() {
        let kp = Keypair::generate();
        let (bytes, _) = encode_packet(&kp, &ping()).unwrap();
        let mut forged = bytes.clone();
        forged[128] = 99;
        // Re-sign so only the type is wrong.
        let body = &bytes[HEAD_SIZE..].to_vec();
        let mut signed = vec![99u8];
        signed.extend_from_slice(body);
        let sig = kp.sign_with_domain(PACKET_SIGNATURE_DOMAIN, &signed);
        forged[64..128].copy_from_slice(&sig);
        let hash = *blake3::hash(&forged[32..]).as_bytes();
        forged[..32].copy_from_slice(&hash);
        assert_eq!(decode_packet(&forged).unwrap_err(), PacketError::UnknownType(99));
    }

    #[test]
    fn all_packet_types_roundtrip() {
        let kp = Keypair::generate();
        let mut record = NodeRecord::new();
        record.set_seq(1);
        record.sign_v4(&kp).unwrap();

        let packets = vec![
            ping(),
            Packet::Pong(Pong {
                to: endpoint(3, 30301),
                reply_tok: [7u8; 32],
                expiration: expiration_timestamp(),
                seq: 2,
            }),
            Packet::FindNode(FindNode {
                target: kp.node_id(),
                expiration: expiration_timestamp(),
            }),
            Packet::Neighbors(Neighbors {
                nodes: vec![RpcNode {
                    public_key: kp.public_bytes(),
                    ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
                    udp: 30301,
                    tcp: 30302,
                }],
                expiration: expiration_timestamp(),
            }),
            Packet::RecordRequest(RecordRequest {
                expiration: expiration_timestamp(),
            }),
            Packet::RecordResponse(RecordResponse {
                reply_tok: [9u8; 32],
                record,
            }),
        ];
        for packet in packets {
            let (bytes, _) = encode_packet(&kp, &packet).unwrap();
            let decoded = decode_packet(&bytes).unwrap();
            assert_eq!(decoded.packet, packet, "{}", packet.name());
        }
    }

    #[test]
    fn max_neighbors_fits_packet() {
        let n = max_neighbors();
        assert!(n > 0);

        // A full packet with n maximal nodes must stay under the limit.
        let kp = Keypair::generate();
        let nodes = vec![
            RpcNode {
                public_key: [0xFF; 32],
                ip: IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
                udp: u16::MAX,
                tcp: u16::MAX,
            };
            n
        ];
        let (bytes, _) = encode_packet(
            &kp,
            &Packet::Neighbors(Neighbors {
                nodes,
                expiration: u64::MAX,
            }),
        )
        .unwrap();
        assert!(bytes.len() < MAX_PACKET_SIZE);
    }

    #[test]
    fn expiration_windows() {
        assert!(!expired(expiration_timestamp()));
        assert!(expired(unix_now().saturating_sub(1)));
    }
}
