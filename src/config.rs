//! Node configuration surface.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::encoding::Encoding;
use crate::identity::NodeId;
use crate::message::{Services, PROTOCOL_VERSION};

/// A peer address in `pubkey_hex@ip:port` form, as used for bootstrap and
/// static peer lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub public_key: [u8; 32],
    pub addr: SocketAddr,
}

impl PeerAddr {
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key)
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (key_hex, addr) = s
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("peer address {s:?} missing '@'"))?;
        let key_bytes = hex::decode(key_hex)
            .map_err(|e| anyhow::anyhow!("peer address {s:?}: bad public key: {e}"))?;
        let public_key: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("peer address {s:?}: public key is not 32 bytes"))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("peer address {s:?}: bad socket address: {e}"))?;
        Ok(Self { public_key, addr })
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", hex::encode(self.public_key), self.addr)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Static override for the externally visible IP.
    pub host_ip: Option<IpAddr>,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub max_peers: usize,
    pub max_inbound: usize,
    pub bootstrap_nodes: Vec<PeerAddr>,
    pub static_peers: Vec<PeerAddr>,
    /// Whitelisted LAN peers exempt from limits and bad-peer policing.
    pub lan_peers: Vec<NodeId>,
    pub allow_list_cidr: Option<String>,
    pub deny_list_cidr: Vec<String>,
    pub relay_node: Option<PeerAddr>,
    pub encoding: Encoding,
    pub protocol_version: u32,
    pub services: Services,
    pub max_bad_responses: u32,
    pub user_agent: String,
    pub disable_relay_tx: bool,
    pub disable_listen: bool,
    pub max_orphan_txs: usize,
    /// Hex-encoded private key location; generated when absent.
    pub key_path: Option<PathBuf>,
    /// Network name appended to RPC topics.
    pub network_name: String,
    pub target_block_time: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_ip: None,
            udp_port: 0,
            tcp_port: 0,
            max_peers: 50,
            max_inbound: 25,
            bootstrap_nodes: Vec::new(),
            static_peers: Vec::new(),
            lan_peers: Vec::new(),
            allow_list_cidr: None,
            deny_list_cidr: Vec::new(),
            relay_node: None,
            encoding: Encoding::Snappy,
            protocol_version: PROTOCOL_VERSION,
            services: Services::FULL,
            max_bad_responses: crate::peers::DEFAULT_MAX_BAD_RESPONSES,
            user_agent: concat!("dagnet/", env!("CARGO_PKG_VERSION")).to_string(),
            disable_relay_tx: false,
            disable_listen: false,
            max_orphan_txs: 100,
            key_path: None,
            network_name: "mainnet".to_string(),
            target_block_time: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn peer_addr_roundtrip() {
        let kp = Keypair::generate();
        let s = format!("{}@10.0.0.1:30301", hex::encode(kp.public_bytes()));
        let parsed = PeerAddr::parse(&s).unwrap();
        assert_eq!(parsed.node_id(), kp.node_id());
        assert_eq!(parsed.addr.port(), 30301);
        assert_eq!(parsed.to_string(), s);
    }

    #[test]
    fn peer_addr_rejects_malformed() {
        assert!(PeerAddr::parse("no-at-sign").is_err());
        assert!(PeerAddr::parse("abcd@10.0.0.1:30301").is_err());
        let kp = Keypair::generate();
        let bad_addr = format!("{}@not-an-addr", hex::encode(kp.public_bytes()));
        assert!(PeerAddr::parse(&bad_addr).is_err());
    }
}
