//! # Connection Gater
//!
//! Policy checks applied before a dial goes out or an inbound connection
//! is admitted: allow/deny CIDR lists and peer-count backpressure.
//!
//! A refused connection is a policy decision, not an error: the gater
//! answers false and the caller silently drops the attempt. Whitelisted
//! LAN peers bypass every check.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::trace;

use crate::config::Config;
use crate::identity::NodeId;
use crate::peers::PeerRegistry;

/// A parsed CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("CIDR {s:?} missing prefix length"))?;
        let network: IpAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("CIDR {s:?}: bad address: {e}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| anyhow::anyhow!("CIDR {s:?}: bad prefix: {e}"))?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            anyhow::bail!("CIDR {s:?}: prefix {prefix} exceeds {max}");
        }
        Ok(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - self.prefix as u32);
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - self.prefix as u32);
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

/// Address filter built from the configured allow and deny lists.
///
/// With an allow list present, everything outside it is rejected; without
/// one, anything not on a deny list passes.
#[derive(Debug, Default)]
pub struct AddrFilter {
    allow: Option<Cidr>,
    deny: Vec<Cidr>,
}

impl AddrFilter {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let allow = config
            .allow_list_cidr
            .as_deref()
            .map(Cidr::parse)
            .transpose()?;
        let deny = config
            .deny_list_cidr
            .iter()
            .map(|s| Cidr::parse(s))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { allow, deny })
    }

    pub fn permits(&self, ip: IpAddr) -> bool {
        if let Some(allow) = &self.allow {
            return allow.contains(ip);
        }
        !self.deny.iter().any(|cidr| cidr.contains(ip))
    }
}

/// Connection admission policy.
pub struct ConnectionGater {
    filter: AddrFilter,
    max_peers: usize,
    max_inbound: usize,
    disable_listen: bool,
    lan_peers: HashSet<NodeId>,
    registry: Arc<PeerRegistry>,
}

impl ConnectionGater {
    pub fn new(config: &Config, registry: Arc<PeerRegistry>) -> anyhow::Result<Self> {
        Ok(Self {
            filter: AddrFilter::from_config(config)?,
            max_peers: config.max_peers,
            max_inbound: config.max_inbound,
            disable_listen: config.disable_listen,
            lan_peers: config.lan_peers.iter().copied().collect(),
            registry,
        })
    }

    pub fn is_white_peer(&self, id: &NodeId) -> bool {
        self.lan_peers.contains(id)
    }

    pub fn is_peer_at_limit(&self) -> bool {
        self.registry.active().len() >= self.max_peers
    }

    pub fn is_inbound_at_limit(&self) -> bool {
        self.registry.dir_inbound().len() >= self.max_inbound
    }

    /// Whether we may dial this peer at all.
    pub fn intercept_peer_dial(&self, id: &NodeId) -> bool {
        if self.is_white_peer(id) {
            return true;
        }
        if self.is_peer_at_limit() {
            trace!(peer = %id, "refusing dial: at peer limit");
            return false;
        }
        true
    }

    /// Whether we may dial this peer at this address.
    pub fn intercept_addr_dial(&self, id: &NodeId, ip: IpAddr) -> bool {
        if self.is_white_peer(id) {
            return true;
        }
        if self.is_peer_at_limit() {
            trace!(peer = %id, addr = %ip, "refusing dial: at peer limit");
            return false;
        }
        self.filter.permits(ip)
    }

    /// Whether an incipient inbound connection is allowed.
    pub fn intercept_accept(&self, ip: IpAddr) -> bool {
        if self.disable_listen {
            trace!(addr = %ip, "refusing inbound: listening disabled");
            return false;
        }
        if !self.filter.permits(ip) {
            trace!(addr = %ip, "refusing inbound: address filtered");
            return false;
        }
        if self.is_inbound_at_limit() {
            trace!(addr = %ip, "refusing inbound: at inbound limit");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::peers::{ConnectionState, Direction};

    #[test]
    fn cidr_contains() {
        let net = Cidr::parse("10.1.0.0/16").unwrap();
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("10.2.0.1".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));

        let all = Cidr::parse("0.0.0.0/0").unwrap();
        assert!(all.contains("203.0.113.9".parse().unwrap()));

        let v6 = Cidr::parse("fd00::/8").unwrap();
        assert!(v6.contains("fd12::1".parse().unwrap()));
        assert!(!v6.contains("fe80::1".parse().unwrap()));
    }

    #[test]
    fn cidr_rejects_malformed() {
        assert!(Cidr::parse("10.0.0.0").is_err());
        assert!(Cidr::parse("10.0.0.0/33").is_err());
        assert!(Cidr::parse("banana/8").is_err());
    }

    #[test]
    fn allow_list_restricts_everything_else() {
        let config = Config {
            allow_list_cidr: Some("192.168.0.0/16".into()),
            ..Config::default()
        };
        let filter = AddrFilter::from_config(&config).unwrap();
        assert!(filter.permits("192.168.1.1".parse().unwrap()));
        assert!(!filter.permits("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn deny_list_blocks_listed_only() {
        let config = Config {
            deny_list_cidr: vec!["10.0.0.0/8".into(), "172.16.0.0/12".into()],
            ..Config::default()
        };
        let filter = AddrFilter::from_config(&config).unwrap();
        assert!(!filter.permits("10.1.2.3".parse().unwrap()));
        assert!(!filter.permits("172.20.0.1".parse().unwrap()));
        assert!(filter.permits("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn peer_limit_backpressure() {
        let registry = Arc::new(PeerRegistry::new(50));
        let config = Config {
            max_peers: 1,
            max_inbound: 1,
            ..Config::default()
        };
        let gater = ConnectionGater::new(&config, registry.clone()).unwrap();

        let dialed = Keypair::generate().node_id();
        assert!(gater.intercept_peer_dial(&dialed));

        // Fill the single slot.
        let busy = registry.fetch(Keypair::generate().node_id());
        busy.update_addr_dir(None, "10.0.0.9:1".into(), Direction::Inbound);
        busy.set_connection_state(ConnectionState::Connected);

        assert!(gater.is_peer_at_limit());
        assert!(!gater.intercept_peer_dial(&dialed));
        assert!(!gater.intercept_accept("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn white_peer_bypasses_limits() {
        let registry = Arc::new(PeerRegistry::new(50));
        let vip = Keypair::generate().node_id();
        let config = Config {
            max_peers: 0,
            lan_peers: vec![vip],
            ..Config::default()
        };
        let gater = ConnectionGater::new(&config, registry).unwrap();
        assert!(gater.intercept_peer_dial(&vip));
        assert!(gater.intercept_addr_dial(&vip, "8.8.8.8".parse().unwrap()));
        assert!(!gater.intercept_peer_dial(&Keypair::generate().node_id()));
    }

    #[test]
    fn disable_listen_refuses_inbound() {
        let registry = Arc::new(PeerRegistry::new(50));
        let config = Config {
            disable_listen: true,
            ..Config::default()
        };
        let gater = ConnectionGater::new(&config, registry).unwrap();
        assert!(!gater.intercept_accept("8.8.8.8".parse().unwrap()));
    }
}
