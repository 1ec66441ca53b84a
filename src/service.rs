//! # Service
//!
//! Composition root: owns the keypair, local record, QUIC host, discovery
//! transport, peer registry, sync engine, and rebroadcast engine, and
//! wires them together. Mostly glue; the interesting logic lives in the
//! component modules.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::{debug, info, trace};

use crate::chain::{BlockChain, DagSync, TxMemPool};
use crate::config::{Config, PeerAddr};
use crate::gater::ConnectionGater;
use crate::identity::{Keypair, NodeId};
use crate::peers::{PeerRegistry, StatsSnapshot, DECAY_INTERVAL};
use crate::peersync::{PeerSync, PeerSyncHandle};
use crate::rebroadcast::{Rebroadcast, RebroadcastHandle};
use crate::record::LocalNode;
use crate::rpc::{Host, HostEvent};
use crate::sync::{SyncManager, PEER_INTERVAL, RECONNECTION_TIME};
use crate::table::DiscNode;
use crate::udp::Discovery;

/// The assembled networking service.
pub struct Service {
    config: Config,
    local: Arc<LocalNode>,
    registry: Arc<PeerRegistry>,
    sync: Arc<SyncManager>,
    host: Arc<Host>,
    discovery: Discovery,
    peersync: PeerSyncHandle,
    rebroadcast: RebroadcastHandle,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Service {
    /// Build and start the whole stack. Local misconfiguration (bad key
    /// file, unparseable CIDR, unbindable socket) is fatal here; nothing
    /// network-dependent is.
    pub async fn start(
        config: Config,
        chain: Arc<dyn BlockChain>,
        mempool: Arc<dyn TxMemPool>,
        dag_sync: Arc<dyn DagSync>,
    ) -> anyhow::Result<Service> {
        let keypair = match &config.key_path {
            Some(path) => Keypair::load_or_generate(path).context("loading private key")?,
            None => Keypair::generate(),
        };
        let local = Arc::new(LocalNode::new(
            keypair.clone(),
            config.host_ip,
            config.udp_port,
            config.tcp_port,
        ));
        info!(id = %local.id(), "starting p2p service");

        let registry = Arc::new(PeerRegistry::new(config.max_bad_responses));
        let gater =
            Arc::new(ConnectionGater::new(&config, registry.clone()).context("connection gater")?);

        let (peersync, peersync_rx) = PeerSyncHandle::channel();
        let sync = Arc::new(SyncManager::new(
            config.clone(),
            registry.clone(),
            gater.clone(),
            chain,
            mempool,
            dag_sync,
            local.clone(),
            peersync.clone(),
        ));

        let rpc_registry = Arc::new(sync.build_registry());
        let tcp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.tcp_port);
        let (host, mut events) =
            Host::listen(tcp_bind, keypair.clone(), rpc_registry, gater.clone())
                .await
                .context("binding RPC listener")?;
        sync.set_host(host.clone());

        let udp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.udp_port);
        let bootnodes: Vec<DiscNode> = config
            .bootstrap_nodes
            .iter()
            .map(|pa| {
                DiscNode::new(pa.node_id(), pa.public_key, pa.addr.ip(), pa.addr.port(), 0)
            })
            .collect();
        let discovery = Discovery::listen(udp_bind, local.clone(), bootnodes)
            .await
            .context("binding discovery listener")?;

        let mut tasks = Vec::new();
        tasks.push(PeerSync::spawn(sync.clone(), peersync_rx));

        // Connection notifications feed the handshake state machine.
        let pump_sync = sync.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    HostEvent::Connected {
                        peer,
                        addr,
                        direction,
                        ..
                    } => {
                        pump_sync.process_connected(peer, addr, direction).await;
                    }
                    HostEvent::Disconnected { peer } => {
                        pump_sync.process_disconnected(peer).await;
                    }
                }
            }
        }));

        let (rebroadcast, rebroadcast_task) = Rebroadcast::spawn(sync.clone());
        tasks.push(rebroadcast_task);
        tasks.push(sync.spawn_maintenance(PEER_INTERVAL));
        tasks.push(registry.spawn_decay_loop(DECAY_INTERVAL));

        let service = Service {
            config,
            local,
            registry,
            sync,
            host,
            discovery,
            peersync,
            rebroadcast,
            tasks: Mutex::new(tasks),
        };
        service.dial_static_peers();
        service.spawn_revival_loop();
        Ok(service)
    }

    /// Cascade shutdown: actors first, then both transports.
    pub fn stop(&self) {
        info!(id = %self.local.id(), "stopping p2p service");
        self.rebroadcast.stop();
        self.peersync.stop();
        self.discovery.close();
        self.host.close();
        for task in self.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn local_id(&self) -> NodeId {
        self.local.id()
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn peersync(&self) -> &PeerSyncHandle {
        &self.peersync
    }

    pub fn rebroadcast(&self) -> &RebroadcastHandle {
        &self.rebroadcast
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn rpc_addr(&self) -> anyhow::Result<SocketAddr> {
        self.host.local_addr()
    }

    pub fn is_current(&self) -> bool {
        self.sync.is_current()
    }

    /// Operator snapshot of every known peer.
    pub fn peer_stats(&self) -> Vec<StatsSnapshot> {
        self.registry
            .all()
            .iter()
            .map(|pe| pe.stats_snapshot())
            .collect()
    }

    // ------------------------------------------------------------------
    // Dialing
    // ------------------------------------------------------------------

    /// Dial a peer; the handshake runs off the connection notification.
    pub async fn connect_to(&self, peer: &PeerAddr) -> anyhow::Result<()> {
        self.host.connect(&peer.public_key, peer.addr).await?;
        Ok(())
    }

    fn dial_static_peers(&self) {
        for peer in self.config.static_peers.clone() {
            let host = self.host.clone();
            tokio::spawn(async move {
                if let Err(e) = host.connect(&peer.public_key, peer.addr).await {
                    debug!(peer = %peer.node_id(), "static peer dial failed: {e}");
                }
            });
        }
        if let Some(relay) = self.config.relay_node.clone() {
            let host = self.host.clone();
            tokio::spawn(async move {
                if let Err(e) = host.connect(&relay.public_key, relay.addr).await {
                    debug!(peer = %relay.node_id(), "relay node dial failed: {e}");
                }
            });
        }
    }

    /// Periodically redial disconnected peers whose records give us an
    /// endpoint, plus any static peers that fell off.
    fn spawn_revival_loop(&self) {
        let registry = self.registry.clone();
        let host = self.host.clone();
        let statics = self.config.static_peers.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(RECONNECTION_TIME);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                for pe in registry.disconnected() {
                    if pe.is_bad() {
                        continue;
                    }
                    let recent = pe
                        .connection_time()
                        .map(|t| t.elapsed() < RECONNECTION_TIME)
                        .unwrap_or(true);
                    if recent {
                        continue;
                    }
                    let endpoint = pe.record().and_then(|record| {
                        Some((*record.public_key()?, record.tcp_addr()?))
                    });
                    let (public_key, addr) = match endpoint {
                        Some(pair) => pair,
                        None => match statics.iter().find(|pa| pa.node_id() == pe.id()) {
                            Some(pa) => (pa.public_key, pa.addr),
                            None => continue,
                        },
                    };
                    let host = host.clone();
                    let id = pe.id();
                    tokio::spawn(async move {
                        trace!(peer = %id, "re-dialing disconnected peer");
                        if let Err(e) = host.connect(&public_key, addr).await {
                            trace!(peer = %id, "re-dial failed: {e}");
                        }
                    });
                }
            }
        });
        self.tasks.lock().expect("task list lock").push(task);
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}
