//! Integration tests for the RPC/sync stack.
//!
//! Each test assembles full services over localhost QUIC + UDP and drives
//! realistic peer scenarios: handshakes, chain-state rejection, DAG
//! catch-up, and transaction relay.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dagnet::chain::{BlockChain, MemoryChain, MemoryDagSync, MemoryMempool, TxDesc, TxMemPool};
use dagnet::config::{Config, PeerAddr};
use dagnet::message::PROTOCOL_VERSION;
use dagnet::{Hash, Service};

/// Atomic port counter for unique port allocation across parallel tests.
/// Each service takes a UDP and a TCP port, so we increment by 2.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

struct Harness {
    service: Service,
    chain: Arc<MemoryChain>,
    mempool: Arc<MemoryMempool>,
}

/// A service over an in-memory chain holding `blocks` blocks on top of
/// `genesis`.
async fn spawn_service(genesis: Hash, blocks: u32) -> Harness {
    let chain = Arc::new(MemoryChain::new(genesis));
    for i in 0..blocks {
        let body = format!("block-{genesis}-{i}").into_bytes();
        chain.add_block(Hash::of(&body), body);
    }
    let dag_sync = Arc::new(MemoryDagSync::new(chain.order()));
    let mempool = Arc::new(MemoryMempool::new());
    let port = next_port();
    let config = Config {
        udp_port: port,
        tcp_port: port + 1,
        network_name: "testnet".into(),
        ..Config::default()
    };
    let service = Service::start(config, chain.clone(), mempool.clone(), dag_sync)
        .await
        .expect("service start");
    Harness {
        service,
        chain,
        mempool,
    }
}

fn peer_addr(h: &Harness) -> PeerAddr {
    PeerAddr {
        public_key: h.service.local_node().keypair().public_bytes(),
        addr: format!("127.0.0.1:{}", h.service.config().tcp_port)
            .parse()
            .unwrap(),
    }
}

/// Poll `cond` until it holds or the timeout elapses.
async fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test]
async fn handshake_connects_both_sides() {
    let genesis = Hash::of(b"handshake-genesis");
    let a = spawn_service(genesis, 2).await;
    let b = spawn_service(genesis, 2).await;
    let (a_id, b_id) = (a.service.local_id(), b.service.local_id());

    a.service.connect_to(&peer_addr(&b)).await.expect("dial");

    assert!(
        wait_until(
            || {
                let a_sees = a
                    .service
                    .peers()
                    .get(&b_id)
                    .map(|p| p.is_connected())
                    .unwrap_or(false);
                let b_sees = b
                    .service
                    .peers()
                    .get(&a_id)
                    .map(|p| p.is_connected())
                    .unwrap_or(false);
                a_sees && b_sees
            },
            TEST_TIMEOUT,
        )
        .await,
        "both sides should reach Connected"
    );

    // The chain-state exchange populated peer metadata on both ends.
    let pe = a.service.peers().get(&b_id).unwrap();
    assert_eq!(pe.protocol_version(), PROTOCOL_VERSION);
    assert!(pe.is_consensus());
    assert!(pe.graph_state().is_some());

    // Equal graph states: neither side picks a sync target.
    assert!(a.service.is_current());
    assert!(b.service.is_current());

    a.service.stop();
    b.service.stop();
}

#[tokio::test]
async fn genesis_mismatch_ends_in_goodbye_and_disconnect() {
    let a = spawn_service(Hash::of(b"genesis-one"), 2).await;
    let b = spawn_service(Hash::of(b"genesis-two"), 2).await;
    let (a_id, b_id) = (a.service.local_id(), b.service.local_id());

    a.service.connect_to(&peer_addr(&b)).await.expect("dial");

    // The dialer learns of the mismatch from the responder's status
    // answer, says goodbye, and both ends settle on Disconnected.
    assert!(
        wait_until(
            || {
                let a_dropped = a
                    .service
                    .peers()
                    .get(&b_id)
                    .map(|p| p.connection_state().is_disconnected())
                    .unwrap_or(false);
                let b_dropped = b
                    .service
                    .peers()
                    .get(&a_id)
                    .map(|p| !p.is_connected())
                    .unwrap_or(true);
                a_dropped && b_dropped
            },
            TEST_TIMEOUT,
        )
        .await,
        "mismatched genesis must not produce a usable connection"
    );
    assert!(!a.service.sync().has_sync_peer());

    a.service.stop();
    b.service.stop();
}

#[tokio::test]
async fn block_sync_catches_up_from_ahead_peer() {
    let genesis = Hash::of(b"sync-genesis");
    let a = spawn_service(genesis, 0).await;
    let b = spawn_service(genesis, 8).await;
    let b_total = b.chain.best_snapshot().graph_state.total;
    assert_eq!(b_total, 9);

    a.service.connect_to(&peer_addr(&b)).await.expect("dial");

    // A picks B as sync target, reconciles the sub-DAG, fetches bodies,
    // and lands on the same order.
    assert!(
        wait_until(
            || a.chain.best_snapshot().graph_state.total == b_total,
            TEST_TIMEOUT,
        )
        .await,
        "A should catch up to B's graph state"
    );
    assert_eq!(a.chain.order(), b.chain.order());

    // With nothing left to fetch the sync peer clears and we are current.
    assert!(
        wait_until(
            || !a.service.sync().has_sync_peer() && a.service.is_current(),
            TEST_TIMEOUT,
        )
        .await,
        "A should become current after catch-up"
    );

    a.service.stop();
    b.service.stop();
}

#[tokio::test]
async fn transaction_relay_propagates_to_peer() {
    let genesis = Hash::of(b"relay-genesis");
    let a = spawn_service(genesis, 1).await;
    let b = spawn_service(genesis, 1).await;
    let b_id = b.service.local_id();

    a.service.connect_to(&peer_addr(&b)).await.expect("dial");
    assert!(
        wait_until(
            || {
                a.service
                    .peers()
                    .get(&b_id)
                    .map(|p| p.is_connected())
                    .unwrap_or(false)
            },
            TEST_TIMEOUT,
        )
        .await
    );

    // A holds a transaction B has never seen; announcing it makes B fetch
    // and admit it.
    let tx_body = b"tx-hello".to_vec();
    let tx_hash = Hash::of(&tx_body);
    a.mempool.insert(tx_hash, tx_body);
    a.service.peersync().relay_inventory(vec![TxDesc {
        hash: tx_hash,
        added: std::time::Instant::now(),
        fee_per_kb: 0,
    }]);

    assert!(
        wait_until(|| b.mempool.have_transaction(&tx_hash), TEST_TIMEOUT).await,
        "B should fetch the announced transaction"
    );

    a.service.stop();
    b.service.stop();
}

#[tokio::test]
async fn lonely_node_is_current_without_peers() {
    let h = spawn_service(Hash::of(b"lonely-genesis"), 3).await;
    assert!(!h.service.sync().has_sync_peer());
    assert!(h.service.is_current());
    assert!(h.service.peer_stats().is_empty());
    h.service.stop();
}
