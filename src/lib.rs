//! # Dagnet - P2P Networking Core for a DAG-Ledger Full Node
//!
//! Dagnet provides the peer-to-peer stack a DAG-ledger full node runs on:
//!
//! - **Identity**: Ed25519 keypairs; `NodeId = BLAKE3(public key)`
//! - **Discovery**: Kademlia-style UDP protocol with signed packets,
//!   a bucketed routing table with IP-diversity limits, and signed,
//!   versioned node records
//! - **RPC/Sync**: topic-addressed request/response over multiplexed QUIC
//!   streams with uniform response-code framing
//! - **Peer sync**: graph-state comparison, locator-based sub-DAG
//!   reconciliation, and orphan-directed block fetch
//! - **Peer management**: connection handshake state machine, bad-peer
//!   scoring with decay, CIDR-based connection gating
//!
//! ## Architecture
//!
//! High-churn state follows the **Actor Pattern**: the discovery reply
//! matcher, the peer-sync engine, and the rebroadcast engine each have a
//! cheap-to-clone Handle and a private actor owning all mutable state,
//! connected by a bounded command channel. Read-heavy, low-churn state
//! (the peer registry, the routing table) sits behind `RwLock`s.
//!
//! Components never hold references into each other: the peer registry
//! owns all peer records by id, and everything else holds [`NodeId`]s it
//! resolves through the registry.
//!
//! ## Security Model
//!
//! - RPC connections use mutual TLS with Ed25519-bound certificates;
//!   the peer identity is extracted from the certificate
//! - Discovery packets are signed and hash-addressed; expired packets are
//!   rejected, and high-cost queries are only answered for bonded peers
//! - Node records are trusted only after signature verification, and a
//!   record with a regressed sequence number is rejected
//! - All decoding of untrusted input is size-bounded; every network read
//!   and write carries an explicit deadline
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `service` | Composition root combining all components |
//! | `identity` | Keypairs, node ids, XOR distance |
//! | `record` | Signed, versioned node records (QNR) |
//! | `packet` | Discovery UDP wire packets |
//! | `table` | Routing table and node database |
//! | `udp` | Discovery transport and reply matching |
//! | `peers` | Peer status registry and bad-peer scoring |
//! | `gater` | Connection admission policy |
//! | `rpc` | QUIC host, topic dispatch, request framing |
//! | `sync` | Topic handlers, chain-state validation, handshake |
//! | `peersync` | DAG synchronization engine |
//! | `rebroadcast` | Periodic inventory re-announcement |
//! | `message` | Serialization types for the sync protocol |
//! | `encoding` | Bounded length-prefixed codec (plain / snappy) |
//! | `chain` | Collaborator traits (chain, mempool, DAG locator) |
//! | `crypto` | TLS certificate generation and verification |
//! | `config` | Node configuration surface |

pub mod chain;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod gater;
pub mod identity;
pub mod message;
pub mod packet;
pub mod peers;
pub mod peersync;
pub mod rebroadcast;
pub mod record;
pub mod rpc;
pub mod service;
pub mod sync;
pub mod table;
pub mod udp;

pub use config::{Config, PeerAddr};
pub use identity::{Keypair, NodeId};
pub use message::{ChainState, GraphState, Hash, Services};
pub use peers::{ConnectionState, Direction, PeerRegistry};
pub use record::NodeRecord;
pub use service::Service;
