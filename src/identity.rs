//! # Node Identity
//!
//! Core identity types used throughout dagnet:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`NodeId`]: 32-byte identifier derived as `BLAKE3(public key)`
//!
//! ## Identity Model
//!
//! A node's identity is the BLAKE3 hash of its Ed25519 public key. The hash
//! (rather than the raw key) is the routing identifier, so every wire
//! message that must be attributed carries the sender's public key
//! explicitly and the receiver recomputes the id before trusting it.
//!
//! - **Self-certifying**: possession of the private key proves the identity
//! - **XOR-metric routing**: ids are used directly in the Kademlia-style
//!   routing table
//!
//! ## Security Invariants
//!
//! - An id derived from a public key always equals `NodeId::from_public_key`
//!   of that key; there is no other way to produce a valid binding.
//! - XOR distance is symmetric and zero only for identical ids.

use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Domain separation prefix for node-record signatures.
pub const RECORD_SIGNATURE_DOMAIN: &[u8] = b"dagnet-record-v1:";

/// Domain separation prefix for discovery packet signatures.
pub const PACKET_SIGNATURE_DOMAIN: &[u8] = b"dagnet-discv4-v1:";

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Load a hex-encoded raw secret key from disk, or generate and persist
    /// a fresh one if the file does not exist.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let hex_str = std::fs::read_to_string(path)?;
            let bytes = hex::decode(hex_str.trim())
                .map_err(|e| anyhow::anyhow!("invalid key file {}: {e}", path.display()))?;
            let arr: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("key file {} is not 32 bytes", path.display()))?;
            return Ok(Self::from_secret_bytes(&arr));
        }
        let kp = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(kp.secret_bytes()))?;
        Ok(kp)
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Sign with a domain separation prefix prepended to the message.
    pub fn sign_with_domain(&self, domain: &[u8], message: &[u8]) -> [u8; 64] {
        let mut prefixed = Vec::with_capacity(domain.len() + message.len());
        prefixed.extend_from_slice(domain);
        prefixed.extend_from_slice(message);
        self.signing_key.sign(&prefixed).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// Verification failures for domain-separated signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Missing,
    InvalidLength,
    InvalidPublicKey,
    VerificationFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Verify a domain-separated Ed25519 signature made by `public_key`.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let key = VerifyingKey::try_from(public_key.as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let mut prefixed = Vec::with_capacity(domain.len() + message.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(message);
    key.verify(&prefixed, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignatureError::VerificationFailed)
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the id from an Ed25519 public key.
    #[inline]
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bit index of the highest differing bit, used as the routing bucket
    /// index. Identical ids map to 255.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        255
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

/// Compare two XOR distances lexicographically.
///
/// Determines which of two ids is closer to a target in the Kademlia
/// XOR metric space.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
