//! # Node Identity
//!
//! This module defines the identity types used throughout kadium:
//!
//! - [`Keypair`]: SECP256K1 signing keypair (secret + public key)
//! - [`NodeId`]: 33-byte compressed public key serving as the peer's unique
//!   identifier
//!
//! ## Identity Model
//!
//! **NodeId = compressed SECP256K1 public key.** Identities are
//! self-certifying: the sender of every packet is recovered from the packet
//! signature, so possession of the private key proves the identity, and the
//! id doubles as the coordinate for XOR-metric routing.
//!
//! Bootstrap nodes load a configured private key so their identity is stable
//! across restarts; ordinary nodes generate a fresh keypair on start.

use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a node id in bytes (compressed SECP256K1 public key).
pub const NODE_ID_SIZE: usize = 33;

/// Length of a node id in bits. One routing bucket exists per bit.
pub const ID_BITS: usize = NODE_ID_SIZE * 8;

/// Error type for loading a keypair from configured material.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyError {
    /// The hex string could not be decoded.
    Hex(hex::FromHexError),
    /// Decoded key material has the wrong length (expected 32 bytes).
    InvalidLength(usize),
    /// The bytes are not a valid SECP256K1 secret key.
    InvalidKey,
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::Hex(e) => write!(f, "invalid hex: {e}"),
            KeyError::InvalidLength(n) => {
                write!(f, "secret key must be 32 bytes, got {n}")
            }
            KeyError::InvalidKey => write!(f, "bytes are not a valid secret key"),
        }
    }
}

impl std::error::Error for KeyError {}

impl From<hex::FromHexError> for KeyError {
    fn from(e: hex::FromHexError) -> Self {
        KeyError::Hex(e)
    }
}

#[derive(Clone)]
pub struct Keypair {
    secret_key: SecretKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            secret_key: SecretKey::new(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidKey)?;
        Ok(Self { secret_key })
    }

    /// Load a keypair from a hex-encoded 32-byte secret key.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim())?;
        if bytes.len() != 32 {
            return Err(KeyError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Self::from_secret_key_bytes(&arr)
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.secret_key.secret_bytes()
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn public_key_bytes(&self) -> [u8; NODE_ID_SIZE] {
        PublicKey::from_secret_key(SECP256K1, &self.secret_key).serialize()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(self.public_key_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// A uniformly random id. Used as the anchor for table refresh lookups;
    /// refresh targets are distance coordinates, not reachable identities,
    /// so no corresponding key needs to exist.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_SIZE] {
        let mut out = [0u8; NODE_ID_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != NODE_ID_SIZE {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; NODE_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
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

// serde's derive only covers arrays up to 32 elements; a 33-byte id needs
// hand-written impls. Encoded as a raw byte string on the wire.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeIdVisitor;

        impl<'de> Visitor<'de> for NodeIdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{NODE_ID_SIZE} bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<NodeId, E> {
                if v.len() != NODE_ID_SIZE {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut arr = [0u8; NODE_ID_SIZE];
                arr.copy_from_slice(v);
                Ok(NodeId(arr))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<NodeId, A::Error> {
                let mut arr = [0u8; NODE_ID_SIZE];
                for (i, byte) in arr.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(NodeId(arr))
            }
        }

        deserializer.deserialize_bytes(NodeIdVisitor)
    }
}

/// Lexicographic comparison of two XOR distances.
#[inline]
pub(crate) fn distance_cmp(a: &[u8; NODE_ID_SIZE], b: &[u8; NODE_ID_SIZE]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Index of the highest set bit of `a XOR b`, 1-based. Returns 0 for equal
/// ids. Peers at log-distance `d` belong in bucket `d - 1`.
pub fn log_distance(a: &NodeId, b: &NodeId) -> usize {
    let dist = a.xor_distance(b);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return (NODE_ID_SIZE - byte_idx) * 8 - byte.leading_zeros() as usize;
        }
    }
    0
}
