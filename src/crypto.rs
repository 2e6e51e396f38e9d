//! # Cryptographic Primitives
//!
//! Digest and signature helpers for the discovery wire protocol:
//!
//! - **Digests**: BLAKE3 over packet bytes, used for the packet hash that
//!   PONG echoes back to correlate with its PING.
//! - **Signatures**: recoverable ECDSA over SECP256K1. Packets do not carry
//!   the sender's identity explicitly; the receiver recovers the sender's
//!   public key from the 65-byte signature, so every datagram is
//!   self-authenticating.
//!
//! Wire signature layout: `recovery_id(1) || r || s(64)`.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, SECP256K1};

use crate::identity::{Keypair, NodeId};

/// Size of a wire signature: one recovery id byte plus the 64-byte compact
/// ECDSA signature.
pub const SIGNATURE_SIZE: usize = 65;

/// Error type for signature recovery failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature has invalid length (expected 65 bytes).
    InvalidLength,
    /// The recovery id byte is not in `0..=3`.
    InvalidRecoveryId,
    /// The public key could not be recovered from the signature.
    RecoveryFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::InvalidRecoveryId => write!(f, "invalid recovery id"),
            SignatureError::RecoveryFailed => write!(f, "public key recovery failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// 32-byte BLAKE3 digest.
pub(crate) fn digest(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(blake3::hash(data).as_bytes());
    out
}

/// Sign `data` with a recoverable ECDSA signature over its digest.
pub(crate) fn sign_recoverable(keypair: &Keypair, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
    let message = Message::from_digest(digest(data));
    let signature = SECP256K1.sign_ecdsa_recoverable(&message, keypair.secret_key());
    let (recovery_id, compact) = signature.serialize_compact();

    let mut out = [0u8; SIGNATURE_SIZE];
    out[0] = recovery_id.to_i32() as u8;
    out[1..].copy_from_slice(&compact);
    out
}

/// Recover the sender's node id from a wire signature over `data`.
pub(crate) fn recover_node_id(signature: &[u8], data: &[u8]) -> Result<NodeId, SignatureError> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(SignatureError::InvalidLength);
    }
    let recovery_id = RecoveryId::from_i32(i32::from(signature[0]))
        .map_err(|_| SignatureError::InvalidRecoveryId)?;
    let signature = RecoverableSignature::from_compact(&signature[1..], recovery_id)
        .map_err(|_| SignatureError::RecoveryFailed)?;

    let message = Message::from_digest(digest(data));
    let public_key = SECP256K1
        .recover_ecdsa(&message, &signature)
        .map_err(|_| SignatureError::RecoveryFailed)?;
    Ok(NodeId::from_bytes(public_key.serialize()))
}
