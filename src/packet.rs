//! # Discovery Wire Protocol
//!
//! Four signed packet types travel between peers, one per UDP datagram:
//!
//! | Type | Purpose |
//! |------|---------|
//! | `PING` | Open (or refresh) a bond with a peer |
//! | `PONG` | Answer a PING, echoing the PING's packet hash |
//! | `FIND_NEIGHBORS` | Ask for the peers nearest a target id |
//! | `NEIGHBORS` | Answer with up to 16 (id, endpoint) entries |
//!
//! ## Wire Layout
//!
//! ```text
//! signature(65) || payload
//! payload = type_tag(1) || body
//! hash    = blake3(signature || payload)
//! ```
//!
//! The sender's identity is not carried explicitly: it is recovered from the
//! recoverable ECDSA signature on decode. The packet hash correlates PONG
//! with PING, since a PONG is only accepted if it echoes the hash of a PING
//! we actually sent.
//!
//! Bodies are bincode-encoded serde structs, deserialized with an explicit
//! size bound so a malformed length prefix cannot balloon allocations.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, SignatureError, SIGNATURE_SIZE};
use crate::identity::{Keypair, NodeId};
use crate::peer::Endpoint;

/// Maximum datagram size. Larger inbound datagrams are discarded.
pub const MAX_PACKET_SIZE: usize = 1600;

/// Maximum entries in a NEIGHBORS body.
pub const MAX_NEIGHBORS: usize = 16;

/// Lifetime stamped into outbound packet bodies. Inbound expirations are
/// carried but not enforced at this layer.
pub(crate) const PACKET_EXPIRATION_MS: u64 = 60_000;

const MAX_BODY_SIZE: u64 = MAX_PACKET_SIZE as u64;

/// 32-byte digest of a packet's signed bytes.
pub type PacketHash = [u8; 32];

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_BODY_SIZE)
        .with_fixint_encoding()
}

fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    Ping,
    Pong,
    FindNeighbors,
    Neighbors,
}

impl PacketType {
    fn tag(self) -> u8 {
        match self {
            PacketType::Ping => 0x01,
            PacketType::Pong => 0x02,
            PacketType::FindNeighbors => 0x03,
            PacketType::Neighbors => 0x04,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(PacketType::Ping),
            0x02 => Some(PacketType::Pong),
            0x03 => Some(PacketType::FindNeighbors),
            0x04 => Some(PacketType::Neighbors),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingData {
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongData {
    pub to: Endpoint,
    pub ping_hash: PacketHash,
    pub expiration: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNeighborsData {
    pub target: NodeId,
    pub expiration: Option<u64>,
}

/// One entry of a NEIGHBORS body. Only identity and reachability travel on
/// the wire; discovery status and timestamps are local state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborsData {
    pub nodes: Vec<Neighbor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketData {
    Ping(PingData),
    Pong(PongData),
    FindNeighbors(FindNeighborsData),
    Neighbors(NeighborsData),
}

impl PacketData {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketData::Ping(_) => PacketType::Ping,
            PacketData::Pong(_) => PacketType::Pong,
            PacketData::FindNeighbors(_) => PacketType::FindNeighbors,
            PacketData::Neighbors(_) => PacketType::Neighbors,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, bincode::Error> {
        match self {
            PacketData::Ping(body) => bincode::serialize(body),
            PacketData::Pong(body) => bincode::serialize(body),
            PacketData::FindNeighbors(body) => bincode::serialize(body),
            PacketData::Neighbors(body) => bincode::serialize(body),
        }
    }

    fn decode_body(kind: PacketType, bytes: &[u8]) -> Result<Self, DecodeError> {
        let data = match kind {
            PacketType::Ping => PacketData::Ping(deserialize_bounded(bytes)?),
            PacketType::Pong => PacketData::Pong(deserialize_bounded(bytes)?),
            PacketType::FindNeighbors => PacketData::FindNeighbors(deserialize_bounded(bytes)?),
            PacketType::Neighbors => {
                let body: NeighborsData = deserialize_bounded(bytes)?;
                if body.nodes.len() > MAX_NEIGHBORS {
                    return Err(DecodeError::TooManyNeighbors(body.nodes.len()));
                }
                PacketData::Neighbors(body)
            }
        };
        Ok(data)
    }
}

/// Error type for inbound datagrams that do not decode to a valid packet.
#[derive(Debug)]
pub enum DecodeError {
    /// Datagram exceeds [`MAX_PACKET_SIZE`].
    Oversize(usize),
    /// Datagram too short to carry a signature and type tag.
    Truncated(usize),
    /// Type tag is not one of the four known packets.
    UnknownType(u8),
    /// Body failed to deserialize.
    Body(bincode::Error),
    /// Sender identity could not be recovered from the signature.
    Signature(SignatureError),
    /// NEIGHBORS body lists more than [`MAX_NEIGHBORS`] entries.
    TooManyNeighbors(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Oversize(n) => {
                write!(f, "datagram of {n} bytes exceeds {MAX_PACKET_SIZE}")
            }
            DecodeError::Truncated(n) => write!(f, "datagram of {n} bytes is truncated"),
            DecodeError::UnknownType(tag) => write!(f, "unknown packet type {tag:#04x}"),
            DecodeError::Body(e) => write!(f, "malformed packet body: {e}"),
            DecodeError::Signature(e) => write!(f, "unrecoverable signature: {e}"),
            DecodeError::TooManyNeighbors(n) => {
                write!(f, "neighbors body lists {n} entries, limit {MAX_NEIGHBORS}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<bincode::Error> for DecodeError {
    fn from(e: bincode::Error) -> Self {
        DecodeError::Body(e)
    }
}

impl From<SignatureError> for DecodeError {
    fn from(e: SignatureError) -> Self {
        DecodeError::Signature(e)
    }
}

/// A decoded (or freshly signed) discovery packet together with its exact
/// wire bytes and hash.
#[derive(Clone, Debug)]
pub struct Packet {
    kind: PacketType,
    data: PacketData,
    node_id: NodeId,
    hash: PacketHash,
    bytes: Vec<u8>,
}

impl Packet {
    /// Sign and frame `data` into a sendable packet.
    pub fn create(data: PacketData, keypair: &Keypair) -> Result<Self, bincode::Error> {
        let body = data.encode_body()?;
        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(data.packet_type().tag());
        payload.extend_from_slice(&body);

        let signature = crypto::sign_recoverable(keypair, &payload);
        let mut bytes = Vec::with_capacity(SIGNATURE_SIZE + payload.len());
        bytes.extend_from_slice(&signature);
        bytes.extend_from_slice(&payload);

        Ok(Self {
            kind: data.packet_type(),
            data,
            node_id: keypair.node_id(),
            hash: crypto::digest(&bytes),
            bytes,
        })
    }

    /// Decode one datagram: enforce the MTU, recover the sender from the
    /// signature, then parse the typed body.
    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        if datagram.len() > MAX_PACKET_SIZE {
            return Err(DecodeError::Oversize(datagram.len()));
        }
        if datagram.len() <= SIGNATURE_SIZE {
            return Err(DecodeError::Truncated(datagram.len()));
        }

        let (signature, payload) = datagram.split_at(SIGNATURE_SIZE);
        let node_id = crypto::recover_node_id(signature, payload)?;

        let tag = payload[0];
        let kind = PacketType::from_tag(tag).ok_or(DecodeError::UnknownType(tag))?;
        let data = PacketData::decode_body(kind, &payload[1..])?;

        Ok(Self {
            kind,
            data,
            node_id,
            hash: crypto::digest(datagram),
            bytes: datagram.to_vec(),
        })
    }

    pub fn kind(&self) -> PacketType {
        self.kind
    }

    pub fn data(&self) -> &PacketData {
        &self.data
    }

    /// Sender identity recovered from the signature.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Digest of the signed bytes; echoed by PONG for correlation.
    pub fn hash(&self) -> &PacketHash {
        &self.hash
    }

    /// The exact datagram bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn ping(&self) -> Option<&PingData> {
        match &self.data {
            PacketData::Ping(body) => Some(body),
            _ => None,
        }
    }

    pub fn pong(&self) -> Option<&PongData> {
        match &self.data {
            PacketData::Pong(body) => Some(body),
            _ => None,
        }
    }

    pub fn find_neighbors(&self) -> Option<&FindNeighborsData> {
        match &self.data {
            PacketData::FindNeighbors(body) => Some(body),
            _ => None,
        }
    }

    pub fn neighbors(&self) -> Option<&NeighborsData> {
        match &self.data {
            PacketData::Neighbors(body) => Some(body),
            _ => None,
        }
    }
}
