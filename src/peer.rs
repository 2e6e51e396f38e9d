//! Peer records and endpoints.
//!
//! An [`Endpoint`] says where a peer is reachable: a host address, the UDP
//! port the discovery protocol uses, and optionally the TCP port the
//! application layer advertises. A [`DiscoveryPeer`] couples an identity
//! with an endpoint and tracks the peer's progress through the bonding
//! handshake.

use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Where a peer is reachable. Two endpoints are equal iff host, UDP port and
/// TCP port all match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// IPv4 or IPv6 address as a string.
    pub host: String,
    /// UDP port the discovery service listens on.
    pub udp_port: u16,
    /// TCP port advertised for the application layer, if any.
    pub tcp_port: Option<u16>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, udp_port: u16, tcp_port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            udp_port,
            tcp_port,
        }
    }

    /// The socket address datagrams for this peer are sent to.
    pub fn udp_socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.udp_port))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.udp_port)
    }
}

/// Progress of a peer through the bonding handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    /// Seen or configured, liveness not yet verified.
    Known,
    /// A PING is outstanding.
    Bonding,
    /// The handshake completed; the peer answered (or sent) a valid packet.
    Bonded,
}

/// A peer as tracked by the routing table. Timestamps are milliseconds since
/// Unix epoch, 0 when not yet set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryPeer {
    pub id: NodeId,
    pub endpoint: Endpoint,
    pub status: PeerStatus,
    pub first_discovered: u64,
    pub last_seen: u64,
    pub last_contacted: u64,
}

impl DiscoveryPeer {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            status: PeerStatus::Known,
            first_discovered: 0,
            last_seen: 0,
            last_contacted: 0,
        }
    }
}
