//! In-flight interaction tracking.
//!
//! The controller keeps at most one outstanding request per remote peer. An
//! interaction records what was asked ([`InteractionAction`]), which reply
//! type settles it, and a correlation filter: a PONG only counts if it
//! echoes the hash of the PING we sent, while any NEIGHBORS reply settles an
//! outstanding FIND_NEIGHBORS.
//!
//! Retries are driven by detached sleep tasks that message the controller
//! loop; the interaction holds the task handle so cancellation is a plain
//! abort. A generation counter makes replacement race-free: a retry message
//! from a superseded interaction carries a stale generation and is ignored.

use tokio::task::JoinHandle;

use crate::identity::NodeId;
use crate::packet::{Packet, PacketHash, PacketType};
use crate::peer::DiscoveryPeer;

/// First retry fires this long after the initial send.
pub(crate) const INITIAL_RETRY_DELAY_MS: u64 = 2_000;

/// Retry delays grow by 1.5x per attempt up to this cap.
pub(crate) const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// Delay before the next retry given the previous one (0 = first send).
pub(crate) fn retry_delay(last_timeout_ms: u64) -> u64 {
    if last_timeout_ms == 0 {
        INITIAL_RETRY_DELAY_MS
    } else {
        MAX_RETRY_DELAY_MS.min(last_timeout_ms.saturating_mul(3) / 2)
    }
}

/// The outbound request an interaction re-issues on retry. PING bodies are
/// rebuilt with fresh timestamps on every send.
#[derive(Debug, Clone)]
pub(crate) enum InteractionAction {
    Ping,
    FindNeighbors { target: NodeId },
}

/// Correlation predicate applied to an inbound packet of the expected type.
#[derive(Debug, Clone)]
pub(crate) enum ReplyFilter {
    /// Any packet of the expected type matches.
    Any,
    /// Only a PONG echoing the recorded hash matches. `None` until the
    /// first PING is actually sent; nothing matches before that.
    PingHash(Option<PacketHash>),
}

pub(crate) struct PeerInteractionState {
    /// The remote this interaction targets; kept here so retries know where
    /// to send without consulting the table.
    pub peer: DiscoveryPeer,
    pub action: InteractionAction,
    pub expected: PacketType,
    pub filter: ReplyFilter,
    pub retryable: bool,
    /// Whether completion should chase the bond with a FIND_NEIGHBORS for
    /// our own id.
    pub bootstrap: bool,
    pub generation: u64,
    pub timer: Option<JoinHandle<()>>,
}

impl PeerInteractionState {
    pub fn bond(peer: DiscoveryPeer, bootstrap: bool, generation: u64) -> Self {
        Self {
            peer,
            action: InteractionAction::Ping,
            expected: PacketType::Pong,
            filter: ReplyFilter::PingHash(None),
            retryable: true,
            bootstrap,
            generation,
            timer: None,
        }
    }

    pub fn find_neighbors(peer: DiscoveryPeer, target: NodeId, generation: u64) -> Self {
        Self {
            peer,
            action: InteractionAction::FindNeighbors { target },
            expected: PacketType::Neighbors,
            filter: ReplyFilter::Any,
            retryable: true,
            bootstrap: false,
            generation,
            timer: None,
        }
    }

    /// Type and filter must both match for the packet to settle this
    /// interaction.
    pub fn matches(&self, packet: &Packet) -> bool {
        if packet.kind() != self.expected {
            return false;
        }
        match &self.filter {
            ReplyFilter::Any => true,
            ReplyFilter::PingHash(None) => false,
            ReplyFilter::PingHash(Some(hash)) => {
                packet.pong().map(|pong| &pong.ping_hash == hash).unwrap_or(false)
            }
        }
    }

    /// Record the hash of the first PING sent. Later sends keep the original
    /// hash: the remote is expected to ack the ping it actually received,
    /// and correlation stays pinned to the first one.
    pub fn pin_ping_hash(&mut self, hash: PacketHash) {
        if let ReplyFilter::PingHash(recorded @ None) = &mut self.filter {
            *recorded = Some(hash);
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
