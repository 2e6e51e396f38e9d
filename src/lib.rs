mod config;
mod controller;
mod crypto;
mod events;
mod identity;
mod interaction;
mod packet;
mod peer;
mod routing;

pub use config::{BootstrapPeer, DiscoveryConfig};
pub use controller::DiscoveryService;
pub use crypto::{SignatureError, SIGNATURE_SIZE};
pub use events::{PeerBondedCallback, PeerBondedEvent, SubscriptionId};
pub use identity::{log_distance, KeyError, Keypair, NodeId, ID_BITS, NODE_ID_SIZE};
pub use packet::{
    DecodeError, FindNeighborsData, Neighbor, NeighborsData, Packet, PacketData, PacketHash,
    PacketType, PingData, PongData, MAX_NEIGHBORS, MAX_PACKET_SIZE,
};
pub use peer::{DiscoveryPeer, Endpoint, PeerStatus};
pub use routing::{AddOutcome, AddResult, PeerTable, TABLE_K};
