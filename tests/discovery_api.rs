//! Integration tests for the discovery service public API.
//!
//! These tests run real services on localhost UDP sockets. Where a scenario
//! needs a misbehaving or scripted peer (wrong ping hash, crafted NEIGHBORS
//! lists), the peer side is driven by hand with a bare socket and the
//! crate's own packet codec.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

use kadium::{
    BootstrapPeer, DiscoveryConfig, DiscoveryService, Endpoint, Keypair, NodeId, Packet,
    PacketData, PacketType, PeerBondedEvent, PeerStatus, PingData, PongData, MAX_PACKET_SIZE,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Deterministic secret key material for bootnode identities.
fn seed_key(n: u8) -> String {
    let mut bytes = [0u8; 32];
    bytes[31] = n;
    hex::encode(bytes)
}

async fn start_bootnode(key_seed: u8) -> DiscoveryService {
    init_tracing();
    let config = DiscoveryConfig {
        bootnode: true,
        private_key: Some(seed_key(key_seed)),
        node_ip: "127.0.0.1".to_string(),
        discovery_port: 0,
        libp2p_port: None,
        bootstrap_peers: vec![],
    };
    DiscoveryService::start(config).await.expect("start bootnode")
}

async fn start_node(bootstrap_peers: Vec<BootstrapPeer>) -> DiscoveryService {
    init_tracing();
    let config = DiscoveryConfig {
        bootnode: false,
        private_key: None,
        node_ip: "127.0.0.1".to_string(),
        discovery_port: 0,
        libp2p_port: Some(9000),
        bootstrap_peers,
    };
    DiscoveryService::start(config).await.expect("start node")
}

fn bootstrap_entry(service: &DiscoveryService) -> BootstrapPeer {
    BootstrapPeer::new(
        service.node_id(),
        "127.0.0.1",
        service.local_endpoint().udp_port,
        None,
    )
}

fn service_addr(service: &DiscoveryService) -> SocketAddr {
    service
        .local_endpoint()
        .udp_socket_addr()
        .expect("local endpoint resolves")
}

async fn bonded_events(service: &DiscoveryService) -> mpsc::UnboundedReceiver<PeerBondedEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    service
        .subscribe_peer_bonded(Arc::new(move |event| {
            let _ = tx.send(event);
        }))
        .await
        .expect("subscribe");
    rx
}

/// Poll the service's table until the peer shows up bonded.
async fn wait_for_bonded(service: &DiscoveryService, id: NodeId) -> kadium::DiscoveryPeer {
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        if let Some(peer) = service.table_peer(id).await {
            if peer.status == PeerStatus::Bonded {
                return peer;
            }
        }
        assert!(Instant::now() < deadline, "peer {id} never bonded");
        sleep(Duration::from_millis(25)).await;
    }
}

/// A hand-driven protocol peer: a bare socket plus a keypair, sending and
/// receiving through the crate's packet codec.
struct ScriptedPeer {
    keypair: Keypair,
    socket: UdpSocket,
}

impl ScriptedPeer {
    async fn bind() -> Self {
        Self {
            keypair: Keypair::generate(),
            socket: UdpSocket::bind("127.0.0.1:0").await.expect("bind"),
        }
    }

    fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("local addr")
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr().port(), None)
    }

    async fn send(&self, data: PacketData, to: SocketAddr) -> Packet {
        let packet = Packet::create(data, &self.keypair).expect("create packet");
        self.socket
            .send_to(packet.bytes(), to)
            .await
            .expect("send packet");
        packet
    }

    async fn recv(&self) -> Packet {
        let mut buf = [0u8; MAX_PACKET_SIZE + 1];
        let (len, _) = timeout(TEST_TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .expect("timely packet")
            .expect("recv");
        Packet::decode(&buf[..len]).expect("decode")
    }

    async fn recv_expect(&self, kind: PacketType) -> Packet {
        let packet = self.recv().await;
        assert_eq!(packet.kind(), kind, "unexpected packet type");
        packet
    }

    fn ping_to(&self, service: &DiscoveryService) -> PacketData {
        PacketData::Ping(PingData {
            from: self.endpoint(),
            to: service.local_endpoint().clone(),
            expiration: None,
        })
    }
}

#[tokio::test]
async fn two_nodes_bond_and_emit_events() {
    let bootnode = start_bootnode(1).await;
    let mut bootnode_events = bonded_events(&bootnode).await;

    let node = start_node(vec![bootstrap_entry(&bootnode)]).await;

    // The bootnode side observes the node's PING and bonds it.
    let event = timeout(TEST_TIMEOUT, bootnode_events.recv())
        .await
        .expect("timely event")
        .expect("event");
    assert_eq!(event.peer.id, *node.node_id());
    assert_eq!(event.peer.status, PeerStatus::Bonded);
    assert!(event.timestamp > 0);

    // The node side bonds the bootnode once the PONG matches.
    let bonded = wait_for_bonded(&node, *bootnode.node_id()).await;
    assert_eq!(bonded.endpoint.udp_port, bootnode.local_endpoint().udp_port);
    assert!(bonded.last_seen >= bonded.first_discovered);
    assert!(bonded.first_discovered > 0);

    // And the bootnode's table holds the node.
    assert!(bootnode.table_peer(*node.node_id()).await.is_some());
}

#[tokio::test]
async fn bonded_event_emitted_once_per_session() {
    let service = start_bootnode(2).await;
    let mut events = bonded_events(&service).await;
    let peer = ScriptedPeer::bind().await;

    let ping = peer.send(peer.ping_to(&service), service_addr(&service)).await;
    let pong = peer.recv_expect(PacketType::Pong).await;
    assert_eq!(pong.pong().expect("pong body").ping_hash, *ping.hash());

    let event = timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("timely event")
        .expect("event");
    assert_eq!(event.peer.id, peer.node_id());

    // A second PING bumps the existing bonded entry: answered, no event.
    peer.send(peer.ping_to(&service), service_addr(&service)).await;
    peer.recv_expect(PacketType::Pong).await;
    assert!(
        timeout(Duration::from_millis(500), events.recv()).await.is_err(),
        "re-ping of a bonded peer must not emit another event"
    );
}

#[tokio::test]
async fn wrong_ping_hash_is_ignored_and_ping_retried() {
    let peer = ScriptedPeer::bind().await;
    let entry = BootstrapPeer::new(&peer.node_id(), "127.0.0.1", peer.addr().port(), None);
    let node = start_node(vec![entry]).await;

    let ping = peer.recv_expect(PacketType::Ping).await;
    assert_eq!(ping.node_id(), node.node_id());
    let first_ping_at = Instant::now();

    // Answer with a PONG that references a hash we never saw.
    let ping_body = ping.ping().expect("ping body");
    peer.send(
        PacketData::Pong(PongData {
            to: ping_body.from.clone(),
            ping_hash: [0xAB; 32],
            expiration: None,
        }),
        service_addr(&node),
    )
    .await;

    // The forged PONG must not settle the bond.
    sleep(Duration::from_millis(300)).await;
    let table_entry = node.table_peer(peer.node_id()).await.expect("seed stays in table");
    assert_ne!(table_entry.status, PeerStatus::Bonded);

    // The retry timer re-sends the PING on schedule.
    let retried = peer.recv_expect(PacketType::Ping).await;
    let elapsed = first_ping_at.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1500),
        "retry came after {elapsed:?}, expected ~2s"
    );

    // Correlation stays pinned to the FIRST ping's hash.
    peer.send(
        PacketData::Pong(PongData {
            to: ping_body.from.clone(),
            ping_hash: *retried.hash(),
            expiration: None,
        }),
        service_addr(&node),
    )
    .await;
    sleep(Duration::from_millis(300)).await;
    let table_entry = node.table_peer(peer.node_id()).await.expect("still present");
    assert_ne!(
        table_entry.status,
        PeerStatus::Bonded,
        "a PONG for a retry hash must not match the pinned filter"
    );

    peer.send(
        PacketData::Pong(PongData {
            to: ping_body.from.clone(),
            ping_hash: *ping.hash(),
            expiration: None,
        }),
        service_addr(&node),
    )
    .await;
    wait_for_bonded(&node, peer.node_id()).await;
}

#[tokio::test]
async fn bootstrap_bond_chains_into_find_neighbors() {
    let peer = ScriptedPeer::bind().await;
    let entry = BootstrapPeer::new(&peer.node_id(), "127.0.0.1", peer.addr().port(), None);
    let node = start_node(vec![entry]).await;

    let ping = peer.recv_expect(PacketType::Ping).await;
    peer.send(
        PacketData::Pong(PongData {
            to: ping.ping().expect("ping body").from.clone(),
            ping_hash: *ping.hash(),
            expiration: None,
        }),
        service_addr(&node),
    )
    .await;

    // A settled bootstrap bond asks for the neighbors nearest the node
    // itself.
    let find = peer.recv_expect(PacketType::FindNeighbors).await;
    assert_eq!(
        find.find_neighbors().expect("find body").target,
        *node.node_id()
    );
}

#[tokio::test]
async fn neighbors_reply_bonds_unknown_peers_only() {
    use kadium::{Neighbor, NeighborsData};

    let bootstrap = ScriptedPeer::bind().await;
    let entry = BootstrapPeer::new(&bootstrap.node_id(), "127.0.0.1", bootstrap.addr().port(), None);
    let node = start_node(vec![entry]).await;

    // Complete the bond and wait for the chained FIND_NEIGHBORS.
    let ping = bootstrap.recv_expect(PacketType::Ping).await;
    bootstrap
        .send(
            PacketData::Pong(PongData {
                to: ping.ping().expect("ping body").from.clone(),
                ping_hash: *ping.hash(),
                expiration: None,
            }),
            service_addr(&node),
        )
        .await;
    bootstrap.recv_expect(PacketType::FindNeighbors).await;

    // Answer with two unknown peers plus the node itself.
    let unknown_a = ScriptedPeer::bind().await;
    let unknown_b = ScriptedPeer::bind().await;
    bootstrap
        .send(
            PacketData::Neighbors(NeighborsData {
                nodes: vec![
                    Neighbor {
                        id: unknown_a.node_id(),
                        endpoint: unknown_a.endpoint(),
                    },
                    Neighbor {
                        id: unknown_b.node_id(),
                        endpoint: unknown_b.endpoint(),
                    },
                    Neighbor {
                        id: *node.node_id(),
                        endpoint: node.local_endpoint().clone(),
                    },
                ],
            }),
            service_addr(&node),
        )
        .await;

    // Both unknown peers get bonded; the node never bonds itself.
    let ping_a = unknown_a.recv_expect(PacketType::Ping).await;
    assert_eq!(ping_a.node_id(), node.node_id());
    let ping_b = unknown_b.recv_expect(PacketType::Ping).await;
    assert_eq!(
        ping_b.ping().expect("ping body").from.udp_port,
        node.local_endpoint().udp_port
    );
    assert!(node.table_peer(*node.node_id()).await.is_none());
}

#[tokio::test]
async fn find_neighbors_answered_from_table() {
    let service = start_bootnode(3).await;
    let peer = ScriptedPeer::bind().await;

    // Bond first so the table has at least one entry.
    peer.send(peer.ping_to(&service), service_addr(&service)).await;
    peer.recv_expect(PacketType::Pong).await;

    peer.send(
        PacketData::FindNeighbors(kadium::FindNeighborsData {
            target: NodeId::random(),
            expiration: None,
        }),
        service_addr(&service),
    )
    .await;

    let reply = peer.recv_expect(PacketType::Neighbors).await;
    let nodes = &reply.neighbors().expect("neighbors body").nodes;
    assert!(!nodes.is_empty() && nodes.len() <= kadium::MAX_NEIGHBORS);
    assert!(nodes.iter().any(|n| n.id == peer.node_id()));
}

#[tokio::test]
async fn invalid_and_self_datagrams_do_not_disrupt_service() {
    let service = start_bootnode(4).await;
    let addr = service_addr(&service);
    let peer = ScriptedPeer::bind().await;

    // Oversize datagram: one byte past the MTU.
    peer.socket
        .send_to(&vec![0u8; MAX_PACKET_SIZE + 1], addr)
        .await
        .expect("send oversize");

    // Garbage that fits the MTU.
    peer.socket
        .send_to(&[0xFF; 40], addr)
        .await
        .expect("send garbage");

    // A packet signed with the service's own key: sender id == local id.
    let own_keypair = Keypair::from_hex(&seed_key(4)).expect("seed key");
    let self_packet = Packet::create(
        PacketData::Ping(PingData {
            from: peer.endpoint(),
            to: service.local_endpoint().clone(),
            expiration: None,
        }),
        &own_keypair,
    )
    .expect("create");
    peer.socket
        .send_to(self_packet.bytes(), addr)
        .await
        .expect("send self packet");

    // None of it gets an answer...
    let mut buf = [0u8; MAX_PACKET_SIZE + 1];
    assert!(
        timeout(Duration::from_millis(500), peer.socket.recv_from(&mut buf))
            .await
            .is_err(),
        "invalid datagrams must not be answered"
    );
    assert!(service.table_peer(*service.node_id()).await.is_none());

    // ...and the very next valid PING is served.
    let ping = peer.send(peer.ping_to(&service), addr).await;
    let pong = peer.recv_expect(PacketType::Pong).await;
    assert_eq!(pong.pong().expect("pong body").ping_hash, *ping.hash());
}

#[tokio::test]
async fn stop_shuts_down_the_socket() {
    let service = start_bootnode(5).await;
    let addr = service_addr(&service);
    let peer = ScriptedPeer::bind().await;

    peer.send(peer.ping_to(&service), addr).await;
    peer.recv_expect(PacketType::Pong).await;

    service.stop().await;

    peer.send(peer.ping_to(&service), addr).await;
    let mut buf = [0u8; MAX_PACKET_SIZE + 1];
    assert!(
        timeout(Duration::from_secs(1), peer.socket.recv_from(&mut buf))
            .await
            .is_err(),
        "a stopped service must not answer"
    );

    // Stopping again is a no-op.
    service.stop().await;
}

#[tokio::test]
async fn nearest_peers_query_reflects_bonded_peers() {
    let service = start_bootnode(6).await;
    let peer_a = ScriptedPeer::bind().await;
    let peer_b = ScriptedPeer::bind().await;

    for peer in [&peer_a, &peer_b] {
        peer.send(peer.ping_to(&service), service_addr(&service)).await;
        peer.recv_expect(PacketType::Pong).await;
    }

    let nearest = service.nearest_peers(*service.node_id(), 16).await;
    assert_eq!(nearest.len(), 2);
    let ids: Vec<NodeId> = nearest.iter().map(|p| p.id).collect();
    assert!(ids.contains(&peer_a.node_id()));
    assert!(ids.contains(&peer_b.node_id()));
    assert!(nearest.iter().all(|p| p.status == PeerStatus::Bonded));
}
