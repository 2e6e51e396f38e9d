//! # Discovery Controller
//!
//! [`DiscoveryService`] is the public handle; the work happens in a single
//! actor task that owns the UDP socket, the peer table, the in-flight
//! interaction map and the subscriber registry. The actor multiplexes three
//! sources (handle commands, inbound datagrams, the periodic refresh tick),
//! so all state mutation is single-threaded and lock-free.
//!
//! ## Protocol
//!
//! Bonding is a signed PING/PONG handshake. A PONG only settles a bond if it
//! echoes the hash of our PING; a settled bootstrap bond immediately asks
//! the peer for the neighbors nearest our own id, which chains discovery
//! outward. Unanswered requests are retried with growing delays until the
//! interaction is settled or replaced.
//!
//! Retry timers never touch the actor state directly: they are detached
//! sleep tasks that post a retry command carrying the interaction's
//! generation. A stale generation means the interaction was replaced while
//! the timer slept, and the command is dropped.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::events::{PeerBondedCallback, PeerBondedEvent, SubscriptionId, Subscribers};
use crate::identity::{Keypair, NodeId};
use crate::interaction::{retry_delay, InteractionAction, PeerInteractionState};
use crate::packet::{
    FindNeighborsData, Neighbor, NeighborsData, Packet, PacketData, PacketType, PingData,
    PongData, MAX_PACKET_SIZE, PACKET_EXPIRATION_MS,
};
use crate::peer::{now_ms, DiscoveryPeer, Endpoint, PeerStatus};
use crate::routing::{AddOutcome, PeerTable, TABLE_K};

/// How often the refresh timer checks whether a table refresh is due.
const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum time between two table refresh rounds.
const TABLE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

enum Command {
    Subscribe(PeerBondedCallback, oneshot::Sender<SubscriptionId>),
    Unsubscribe(SubscriptionId, oneshot::Sender<bool>),
    NearestPeers(NodeId, usize, oneshot::Sender<Vec<DiscoveryPeer>>),
    GetPeer(NodeId, oneshot::Sender<Option<DiscoveryPeer>>),
    Retry {
        peer: NodeId,
        generation: u64,
        last_timeout_ms: u64,
    },
    Stop(oneshot::Sender<()>),
}

/// Handle to a running discovery service.
pub struct DiscoveryService {
    cmd_tx: mpsc::Sender<Command>,
    local: DiscoveryPeer,
}

impl DiscoveryService {
    /// Resolve the identity, bind the UDP socket and spawn the controller.
    /// When not a bootnode, bonding with the configured bootstrap peers
    /// starts immediately.
    pub async fn start(config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;

        let keypair = config.keypair()?;
        let node_id = keypair.node_id();

        let ip: IpAddr = config
            .node_ip
            .parse()
            .with_context(|| format!("invalid node_ip {:?}", config.node_ip))?;
        let socket = UdpSocket::bind(SocketAddr::new(ip, config.discovery_port))
            .await
            .context("failed to bind discovery socket")?;
        let local_addr = socket
            .local_addr()
            .context("failed to read bound socket address")?;

        let mut endpoint = config.local_endpoint();
        endpoint.udp_port = local_addr.port();
        let local = DiscoveryPeer::new(node_id, endpoint);

        let bootstrap_peers = if config.bootnode {
            Vec::new()
        } else {
            config.bootstrap_peer_records()?
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let actor = DiscoveryActor {
            keypair,
            local: local.clone(),
            socket,
            table: PeerTable::new(node_id, TABLE_K),
            interactions: HashMap::new(),
            subscribers: Subscribers::new(),
            bootstrap_peers,
            last_refresh: None,
            next_generation: 0,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        info!(node = %local.id, addr = %local_addr, "discovery service started");
        Ok(Self { cmd_tx, local })
    }

    pub fn local_peer(&self) -> &DiscoveryPeer {
        &self.local
    }

    pub fn node_id(&self) -> &NodeId {
        &self.local.id
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local.endpoint
    }

    /// Register a callback for bonded peers. Returns `None` if the service
    /// has stopped.
    pub async fn subscribe_peer_bonded(
        &self,
        callback: PeerBondedCallback,
    ) -> Option<SubscriptionId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(callback, tx))
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Remove a subscription. Returns whether it existed.
    pub async fn unsubscribe_peer_bonded(&self, id: SubscriptionId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Unsubscribe(id, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// The `k` known peers nearest `target`, sorted ascending by distance.
    pub async fn nearest_peers(&self, target: NodeId, k: usize) -> Vec<DiscoveryPeer> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::NearestPeers(target, k, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// The table's current record for a peer, if present.
    pub async fn table_peer(&self, id: NodeId) -> Option<DiscoveryPeer> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetPeer(id, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Shut the service down: all retry timers are cancelled, the
    /// interaction map is cleared and the socket is closed. Completes once
    /// the controller has acknowledged.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct DiscoveryActor {
    keypair: Keypair,
    local: DiscoveryPeer,
    socket: UdpSocket,
    table: PeerTable,
    interactions: HashMap<NodeId, PeerInteractionState>,
    subscribers: Subscribers,
    bootstrap_peers: Vec<DiscoveryPeer>,
    last_refresh: Option<Instant>,
    next_generation: u64,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl DiscoveryActor {
    async fn run(mut self) {
        self.bootstrap().await;

        let period = REFRESH_CHECK_INTERVAL.min(TABLE_REFRESH_INTERVAL);
        let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
        // One byte over the MTU so an oversize datagram is still seen as
        // oversize instead of silently truncated to a valid length.
        let mut buf = [0u8; MAX_PACKET_SIZE + 1];

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => debug!(error = %e, "udp receive error"),
                    }
                }
                _ = refresh.tick() => self.refresh_if_required().await,
            }
        }

        self.shutdown();
    }

    /// Seed the table with the configured bootstrap peers and bond with
    /// each one that was actually inserted.
    async fn bootstrap(&mut self) {
        let peers = std::mem::take(&mut self.bootstrap_peers);
        for peer in peers {
            let added = matches!(self.table.try_add(peer.clone()).outcome, AddOutcome::Added);
            if added {
                debug!(peer = %peer.id, endpoint = %peer.endpoint, "bonding with bootstrap peer");
                self.bond(peer, true).await;
            }
        }
    }

    /// Returns `true` when the actor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Subscribe(callback, reply) => {
                let _ = reply.send(self.subscribers.subscribe(callback));
            }
            Command::Unsubscribe(id, reply) => {
                let _ = reply.send(self.subscribers.unsubscribe(id));
            }
            Command::NearestPeers(target, k, reply) => {
                let _ = reply.send(self.table.nearest_peers(&target, k));
            }
            Command::GetPeer(id, reply) => {
                let _ = reply.send(self.table.get(&id).cloned());
            }
            Command::Retry {
                peer,
                generation,
                last_timeout_ms,
            } => {
                // Only the interaction that scheduled this timer may retry;
                // a replacement bumped the generation.
                let current = self.interactions.get(&peer).map(|s| s.generation);
                if current == Some(generation) {
                    self.execute_interaction(peer, last_timeout_ms).await;
                }
            }
            Command::Stop(reply) => {
                self.shutdown();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn shutdown(&mut self) {
        for (_, mut state) in self.interactions.drain() {
            state.cancel_timer();
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%from, error = %e, "discarding invalid discovery packet");
                return;
            }
        };

        // The sender's UDP coordinates come from the datagram source; only
        // a PING also advertises a TCP port.
        let tcp_port = packet.ping().and_then(|ping| ping.from.tcp_port);
        let sender = DiscoveryPeer::new(
            *packet.node_id(),
            Endpoint::new(from.ip().to_string(), from.port(), tcp_port),
        );
        self.on_message(packet, sender).await;
    }

    async fn on_message(&mut self, packet: Packet, sender: DiscoveryPeer) {
        if sender.id == self.local.id {
            debug!("dropping discovery packet from self");
            return;
        }

        // Prefer the table's record so status and timestamps carry over.
        let peer = self.table.get(&sender.id).cloned().unwrap_or(sender);
        debug!(kind = ?packet.kind(), peer = %peer.id, "received discovery packet");

        match packet.kind() {
            PacketType::Ping => {
                if self.add_to_table(peer.clone()) {
                    if let Some(ping) = packet.ping() {
                        let data = PacketData::Pong(PongData {
                            to: ping.from.clone(),
                            ping_hash: *packet.hash(),
                            expiration: Some(now_ms() + PACKET_EXPIRATION_MS),
                        });
                        self.send_packet(&peer, data).await;
                    }
                }
            }
            PacketType::Pong => {
                if let Some(state) = self.match_interaction(&packet) {
                    self.add_to_table(peer.clone());
                    if state.bootstrap {
                        // Bootstrap bond settled: ask the peer for the
                        // neighbors nearest ourselves.
                        let target = self.local.id;
                        self.find_nodes(peer, target).await;
                    }
                }
            }
            PacketType::Neighbors => {
                if self.match_interaction(&packet).is_some() {
                    let nodes = packet
                        .neighbors()
                        .map(|data| data.nodes.clone())
                        .unwrap_or_default();
                    for neighbor in nodes {
                        if neighbor.id == self.local.id || self.table.get(&neighbor.id).is_some() {
                            continue;
                        }
                        debug!(peer = %neighbor.id, "bonding with discovered neighbor");
                        self.bond(DiscoveryPeer::new(neighbor.id, neighbor.endpoint), false)
                            .await;
                    }
                }
            }
            PacketType::FindNeighbors => {
                if let Some(find) = packet.find_neighbors() {
                    let nodes = self
                        .table
                        .nearest_peers(&find.target, TABLE_K)
                        .into_iter()
                        .map(|p| Neighbor {
                            id: p.id,
                            endpoint: p.endpoint,
                        })
                        .collect();
                    let data = PacketData::Neighbors(NeighborsData { nodes });
                    self.send_packet(&peer, data).await;
                }
            }
        }
    }

    /// Start (or restart) the bonding handshake with a peer.
    async fn bond(&mut self, mut peer: DiscoveryPeer, bootstrap: bool) {
        peer.first_discovered = now_ms();
        peer.status = PeerStatus::Bonding;
        if let Some(entry) = self.table.get_mut(&peer.id) {
            entry.first_discovered = peer.first_discovered;
            entry.status = PeerStatus::Bonding;
        }

        let generation = self.next_generation();
        let state = PeerInteractionState::bond(peer, bootstrap, generation);
        self.dispatch_interaction(state).await;
    }

    /// Ask a peer for the neighbors nearest `target`.
    async fn find_nodes(&mut self, peer: DiscoveryPeer, target: NodeId) {
        let generation = self.next_generation();
        let state = PeerInteractionState::find_neighbors(peer, target, generation);
        self.dispatch_interaction(state).await;
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Install an interaction for its peer, cancelling any previous one,
    /// and perform the first send.
    async fn dispatch_interaction(&mut self, state: PeerInteractionState) {
        let id = state.peer.id;
        if let Some(mut previous) = self.interactions.insert(id, state) {
            previous.cancel_timer();
        }
        self.execute_interaction(id, 0).await;
    }

    /// Send the interaction's request and, if retryable, schedule the next
    /// attempt. `last_timeout_ms` is 0 on the first send.
    async fn execute_interaction(&mut self, id: NodeId, last_timeout_ms: u64) {
        let Some(state) = self.interactions.get(&id) else {
            return;
        };
        let peer = state.peer.clone();
        let data = match &state.action {
            InteractionAction::Ping => PacketData::Ping(PingData {
                from: self.local.endpoint.clone(),
                to: peer.endpoint.clone(),
                expiration: Some(now_ms() + PACKET_EXPIRATION_MS),
            }),
            InteractionAction::FindNeighbors { target } => {
                PacketData::FindNeighbors(FindNeighborsData {
                    target: *target,
                    expiration: Some(now_ms() + PACKET_EXPIRATION_MS),
                })
            }
        };

        let sent = self.send_packet(&peer, data).await;

        let Some(state) = self.interactions.get_mut(&id) else {
            return;
        };
        if let Some(packet) = sent {
            // Correlation is pinned to the first PING's hash; see
            // `PeerInteractionState::pin_ping_hash`.
            state.pin_ping_hash(*packet.hash());
        }
        if state.retryable {
            let delay = retry_delay(last_timeout_ms);
            let generation = state.generation;
            let cmd_tx = self.cmd_tx.clone();
            state.cancel_timer();
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = cmd_tx
                    .send(Command::Retry {
                        peer: id,
                        generation,
                        last_timeout_ms: delay,
                    })
                    .await;
            }));
        }
    }

    /// Look up the interaction for the packet's sender and settle it if the
    /// packet satisfies type and filter. Unmatched packets leave the
    /// registry untouched.
    fn match_interaction(&mut self, packet: &Packet) -> Option<PeerInteractionState> {
        let state = self.interactions.get(packet.node_id())?;
        if !state.matches(packet) {
            return None;
        }
        let mut state = self.interactions.remove(packet.node_id())?;
        state.cancel_timer();
        Some(state)
    }

    /// Sign, frame and send a packet to a peer. Returns the packet even when
    /// the socket send fails (the retry timer owns re-sending) and `None`
    /// only when the packet could not be built.
    async fn send_packet(&mut self, peer: &DiscoveryPeer, data: PacketData) -> Option<Packet> {
        let kind = data.packet_type();
        let packet = match Packet::create(data, &self.keypair) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(peer = %peer.id, kind = ?kind, error = %e, "failed to encode discovery packet");
                return None;
            }
        };

        match peer.endpoint.udp_socket_addr() {
            Ok(addr) => match self.socket.send_to(packet.bytes(), addr).await {
                Ok(_) => {
                    if let Some(entry) = self.table.get_mut(&peer.id) {
                        entry.last_contacted = now_ms();
                    }
                }
                Err(e) => {
                    warn!(peer = %peer.id, kind = ?kind, error = %e, "sending discovery packet failed");
                }
            },
            Err(e) => {
                warn!(peer = %peer.id, endpoint = %peer.endpoint, error = %e, "peer endpoint is unusable");
            }
        }

        Some(packet)
    }

    /// Table admission policy on PING and matched PONG. Bumps an existing
    /// entry to most-recently-seen, replaces the least-recently-seen entry
    /// of a full bucket, and emits `PeerBonded` on the first transition to
    /// bonded. Returns `false` only for our own id.
    fn add_to_table(&mut self, mut peer: DiscoveryPeer) -> bool {
        let result = self.table.try_add(peer.clone());
        if matches!(result.outcome, AddOutcome::SelfId) {
            return false;
        }

        let now = now_ms();
        if peer.first_discovered == 0 {
            peer.first_discovered = now;
        }
        peer.last_seen = now;

        if peer.status != PeerStatus::Bonded {
            peer.status = PeerStatus::Bonded;
            info!(peer = %peer.id, endpoint = %peer.endpoint, "peer bonded");
            self.subscribers.notify(PeerBondedEvent {
                peer: peer.clone(),
                timestamp: now,
            });
        }

        match result.outcome {
            AddOutcome::Added => {
                // try_add stored the pre-update copy; sync the entry.
                if let Some(entry) = self.table.get_mut(&peer.id) {
                    *entry = peer;
                }
            }
            AddOutcome::AlreadyExisted => {
                self.table.evict(&peer.id);
                let _ = self.table.try_add(peer);
            }
            AddOutcome::BucketFull => {
                if let Some(candidate) = result.eviction_candidate {
                    debug!(evicted = %candidate.id, added = %peer.id, "replacing least-recently-seen peer");
                    self.table.evict(&candidate.id);
                }
                let _ = self.table.try_add(peer);
            }
            AddOutcome::SelfId => {}
        }

        true
    }

    /// Refresh the table when the last round is old enough: probe the 16
    /// nearest known peers for neighbors of a random target.
    async fn refresh_if_required(&mut self) {
        let due = self
            .last_refresh
            .map_or(true, |at| at.elapsed() >= TABLE_REFRESH_INTERVAL);
        if !due {
            return;
        }

        debug!("peer table refresh triggered by timer expiry");
        let target = NodeId::random();
        for peer in self.table.nearest_peers(&target, TABLE_K) {
            self.find_nodes(peer, target).await;
        }
        self.last_refresh = Some(Instant::now());
    }
}
