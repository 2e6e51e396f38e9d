//! Discovery service configuration.
//!
//! The host application loads these values however it likes (they derive
//! `Deserialize`) and hands them to [`DiscoveryService::start`].
//!
//! [`DiscoveryService::start`]: crate::DiscoveryService::start

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::identity::{Keypair, NodeId};
use crate::peer::{DiscoveryPeer, Endpoint};

#[derive(Clone, Debug, Deserialize)]
pub struct DiscoveryConfig {
    /// Bootstrap nodes use the configured private key for a stable identity
    /// and do not bond outward on start.
    #[serde(default)]
    pub bootnode: bool,
    /// Hex-encoded SECP256K1 secret key; required when `bootnode` is set.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Host address the UDP socket binds to and the local endpoint
    /// advertises.
    pub node_ip: String,
    /// UDP port for discovery. 0 binds an ephemeral port; the advertised
    /// endpoint reflects the port actually bound.
    pub discovery_port: u16,
    /// TCP port advertised for the application layer, if any.
    #[serde(default)]
    pub libp2p_port: Option<u16>,
    /// Seed peers contacted on start when not a bootnode.
    #[serde(default)]
    pub bootstrap_peers: Vec<BootstrapPeer>,
}

/// One configured seed peer.
#[derive(Clone, Debug, Deserialize)]
pub struct BootstrapPeer {
    /// Hex-encoded node id (33-byte compressed public key).
    pub id: String,
    pub host: String,
    pub udp_port: u16,
    #[serde(default)]
    pub tcp_port: Option<u16>,
}

impl BootstrapPeer {
    pub fn new(id: &NodeId, host: impl Into<String>, udp_port: u16, tcp_port: Option<u16>) -> Self {
        Self {
            id: id.to_hex(),
            host: host.into(),
            udp_port,
            tcp_port,
        }
    }

    pub fn to_peer(&self) -> Result<DiscoveryPeer> {
        let id = NodeId::from_hex(&self.id)
            .with_context(|| format!("invalid bootstrap node id {:?}", self.id))?;
        Ok(DiscoveryPeer::new(
            id,
            Endpoint::new(self.host.clone(), self.udp_port, self.tcp_port),
        ))
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bootnode && self.private_key.is_none() {
            bail!("bootnode requires a configured private key");
        }
        for peer in &self.bootstrap_peers {
            peer.to_peer()?;
        }
        Ok(())
    }

    /// The identity this node runs with: bootnodes load the configured key,
    /// ordinary nodes generate a fresh one.
    pub(crate) fn keypair(&self) -> Result<Keypair> {
        if self.bootnode {
            let hex = self
                .private_key
                .as_deref()
                .context("bootnode requires a configured private key")?;
            Keypair::from_hex(hex).context("invalid configured private key")
        } else {
            Ok(Keypair::generate())
        }
    }

    pub(crate) fn local_endpoint(&self) -> Endpoint {
        Endpoint::new(self.node_ip.clone(), self.discovery_port, self.libp2p_port)
    }

    pub(crate) fn bootstrap_peer_records(&self) -> Result<Vec<DiscoveryPeer>> {
        self.bootstrap_peers.iter().map(|p| p.to_peer()).collect()
    }
}
