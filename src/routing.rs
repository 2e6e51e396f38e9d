//! # XOR-Metric Peer Table
//!
//! The routing table organizes peers by XOR distance from the local node id.
//!
//! ## Bucket Organization
//!
//! Bucket `i` holds peers whose log-distance from the local id is `i + 1`:
//! bucket 263 covers the far half of the keyspace, bucket 0 the single id
//! differing only in the lowest bit. Each bucket holds at most `k` peers,
//! oldest first, so the front entry is the least-recently-seen and therefore
//! the eviction candidate when the bucket is full.
//!
//! The table only reports outcomes; the replacement policy (bump a re-added
//! peer, evict the candidate without probing it) is the controller's call.

use std::collections::BinaryHeap;

use crate::identity::{distance_cmp, log_distance, NodeId, ID_BITS, NODE_ID_SIZE};
use crate::peer::DiscoveryPeer;

/// Bucket capacity used by the discovery service.
pub const TABLE_K: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Inserted into its bucket.
    Added,
    /// A peer with this id is already present; table unchanged.
    AlreadyExisted,
    /// The target bucket is full; table unchanged, candidate reported.
    BucketFull,
    /// The peer id equals the local id; never inserted.
    SelfId,
}

#[derive(Debug, Clone)]
pub struct AddResult {
    pub outcome: AddOutcome,
    /// Least-recently-seen peer of the full bucket, present iff the outcome
    /// is [`AddOutcome::BucketFull`].
    pub eviction_candidate: Option<DiscoveryPeer>,
}

impl From<AddOutcome> for AddResult {
    fn from(outcome: AddOutcome) -> Self {
        Self {
            outcome,
            eviction_candidate: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    peers: Vec<DiscoveryPeer>,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.peers.iter().position(|p| &p.id == id)
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.position(id) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct PeerTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl PeerTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        for _ in 0..ID_BITS {
            buckets.push(Bucket::default());
        }
        Self {
            local_id,
            k,
            buckets,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Bucket index for a peer id, `None` for the local id itself.
    fn bucket_of(&self, id: &NodeId) -> Option<usize> {
        match log_distance(&self.local_id, id) {
            0 => None,
            distance => Some(distance - 1),
        }
    }

    /// Try to insert a peer. Never mutates the table on `AlreadyExisted`,
    /// `BucketFull` or `SelfId`; the caller decides how to proceed.
    pub fn try_add(&mut self, peer: DiscoveryPeer) -> AddResult {
        let Some(idx) = self.bucket_of(&peer.id) else {
            return AddOutcome::SelfId.into();
        };

        let bucket = &mut self.buckets[idx];
        if bucket.position(&peer.id).is_some() {
            return AddOutcome::AlreadyExisted.into();
        }
        if bucket.peers.len() < self.k {
            bucket.peers.push(peer);
            return AddOutcome::Added.into();
        }

        AddResult {
            outcome: AddOutcome::BucketFull,
            eviction_candidate: bucket.peers.first().cloned(),
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&DiscoveryPeer> {
        let idx = self.bucket_of(id)?;
        let pos = self.buckets[idx].position(id)?;
        Some(&self.buckets[idx].peers[pos])
    }

    pub(crate) fn get_mut(&mut self, id: &NodeId) -> Option<&mut DiscoveryPeer> {
        let idx = self.bucket_of(id)?;
        let pos = self.buckets[idx].position(id)?;
        Some(&mut self.buckets[idx].peers[pos])
    }

    /// Remove a peer unconditionally. Returns whether it was present.
    pub fn evict(&mut self, id: &NodeId) -> bool {
        match self.bucket_of(id) {
            Some(idx) => self.buckets[idx].remove(id),
            None => false,
        }
    }

    /// Up to `k` peers sorted ascending by XOR distance to `target`, drawn
    /// from all buckets.
    pub fn nearest_peers(&self, target: &NodeId, k: usize) -> Vec<DiscoveryPeer> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(PartialEq, Eq)]
        struct DistPeer {
            dist: [u8; NODE_ID_SIZE],
            peer: DiscoveryPeer,
        }

        impl Ord for DistPeer {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistPeer {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        // Max-heap of size k: the root is the farthest of the current best,
        // so each closer candidate displaces it.
        let mut heap: BinaryHeap<DistPeer> = BinaryHeap::with_capacity(k + 1);
        for bucket in &self.buckets {
            for peer in &bucket.peers {
                let dist = peer.id.xor_distance(target);
                if heap.len() < k {
                    heap.push(DistPeer {
                        dist,
                        peer: peer.clone(),
                    });
                } else if let Some(farthest) = heap.peek() {
                    if distance_cmp(&dist, &farthest.dist) == std::cmp::Ordering::Less {
                        heap.push(DistPeer {
                            dist,
                            peer: peer.clone(),
                        });
                        heap.pop();
                    }
                }
            }
        }

        let mut result: Vec<DistPeer> = heap.into_iter().collect();
        result.sort_by(|a, b| distance_cmp(&a.dist, &b.dist));
        result.into_iter().map(|dp| dp.peer).collect()
    }

    /// Total peers across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.peers.is_empty())
    }
}
