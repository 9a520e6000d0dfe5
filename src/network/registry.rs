//! Peer Registry
//!
//! Known nodes and what the last call to each of them said about its
//! liveness. Entries are never pruned: a node that vanishes mid-game stalls
//! that game until someone asks for a rematch.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::{debug, info};

use crate::game::state::PlayerId;

/// Shortest prefix a discovery sweep accepts (at most 4094 hosts).
pub const MIN_SWEEP_PREFIX: u8 = 20;

/// A known remote node.
#[derive(Debug, Clone)]
struct PeerEntry {
    /// When this node first heard of the peer
    first_seen: DateTime<Utc>,
    /// Last successful call in either direction
    last_seen: Option<DateTime<Utc>>,
    /// Outcome of the last call
    reachable: bool,
}

/// One row of `list_peers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PlayerId,
    /// This row is the local node
    pub is_self: bool,
    pub reachable: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Registry of known nodes.
#[derive(Debug)]
pub struct PeerRegistry {
    self_id: PlayerId,
    peers: BTreeMap<PlayerId, PeerEntry>,
}

impl PeerRegistry {
    /// Create a registry that only knows itself.
    pub fn new(self_id: PlayerId) -> Self {
        Self {
            self_id,
            peers: BTreeMap::new(),
        }
    }

    /// This node's identifier.
    pub fn self_id(&self) -> &PlayerId {
        &self.self_id
    }

    /// Record a peer. Idempotent: returns false if the peer was already
    /// known or is this node.
    pub fn register(&mut self, id: PlayerId) -> bool {
        if id == self.self_id || self.peers.contains_key(&id) {
            return false;
        }
        info!("Registered peer {}", id);
        self.peers.insert(id, PeerEntry {
            first_seen: Utc::now(),
            last_seen: None,
            reachable: true,
        });
        true
    }

    /// Whether a peer is known.
    pub fn contains(&self, id: &PlayerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Number of remote peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// No remote peers known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Every known node, this one first.
    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let me = PeerInfo {
            id: self.self_id.clone(),
            is_self: true,
            reachable: true,
            last_seen: Some(Utc::now()),
        };
        std::iter::once(me)
            .chain(self.peers.iter().map(|(id, entry)| PeerInfo {
                id: id.clone(),
                is_self: false,
                reachable: entry.reachable,
                last_seen: entry.last_seen,
            }))
            .collect()
    }

    /// Identifiers of every remote peer, reachable or not.
    pub fn remote_peers(&self) -> Vec<PlayerId> {
        self.peers.keys().cloned().collect()
    }

    /// A call to or from `id` succeeded.
    pub fn mark_reachable(&mut self, id: &PlayerId) {
        if let Some(entry) = self.peers.get_mut(id) {
            entry.reachable = true;
            entry.last_seen = Some(Utc::now());
        }
    }

    /// A call to `id` failed.
    pub fn mark_unreachable(&mut self, id: &PlayerId) {
        if let Some(entry) = self.peers.get_mut(id) {
            if entry.reachable {
                debug!("Peer {} unreachable (known since {})", id, entry.first_seen);
            }
            entry.reachable = false;
        }
    }
}

/// Every host address of `own`'s subnet, `own` excluded, as discovery
/// candidates on `port`. Prefixes shorter than `MIN_SWEEP_PREFIX` are
/// narrowed to it.
pub fn subnet_candidates(own: Ipv4Addr, prefix: u8, port: u16) -> Vec<PlayerId> {
    let prefix = prefix.clamp(MIN_SWEEP_PREFIX, 32);
    let mask = if prefix == 32 { u32::MAX } else { !(u32::MAX >> prefix) };
    let own_bits = u32::from(own);
    let network = own_bits & mask;
    let broadcast = network | !mask;

    // /31 and /32 have no network or broadcast address to skip
    let (first, last) = if prefix >= 31 {
        (network, broadcast)
    } else {
        (network + 1, broadcast - 1)
    };

    (first..=last)
        .filter(|&bits| bits != own_bits)
        .map(|bits| PlayerId::from_parts(&Ipv4Addr::from(bits).to_string(), port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(port: u16) -> PlayerId {
        PlayerId::from_parts("10.0.0.1", port)
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = PeerRegistry::new(id(5000));

        assert!(registry.register(id(5001)));
        for _ in 0..10 {
            assert!(!registry.register(id(5001)));
        }
        assert!(!registry.register(id(5000)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_marks_self() {
        let mut registry = PeerRegistry::new(id(5000));
        registry.register(id(5002));
        registry.register(id(5001));

        let peers = registry.list_peers();
        assert_eq!(peers.len(), 3);
        assert!(peers[0].is_self);
        assert_eq!(peers[0].id, id(5000));
        assert_eq!(peers.iter().filter(|p| p.is_self).count(), 1);
        assert_eq!(registry.remote_peers(), vec![id(5001), id(5002)]);
    }

    #[test]
    fn test_liveness_bookkeeping() {
        let mut registry = PeerRegistry::new(id(5000));
        registry.register(id(5001));

        registry.mark_unreachable(&id(5001));
        let row = registry.list_peers().into_iter().find(|p| p.id == id(5001)).unwrap();
        assert!(!row.reachable);
        assert!(row.last_seen.is_none());

        registry.mark_reachable(&id(5001));
        let row = registry.list_peers().into_iter().find(|p| p.id == id(5001)).unwrap();
        assert!(row.reachable);
        assert!(row.last_seen.is_some());

        // Never pruned
        registry.mark_unreachable(&id(5001));
        assert!(registry.contains(&id(5001)));
    }

    #[test]
    fn test_subnet_candidates() {
        let own: Ipv4Addr = "192.168.1.20".parse().unwrap();
        let candidates = subnet_candidates(own, 24, 5000);

        assert_eq!(candidates.len(), 253);
        assert_eq!(candidates[0].as_str(), "192.168.1.1:5000");
        assert_eq!(candidates[252].as_str(), "192.168.1.254:5000");
        assert!(!candidates.iter().any(|c| c.as_str() == "192.168.1.20:5000"));

        assert_eq!(subnet_candidates(own, 30, 1).len(), 2);
        assert!(subnet_candidates(own, 32, 1).is_empty());
        // Narrowed to /20
        assert_eq!(subnet_candidates(own, 8, 1).len(), 4093);
    }
}
