//! Discovery cache: peers and announced services seen in the current session.
//!
//! The cache lets interest registered late be answered immediately from
//! earlier scan results. It is cleared when a fresh discovery session starts.

use std::collections::{HashMap, HashSet};

use crate::descriptor::ServiceId;
use crate::peer::{DiscoveredPeer, PeerId};

/// Peers and (peer, service) announcements seen so far.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    peers: HashMap<PeerId, DiscoveredPeer>,
    services: HashMap<ServiceId, HashSet<PeerId>>,
}

impl DiscoveryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a peer. Returns `true` if it was not known yet.
    pub fn record_peer(&mut self, peer: &PeerId) -> bool {
        match self.peers.get_mut(peer) {
            Some(known) => {
                known.touch();
                false
            }
            None => {
                self.peers
                    .insert(peer.clone(), DiscoveredPeer::new(peer.clone()));
                true
            }
        }
    }

    /// Remember that `peer` announced `identifier`.
    ///
    /// Returns `true` if this pair was not known yet. The peer itself is
    /// recorded as a side effect.
    pub fn record_service_on_peer(&mut self, peer: &PeerId, identifier: ServiceId) -> bool {
        self.record_peer(peer);
        self.services
            .entry(identifier)
            .or_default()
            .insert(peer.clone())
    }

    /// Peers that announced `identifier`, in a stable order.
    pub fn matches_for_identifier(&self, identifier: ServiceId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .services
            .get(&identifier)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Look up a known peer.
    pub fn peer(&self, peer: &PeerId) -> Option<&DiscoveredPeer> {
        self.peers.get(peer)
    }

    /// All peers seen this session.
    pub fn peers(&self) -> impl Iterator<Item = &DiscoveredPeer> {
        self.peers.values()
    }

    /// Number of peers seen this session.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.peers.clear();
        self.services.clear();
    }
}
