//! Peer handles as reported by a discovery provider.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Opaque handle of a remote device (for example a hardware address).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Arc<str>);

impl PeerId {
    /// Wrap a provider-specific peer address.
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(Arc::from(address.as_ref()))
    }

    /// The address as given by the provider.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PeerId {
    fn from(address: String) -> Self {
        Self(Arc::from(address))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// A peer seen during the current discovery session.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    id: PeerId,
    first_seen: Instant,
    last_seen: Instant,
}

impl DiscoveredPeer {
    pub(crate) fn new(id: PeerId) -> Self {
        let now = Instant::now();
        Self {
            id,
            first_seen: now,
            last_seen: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// The peer's handle.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// When the peer was first reported in this session.
    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    /// When the peer was last reported.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}
