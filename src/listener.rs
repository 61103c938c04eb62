//! Application-facing callbacks.

use std::sync::Arc;

use crate::descriptor::ServiceDescriptor;
use crate::error::Error;
use crate::peer::{DiscoveredPeer, PeerId};
use crate::registry::Connection;

/// Receives discovery and connection events for one registered interest or
/// one advertised service.
///
/// Every method has a no-op default. Callbacks run on whichever thread
/// delivered the triggering event and must not block; they may call back
/// into the engine.
pub trait ServiceListener: Send + Sync + 'static {
    /// A new peer was found in the current discovery session.
    fn on_peer_discovered(&self, _peer: &DiscoveredPeer) {}

    /// `peer` offers `descriptor`.
    fn on_service_discovered(&self, _peer: &PeerId, _descriptor: &ServiceDescriptor) {}

    /// Whether the engine should try to connect to `descriptor` on `peer`.
    fn should_connect_to(&self, _peer: &PeerId, _descriptor: &ServiceDescriptor) -> bool {
        true
    }

    /// A connection was established, as client or as server.
    fn on_connection_established(&self, _connection: Arc<Connection>) {}

    /// A connection was closed or reported disconnected.
    fn on_connection_lost(&self, _connection: &Connection) {}

    /// A connection attempt or a listening endpoint failed.
    ///
    /// `reason` is always [`Error::ConnectionFailed`]. The engine does not
    /// retry on its own.
    fn on_connection_failed(&self, _descriptor: &ServiceDescriptor, _reason: &Error) {}
}
