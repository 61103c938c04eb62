//! Proximity service discovery and de-duplicated connection setup.
//!
//! A [`DiscoveryCoordinator`] correlates "peer found" and "service announced"
//! events from a radio scanner against the services an application registered
//! interest in, and launches at most one connection per (peer, service, role).
//! The radio and the byte transport are plugged in through the traits in
//! [`provider`].

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod descriptor;
pub mod error;
pub mod feed;
pub mod listener;
pub mod peer;
pub mod provider;
pub mod registry;

// Re-export key types
pub use cache::DiscoveryCache;
pub use config::EngineConfig;
pub use connector::{
    ClientConnector, Connector, ConnectorHandle, ConnectorId, ConnectorState, ServerConnector,
};
pub use coordinator::DiscoveryCoordinator;
pub use descriptor::{ServiceDescriptor, ServiceId};
pub use error::{Error, Result};
pub use feed::{DiscoveryEvent, EventFeed};
pub use listener::ServiceListener;
pub use peer::{DiscoveredPeer, PeerId};
pub use provider::{
    BoxChannel, BoxListener, ByteChannel, ListeningEndpoint, NoAdvertiser, PeerDiscoveryProvider,
    ServiceAdvertiser, TransportProvider,
};
pub use registry::{Connection, ConnectionKey, ConnectionRegistry, ConnectionState, Role};
