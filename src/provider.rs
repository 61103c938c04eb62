//! Interfaces to the radio and transport layers the engine drives.
//!
//! Implementations wrap a concrete stack (Bluetooth RFCOMM, Wi-Fi Direct,
//! an in-memory loopback for tests). The engine only ever talks to these
//! traits.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::descriptor::{ServiceDescriptor, ServiceId};
use crate::peer::PeerId;

/// A peer discovery backend (a radio scanner).
///
/// Results are pushed back into the engine through
/// [`DiscoveryCoordinator::on_peer_discovered`](crate::DiscoveryCoordinator::on_peer_discovered)
/// and [`DiscoveryCoordinator::on_service_announced`](crate::DiscoveryCoordinator::on_service_announced),
/// or through an attached [`EventFeed`](crate::EventFeed). For any one peer,
/// the peer must be reported before the services it announces.
pub trait PeerDiscoveryProvider: Send + Sync + 'static {
    /// Human-readable name for logging (e.g. "bluetooth", "wifi-direct").
    fn name(&self) -> &'static str;

    /// Whether the underlying radio exists and is usable.
    fn is_available(&self) -> bool {
        true
    }

    /// Begin (or restart) scanning for nearby peers.
    fn start_scanning(&self) -> io::Result<()>;

    /// Stop scanning.
    fn stop_scanning(&self);

    /// A service the engine wants to find.
    fn look_for(&self, _descriptor: &ServiceDescriptor) {}

    /// A service the engine no longer wants to find.
    fn stop_looking_for(&self, _descriptor: &ServiceDescriptor) {}

    /// Re-query the services of peers that were already found.
    fn refresh(&self) {}
}

/// Makes local services visible to remote scanners.
pub trait ServiceAdvertiser: Send + Sync + 'static {
    /// Publish a service record.
    fn begin_advertising(&self, descriptor: &ServiceDescriptor) -> io::Result<()>;

    /// Withdraw a service record.
    fn end_advertising(&self, descriptor: &ServiceDescriptor);

    /// Make the device itself discoverable for `duration`.
    fn make_discoverable(&self, _duration: Duration) -> io::Result<()> {
        Ok(())
    }
}

/// Advertiser for stacks where listening alone makes a service visible.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdvertiser;

impl ServiceAdvertiser for NoAdvertiser {
    fn begin_advertising(&self, _descriptor: &ServiceDescriptor) -> io::Result<()> {
        Ok(())
    }

    fn end_advertising(&self, _descriptor: &ServiceDescriptor) {}
}

/// A duplex byte channel to a remote peer.
#[async_trait]
pub trait ByteChannel: Send + Sync + 'static {
    /// Read into `buf`, returning the number of bytes read (0 at end of stream).
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf`.
    async fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Whether the transport still considers the channel connected.
    fn is_connected(&self) -> bool;

    /// Release the channel. Must tolerate being called more than once.
    fn close(&self) -> io::Result<()>;
}

/// Shared handle to a transport channel.
pub type BoxChannel = Arc<dyn ByteChannel>;

/// A listening endpoint for one service.
#[async_trait]
pub trait ListeningEndpoint: Send + Sync + 'static {
    /// Wait for the next inbound connection.
    ///
    /// Must be cancel-safe: dropping the future abandons the wait.
    async fn accept(&self) -> io::Result<(PeerId, BoxChannel)>;

    /// Release the endpoint. Must tolerate being called more than once.
    fn close(&self) -> io::Result<()>;
}

/// Shared handle to a listening endpoint.
pub type BoxListener = Arc<dyn ListeningEndpoint>;

/// Opens outbound channels and listening endpoints.
///
/// Both operations may take long. Dropping an in-flight future must abort
/// the attempt and release anything it had partially opened.
#[async_trait]
pub trait TransportProvider: Send + Sync + 'static {
    /// Connect to `identifier` on `peer`.
    async fn connect(&self, peer: &PeerId, identifier: ServiceId) -> io::Result<BoxChannel>;

    /// Open a listening endpoint for `descriptor`.
    async fn listen(&self, descriptor: &ServiceDescriptor) -> io::Result<BoxListener>;
}
