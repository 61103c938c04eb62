//! Error types for proximity-discovery.

use crate::descriptor::ServiceId;
use crate::peer::PeerId;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No discovery provider (radio) is available on this device.
    #[error("peer discovery is unavailable")]
    DiscoveryUnavailable,

    /// The engine has not been started, or has been shut down.
    #[error("engine is not running")]
    NotRunning,

    /// A connection could not be established or an endpoint could not be served.
    #[error("connection to service {service} failed{}: {reason}", peer_suffix(.peer))]
    ConnectionFailed {
        /// Identifier of the service the attempt was made for.
        service: ServiceId,
        /// Remote peer, when the failure concerns a single peer.
        peer: Option<PeerId>,
        /// Transport-level cause, rendered as text.
        reason: String,
    },

    /// A connection (or attempt) for the same key already exists.
    ///
    /// Resolved internally by the reservation check and never handed to a listener.
    #[error("connection to service {service} on {peer} already exists or is in flight")]
    DuplicateConnectionAttempt {
        /// Remote peer.
        peer: PeerId,
        /// Service identifier.
        service: ServiceId,
    },

    /// The identifier of a descriptor was already computed or overridden.
    #[error("service identifier {identifier} is already fixed")]
    IdentityAlreadyFixed {
        /// The identifier that is in effect.
        identifier: ServiceId,
    },

    /// A server connector is already running for the service.
    #[error("service {service} is already being advertised")]
    AlreadyAdvertising {
        /// Service identifier.
        service: ServiceId,
    },

    /// A raw identifier did not have the expected 16 bytes.
    #[error("invalid service identifier length: {len} bytes")]
    InvalidIdentifier {
        /// Length of the rejected input.
        len: usize,
    },

    /// I/O error reported by a provider.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a connection failure for a service.
    pub fn connection_failed<S: Into<String>>(
        service: ServiceId,
        peer: Option<PeerId>,
        reason: S,
    ) -> Self {
        Self::ConnectionFailed {
            service,
            peer,
            reason: reason.into(),
        }
    }
}

fn peer_suffix(peer: &Option<PeerId>) -> String {
    match peer {
        Some(peer) => format!(" on {peer}"),
        None => String::new(),
    }
}
