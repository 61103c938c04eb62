//! Stream-based delivery of discovery events.
//!
//! Providers that produce events on their own threads can push them into an
//! [`EventFeed`] instead of calling the coordinator directly; the coordinator
//! drains attached feeds on its runtime.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::peer::PeerId;

/// An event produced by a discovery provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer came into range.
    PeerFound(PeerId),
    /// A peer announced a service identifier, as raw bytes off the wire.
    ServiceAnnounced {
        /// Announcing peer.
        peer: PeerId,
        /// Identifier bytes as received.
        identifier: Vec<u8>,
    },
}

/// Sending half of an [`EventFeed`].
pub type EventSender = mpsc::UnboundedSender<DiscoveryEvent>;

/// Channel-backed stream of [`DiscoveryEvent`]s.
pub struct EventFeed {
    receiver: UnboundedReceiverStream<DiscoveryEvent>,
}

impl EventFeed {
    /// Create a feed and the sender a provider should push events into.
    pub fn new() -> (Self, EventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Self {
            receiver: UnboundedReceiverStream::new(rx),
        };
        (feed, tx)
    }
}

impl Stream for EventFeed {
    type Item = DiscoveryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}
