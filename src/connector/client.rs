use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{cancelled, is_cancelled, ConnectorEvent, ConnectorId, ConnectorState, EventSender};
use crate::descriptor::ServiceDescriptor;
use crate::peer::PeerId;
use crate::provider::{BoxChannel, TransportProvider};

/// A single outbound connection attempt.
///
/// Never retries: a failure is reported once and the connector ends.
#[derive(Debug, Clone)]
pub struct ClientConnector {
    peer: PeerId,
    descriptor: ServiceDescriptor,
    timeout: Option<Duration>,
}

impl ClientConnector {
    /// Attempt to reach `descriptor` on `peer`.
    pub fn new(peer: PeerId, descriptor: ServiceDescriptor) -> Self {
        Self {
            peer,
            descriptor,
            timeout: None,
        }
    }

    /// Bound the attempt. `None` leaves it to the transport.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Target peer.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Target service.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    async fn attempt(&self, transport: &dyn TransportProvider) -> io::Result<BoxChannel> {
        let identifier = self.descriptor.identifier();
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, transport.connect(&self.peer, identifier))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {limit:?}"),
                    )
                })?,
            None => transport.connect(&self.peer, identifier).await,
        }
    }

    pub(super) async fn run(
        self,
        id: ConnectorId,
        transport: Arc<dyn TransportProvider>,
        mut cancel: watch::Receiver<bool>,
        state: watch::Sender<ConnectorState>,
        events: EventSender,
    ) {
        state.send_replace(ConnectorState::Working);
        debug!(
            connector = %id,
            peer = %self.peer,
            service = %self.descriptor.identifier(),
            "Connecting"
        );

        let outcome = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            result = self.attempt(transport.as_ref()) => Some(result),
        };

        match outcome {
            None => {
                debug!(connector = %id, peer = %self.peer, "Connect cancelled");
                state.send_replace(ConnectorState::Cancelled);
                let _ = events.send(ConnectorEvent::Stopped { connector: id });
            }
            Some(Ok(channel)) if is_cancelled(&cancel) => {
                // cancelled after the transport already handed us a channel
                debug!(connector = %id, peer = %self.peer, "Connect cancelled; closing channel");
                close_quietly(&channel);
                state.send_replace(ConnectorState::Cancelled);
                let _ = events.send(ConnectorEvent::Stopped { connector: id });
            }
            Some(Ok(channel)) => {
                info!(
                    connector = %id,
                    peer = %self.peer,
                    service = %self.descriptor.identifier(),
                    "Connected"
                );
                state.send_replace(ConnectorState::Connected);
                let event = ConnectorEvent::Connected {
                    connector: id,
                    peer: self.peer.clone(),
                    channel,
                };
                if let Err(mpsc::error::SendError(ConnectorEvent::Connected { channel, .. })) =
                    events.send(event)
                {
                    close_quietly(&channel);
                }
            }
            Some(Err(error)) => {
                warn!(
                    connector = %id,
                    peer = %self.peer,
                    service = %self.descriptor.identifier(),
                    error = %error,
                    "Connect failed"
                );
                state.send_replace(ConnectorState::Failed);
                let _ = events.send(ConnectorEvent::Failed {
                    connector: id,
                    reason: error.to_string(),
                });
            }
        }
    }
}

fn close_quietly(channel: &BoxChannel) {
    if let Err(error) = channel.close() {
        debug!(error = %error, "Closing channel failed");
    }
}
