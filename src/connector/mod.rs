//! Connectors: background workers that realise connections.
//!
//! - [`ClientConnector`]: one outbound attempt to one peer, single-shot.
//! - [`ServerConnector`]: an accept loop serving one advertised service until cancelled.
//!
//! Each connector runs as its own task and reports back to the coordinator
//! over a channel. Cancellation drops whatever transport call is in flight.

mod client;
mod server;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::descriptor::ServiceDescriptor;
use crate::peer::PeerId;
use crate::provider::{BoxChannel, TransportProvider};
use crate::registry::Role;

pub use client::ClientConnector;
pub use server::ServerConnector;

/// Identifies one connector for the lifetime of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorId(u64);

impl ConnectorId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic source of connector ids.
#[derive(Debug, Default)]
pub(crate) struct ConnectorIds(AtomicU64);

impl ConnectorIds {
    pub(crate) fn next(&self) -> ConnectorId {
        ConnectorId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Lifecycle of a connector.
///
/// Server connectors stay in `Working` across accepted connections and only
/// leave it when cancelled or out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Created, task not yet running.
    Idle,
    /// Connecting (client) or accepting (server).
    Working,
    /// Client connected; the channel was handed to the coordinator.
    Connected,
    /// Gave up; the failure was reported.
    Failed,
    /// Stopped on request.
    Cancelled,
}

/// What a connector reports back.
pub(crate) enum ConnectorEvent {
    /// A client attempt succeeded.
    Connected {
        connector: ConnectorId,
        peer: PeerId,
        channel: BoxChannel,
    },
    /// A server accepted an inbound connection and keeps listening.
    Accepted {
        connector: ConnectorId,
        peer: PeerId,
        channel: BoxChannel,
    },
    /// The connector failed and has ended.
    Failed {
        connector: ConnectorId,
        reason: String,
    },
    /// The connector ended after cancellation.
    Stopped { connector: ConnectorId },
}

pub(crate) type EventSender = mpsc::UnboundedSender<ConnectorEvent>;

/// A unit of connection work, client or server side.
pub enum Connector {
    /// Outbound, single attempt.
    Client(ClientConnector),
    /// Inbound, accept loop.
    Server(ServerConnector),
}

impl Connector {
    /// Service the connector works for.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        match self {
            Connector::Client(c) => c.descriptor(),
            Connector::Server(s) => s.descriptor(),
        }
    }

    /// Local role of the connections this connector produces.
    pub fn role(&self) -> Role {
        match self {
            Connector::Client(_) => Role::Client,
            Connector::Server(_) => Role::Server,
        }
    }

    /// Start the connector on `runtime`.
    pub(crate) fn spawn(
        self,
        id: ConnectorId,
        runtime: &Handle,
        transport: Arc<dyn TransportProvider>,
        events: EventSender,
    ) -> ConnectorHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectorState::Idle);
        let role = self.role();
        let descriptor = self.descriptor().clone();

        let (peer, task) = match self {
            Connector::Client(client) => {
                let peer = Some(client.peer().clone());
                let task = runtime.spawn(client.run(id, transport, cancel_rx, state_tx, events));
                (peer, task)
            }
            Connector::Server(server) => {
                let task = runtime.spawn(server.run(id, transport, cancel_rx, state_tx, events));
                (None, task)
            }
        };

        ConnectorHandle {
            id,
            role,
            descriptor,
            peer,
            cancel: cancel_tx,
            state: state_rx,
            task,
        }
    }
}

/// Owner's view of a running connector.
///
/// Dropping the handle cancels the connector.
pub struct ConnectorHandle {
    id: ConnectorId,
    role: Role,
    descriptor: ServiceDescriptor,
    peer: Option<PeerId>,
    cancel: watch::Sender<bool>,
    state: watch::Receiver<ConnectorState>,
    task: JoinHandle<()>,
}

impl ConnectorHandle {
    /// Connector id.
    pub fn id(&self) -> ConnectorId {
        self.id
    }

    /// Client or server.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Service the connector works for.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Target peer of a client connector.
    pub fn peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    /// Latest state reported by the task.
    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    /// Whether the task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the connector to stop. Returns immediately; safe to call at any
    /// point and more than once.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}

impl fmt::Debug for ConnectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("service", &self.descriptor.identifier())
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves once cancellation was requested or the handle is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Whether cancellation was requested, without waiting.
pub(crate) fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}
