//! The discovery and connection engine.
//!
//! [`DiscoveryCoordinator`] owns the interest set, the discovery cache and the
//! active connectors behind one lock, consumes provider events, launches and
//! cancels connectors, and notifies listeners. Listener callbacks are never
//! invoked while a lock is held: notifications are collected under the lock
//! and dispatched after it is released.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::cache::DiscoveryCache;
use crate::config::EngineConfig;
use crate::connector::{
    ClientConnector, Connector, ConnectorEvent, ConnectorHandle, ConnectorId, ConnectorIds,
    ConnectorState, EventSender, ServerConnector,
};
use crate::descriptor::{ServiceDescriptor, ServiceId};
use crate::error::{Error, Result};
use crate::feed::DiscoveryEvent;
use crate::listener::ServiceListener;
use crate::peer::{DiscoveredPeer, PeerId};
use crate::provider::{BoxChannel, PeerDiscoveryProvider, ServiceAdvertiser, TransportProvider};
use crate::registry::{Connection, ConnectionKey, ConnectionRegistry, RegisteredConnection, Role};

/// Discovers peers, matches their services against registered interests and
/// keeps at most one connection per (peer, service, role).
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct DiscoveryCoordinator {
    shared: Arc<Shared>,
}

struct Shared {
    config: EngineConfig,
    discovery: Arc<dyn PeerDiscoveryProvider>,
    advertiser: Arc<dyn ServiceAdvertiser>,
    transport: Arc<dyn TransportProvider>,
    registry: ConnectionRegistry,
    ids: ConnectorIds,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    runtime: Option<Runtime>,
    interests: HashMap<ServiceId, Interest>,
    cache: DiscoveryCache,
    connectors: HashMap<ConnectorId, ActiveConnector>,
}

/// Present while the engine is running.
struct Runtime {
    handle: Handle,
    events: EventSender,
    feeds: Vec<JoinHandle<()>>,
}

struct Interest {
    descriptor: ServiceDescriptor,
    listener: Weak<dyn ServiceListener>,
}

struct ActiveConnector {
    handle: ConnectorHandle,
    listener: Weak<dyn ServiceListener>,
    // advertised services keep their listener alive while served
    _retained: Option<Arc<dyn ServiceListener>>,
}

impl ActiveConnector {
    fn is_server_for(&self, identifier: ServiceId) -> bool {
        self.handle.role() == Role::Server && self.handle.descriptor().identifier() == identifier
    }

    fn is_client_for(&self, identifier: ServiceId) -> bool {
        self.handle.role() == Role::Client && self.handle.descriptor().identifier() == identifier
    }

    fn client_key(&self) -> Option<ConnectionKey> {
        self.handle.peer().map(|peer| {
            ConnectionKey::new(peer.clone(), self.handle.descriptor().identifier(), Role::Client)
        })
    }
}

/// A listener call, collected under the lock and made after it is released.
enum Notice {
    PeerDiscovered(Arc<dyn ServiceListener>, DiscoveredPeer),
    ServiceDiscovered(Arc<dyn ServiceListener>, PeerId, ServiceDescriptor),
    Established(Arc<dyn ServiceListener>, Arc<Connection>),
    Lost(Arc<dyn ServiceListener>, Arc<Connection>),
    Failed(Arc<dyn ServiceListener>, ServiceDescriptor, Error),
}

fn dispatch(notices: Vec<Notice>) {
    for notice in notices {
        match notice {
            Notice::PeerDiscovered(listener, peer) => listener.on_peer_discovered(&peer),
            Notice::ServiceDiscovered(listener, peer, descriptor) => {
                listener.on_service_discovered(&peer, &descriptor)
            }
            Notice::Established(listener, connection) => {
                listener.on_connection_established(connection)
            }
            Notice::Lost(listener, connection) => listener.on_connection_lost(&connection),
            Notice::Failed(listener, descriptor, error) => {
                listener.on_connection_failed(&descriptor, &error)
            }
        }
    }
}

fn lost_notices(entries: Vec<RegisteredConnection>) -> Vec<Notice> {
    entries
        .into_iter()
        .filter_map(|entry| match entry.listener.upgrade() {
            Some(listener) => Some(Notice::Lost(listener, entry.connection)),
            None => {
                debug!(connection = %entry.connection, "Listener gone; dropping loss notice");
                None
            }
        })
        .collect()
}

/// An interest taken out of the interest set, with its attempts retired.
struct Withdrawn {
    descriptor: Option<ServiceDescriptor>,
    cancelled: usize,
    now_empty: bool,
}

fn close_channel(channel: &BoxChannel) {
    if let Err(error) = channel.close() {
        debug!(error = %error, "Closing channel failed");
    }
}

impl DiscoveryCoordinator {
    /// Create a stopped engine over the given providers.
    pub fn new(
        config: EngineConfig,
        discovery: Arc<dyn PeerDiscoveryProvider>,
        advertiser: Arc<dyn ServiceAdvertiser>,
        transport: Arc<dyn TransportProvider>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                discovery,
                advertiser,
                transport,
                registry: ConnectionRegistry::new(),
                ids: ConnectorIds::default(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn upgrade(shared: &Weak<Shared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Start the engine on the current tokio runtime.
    ///
    /// Calling `start` on a running engine does nothing.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        self.start_on(handle)
    }

    /// Start the engine, spawning its tasks on `handle`.
    pub fn start_on(&self, handle: Handle) -> Result<()> {
        if !self.shared.discovery.is_available() {
            warn!(provider = self.shared.discovery.name(), "Discovery provider unavailable");
            return Err(Error::DiscoveryUnavailable);
        }

        let mut state = self.shared.state.lock();
        if state.runtime.is_some() {
            debug!("Engine already running");
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        handle.spawn(drive(
            Arc::downgrade(&self.shared),
            events_rx,
            self.shared.config.prune_interval,
        ));
        state.runtime = Some(Runtime {
            handle,
            events: events_tx,
            feeds: Vec::new(),
        });

        info!(provider = self.shared.discovery.name(), "Engine started");
        Ok(())
    }

    /// Whether [`start`](Self::start) was called and [`shutdown`](Self::shutdown) was not.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().runtime.is_some()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    /// Begin a fresh discovery session: forget every cached peer and service
    /// and (re)start scanning.
    pub fn start_discovery(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.runtime.is_none() {
                return Err(Error::NotRunning);
            }
            state.cache.reset();
        }
        debug!(provider = self.shared.discovery.name(), "Starting discovery session");
        self.shared.discovery.start_scanning()?;
        Ok(())
    }

    /// Stop scanning. Cached results are kept for replay.
    pub fn stop_discovery(&self) -> Result<()> {
        self.ensure_running()?;
        self.shared.discovery.stop_scanning();
        Ok(())
    }

    /// Ask the provider to re-query the services of peers it already found.
    pub fn refresh_nearby_services(&self) -> Result<()> {
        self.ensure_running()?;
        debug!("Refreshing nearby services");
        self.shared.discovery.refresh();
        Ok(())
    }

    /// Make this device discoverable for the configured duration.
    pub fn start_discoverable(&self) -> Result<()> {
        self.ensure_running()?;
        let duration = self.shared.config.discoverable_duration();
        debug!(?duration, "Making device discoverable");
        self.shared.advertiser.make_discoverable(duration)?;
        Ok(())
    }

    /// Register interest in `descriptor`.
    ///
    /// Peers that already announced the service in this session are replayed
    /// to `listener` before this call returns. Registering the same
    /// descriptor again is a no-op while the first listener is alive.
    ///
    /// The engine holds `listener` weakly; dropping it retires the interest.
    pub fn register_interest(
        &self,
        descriptor: ServiceDescriptor,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<()> {
        let identifier = descriptor.identifier();
        let check_reversed = self.shared.config.check_reversed_identifier_bytes;

        let (cached, first) = {
            let mut state = self.shared.state.lock();
            if state.runtime.is_none() {
                return Err(Error::NotRunning);
            }
            if let Some(existing) = state.interests.get(&identifier) {
                if existing.listener.strong_count() > 0 {
                    debug!(service = %identifier, "Interest already registered");
                    return Ok(());
                }
                debug!(service = %identifier, "Replacing interest with dropped listener");
            }

            let first = state.interests.is_empty();
            state.interests.insert(
                identifier,
                Interest {
                    descriptor: descriptor.clone(),
                    listener: Arc::downgrade(&listener),
                },
            );

            let mut cached = state.cache.matches_for_identifier(identifier);
            let reversed = descriptor.reversed_identifier();
            if check_reversed && reversed != identifier {
                cached.extend(state.cache.matches_for_identifier(reversed));
                cached.sort();
                cached.dedup();
            }
            (cached, first)
        };

        info!(service = %identifier, descriptor = %descriptor, replay = cached.len(), "Registered interest");

        for peer in cached {
            self.on_match(&peer, &descriptor, &listener, true);
        }

        self.shared.discovery.look_for(&descriptor);
        if first {
            self.shared.discovery.start_scanning()?;
        }
        Ok(())
    }

    /// Withdraw interest in `descriptor`.
    ///
    /// In-flight outbound attempts for it are cancelled; open connections are
    /// left alone. Scanning stops once no interest remains.
    pub fn unregister_interest(&self, descriptor: &ServiceDescriptor) {
        let identifier = descriptor.identifier();
        let withdrawn = {
            let mut state = self.shared.state.lock();
            self.withdraw(&mut state, identifier)
        };

        if withdrawn.descriptor.is_none() {
            debug!(service = %identifier, "No interest to unregister");
            return;
        }
        info!(service = %identifier, cancelled = withdrawn.cancelled, "Unregistered interest");
        self.stop_looking_for(descriptor, withdrawn.now_empty);
    }

    /// Remove the interest in `identifier` and retire its outbound attempts.
    fn withdraw(&self, state: &mut State, identifier: ServiceId) -> Withdrawn {
        let descriptor = state
            .interests
            .remove(&identifier)
            .map(|interest| interest.descriptor);
        let ids: Vec<ConnectorId> = state
            .connectors
            .iter()
            .filter(|(_, active)| active.is_client_for(identifier))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(active) = state.connectors.remove(id) {
                self.retire(*id, active);
            }
        }
        Withdrawn {
            descriptor,
            cancelled: ids.len(),
            now_empty: state.interests.is_empty(),
        }
    }

    /// Tell the provider to drop a withdrawn interest. Must run unlocked.
    fn stop_looking_for(&self, descriptor: &ServiceDescriptor, now_empty: bool) {
        self.shared.discovery.stop_looking_for(descriptor);
        if now_empty {
            debug!("No interests left; stopping scan");
            self.shared.discovery.stop_scanning();
        }
    }

    /// Snapshot of the registered interests.
    pub fn interests(&self) -> Vec<ServiceDescriptor> {
        self.shared
            .state
            .lock()
            .interests
            .values()
            .map(|interest| interest.descriptor.clone())
            .collect()
    }

    /// Serve `descriptor`: start a server connector accepting inbound
    /// connections and publish the service.
    pub fn advertise_service(
        &self,
        descriptor: ServiceDescriptor,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<()> {
        let identifier = descriptor.identifier();
        let id = {
            let mut state = self.shared.state.lock();
            let (handle, events) = match &state.runtime {
                Some(runtime) => (runtime.handle.clone(), runtime.events.clone()),
                None => return Err(Error::NotRunning),
            };
            if state
                .connectors
                .values()
                .any(|active| active.is_server_for(identifier))
            {
                return Err(Error::AlreadyAdvertising {
                    service: identifier,
                });
            }

            let id = self.shared.ids.next();
            let connector = Connector::Server(
                ServerConnector::new(descriptor.clone())
                    .with_retry_budget(self.shared.config.accept_retry_budget)
                    .with_retry_jitter(self.shared.config.accept_retry_jitter),
            );
            let handle = connector.spawn(id, &handle, Arc::clone(&self.shared.transport), events);
            state.connectors.insert(
                id,
                ActiveConnector {
                    handle,
                    listener: Arc::downgrade(&listener),
                    _retained: Some(listener),
                },
            );
            id
        };

        if let Err(error) = self.shared.advertiser.begin_advertising(&descriptor) {
            warn!(service = %identifier, error = %error, "Advertising failed; stopping server");
            if let Some(active) = self.shared.state.lock().connectors.remove(&id) {
                self.retire(id, active);
            }
            return Err(error.into());
        }

        info!(service = %identifier, connector = %id, "Advertising service");
        Ok(())
    }

    /// Stop serving `descriptor`. Accepted connections stay open.
    pub fn stop_advertising(&self, descriptor: &ServiceDescriptor) {
        let identifier = descriptor.identifier();
        let stopped = {
            let mut state = self.shared.state.lock();
            let ids: Vec<ConnectorId> = state
                .connectors
                .iter()
                .filter(|(_, active)| active.is_server_for(identifier))
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                if let Some(active) = state.connectors.remove(id) {
                    self.retire(*id, active);
                }
            }
            !ids.is_empty()
        };

        if stopped {
            info!(service = %identifier, "Stopped advertising");
            self.shared.advertiser.end_advertising(descriptor);
        } else {
            debug!(service = %identifier, "Service was not advertised");
        }
    }

    /// Provider callback: `peer` came into range.
    pub fn on_peer_discovered(&self, peer: PeerId) {
        let notices = {
            let mut state = self.shared.state.lock();
            if state.runtime.is_none() {
                trace!(peer = %peer, "Engine not running; ignoring peer");
                return;
            }
            if !state.cache.record_peer(&peer) {
                trace!(peer = %peer, "Peer already known");
                return;
            }
            let Some(discovered) = state.cache.peer(&peer).cloned() else {
                return;
            };
            debug!(peer = %peer, "Peer discovered");
            state
                .interests
                .values()
                .filter_map(|interest| interest.listener.upgrade())
                .map(|listener| Notice::PeerDiscovered(listener, discovered.clone()))
                .collect::<Vec<_>>()
        };
        dispatch(notices);
    }

    /// Provider callback: `peer` announced the raw service identifier `identifier`.
    pub fn on_service_announced(&self, peer: PeerId, identifier: &[u8]) {
        let announced = match ServiceId::from_slice(identifier) {
            Ok(announced) => announced,
            Err(error) => {
                warn!(peer = %peer, error = %error, "Ignoring malformed announcement");
                return;
            }
        };

        let mut stale = None;
        let mut fresh = false;
        let mut notices = Vec::new();
        let matched = {
            let mut state = self.shared.state.lock();
            if state.runtime.is_none() {
                trace!(peer = %peer, "Engine not running; ignoring announcement");
                return;
            }
            fresh = state.cache.record_service_on_peer(&peer, announced);
            if fresh {
                trace!(peer = %peer, service = %announced, "Service recorded");
            }

            let key = if state.interests.contains_key(&announced) {
                Some(announced)
            } else if self.shared.config.check_reversed_identifier_bytes
                && state.interests.contains_key(&announced.reversed())
            {
                trace!(peer = %peer, service = %announced, "Matched reversed identifier");
                Some(announced.reversed())
            } else {
                None
            };

            match key {
                Some(key) => {
                    let listener = state
                        .interests
                        .get(&key)
                        .and_then(|interest| interest.listener.upgrade());
                    match listener {
                        Some(listener) => state
                            .interests
                            .get(&key)
                            .map(|interest| (interest.descriptor.clone(), listener)),
                        None => {
                            warn!(service = %key, "Listener gone; removing interest");
                            stale = Some(self.withdraw(&mut state, key));
                            None
                        }
                    }
                }
                None => {
                    if self.shared.config.notify_about_all_services && fresh {
                        let placeholder = ServiceDescriptor::from_identifier(announced);
                        notices.extend(
                            state
                                .interests
                                .values()
                                .filter_map(|interest| interest.listener.upgrade())
                                .map(|listener| {
                                    Notice::ServiceDiscovered(
                                        listener,
                                        peer.clone(),
                                        placeholder.clone(),
                                    )
                                }),
                        );
                    } else {
                        trace!(peer = %peer, service = %announced, "No interest in service");
                    }
                    None
                }
            }
        };

        dispatch(notices);
        if let Some(Withdrawn {
            descriptor: Some(descriptor),
            cancelled,
            now_empty,
        }) = stale
        {
            debug!(service = %descriptor.identifier(), cancelled, "Retired interest of dropped listener");
            self.stop_looking_for(&descriptor, now_empty);
        }
        if let Some((descriptor, listener)) = matched {
            self.on_match(&peer, &descriptor, &listener, fresh);
        }
    }

    /// Feed provider events from `feed` into the engine until it ends or the
    /// engine shuts down.
    pub fn attach_feed<S>(&self, feed: S) -> Result<()>
    where
        S: Stream<Item = DiscoveryEvent> + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let runtime = state.runtime.as_mut().ok_or(Error::NotRunning)?;
        let shared = Arc::downgrade(&self.shared);

        let task = runtime.handle.spawn(async move {
            let mut feed = Box::pin(feed);
            while let Some(event) = feed.next().await {
                let Some(engine) = DiscoveryCoordinator::upgrade(&shared) else {
                    break;
                };
                match event {
                    DiscoveryEvent::PeerFound(peer) => engine.on_peer_discovered(peer),
                    DiscoveryEvent::ServiceAnnounced { peer, identifier } => {
                        engine.on_service_announced(peer, &identifier)
                    }
                }
            }
            trace!("Event feed ended");
        });

        runtime.feeds.retain(|task| !task.is_finished());
        runtime.feeds.push(task);
        Ok(())
    }

    /// Close every connection to `peer`.
    pub fn disconnect_peer(&self, peer: &PeerId) {
        let closed = self
            .shared
            .registry
            .close_matching(|connection| connection.peer() == peer);
        debug!(peer = %peer, closed = closed.len(), "Disconnected peer");
        dispatch(lost_notices(closed));
    }

    /// Close every connection for the service `identifier`, in both roles.
    pub fn disconnect_service(&self, identifier: ServiceId) {
        let closed = self
            .shared
            .registry
            .close_matching(|connection| connection.key().service == identifier);
        debug!(service = %identifier, closed = closed.len(), "Disconnected service");
        dispatch(lost_notices(closed));
    }

    /// Close the connections for `identifier` in one role only.
    pub fn disconnect_service_role(&self, identifier: ServiceId, role: Role) {
        let closed = self.shared.registry.close_matching(|connection| {
            connection.key().service == identifier && connection.role() == role
        });
        debug!(service = %identifier, ?role, closed = closed.len(), "Disconnected service role");
        dispatch(lost_notices(closed));
    }

    /// Snapshot of the open connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.registry.connections()
    }

    /// Number of live connectors.
    pub fn active_connectors(&self) -> usize {
        self.shared.state.lock().connectors.len()
    }

    /// State of every live connector.
    pub fn connector_states(&self) -> Vec<(ConnectorId, Role, ConnectorState)> {
        let state = self.shared.state.lock();
        let mut states: Vec<_> = state
            .connectors
            .values()
            .map(|active| (active.handle.id(), active.handle.role(), active.handle.state()))
            .collect();
        states.sort_by_key(|(id, _, _)| *id);
        states
    }

    /// Peers found in the current discovery session.
    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        let state = self.shared.state.lock();
        let mut peers: Vec<_> = state.cache.peers().cloned().collect();
        peers.sort_by(|a, b| a.id().cmp(b.id()));
        peers
    }

    /// Stop everything: cancel connectors, close connections, forget
    /// interests and cached results, stop scanning and advertising.
    ///
    /// Safe to call repeatedly; the engine can be started again afterwards.
    pub fn shutdown(&self) {
        let (runtime, connectors) = {
            let mut state = self.shared.state.lock();
            let runtime = state.runtime.take();
            let connectors: Vec<(ConnectorId, ActiveConnector)> =
                state.connectors.drain().collect();
            state.interests.clear();
            state.cache.reset();
            (runtime, connectors)
        };

        let mut advertised = Vec::new();
        for (id, active) in connectors {
            if active.handle.role() == Role::Server {
                advertised.push(active.handle.descriptor().clone());
            }
            self.retire(id, active);
        }

        let closed = self.shared.registry.close_all();
        let closed_count = closed.len();
        dispatch(lost_notices(closed));

        let Some(runtime) = runtime else {
            trace!("Engine already shut down");
            return;
        };
        for feed in runtime.feeds {
            feed.abort();
        }

        self.shared.discovery.stop_scanning();
        for descriptor in &advertised {
            self.shared.advertiser.end_advertising(descriptor);
        }
        info!(closed = closed_count, "Engine shut down");
    }

    /// Try to connect to a matched service, notifying the listener first
    /// unless `peer` already reported it in this session.
    fn on_match(
        &self,
        peer: &PeerId,
        descriptor: &ServiceDescriptor,
        listener: &Arc<dyn ServiceListener>,
        fresh: bool,
    ) {
        if fresh {
            debug!(peer = %peer, service = %descriptor.identifier(), "Service discovered");
            listener.on_service_discovered(peer, descriptor);
        } else {
            trace!(peer = %peer, service = %descriptor.identifier(), "Service announced again");
        }

        if !listener.should_connect_to(peer, descriptor) {
            debug!(peer = %peer, service = %descriptor.identifier(), "Listener declined connection");
            return;
        }
        self.try_connect(peer, descriptor, Arc::downgrade(listener));
    }

    /// Reserve the client key for (`peer`, `descriptor`) and launch a client
    /// connector, unless a connection or attempt already exists.
    fn try_connect(
        &self,
        peer: &PeerId,
        descriptor: &ServiceDescriptor,
        listener: Weak<dyn ServiceListener>,
    ) {
        let pruned = {
            let mut state = self.shared.state.lock();
            let (handle, events) = match &state.runtime {
                Some(runtime) => (runtime.handle.clone(), runtime.events.clone()),
                None => return,
            };

            let pruned = self.shared.registry.prune_closed();
            let key = ConnectionKey::new(peer.clone(), descriptor.identifier(), Role::Client);
            let id = self.shared.ids.next();
            if self.shared.registry.try_reserve(&key, id) {
                let connector = Connector::Client(
                    ClientConnector::new(peer.clone(), descriptor.clone())
                        .with_timeout(self.shared.config.connect_timeout),
                );
                let handle =
                    connector.spawn(id, &handle, Arc::clone(&self.shared.transport), events);
                debug!(peer = %peer, service = %key.service, connector = %id, "Launched connector");
                state.connectors.insert(
                    id,
                    ActiveConnector {
                        handle,
                        listener,
                        _retained: None,
                    },
                );
            } else {
                let skipped = Error::DuplicateConnectionAttempt {
                    peer: peer.clone(),
                    service: key.service,
                };
                debug!(error = %skipped, "Skipping connection attempt");
            }
            pruned
        };
        dispatch(lost_notices(pruned));
    }

    /// Cancel a connector that was removed from the active set and free its
    /// reservation.
    fn retire(&self, id: ConnectorId, active: ActiveConnector) {
        active.handle.cancel();
        if let Some(key) = active.client_key() {
            self.shared.registry.release(&key, id);
        }
        trace!(connector = %id, "Connector retired");
    }

    fn handle_event(&self, event: ConnectorEvent) {
        let mut notices = Vec::new();
        let mut ended_server = None;
        {
            let mut state = self.shared.state.lock();
            match event {
                ConnectorEvent::Connected {
                    connector,
                    peer,
                    channel,
                } => match state.connectors.remove(&connector) {
                    Some(active) => {
                        let descriptor = active.handle.descriptor().clone();
                        let connection =
                            Arc::new(Connection::new(peer, descriptor, Role::Client, channel));
                        match self.shared.registry.commit(
                            Arc::clone(&connection),
                            connector,
                            active.listener.clone(),
                        ) {
                            Ok(()) => {
                                info!(connection = %connection, "Connection established");
                                match active.listener.upgrade() {
                                    Some(listener) => {
                                        notices.push(Notice::Established(listener, connection))
                                    }
                                    None => warn!(connection = %connection, "Listener gone"),
                                }
                            }
                            Err(connection) => {
                                debug!(connection = %connection, "Reservation gone; discarding");
                                connection.close();
                            }
                        }
                    }
                    None => {
                        debug!(connector = %connector, peer = %peer, "Late connect; discarding");
                        close_channel(&channel);
                    }
                },
                ConnectorEvent::Accepted {
                    connector,
                    peer,
                    channel,
                } => match state.connectors.get(&connector) {
                    Some(active) => {
                        let descriptor = active.handle.descriptor().clone();
                        let connection =
                            Arc::new(Connection::new(peer, descriptor, Role::Server, channel));
                        match self
                            .shared
                            .registry
                            .insert_accepted(Arc::clone(&connection), active.listener.clone())
                        {
                            Ok(displaced) => {
                                notices.extend(lost_notices(displaced.into_iter().collect()));
                                info!(connection = %connection, "Connection accepted");
                                if let Some(listener) = active.listener.upgrade() {
                                    notices.push(Notice::Established(listener, connection));
                                }
                            }
                            Err(connection) => {
                                debug!(connection = %connection, "Duplicate inbound connection; closing");
                                connection.close();
                            }
                        }
                    }
                    None => {
                        debug!(connector = %connector, peer = %peer, "Accept after stop; discarding");
                        close_channel(&channel);
                    }
                },
                ConnectorEvent::Failed { connector, reason } => {
                    if let Some(active) = state.connectors.remove(&connector) {
                        let descriptor = active.handle.descriptor().clone();
                        let error = Error::connection_failed(
                            descriptor.identifier(),
                            active.handle.peer().cloned(),
                            reason,
                        );
                        warn!(connector = %connector, error = %error, "Connector failed");
                        if active.handle.role() == Role::Server {
                            ended_server = Some(descriptor.clone());
                        }
                        if let Some(listener) = active.listener.upgrade() {
                            notices.push(Notice::Failed(listener, descriptor, error));
                        }
                        self.retire(connector, active);
                    }
                }
                ConnectorEvent::Stopped { connector } => {
                    if let Some(active) = state.connectors.remove(&connector) {
                        self.retire(connector, active);
                    }
                }
            }
        }

        dispatch(notices);
        if let Some(descriptor) = ended_server {
            self.shared.advertiser.end_advertising(&descriptor);
        }
    }

    fn prune(&self) {
        if !self.is_running() {
            return;
        }
        let pruned = self.shared.registry.prune_closed();
        dispatch(lost_notices(pruned));
    }
}

impl std::fmt::Debug for DiscoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DiscoveryCoordinator")
            .field("running", &state.runtime.is_some())
            .field("interests", &state.interests.len())
            .field("peers", &state.cache.peer_count())
            .field("connectors", &state.connectors.len())
            .field("registry", &self.shared.registry)
            .finish()
    }
}

/// Drain connector reports and run the stale connection sweep.
///
/// Ends once every event sender is gone or the engine was dropped.
async fn drive(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<ConnectorEvent>,
    prune_every: Option<Duration>,
) {
    let mut sweep = prune_every.map(|period| {
        let mut sweep = interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep
    });

    loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(engine) = DiscoveryCoordinator::upgrade(&shared) else { break };
                engine.handle_event(event);
            }
            _ = tick(&mut sweep) => {
                let Some(engine) = DiscoveryCoordinator::upgrade(&shared) else { break };
                engine.prune();
            }
        }
    }
    trace!("Engine driver stopped");
}

async fn tick(sweep: &mut Option<Interval>) {
    match sweep {
        Some(sweep) => {
            sweep.tick().await;
        }
        None => std::future::pending().await,
    }
}
