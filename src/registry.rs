//! Connection registry: the open connections and the reservations that keep
//! a second attempt for the same (peer, service, role) from being launched.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connector::ConnectorId;
use crate::descriptor::{ServiceDescriptor, ServiceId};
use crate::listener::ServiceListener;
use crate::peer::PeerId;
use crate::provider::BoxChannel;

/// Which side of the connection the local device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We connected to a remote server.
    Client,
    /// A remote client connected to our advertised service.
    Server,
}

/// Uniqueness key of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Remote peer.
    pub peer: PeerId,
    /// Service identifier.
    pub service: ServiceId,
    /// Local role.
    pub role: Role,
}

impl ConnectionKey {
    /// Build a key.
    pub fn new(peer: PeerId, service: ServiceId, role: Role) -> Self {
        Self {
            peer,
            service,
            role,
        }
    }
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Usable.
    Open,
    /// Closed locally or reported disconnected by the transport.
    Closed,
}

/// An established connection to a peer for one service.
pub struct Connection {
    key: ConnectionKey,
    descriptor: ServiceDescriptor,
    channel: BoxChannel,
    closed: AtomicBool,
    established_at: Instant,
}

impl Connection {
    pub(crate) fn new(
        peer: PeerId,
        descriptor: ServiceDescriptor,
        role: Role,
        channel: BoxChannel,
    ) -> Self {
        Self {
            key: ConnectionKey::new(peer, descriptor.identifier(), role),
            descriptor,
            channel,
            closed: AtomicBool::new(false),
            established_at: Instant::now(),
        }
    }

    /// Uniqueness key.
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Remote peer.
    pub fn peer(&self) -> &PeerId {
        &self.key.peer
    }

    /// Service this connection belongs to.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.key.role
    }

    /// When the connection was established.
    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) || !self.channel.is_connected() {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        }
    }

    /// Shorthand for `state() == ConnectionState::Open`.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Read from the peer.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        self.channel.read(buf).await
    }

    /// Write to the peer.
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        self.channel.write_all(buf).await
    }

    /// Close the connection and release the transport handle.
    ///
    /// Closing twice is a no-op; transport errors on close are logged and dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.key.peer, service = %self.key.service, role = ?self.key.role, "Closing connection");
        if let Err(e) = self.channel.close() {
            debug!(error = %e, peer = %self.key.peer, "Transport close failed");
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.key.peer)
            .field("service", &self.key.service)
            .field("role", &self.key.role)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} <-> {} ({:?})",
            self.key.role,
            self.descriptor.name(),
            self.key.peer,
            self.state()
        )
    }
}

/// A connection removed from the registry, with the listener that owns it.
pub struct RegisteredConnection {
    /// The (now closed) connection.
    pub connection: Arc<Connection>,
    /// Listener to notify about the loss, if it is still alive.
    pub listener: Weak<dyn ServiceListener>,
}

enum Slot {
    Reserved(ConnectorId),
    Open(RegisteredConnection),
}

/// Tracks open connections and in-flight reservations.
#[derive(Default)]
pub struct ConnectionRegistry {
    slots: Mutex<HashMap<ConnectionKey, Slot>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `owner` unless a live connection or another
    /// reservation already holds it.
    ///
    /// A disconnected entry found under the key is closed and replaced.
    pub fn try_reserve(&self, key: &ConnectionKey, owner: ConnectorId) -> bool {
        let stale = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(Slot::Reserved(holder)) => {
                    trace!(peer = %key.peer, service = %key.service, %holder, "Key already reserved");
                    return false;
                }
                Some(Slot::Open(entry)) if entry.connection.is_open() => {
                    trace!(peer = %key.peer, service = %key.service, "Connection already open");
                    return false;
                }
                _ => {}
            }
            slots.insert(key.clone(), Slot::Reserved(owner))
        };
        if let Some(Slot::Open(entry)) = stale {
            debug!(peer = %key.peer, service = %key.service, "Replacing stale connection");
            entry.connection.close();
        }
        true
    }

    /// Store an established connection in place of `owner`'s reservation.
    ///
    /// Hands the connection back if the reservation is gone (released or
    /// taken over), so the caller can close it.
    pub fn commit(
        &self,
        connection: Arc<Connection>,
        owner: ConnectorId,
        listener: Weak<dyn ServiceListener>,
    ) -> Result<(), Arc<Connection>> {
        let mut slots = self.slots.lock();
        let key = connection.key().clone();
        match slots.get(&key) {
            Some(Slot::Reserved(holder)) if *holder == owner => {
                slots.insert(
                    key,
                    Slot::Open(RegisteredConnection {
                        connection,
                        listener,
                    }),
                );
                Ok(())
            }
            _ => Err(connection),
        }
    }

    /// Store an inbound connection without a prior reservation.
    ///
    /// Refused (connection handed back) while a live entry holds the key. A
    /// disconnected entry under the key is closed and returned so its loss
    /// can be reported.
    pub fn insert_accepted(
        &self,
        connection: Arc<Connection>,
        listener: Weak<dyn ServiceListener>,
    ) -> Result<Option<RegisteredConnection>, Arc<Connection>> {
        let stale = {
            let mut slots = self.slots.lock();
            let key = connection.key().clone();
            match slots.get(&key) {
                Some(Slot::Reserved(_)) => return Err(connection),
                Some(Slot::Open(entry)) if entry.connection.is_open() => return Err(connection),
                _ => {}
            }
            slots.insert(
                key,
                Slot::Open(RegisteredConnection {
                    connection,
                    listener,
                }),
            )
        };
        match stale {
            Some(Slot::Open(entry)) => {
                debug!(connection = %entry.connection, "Replacing stale inbound connection");
                entry.connection.close();
                Ok(Some(entry))
            }
            _ => Ok(None),
        }
    }

    /// Drop `owner`'s reservation on `key` so the key can be retried.
    ///
    /// Returns `false` if `owner` did not hold the key.
    pub fn release(&self, key: &ConnectionKey, owner: ConnectorId) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Reserved(holder)) if *holder == owner => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Close every connection and forget every reservation.
    pub fn close_all(&self) -> Vec<RegisteredConnection> {
        let drained: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        close_entries(drained)
    }

    /// Close and remove the connections matching `predicate`.
    pub fn close_matching<F>(&self, predicate: F) -> Vec<RegisteredConnection>
    where
        F: Fn(&Connection) -> bool,
    {
        self.remove_and_close(|entry| predicate(&entry.connection))
    }

    /// Close and remove connections the transport reports as disconnected.
    pub fn prune_closed(&self) -> Vec<RegisteredConnection> {
        let pruned = self.remove_and_close(|entry| !entry.connection.is_open());
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Pruned disconnected connections");
        }
        pruned
    }

    /// Snapshot of the open connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Open(entry) => Some(Arc::clone(&entry.connection)),
                Slot::Reserved(_) => None,
            })
            .collect()
    }

    /// Whether `key` holds an open connection.
    pub fn is_connected(&self, key: &ConnectionKey) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Open(entry)) if entry.connection.is_open())
    }

    /// Number of outstanding reservations.
    pub fn reservation_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Reserved(_)))
            .count()
    }

    fn remove_and_close<F>(&self, mut predicate: F) -> Vec<RegisteredConnection>
    where
        F: FnMut(&RegisteredConnection) -> bool,
    {
        let removed = {
            let mut slots = self.slots.lock();
            let keys: Vec<ConnectionKey> = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Open(entry) if predicate(entry) => Some(key.clone()),
                    _ => None,
                })
                .collect();
            keys.iter()
                .filter_map(|key| slots.remove(key))
                .collect::<Vec<_>>()
        };
        close_entries(removed)
    }
}

fn close_entries(slots: Vec<Slot>) -> Vec<RegisteredConnection> {
    slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Open(entry) => {
                entry.connection.close();
                Some(entry)
            }
            Slot::Reserved(owner) => {
                trace!(%owner, "Dropping reservation");
                None
            }
        })
        .collect()
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        let mut list = f.debug_list();
        for (key, slot) in slots.iter() {
            match slot {
                Slot::Reserved(owner) => list.entry(&(key, "reserved", owner)),
                Slot::Open(entry) => list.entry(&(key, entry.connection.state())),
            };
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::provider::ByteChannel;

    #[derive(Default)]
    struct FakeChannel {
        connected: AtomicBool,
        closes: std::sync::atomic::AtomicUsize,
    }

    impl FakeChannel {
        fn connected() -> Arc<Self> {
            let channel = Self::default();
            channel.connected.store(true, Ordering::SeqCst);
            Arc::new(channel)
        }
    }

    #[async_trait]
    impl ByteChannel for FakeChannel {
        async fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        async fn write_all(&self, _buf: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn close(&self) -> io::Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Quiet;
    impl ServiceListener for Quiet {}

    fn no_listener() -> Weak<dyn ServiceListener> {
        let listener: Arc<dyn ServiceListener> = Arc::new(Quiet);
        Arc::downgrade(&listener)
    }

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::with_attributes("svc1", "_test", [("name", "svc1")])
    }

    fn connection(peer: &str, role: Role, channel: Arc<FakeChannel>) -> Arc<Connection> {
        Arc::new(Connection::new(PeerId::new(peer), descriptor(), role, channel))
    }

    fn key(peer: &str, role: Role) -> ConnectionKey {
        ConnectionKey::new(PeerId::new(peer), descriptor().identifier(), role)
    }

    #[test]
    fn second_reservation_for_same_key_is_refused() {
        let registry = ConnectionRegistry::new();
        assert!(registry.try_reserve(&key("p1", Role::Client), ConnectorId::new(1)));
        assert!(!registry.try_reserve(&key("p1", Role::Client), ConnectorId::new(2)));
        assert!(registry.try_reserve(&key("p1", Role::Server), ConnectorId::new(3)));
        assert!(registry.try_reserve(&key("p2", Role::Client), ConnectorId::new(4)));
    }

    #[test]
    fn commit_requires_matching_reservation() {
        let registry = ConnectionRegistry::new();
        let owner = ConnectorId::new(1);
        let conn = connection("p1", Role::Client, FakeChannel::connected());

        let refused = registry
            .commit(Arc::clone(&conn), owner, no_listener())
            .unwrap_err();
        assert!(Arc::ptr_eq(&refused, &conn));

        assert!(registry.try_reserve(conn.key(), owner));
        assert!(registry
            .commit(Arc::clone(&conn), ConnectorId::new(2), no_listener())
            .is_err());
        assert!(registry.commit(Arc::clone(&conn), owner, no_listener()).is_ok());
        assert!(registry.is_connected(conn.key()));
        assert!(!registry.try_reserve(conn.key(), ConnectorId::new(3)));
    }

    #[test]
    fn release_makes_key_retryable() {
        let registry = ConnectionRegistry::new();
        let k = key("p1", Role::Client);
        assert!(registry.try_reserve(&k, ConnectorId::new(1)));

        assert!(!registry.release(&k, ConnectorId::new(2)));
        assert!(registry.release(&k, ConnectorId::new(1)));
        assert_eq!(registry.reservation_count(), 0);
        assert!(registry.try_reserve(&k, ConnectorId::new(2)));
    }

    #[test]
    fn stale_connection_does_not_block_reconnect() {
        let registry = ConnectionRegistry::new();
        let channel = FakeChannel::connected();
        let conn = connection("p1", Role::Client, Arc::clone(&channel));
        let owner = ConnectorId::new(1);
        registry.try_reserve(conn.key(), owner);
        registry.commit(Arc::clone(&conn), owner, no_listener()).unwrap();

        channel.connected.store(false, Ordering::SeqCst);

        let pruned = registry.prune_closed();
        assert_eq!(pruned.len(), 1);
        assert!(registry.try_reserve(conn.key(), ConnectorId::new(2)));
    }

    #[test]
    fn close_matching_only_touches_selected_connections() {
        let registry = ConnectionRegistry::new();
        let client = FakeChannel::connected();
        let server = FakeChannel::connected();
        let c = connection("p1", Role::Client, Arc::clone(&client));
        let s = connection("p1", Role::Server, Arc::clone(&server));
        registry.try_reserve(c.key(), ConnectorId::new(1));
        registry.commit(c, ConnectorId::new(1), no_listener()).unwrap();
        registry.insert_accepted(s, no_listener()).unwrap();

        let closed = registry.close_matching(|c| c.role() == Role::Client);
        assert_eq!(closed.len(), 1);
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
        assert_eq!(server.closes.load(Ordering::SeqCst), 0);
        assert_eq!(registry.connections().len(), 1);
    }

    #[test]
    fn insert_accepted_refuses_live_duplicate() {
        let registry = ConnectionRegistry::new();
        let first = connection("p1", Role::Server, FakeChannel::connected());
        let second = connection("p1", Role::Server, FakeChannel::connected());

        assert!(registry.insert_accepted(first, no_listener()).is_ok());
        assert!(registry.insert_accepted(second, no_listener()).is_err());
    }

    #[test]
    fn insert_accepted_hands_back_displaced_stale_entry() {
        let registry = ConnectionRegistry::new();
        let stale_channel = FakeChannel::connected();
        let stale = connection("p1", Role::Server, Arc::clone(&stale_channel));
        let fresh = connection("p1", Role::Server, FakeChannel::connected());
        assert!(registry.insert_accepted(Arc::clone(&stale), no_listener()).unwrap().is_none());

        stale_channel.connected.store(false, Ordering::SeqCst);

        let displaced = registry
            .insert_accepted(Arc::clone(&fresh), no_listener())
            .unwrap()
            .expect("stale entry is returned");
        assert!(Arc::ptr_eq(&displaced.connection, &stale));
        assert_eq!(stale_channel.closes.load(Ordering::SeqCst), 1);
        assert!(registry.is_connected(fresh.key()));
    }

    #[test]
    fn close_all_closes_once_and_clears() {
        let registry = ConnectionRegistry::new();
        let channel = FakeChannel::connected();
        let conn = connection("p1", Role::Server, Arc::clone(&channel));
        registry.insert_accepted(Arc::clone(&conn), no_listener()).unwrap();
        registry.try_reserve(&key("p2", Role::Client), ConnectorId::new(9));

        assert_eq!(registry.close_all().len(), 1);
        conn.close();

        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        assert!(registry.connections().is_empty());
        assert_eq!(registry.reservation_count(), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn closed_connection_rejects_io() {
        let conn = connection("p1", Role::Client, FakeChannel::connected());
        conn.close();
        let err = conn.write_all(b"hi").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
