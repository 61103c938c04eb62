//! In-memory providers and a recording listener for engine tests.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proximity_discovery::{
    BoxChannel, BoxListener, ByteChannel, Connection, DiscoveredPeer, DiscoveryCoordinator,
    EngineConfig, Error, ListeningEndpoint, PeerDiscoveryProvider, PeerId, Role,
    ServiceAdvertiser, ServiceDescriptor, ServiceId, ServiceListener, TransportProvider,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Descriptor `{name: svc1}` of type `_test`.
pub fn svc1() -> ServiceDescriptor {
    ServiceDescriptor::with_attributes("svc1", "_test", [("name", "svc1")])
}

pub fn svc2() -> ServiceDescriptor {
    ServiceDescriptor::with_attributes("svc2", "_test", [("name", "svc2")])
}

#[derive(Default)]
pub struct MockDiscovery {
    pub unavailable: AtomicBool,
    pub scanning: AtomicBool,
    pub scan_starts: AtomicUsize,
    pub scan_stops: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub looking_for: Mutex<Vec<ServiceId>>,
}

impl PeerDiscoveryProvider for MockDiscovery {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    fn start_scanning(&self) -> io::Result<()> {
        self.scanning.store(true, Ordering::SeqCst);
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_scanning(&self) {
        self.scanning.store(false, Ordering::SeqCst);
        self.scan_stops.fetch_add(1, Ordering::SeqCst);
    }

    fn look_for(&self, descriptor: &ServiceDescriptor) {
        self.looking_for.lock().push(descriptor.identifier());
    }

    fn stop_looking_for(&self, descriptor: &ServiceDescriptor) {
        let identifier = descriptor.identifier();
        self.looking_for.lock().retain(|id| *id != identifier);
    }

    fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockAdvertiser {
    pub fail: AtomicBool,
    pub advertised: Mutex<Vec<ServiceId>>,
    pub discoverable_for: Mutex<Option<Duration>>,
}

impl ServiceAdvertiser for MockAdvertiser {
    fn begin_advertising(&self, descriptor: &ServiceDescriptor) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "advertising disabled"));
        }
        self.advertised.lock().push(descriptor.identifier());
        Ok(())
    }

    fn end_advertising(&self, descriptor: &ServiceDescriptor) {
        let identifier = descriptor.identifier();
        self.advertised.lock().retain(|id| *id != identifier);
    }

    fn make_discoverable(&self, duration: Duration) -> io::Result<()> {
        *self.discoverable_for.lock() = Some(duration);
        Ok(())
    }
}

pub struct MockChannel {
    pub peer: PeerId,
    connected: AtomicBool,
    closes: AtomicUsize,
}

impl MockChannel {
    pub fn new(peer: PeerId) -> Arc<Self> {
        Arc::new(Self {
            peer,
            connected: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
        })
    }

    /// Simulate the remote side going away.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) > 0
    }
}

#[async_trait]
impl ByteChannel for MockChannel {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let reply = b"pong";
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
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

/// How outbound connects behave.
#[derive(Debug, Clone, Copy)]
pub enum ConnectMode {
    Ready,
    Delay(Duration),
    Hang,
    Fail,
}

type Inbound = io::Result<(PeerId, BoxChannel)>;

pub struct MockTransport {
    mode: Mutex<ConnectMode>,
    pub connects: AtomicUsize,
    pub listens: AtomicUsize,
    pub endpoint_closes: Arc<AtomicUsize>,
    pub opened: Mutex<Vec<Arc<MockChannel>>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            mode: Mutex::new(ConnectMode::Ready),
            connects: AtomicUsize::new(0),
            listens: AtomicUsize::new(0),
            endpoint_closes: Arc::new(AtomicUsize::new(0)),
            opened: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
        }
    }
}

impl MockTransport {
    pub fn set_mode(&self, mode: ConnectMode) {
        *self.mode.lock() = mode;
    }

    /// Hand an inbound connection from `peer` to whoever is accepting.
    pub fn dial_in(&self, peer: &str) -> Arc<MockChannel> {
        let channel = MockChannel::new(PeerId::new(peer));
        let boxed: BoxChannel = channel.clone();
        let _ = self.inbound_tx.send(Ok((PeerId::new(peer), boxed)));
        channel
    }

    /// Make the next pending accept fail.
    pub fn fail_accept(&self) {
        let _ = self
            .inbound_tx
            .send(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "accept failed")));
    }

    pub fn last_opened(&self) -> Option<Arc<MockChannel>> {
        self.opened.lock().last().cloned()
    }
}

/// Closes a half-open channel when the connect future is dropped.
struct CloseOnDrop(Option<Arc<MockChannel>>);

impl CloseOnDrop {
    fn disarm(mut self) -> Arc<MockChannel> {
        self.0.take().expect("armed guard")
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(channel) = self.0.take() {
            let _ = channel.close();
        }
    }
}

#[async_trait]
impl TransportProvider for MockTransport {
    async fn connect(&self, peer: &PeerId, _identifier: ServiceId) -> io::Result<BoxChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let channel = MockChannel::new(peer.clone());
        self.opened.lock().push(channel.clone());
        let guard = CloseOnDrop(Some(channel));

        let mode = *self.mode.lock();
        match mode {
            ConnectMode::Ready => {}
            ConnectMode::Delay(delay) => tokio::time::sleep(delay).await,
            ConnectMode::Hang => std::future::pending::<()>().await,
            ConnectMode::Fail => {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"))
            }
        }

        let channel: BoxChannel = guard.disarm();
        Ok(channel)
    }

    async fn listen(&self, _descriptor: &ServiceDescriptor) -> io::Result<BoxListener> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockEndpoint {
            inbound: Arc::clone(&self.inbound_rx),
            closes: Arc::clone(&self.endpoint_closes),
        }))
    }
}

struct MockEndpoint {
    inbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ListeningEndpoint for MockEndpoint {
    async fn accept(&self) -> io::Result<(PeerId, BoxChannel)> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(next) => next,
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport gone")),
        }
    }

    fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub enum Seen {
    Peer(PeerId),
    Service(PeerId, ServiceId),
    Established(Arc<Connection>),
    Lost(PeerId, Role),
    Failed(ServiceId, Option<PeerId>, String),
}

pub struct Recorder {
    tx: mpsc::UnboundedSender<Seen>,
    pub connect: AtomicBool,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Self {
            tx,
            connect: AtomicBool::new(true),
        });
        (recorder, rx)
    }
}

impl ServiceListener for Recorder {
    fn on_peer_discovered(&self, peer: &DiscoveredPeer) {
        let _ = self.tx.send(Seen::Peer(peer.id().clone()));
    }

    fn on_service_discovered(&self, peer: &PeerId, descriptor: &ServiceDescriptor) {
        let _ = self
            .tx
            .send(Seen::Service(peer.clone(), descriptor.identifier()));
    }

    fn should_connect_to(&self, _peer: &PeerId, _descriptor: &ServiceDescriptor) -> bool {
        self.connect.load(Ordering::SeqCst)
    }

    fn on_connection_established(&self, connection: Arc<Connection>) {
        let _ = self.tx.send(Seen::Established(connection));
    }

    fn on_connection_lost(&self, connection: &Connection) {
        let _ = self
            .tx
            .send(Seen::Lost(connection.peer().clone(), connection.role()));
    }

    fn on_connection_failed(&self, descriptor: &ServiceDescriptor, reason: &Error) {
        let peer = match reason {
            Error::ConnectionFailed { peer, .. } => peer.clone(),
            _ => None,
        };
        let _ = self
            .tx
            .send(Seen::Failed(descriptor.identifier(), peer, reason.to_string()));
    }
}

/// Next recorded event, or an error after [`WAIT`].
pub async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> anyhow::Result<Seen> {
    match timeout(WAIT, rx.recv()).await {
        Ok(Some(seen)) => Ok(seen),
        Ok(None) => anyhow::bail!("listener channel closed"),
        Err(_) => anyhow::bail!("no listener event within {WAIT:?}"),
    }
}

/// Skip events until an established connection shows up.
pub async fn next_established(
    rx: &mut mpsc::UnboundedReceiver<Seen>,
) -> anyhow::Result<Arc<Connection>> {
    loop {
        if let Seen::Established(connection) = next(rx).await? {
            return Ok(connection);
        }
    }
}

/// Everything recorded so far, without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Vec<Seen> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

/// Poll `check` until it holds or [`WAIT`] passes.
pub async fn eventually<F>(mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("condition not met within {WAIT:?}"))
}

pub struct Harness {
    pub engine: DiscoveryCoordinator,
    pub discovery: Arc<MockDiscovery>,
    pub advertiser: Arc<MockAdvertiser>,
    pub transport: Arc<MockTransport>,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let discovery = Arc::new(MockDiscovery::default());
        let advertiser = Arc::new(MockAdvertiser::default());
        let transport = Arc::new(MockTransport::default());
        let engine = DiscoveryCoordinator::new(
            config,
            discovery.clone(),
            advertiser.clone(),
            transport.clone(),
        );
        Self {
            engine,
            discovery,
            advertiser,
            transport,
        }
    }

    /// A started engine with default configuration.
    pub fn started() -> anyhow::Result<Self> {
        let harness = Self::new(EngineConfig::default());
        harness.engine.start()?;
        Ok(harness)
    }

    /// Report `peer` and its announcement of `identifier`.
    pub fn announce(&self, peer: &str, identifier: ServiceId) {
        self.engine.on_peer_discovered(PeerId::new(peer));
        self.engine
            .on_service_announced(PeerId::new(peer), identifier.as_bytes());
    }
}
