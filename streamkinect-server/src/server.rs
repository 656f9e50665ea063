//! Discoverable control server.
//!
//! Lifecycle: `start` binds the control socket and registers the service;
//! the advertiser's "registered" notification triggers resolution, and the
//! "resolved" notification for the bound port moves the server to RUNNING,
//! after which control connections are accepted. Advertiser notifications
//! are funnelled into the reactor task and only act when they match the
//! state the server is waiting in.

use crate::advertiser::{AdvertiserEvent, ServiceAdvertiser};
use crate::device::ServerDevice;
use crate::error::ServerError;
use crate::handler::{ControlHandler, DescriptorSource};
use crate::mdns::default_service_name;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamkinect_core::{Device, ListenerId, PipelineConfig};
use streamkinect_protocol::{Decoder, Encoder, MePayload, CONTROL_ENDPOINT, SERVICE_TYPE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Advertised instance name. Defaults to "Kinect stream on <host>".
    pub name: Option<String>,
    /// Address the control socket binds to.
    pub control_bind: SocketAddr,
    /// How long to wait for registration and resolution before giving up.
    /// `None` waits forever.
    pub discovery_timeout: Option<Duration>,
    /// Pipeline settings applied to every device.
    pub pipeline: PipelineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: None,
            control_bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            discovery_timeout: Some(Duration::from_secs(10)),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_control_bind(mut self, addr: SocketAddr) -> Self {
        self.control_bind = addr;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }
}

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    WaitingForRegistration,
    WaitingForResolve,
    Running,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Started,
    Stopped,
    StartFailed { reason: String },
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Lifecycle event channel capacity.
const EVENT_CAPACITY: usize = 16;

/// Resources belonging to one start/stop cycle.
struct Session {
    advertiser: Arc<dyn ServiceAdvertiser>,
    advertiser_listener: ListenerId,
    shutdown: broadcast::Sender<()>,
    control_port: u16,
    hostname: Option<String>,
}

impl Session {
    /// Withdraws the advertisement and stops the reactor and connections.
    fn close(self) {
        self.advertiser.withdraw();
        self.advertiser.events().unsubscribe(self.advertiser_listener);
        let _ = self.shutdown.send(());
    }
}

struct Lifecycle {
    state: ServerState,
    generation: u64,
    session: Option<Session>,
}

struct ServerInner {
    config: ServerConfig,
    name: String,
    runtime: Handle,
    lifecycle: Mutex<Lifecycle>,
    devices: RwLock<Vec<Arc<ServerDevice>>>,
    events: broadcast::Sender<ServerEvent>,
    stats: ServerStats,
}

/// Discoverable depth streaming server.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Creates a stopped server on the current tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let runtime = Handle::try_current().map_err(|_| ServerError::NoRuntime)?;
        let name = config.name.clone().unwrap_or_else(default_service_name);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                name,
                runtime,
                lifecycle: Mutex::new(Lifecycle {
                    state: ServerState::Stopped,
                    generation: 0,
                    session: None,
                }),
                devices: RwLock::new(Vec::new()),
                events,
                stats: ServerStats::default(),
            }),
        })
    }

    /// Binds the control socket and begins service registration.
    ///
    /// Returns once registration has been requested; the server reports
    /// `ServerEvent::Started` when it reaches RUNNING.
    pub fn start(&self, advertiser: Arc<dyn ServiceAdvertiser>) -> Result<(), ServerError> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock();
        if lifecycle.state != ServerState::Stopped {
            return Err(ServerError::InvalidState("already running"));
        }

        let std_listener = std::net::TcpListener::bind(inner.config.control_bind)?;
        std_listener.set_nonblocking(true)?;
        let control_port = std_listener.local_addr()?.port();
        let listener = {
            let _guard = inner.runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        lifecycle.generation += 1;
        let generation = lifecycle.generation;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let advertiser_listener = advertiser.events().subscribe(move |event: &AdvertiserEvent| {
            let _ = event_tx.send(event.clone());
        });

        let (shutdown, _) = broadcast::channel(1);
        let reactor_shutdown = shutdown.subscribe();

        lifecycle.state = ServerState::WaitingForRegistration;
        lifecycle.session = Some(Session {
            advertiser: Arc::clone(&advertiser),
            advertiser_listener,
            shutdown: shutdown.clone(),
            control_port,
            hostname: None,
        });
        drop(lifecycle);

        tracing::info!("Control socket bound on port {}", control_port);

        inner.runtime.spawn(run_reactor(
            Arc::clone(inner),
            generation,
            listener,
            event_rx,
            shutdown,
            reactor_shutdown,
        ));

        // Devices start before registration so a WHO answered as soon as the
        // server is RUNNING never sees a device whose endpoints are closed.
        for device in inner.devices.read().iter() {
            if let Err(e) = device.start() {
                tracing::error!("Failed to start device {}: {}", device.id(), e);
            }
        }

        if let Err(e) = advertiser.register(&inner.name, SERVICE_TYPE, control_port) {
            tracing::error!("Service registration failed: {}", e);
            let session = {
                let mut lifecycle = inner.lifecycle.lock();
                lifecycle.state = ServerState::Stopped;
                lifecycle.session.take()
            };
            if let Some(session) = session {
                session.close();
            }
            for device in inner.devices.read().iter() {
                device.halt();
            }
            return Err(e.into());
        }

        Ok(())
    }

    /// Stops the server, its devices and its advertisement.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let session = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state == ServerState::Stopped {
                return Err(ServerError::InvalidState("not running"));
            }
            lifecycle.state = ServerState::Stopped;
            lifecycle.session.take()
        };

        self.inner.teardown(session).await;
        tracing::info!("Server stopped");
        let _ = self.inner.events.send(ServerEvent::Stopped);
        Ok(())
    }

    /// Adds a device. Its frames start flowing immediately unless the server
    /// is stopped.
    pub fn add_device(&self, device: Arc<dyn Device>) -> Result<(), ServerError> {
        let inner = &self.inner;
        let mut devices = inner.devices.write();
        if devices.iter().any(|d| d.id() == device.unique_id()) {
            return Err(ServerError::DuplicateDevice(device.unique_id().to_string()));
        }

        let server_device =
            ServerDevice::new(device, inner.config.pipeline.clone(), inner.runtime.clone());
        if inner.state() != ServerState::Stopped {
            server_device.start()?;
        }

        tracing::info!("Added device {}", server_device.id());
        devices.push(server_device);
        Ok(())
    }

    /// Removes a device, tearing down its endpoints. Returns false if no
    /// device has `id`.
    pub async fn remove_device(&self, id: &str) -> bool {
        let removed = {
            let mut devices = self.inner.devices.write();
            let index = devices.iter().position(|d| d.id() == id);
            index.map(|index| devices.remove(index))
        };

        match removed {
            Some(device) => {
                device.stop().await;
                tracing::info!("Removed device {}", id);
                true
            }
            None => false,
        }
    }

    /// Returns the ids of registered devices.
    pub fn devices(&self) -> Vec<String> {
        self.inner
            .devices
            .read()
            .iter()
            .map(|d| d.id().to_string())
            .collect()
    }

    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Returns the bound control port while the server is not stopped.
    pub fn control_port(&self) -> Option<u16> {
        self.inner
            .lifecycle
            .lock()
            .session
            .as_ref()
            .map(|s| s.control_port)
    }

    /// Returns the resolved hostname once running.
    pub fn hostname(&self) -> Option<String> {
        self.inner
            .lifecycle
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.hostname.clone())
    }

    /// Returns the advertised instance name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Subscribes to lifecycle notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.inner.stats
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let session = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state == ServerState::Stopped {
                return;
            }
            lifecycle.state = ServerState::Stopped;
            lifecycle.session.take()
        };

        tracing::debug!("Server dropped while active, shutting down");
        if let Some(session) = session {
            session.close();
        }
        for device in self.inner.devices.read().iter() {
            device.halt();
        }
    }
}

impl ServerInner {
    fn state(&self) -> ServerState {
        self.lifecycle.lock().state
    }

    /// Returns true while `generation` is the current run and the server
    /// accepts connections.
    fn is_serving(&self, generation: u64) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.generation == generation && lifecycle.state == ServerState::Running
    }

    async fn teardown(&self, session: Option<Session>) {
        let devices: Vec<Arc<ServerDevice>> = self.devices.read().clone();
        for device in devices {
            device.stop().await;
        }
        if let Some(session) = session {
            session.close();
        }
    }

    fn on_advertiser_event(&self, generation: u64, event: AdvertiserEvent) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.generation != generation {
            return;
        }

        match event {
            AdvertiserEvent::Registered {
                name,
                service_type,
                domain,
            } => {
                if lifecycle.state != ServerState::WaitingForRegistration {
                    tracing::debug!("Ignoring registration of '{}' in {:?}", name, lifecycle.state);
                    return;
                }
                let Some(advertiser) = lifecycle.session.as_ref().map(|s| s.advertiser.clone())
                else {
                    return;
                };
                lifecycle.state = ServerState::WaitingForResolve;
                drop(lifecycle);

                tracing::info!("Registered as '{}' ({} in {})", name, service_type, domain);
                if let Err(e) = advertiser.resolve(&name, &service_type, &domain) {
                    tracing::warn!("Failed to start resolving '{}': {}", name, e);
                }
            }
            AdvertiserEvent::Resolved {
                fullname,
                hostname,
                port,
            } => {
                if lifecycle.state != ServerState::WaitingForResolve {
                    tracing::debug!("Ignoring resolution of '{}' in {:?}", fullname, lifecycle.state);
                    return;
                }
                let Some(session) = lifecycle.session.as_mut() else {
                    return;
                };
                if session.control_port != port {
                    tracing::warn!(
                        "Ignoring resolution of '{}' to port {} (control port is {})",
                        fullname,
                        port,
                        session.control_port
                    );
                    return;
                }

                session.hostname = Some(hostname.clone());
                lifecycle.state = ServerState::Running;
                drop(lifecycle);

                tracing::info!("Server running at tcp://{}:{}", hostname, port);
                let _ = self.events.send(ServerEvent::Started);
            }
        }
    }

    /// Abandons a start that has not reached RUNNING. Returns false if the
    /// run is no longer waiting on discovery.
    async fn on_discovery_timeout(&self, generation: u64, timeout: Duration) -> bool {
        let session = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.generation != generation
                || matches!(lifecycle.state, ServerState::Stopped | ServerState::Running)
            {
                return false;
            }
            tracing::warn!(
                "Service discovery did not complete within {:?} (state {:?})",
                timeout,
                lifecycle.state
            );
            lifecycle.state = ServerState::Stopped;
            lifecycle.session.take()
        };

        self.teardown(session).await;
        let _ = self.events.send(ServerEvent::StartFailed {
            reason: format!("service discovery timed out after {:?}", timeout),
        });
        true
    }
}

impl DescriptorSource for ServerInner {
    fn describe(&self) -> Result<MePayload, ServerError> {
        let (hostname, port) = {
            let lifecycle = self.lifecycle.lock();
            let session = lifecycle
                .session
                .as_ref()
                .ok_or(ServerError::InvalidState("not running"))?;
            let hostname = session.hostname.clone().unwrap_or_else(|| "localhost".into());
            (hostname, session.control_port)
        };

        let mut me = MePayload::new(self.name.clone())
            .with_endpoint(CONTROL_ENDPOINT, format!("tcp://{}:{}", hostname, port));

        let devices: Vec<Arc<ServerDevice>> = self.devices.read().clone();
        for device in devices {
            me.devices.push(device.record(&hostname)?);
        }
        Ok(me)
    }
}

/// Resolves when `deadline` passes; never resolves without one.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns the control socket for one run: applies advertiser events, enforces
/// the discovery timeout and accepts control connections once running.
async fn run_reactor(
    inner: Arc<ServerInner>,
    generation: u64,
    listener: TcpListener,
    mut advertiser_events: mpsc::UnboundedReceiver<AdvertiserEvent>,
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let timeout = inner.config.discovery_timeout;
    let deadline = timeout.map(|t| Instant::now() + t);
    let handler = Arc::new(ControlHandler::new(inner.clone()));

    loop {
        let running = inner.is_serving(generation);

        tokio::select! {
            Some(event) = advertiser_events.recv() => {
                inner.on_advertiser_event(generation, event);
            }
            result = listener.accept(), if running => {
                match result {
                    Ok((stream, addr)) => {
                        let conn_shutdown = shutdown.subscribe();
                        if !inner.is_serving(generation) {
                            continue;
                        }
                        let _ = stream.set_nodelay(true);
                        inner.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                        inner.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                        let inner = Arc::clone(&inner);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let result = handle_connection(stream, addr, &inner, &handler, conn_shutdown).await;
                            if let Err(e) = result {
                                tracing::debug!("Connection {} error: {}", addr, e);
                            }
                            inner.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            tracing::debug!("Client disconnected: {}", addr);
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = wait_until(deadline), if !running && deadline.is_some() => {
                if let Some(timeout) = timeout {
                    if inner.on_discovery_timeout(generation, timeout).await {
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    if let Ok(addr) = listener.local_addr() {
        tracing::debug!("Control socket on port {} closed", addr.port());
    }
}

/// Serves one control connection: requests are answered strictly in order.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    inner: &ServerInner,
    handler: &ControlHandler,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    tracing::debug!("Client connected: {}", addr);

    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => return Ok(()),
                    Ok(n) => decoder.extend(&buf[..n]),
                    Err(e) => return Err(e.into()),
                }
            }
            _ = shutdown.recv() => {
                return Ok(());
            }
        }

        while let Some(message) = decoder.decode_message()? {
            inner.stats.requests_total.fetch_add(1, Ordering::Relaxed);

            let reply = handler.handle(&message);
            if reply.is_error() {
                inner.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!("[{}] Reply: {}", addr, reply.kind);

            let bytes = Encoder::encode_reply(reply)?;
            stream.write_all(&bytes).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertiser::{full_service_name, FakeAdvertiser, LOCAL_DOMAIN};
    use crate::error::AdvertiserError;
    use std::sync::atomic::AtomicUsize;
    use streamkinect_client::ControlClient;
    use streamkinect_core::{
        DepthFrameSource, Listeners, SimulatedDevice, SimulatedSourceConfig,
    };

    /// Advertiser whose notifications are raised by the test itself.
    #[derive(Default)]
    struct ManualAdvertiser {
        listeners: Listeners<AdvertiserEvent>,
        resolves: AtomicUsize,
    }

    impl ManualAdvertiser {
        fn resolves(&self) -> usize {
            self.resolves.load(Ordering::SeqCst)
        }

        fn registered(&self) {
            self.listeners.notify(&AdvertiserEvent::Registered {
                name: "test server".to_string(),
                service_type: SERVICE_TYPE.to_string(),
                domain: LOCAL_DOMAIN.to_string(),
            });
        }

        fn resolved(&self, port: u16) {
            self.listeners.notify(&resolved_event(port));
        }
    }

    impl ServiceAdvertiser for ManualAdvertiser {
        fn events(&self) -> &Listeners<AdvertiserEvent> {
            &self.listeners
        }

        fn register(&self, _: &str, _: &str, _: u16) -> Result<(), AdvertiserError> {
            Ok(())
        }

        fn resolve(&self, _: &str, _: &str, _: &str) -> Result<(), AdvertiserError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn withdraw(&self) {}
    }

    fn resolved_event(port: u16) -> AdvertiserEvent {
        AdvertiserEvent::Resolved {
            fullname: full_service_name("test server", SERVICE_TYPE, LOCAL_DOMAIN),
            hostname: "localhost".to_string(),
            port,
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Gives the reactor time to apply notifications that have no visible
    /// effect.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    fn generation(server: &Server) -> u64 {
        server.inner.lifecycle.lock().generation
    }

    fn test_config() -> ServerConfig {
        ServerConfig::default()
            .with_name("test server")
            .with_control_bind("127.0.0.1:0".parse().unwrap())
            .with_discovery_timeout(Some(Duration::from_millis(500)))
    }

    fn small_device() -> Arc<dyn Device> {
        Arc::new(SimulatedDevice::new(SimulatedSourceConfig {
            width: 32,
            height: 24,
            fps: 50,
        }))
    }

    async fn next_event(events: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for server event")
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_server_is_stopped() {
        let server = Server::new(test_config()).unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!server.is_running());
        assert!(server.control_port().is_none());
        assert_eq!(server.name(), "test server");
    }

    #[tokio::test]
    async fn test_start_reaches_running() {
        let server = Server::new(test_config()).unwrap();
        let mut events = server.subscribe_events();

        server.start(Arc::new(FakeAdvertiser::new())).unwrap();
        assert_ne!(server.state(), ServerState::Stopped);

        assert_eq!(next_event(&mut events).await, ServerEvent::Started);
        assert!(server.is_running());
        assert_eq!(server.hostname().as_deref(), Some("localhost"));
        assert!(server.control_port().is_some());

        server.stop().await.unwrap();
        assert_eq!(next_event(&mut events).await, ServerEvent::Stopped);
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = Server::new(test_config()).unwrap();
        server.start(Arc::new(FakeAdvertiser::new())).unwrap();

        let err = server.start(Arc::new(FakeAdvertiser::new())).unwrap_err();
        assert!(matches!(err, ServerError::InvalidState("already running")));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_fails() {
        let server = Server::new(test_config()).unwrap();
        let err = server.stop().await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidState("not running")));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = Server::new(test_config()).unwrap();
        let mut events = server.subscribe_events();

        for _ in 0..2 {
            server.start(Arc::new(FakeAdvertiser::new())).unwrap();
            assert_eq!(next_event(&mut events).await, ServerEvent::Started);
            server.stop().await.unwrap();
            assert_eq!(next_event(&mut events).await, ServerEvent::Stopped);
        }
    }

    #[tokio::test]
    async fn test_mismatched_port_times_out() {
        let advertiser = Arc::new(FakeAdvertiser::new().with_entry("test server", 1));
        let server = Server::new(test_config()).unwrap();
        let mut events = server.subscribe_events();

        server.start(advertiser.clone()).unwrap();

        match next_event(&mut events).await {
            ServerEvent::StartFailed { reason } => assert!(reason.contains("timed out")),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(advertiser.events().is_empty());

        // Stopped again, so another start is allowed.
        server.start(Arc::new(FakeAdvertiser::new())).unwrap();
        assert_eq!(next_event(&mut events).await, ServerEvent::Started);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_withdraws_and_unsubscribes() {
        let advertiser = Arc::new(FakeAdvertiser::new());
        let server = Server::new(test_config()).unwrap();
        let mut events = server.subscribe_events();

        server.start(advertiser.clone()).unwrap();
        assert_eq!(next_event(&mut events).await, ServerEvent::Started);
        assert_eq!(advertiser.registrations(), vec!["test server".to_string()]);
        assert_eq!(advertiser.events().len(), 1);

        server.stop().await.unwrap();
        assert!(advertiser.registrations().is_empty());
        assert!(advertiser.events().is_empty());
    }

    #[tokio::test]
    async fn test_ping_and_who() {
        let server = Server::new(test_config()).unwrap();
        let mut events = server.subscribe_events();
        server.add_device(small_device()).unwrap();

        server.start(Arc::new(FakeAdvertiser::new())).unwrap();
        assert_eq!(next_event(&mut events).await, ServerEvent::Started);

        let port = server.control_port().unwrap();
        let mut client = ControlClient::connect(&format!("127.0.0.1:{}", port))
            .await
            .unwrap();

        client.ping().await.unwrap();

        let me = client.who().await.unwrap();
        assert_eq!(me.version, 1);
        assert_eq!(me.name, "test server");
        assert_eq!(
            me.control_endpoint(),
            Some(format!("tcp://localhost:{}", port).as_str())
        );
        assert_eq!(me.devices.len(), 1);
        let depth = me.devices[0].depth_endpoint().unwrap().to_string();

        // The depth endpoint is created once.
        let again = client.who().await.unwrap();
        assert_eq!(again.devices[0].depth_endpoint(), Some(depth.as_str()));

        assert_eq!(server.stats().requests_total.load(Ordering::Relaxed), 3);
        assert_eq!(server.stats().errors_total.load(Ordering::Relaxed), 0);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_device_lifecycle_follows_server() {
        let server = Server::new(test_config()).unwrap();
        let mut events = server.subscribe_events();

        let device = small_device();
        let source = device.depth_frame_source();
        server.add_device(device.clone()).unwrap();
        assert!(!source.is_running());

        let err = server.add_device(device.clone()).unwrap_err();
        assert!(matches!(err, ServerError::DuplicateDevice(_)));

        server.start(Arc::new(FakeAdvertiser::new())).unwrap();
        assert!(source.is_running());
        assert_eq!(next_event(&mut events).await, ServerEvent::Started);

        server.stop().await.unwrap();
        assert!(!source.is_running());

        assert!(server.remove_device(device.unique_id()).await);
        assert!(!server.remove_device(device.unique_id()).await);
        assert!(server.devices().is_empty());
    }

    #[tokio::test]
    async fn test_add_device_while_running_starts_it() {
        let server = Server::new(test_config()).unwrap();
        let mut events = server.subscribe_events();
        server.start(Arc::new(FakeAdvertiser::new())).unwrap();
        assert_eq!(next_event(&mut events).await, ServerEvent::Started);

        let device = small_device();
        server.add_device(device.clone()).unwrap();
        assert!(device.depth_frame_source().is_running());

        assert!(server.remove_device(device.unique_id()).await);
        assert!(!device.depth_frame_source().is_running());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolution_before_registration_is_ignored() {
        let advertiser = Arc::new(ManualAdvertiser::default());
        let server = Server::new(test_config().with_discovery_timeout(None)).unwrap();
        let mut events = server.subscribe_events();

        server.start(advertiser.clone()).unwrap();
        let port = server.control_port().unwrap();

        // Applied in order: if the early resolution counted, the registration
        // that follows would be ignored and resolve never called.
        advertiser.resolved(port);
        advertiser.registered();
        wait_for(|| advertiser.resolves() == 1).await;

        assert_eq!(server.state(), ServerState::WaitingForResolve);
        assert!(server.hostname().is_none());
        assert!(events.try_recv().is_err());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_registration_resolves_once() {
        let advertiser = Arc::new(ManualAdvertiser::default());
        let server = Server::new(test_config().with_discovery_timeout(None)).unwrap();
        let mut events = server.subscribe_events();

        server.start(advertiser.clone()).unwrap();
        let port = server.control_port().unwrap();

        advertiser.registered();
        advertiser.registered();
        advertiser.resolved(port);
        assert_eq!(next_event(&mut events).await, ServerEvent::Started);
        assert_eq!(advertiser.resolves(), 1);

        // Once running, neither notification has any effect.
        advertiser.registered();
        advertiser.resolved(port);
        settle().await;

        assert_eq!(advertiser.resolves(), 1);
        assert!(server.is_running());
        assert!(events.try_recv().is_err());

        server.stop().await.unwrap();
        assert_eq!(next_event(&mut events).await, ServerEvent::Stopped);
    }

    #[tokio::test]
    async fn test_previous_run_notifications_are_ignored() {
        let first = Arc::new(ManualAdvertiser::default());
        let server = Server::new(test_config().with_discovery_timeout(None)).unwrap();
        let mut events = server.subscribe_events();

        server.start(first.clone()).unwrap();
        let old_generation = generation(&server);
        let old_port = server.control_port().unwrap();
        server.stop().await.unwrap();
        assert_eq!(next_event(&mut events).await, ServerEvent::Stopped);

        let second = Arc::new(ManualAdvertiser::default());
        server.start(second.clone()).unwrap();
        let port = server.control_port().unwrap();
        assert_ne!(generation(&server), old_generation);

        // Late notifications from the first advertiser reach nobody.
        assert!(first.events().is_empty());
        first.registered();
        first.resolved(old_port);

        // Events tagged with the previous run are dropped on arrival.
        server.inner.on_advertiser_event(
            old_generation,
            AdvertiserEvent::Registered {
                name: "test server".to_string(),
                service_type: SERVICE_TYPE.to_string(),
                domain: LOCAL_DOMAIN.to_string(),
            },
        );
        assert_eq!(server.state(), ServerState::WaitingForRegistration);

        second.registered();
        wait_for(|| second.resolves() == 1).await;
        server
            .inner
            .on_advertiser_event(old_generation, resolved_event(port));
        assert_eq!(server.state(), ServerState::WaitingForResolve);
        assert_eq!(first.resolves(), 0);
        assert!(events.try_recv().is_err());

        second.resolved(port);
        assert_eq!(next_event(&mut events).await, ServerEvent::Started);
        server.stop().await.unwrap();
    }
}
