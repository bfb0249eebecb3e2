//! Client lifecycle tests
//!
//! Exercises the orchestrator against mock collaborators (engine factory,
//! TUN factory, route table, packet pipe): connect validation, route
//! ordering, disconnect deadline handling and error joining.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tunshift::client::ClientError;
use tunshift::config::{Config, ProxyAddr};
use tunshift::engine::{EngineConfig, EngineError, EngineFactory, ProxyEngine};
use tunshift::link::Link;
use tunshift::pipe::{PacketPipe, PipeError};
use tunshift::route::{RouteError, RouteSpec, RouteTable};
use tunshift::tun::{PacketIo, TunDevice, TunError, TunFactory, TunOptions};
use tunshift::{Client, Error};

const GATEWAY: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);
const SERVER: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 3);
const LINK: &str = "vless://test-account@127.0.0.3:443?security=tls";

fn server_net() -> Ipv4Net {
    Ipv4Net::new(SERVER, 32).unwrap()
}

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockEngine {
    starts: AtomicUsize,
    closes: AtomicUsize,
    close_error: Mutex<Option<String>>,
}

struct SharedEngine(Arc<MockEngine>);

#[async_trait]
impl ProxyEngine for SharedEngine {
    async fn start(&self) -> Result<(), EngineError> {
        self.0.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        match self.0.close_error.lock().unwrap().clone() {
            Some(msg) => Err(EngineError::Shutdown(msg)),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct MockEngineFactory {
    engine: Arc<MockEngine>,
    creates: AtomicUsize,
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        _link: &Link,
        _cfg: &EngineConfig,
    ) -> Result<Box<dyn ProxyEngine>, EngineError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SharedEngine(Arc::clone(&self.engine))))
    }
}

/// Size of the single frame [`MockTun`] hands out before blocking.
const MOCK_FRAME_LEN: usize = 40;

struct MockTun {
    closes: AtomicUsize,
    reads: AtomicUsize,
    close_error: Mutex<Option<String>>,
    closed: CancellationToken,
}

impl Default for MockTun {
    fn default() -> Self {
        Self {
            closes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            close_error: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl PacketIo for MockTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // One frame of traffic, then quiet until closed.
        if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(MOCK_FRAME_LEN.min(buf.len()));
        }
        self.closed.cancelled().await;
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"))
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        match self.close_error.lock().unwrap().clone() {
            Some(msg) => Err(io::Error::new(io::ErrorKind::Other, msg)),
            None => Ok(()),
        }
    }
}

impl TunDevice for MockTun {
    fn name(&self) -> &str {
        "utun9"
    }
}

#[derive(Default)]
struct MockTunFactory {
    tun: Arc<MockTun>,
    opens: AtomicUsize,
}

#[async_trait]
impl TunFactory for MockTunFactory {
    async fn open(&self, _opts: &TunOptions) -> Result<Arc<dyn TunDevice>, TunError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.tun) as Arc<dyn TunDevice>)
    }
}

#[derive(Default)]
struct MockRouteTable {
    installed: Mutex<Vec<RouteSpec>>,
    adds: Mutex<Vec<RouteSpec>>,
    deletes: Mutex<Vec<RouteSpec>>,
    fail_interface_add: bool,
}

#[async_trait]
impl RouteTable for MockRouteTable {
    async fn add(&self, spec: &RouteSpec) -> Result<(), RouteError> {
        self.adds.lock().unwrap().push(spec.clone());
        if self.fail_interface_add && spec.if_name.is_some() {
            return Err(RouteError::CommandFailed {
                tool: "ip",
                action: "add",
                prefix: "0.0.0.0/1".into(),
                stderr: "permission denied".into(),
            });
        }
        self.installed.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn delete(&self, spec: &RouteSpec) -> Result<(), RouteError> {
        self.deletes.lock().unwrap().push(spec.clone());
        let mut installed = self.installed.lock().unwrap();
        match installed.iter().position(|s| s == spec) {
            Some(idx) => {
                installed.remove(idx);
                Ok(())
            }
            None => Err(RouteError::NotFound),
        }
    }

    async fn default_gateway(&self) -> Result<Ipv4Addr, RouteError> {
        Ok(GATEWAY)
    }
}

/// Bytes [`PipeBehavior::PumpOnceThenCancel`] writes back to the device.
const MOCK_REPLY_LEN: usize = 24;

#[derive(Clone, Copy)]
enum PipeBehavior {
    /// Returns success once cancelled.
    CleanOnCancel,
    /// Moves one frame in each direction through the device handle, then
    /// behaves like [`PipeBehavior::CleanOnCancel`].
    PumpOnceThenCancel,
    /// Returns an error once cancelled.
    ErrorOnCancel(&'static str),
    /// Ignores cancellation and never returns.
    NeverReturns,
}

struct MockPipe {
    behavior: PipeBehavior,
    copies: AtomicUsize,
}

impl MockPipe {
    fn new(behavior: PipeBehavior) -> Self {
        Self {
            behavior,
            copies: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PacketPipe for MockPipe {
    async fn copy(
        &self,
        cancel: CancellationToken,
        io: Arc<dyn PacketIo>,
        _socks: SocketAddr,
    ) -> Result<(), PipeError> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            PipeBehavior::CleanOnCancel => {
                cancel.cancelled().await;
                Ok(())
            }
            PipeBehavior::PumpOnceThenCancel => {
                let mut buf = [0u8; 2048];
                let _ = io.recv(&mut buf).await;
                let _ = io.send(&buf[..MOCK_REPLY_LEN]).await;
                cancel.cancelled().await;
                Ok(())
            }
            PipeBehavior::ErrorOnCancel(msg) => {
                cancel.cancelled().await;
                Err(PipeError::Socks(msg.to_string()))
            }
            PipeBehavior::NeverReturns => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Mocks {
    engine: Arc<MockEngine>,
    factory: Arc<MockEngineFactory>,
    tun: Arc<MockTun>,
    tun_factory: Arc<MockTunFactory>,
    routes: Arc<MockRouteTable>,
    pipe: Arc<MockPipe>,
}

impl Mocks {
    fn new(pipe_behavior: PipeBehavior) -> Self {
        let engine = Arc::new(MockEngine::default());
        let factory = Arc::new(MockEngineFactory {
            engine: Arc::clone(&engine),
            creates: AtomicUsize::new(0),
        });
        let tun = Arc::new(MockTun::default());
        let tun_factory = Arc::new(MockTunFactory {
            tun: Arc::clone(&tun),
            opens: AtomicUsize::new(0),
        });
        Self {
            engine,
            factory,
            tun,
            tun_factory,
            routes: Arc::new(MockRouteTable::default()),
            pipe: Arc::new(MockPipe::new(pipe_behavior)),
        }
    }

    fn config(&self) -> Config {
        Config {
            gateway_ip: Some(GATEWAY),
            inbound_proxy: Some(ProxyAddr::loopback(10234)),
            engine_factory: Some(self.factory.clone() as Arc<dyn EngineFactory>),
            tun_factory: Some(self.tun_factory.clone() as Arc<dyn TunFactory>),
            route_table: Some(self.routes.clone() as Arc<dyn RouteTable>),
            packet_pipe: Some(self.pipe.clone() as Arc<dyn PacketPipe>),
            ..Config::default()
        }
    }

    async fn client(&self) -> Client {
        Client::new_with(self.config()).await.unwrap()
    }
}

fn exception_spec() -> RouteSpec {
    RouteSpec::via_gateway(GATEWAY, vec![server_net()])
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_happy_path() {
    let mocks = Mocks::new(PipeBehavior::CleanOnCancel);
    let client = mocks.client().await;

    client.connect(LINK).await.unwrap();
    // Let the spawned pipe task get its first poll.
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(mocks.factory.creates.load(Ordering::SeqCst), 1);
    assert_eq!(mocks.engine.starts.load(Ordering::SeqCst), 1);
    assert_eq!(mocks.tun_factory.opens.load(Ordering::SeqCst), 1);
    assert_eq!(mocks.pipe.copies.load(Ordering::SeqCst), 1);

    // Dangling-state cleanup ran before installing anything.
    let deletes = mocks.routes.deletes.lock().unwrap().clone();
    assert_eq!(deletes, vec![exception_spec()]);

    // Exception route first, tunnel routes after; never the other way.
    let adds = mocks.routes.adds.lock().unwrap().clone();
    assert_eq!(adds.len(), 2);
    assert_eq!(adds[0], exception_spec());
    assert_eq!(
        adds[1],
        RouteSpec::via_interface(
            "utun9",
            vec!["0.0.0.0/1".parse().unwrap(), "128.0.0.0/1".parse().unwrap()],
        )
    );

    client.disconnect(None).await.unwrap();
}

#[tokio::test]
async fn connect_rejects_garbage_link() {
    let mocks = Mocks::new(PipeBehavior::CleanOnCancel);
    let client = mocks.client().await;

    let err = client.connect("invalid_link").await.unwrap_err();
    assert!(err
        .to_string()
        .contains("invalid config: protocol create"));

    // Nothing was touched.
    assert_eq!(mocks.factory.creates.load(Ordering::SeqCst), 0);
    assert_eq!(mocks.tun_factory.opens.load(Ordering::SeqCst), 0);
    assert!(mocks.routes.adds.lock().unwrap().is_empty());
    assert!(mocks.routes.deletes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn connect_rejects_link_without_port() {
    let mocks = Mocks::new(PipeBehavior::CleanOnCancel);
    let client = mocks.client().await;

    let err = client.connect("vless://example.com").await.unwrap_err();
    assert!(err.to_string().contains("invalid config: parse"));
    assert_eq!(mocks.factory.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let mocks = Mocks::new(PipeBehavior::CleanOnCancel);
    let client = mocks.client().await;

    client.connect(LINK).await.unwrap();
    let err = client.connect(LINK).await.unwrap_err();
    assert!(matches!(err, Error::Client(ClientError::AlreadyConnected)));

    client.disconnect(None).await.unwrap();
}

#[tokio::test]
async fn disconnect_without_connect_is_a_no_op() {
    let mocks = Mocks::new(PipeBehavior::CleanOnCancel);
    let client = mocks.client().await;

    client.disconnect(None).await.unwrap();

    assert_eq!(mocks.engine.closes.load(Ordering::SeqCst), 0);
    assert_eq!(mocks.tun.closes.load(Ordering::SeqCst), 0);
    assert!(mocks.routes.deletes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let mocks = Mocks::new(PipeBehavior::CleanOnCancel);
    let client = mocks.client().await;

    client.connect(LINK).await.unwrap();
    client.disconnect(None).await.unwrap();
    client.disconnect(None).await.unwrap();
    client.disconnect(None).await.unwrap();

    // Only the first disconnect performed work.
    assert_eq!(mocks.engine.closes.load(Ordering::SeqCst), 1);
    assert_eq!(mocks.tun.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_deadline_expires_when_pipe_hangs() {
    let mocks = Mocks::new(PipeBehavior::NeverReturns);
    let client = mocks.client().await;

    client.connect(LINK).await.unwrap();
    let err = client
        .disconnect(Some(Duration::from_millis(10)))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("disconnect deadline exceeded"));

    // Teardown still ran exactly once per collaborator.
    assert_eq!(mocks.engine.closes.load(Ordering::SeqCst), 1);
    assert_eq!(mocks.tun.closes.load(Ordering::SeqCst), 1);

    // The last delete removed the exception route keyed by the configured
    // gateway and the server /32.
    let deletes = mocks.routes.deletes.lock().unwrap().clone();
    assert_eq!(deletes.last().unwrap(), &exception_spec());

    // The client is disconnected regardless: another disconnect is a no-op.
    client.disconnect(None).await.unwrap();
    assert_eq!(mocks.engine.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_joins_every_failure() {
    let mocks = Mocks::new(PipeBehavior::ErrorOnCancel("stop err"));
    *mocks.engine.close_error.lock().unwrap() = Some("instance close err".into());
    *mocks.tun.close_error.lock().unwrap() = Some("tun close err".into());
    let client = mocks.client().await;

    client.connect(LINK).await.unwrap();
    let err = client.disconnect(None).await.unwrap_err();

    let msg = err.to_string();
    assert!(msg.contains("instance close err"), "missing engine error: {msg}");
    assert!(msg.contains("tun close err"), "missing tun error: {msg}");
    assert!(msg.contains("stop err"), "missing pipe error: {msg}");

    // Despite the failures the state machine reached disconnected.
    client.disconnect(None).await.unwrap();
}

#[tokio::test]
async fn failed_tunnel_route_rolls_everything_back() {
    let mut mocks = Mocks::new(PipeBehavior::CleanOnCancel);
    mocks.routes = Arc::new(MockRouteTable {
        fail_interface_add: true,
        ..MockRouteTable::default()
    });
    let client = mocks.client().await;

    let err = client.connect(LINK).await.unwrap_err();
    assert!(matches!(err, Error::Client(ClientError::RouteSetup(_))));

    // Engine and TUN were closed, the exception route was removed again and
    // the pipe never started.
    assert_eq!(mocks.engine.closes.load(Ordering::SeqCst), 1);
    assert_eq!(mocks.tun.closes.load(Ordering::SeqCst), 1);
    assert!(mocks.routes.installed.lock().unwrap().is_empty());
    assert_eq!(mocks.pipe.copies.load(Ordering::SeqCst), 0);

    // The failed connect left no session behind, so this is a no-op.
    client.disconnect(None).await.unwrap();
    assert_eq!(mocks.engine.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn counters_stay_readable_after_disconnect() {
    let mocks = Mocks::new(PipeBehavior::PumpOnceThenCancel);
    let client = mocks.client().await;

    assert_eq!(client.bytes_read(), 0);
    assert_eq!(client.bytes_written(), 0);

    client.connect(LINK).await.unwrap();
    // Let the pipe task move its one frame in each direction.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.bytes_read(), MOCK_FRAME_LEN as u64);
    assert_eq!(client.bytes_written(), MOCK_REPLY_LEN as u64);

    client.disconnect(None).await.unwrap();

    // Counters are not zeroed on disconnect; the last-known values remain.
    assert_eq!(client.bytes_read(), MOCK_FRAME_LEN as u64);
    assert_eq!(client.bytes_written(), MOCK_REPLY_LEN as u64);
    assert!(client.stats().is_some());
}

#[tokio::test]
async fn accessors_report_configuration() {
    let mocks = Mocks::new(PipeBehavior::CleanOnCancel);
    let client = mocks.client().await;

    assert_eq!(client.gateway_ip(), GATEWAY);
    assert_eq!(client.inbound_proxy(), ProxyAddr::loopback(10234));
    assert_eq!(client.tun_address(), Ipv4Addr::new(192, 18, 0, 1));
}
