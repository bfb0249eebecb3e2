//! Tunnel lifecycle orchestrator
//!
//! [`Client`] wires the collaborators together: it builds the outbound
//! engine from a connection link, creates and addresses the TUN device,
//! installs the server-exception route before the tunnel routes (the order
//! prevents a forwarding loop), runs the packet pipe, and tears everything
//! down deterministically on disconnect.
//!
//! Connecting does not replace the system default route; the split-default
//! pair only shadows it, so the host's routing is intact once the session
//! ends.

mod watcher;

use crate::config::{
    default_routes_to_tun, default_tun_address, free_inbound_port, Config, DebugOptions, ProxyAddr,
};
use crate::diag;
use crate::engine::{EngineConfig, EngineError, EngineFactory, EngineLogLevel, ProxyEngine};
use crate::link::{Link, LinkError};
use crate::metrics::{IoMetrics, IoStats};
use crate::pipe::{InstrumentedPipe, LwipPipe, PacketPipe, PipeError};
use crate::route::{RouteError, RouteSpec, RouteTable, SystemRouteTable};
use crate::tun::{NativeTunFactory, PacketIo, TunError, TunFactory, TunOptions};
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound applied to every disconnect, on top of the caller's deadline.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settle delay after `engine.start()`; the engine needs a moment before its
/// inbound accepts connections.
const ENGINE_WARMUP: Duration = Duration::from_millis(100);

/// Client operation errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid config: {0}")]
    InvalidLink(#[source] LinkError),

    #[error("server address not resolvable: {0}")]
    UnresolvableServer(#[source] LinkError),

    #[error("create proxy engine: {0}")]
    EngineCreate(#[source] EngineError),

    #[error("start proxy engine: {0}")]
    EngineStart(#[source] EngineError),

    #[error("close proxy engine: {0}")]
    EngineClose(#[source] EngineError),

    #[error("setup TUN device: {0}")]
    TunSetup(#[source] TunError),

    #[error("close TUN device: {0}")]
    TunClose(#[source] std::io::Error),

    #[error("add route: {0}")]
    RouteSetup(#[source] RouteError),

    #[error("delete route: {0}")]
    RouteCleanup(#[source] RouteError),

    #[error("discover gateway: {0}")]
    GatewayDiscovery(#[source] RouteError),

    #[error("tunnel pipe: {0}")]
    Pipe(#[source] PipeError),

    #[error("already connected")]
    AlreadyConnected,

    #[error("disconnect deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Disconnect(DisconnectError),

    #[error("configuration: {0}")]
    Config(String),
}

/// Every failure collected while tearing a session down. Teardown always runs
/// all steps; this joins whatever went wrong.
#[derive(Debug, Default)]
pub struct DisconnectError {
    errors: Vec<ClientError>,
}

impl DisconnectError {
    fn push(&mut self, err: ClientError) {
        self.errors.push(err);
    }

    fn prepend(&mut self, err: ClientError) {
        self.errors.insert(0, err);
    }

    /// The individual teardown failures, in the order they surfaced.
    pub fn errors(&self) -> &[ClientError] {
        &self.errors
    }

    fn into_result(self) -> Result<(), ClientError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ClientError::Disconnect(self))
        }
    }
}

impl fmt::Display for DisconnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DisconnectError {}

/// Live per-connection state.
struct Session {
    engine: Box<dyn ProxyEngine>,
    tun: Arc<IoMetrics>,
    server_ip: Ipv4Addr,
    cancel: CancellationToken,
    stopped: oneshot::Receiver<Result<(), PipeError>>,
    observers: Vec<JoinHandle<()>>,
}

/// The VPN client. Connecting routes host traffic (or the prefixes given in
/// [`Config::routes_to_tun`]) through the remote server behind the
/// connection link.
///
/// Safe to share across tasks; at most one session exists at a time.
pub struct Client {
    inbound: ProxyAddr,
    tun_address: Ipv4Net,
    routes_to_tun: Vec<Ipv4Net>,
    tls_allow_insecure: bool,
    outbound_log_level: EngineLogLevel,
    debug: bool,
    debug_options: DebugOptions,

    engine_factory: Arc<dyn EngineFactory>,
    tun_factory: Arc<dyn TunFactory>,
    route_table: Arc<dyn RouteTable>,
    pipe: Arc<dyn PacketPipe>,

    // Read-mostly; written only by the gateway watcher. Always read by
    // value-copy, never held across an await.
    gateway: Arc<RwLock<Ipv4Addr>>,
    session: Mutex<Option<Session>>,
    // Survives the session so counters stay readable after disconnect.
    last_metrics: StdMutex<Option<Arc<IoMetrics>>>,
}

impl Client {
    /// Creates a client with auto-discovered gateway and default settings.
    pub async fn new_default() -> crate::Result<Self> {
        Self::new_with(Config::default()).await
    }

    /// Creates a client, overlaying the set fields of `cfg` onto the
    /// defaults.
    pub async fn new_with(cfg: Config) -> crate::Result<Self> {
        let route_table = cfg
            .route_table
            .unwrap_or_else(|| Arc::new(SystemRouteTable::default()));

        let gateway = match cfg.gateway_ip {
            Some(ip) => ip,
            None => route_table
                .default_gateway()
                .await
                .map_err(ClientError::GatewayDiscovery)?,
        };

        let debug_options = cfg.debug_options.unwrap_or_default().normalized();

        let mut pipe: Arc<dyn PacketPipe> =
            cfg.packet_pipe.unwrap_or_else(|| Arc::new(LwipPipe));
        if cfg.debug && debug_options.verbose_pipe {
            pipe = InstrumentedPipe::wrap(pipe);
        }

        Ok(Self {
            inbound: cfg
                .inbound_proxy
                .unwrap_or_else(|| ProxyAddr::loopback(free_inbound_port())),
            tun_address: cfg.tun_address.unwrap_or_else(default_tun_address),
            routes_to_tun: cfg.routes_to_tun.unwrap_or_else(default_routes_to_tun),
            tls_allow_insecure: cfg.tls_allow_insecure,
            outbound_log_level: cfg
                .outbound_log_level
                .unwrap_or_else(EngineLogLevel::from_tracing),
            debug: cfg.debug,
            debug_options,
            engine_factory: cfg
                .engine_factory
                .unwrap_or_else(|| Arc::new(crate::engine::RelayEngineFactory)),
            tun_factory: cfg
                .tun_factory
                .unwrap_or_else(|| Arc::new(NativeTunFactory)),
            route_table,
            pipe,
            gateway: Arc::new(RwLock::new(gateway)),
            session: Mutex::new(None),
            last_metrics: StdMutex::new(None),
        })
    }

    /// Gateway IP outbound engine traffic is routed through.
    pub fn gateway_ip(&self) -> Ipv4Addr {
        *self.gateway.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address the TUN device is (or will be) set up on.
    pub fn tun_address(&self) -> Ipv4Addr {
        self.tun_address.addr()
    }

    /// Loopback proxy address the engine accepts SOCKS traffic on.
    pub fn inbound_proxy(&self) -> ProxyAddr {
        self.inbound
    }

    /// Bytes read from the TUN device over the lifetime of the last session.
    pub fn bytes_read(&self) -> u64 {
        self.current_metrics().map_or(0, |m| m.bytes_read())
    }

    /// Bytes written to the TUN device over the lifetime of the last session.
    pub fn bytes_written(&self) -> u64 {
        self.current_metrics().map_or(0, |m| m.bytes_written())
    }

    /// Traffic counter snapshot, if a session ever started.
    pub fn stats(&self) -> Option<IoStats> {
        self.current_metrics().map(|m| m.stats())
    }

    fn current_metrics(&self) -> Option<Arc<IoMetrics>> {
        self.last_metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Host route sending remote-server traffic via the current gateway,
    /// keeping the engine's own packets out of the tunnel.
    fn exception_route(&self, server_ip: Ipv4Addr) -> RouteSpec {
        RouteSpec::via_gateway(self.gateway_ip(), vec![Ipv4Net::from(server_ip)])
    }

    /// Connects the tunnel: builds and starts the engine for `link`, brings
    /// up the TUN device, installs routes and starts piping packets.
    ///
    /// On failure, everything installed up to that point is rolled back
    /// best-effort and the client stays disconnected.
    pub async fn connect(&self, link: &str) -> crate::Result<()> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(ClientError::AlreadyConnected.into());
        }
        debug!(
            inbound = %self.inbound,
            tun_address = %self.tun_address,
            gateway = %self.gateway_ip(),
            "connecting tunnel"
        );

        let link = Link::parse(link).map_err(ClientError::InvalidLink)?;

        let engine_cfg = EngineConfig {
            inbound: self.inbound,
            tls_allow_insecure: self.tls_allow_insecure,
            log_level: self.outbound_log_level,
        };
        let engine = self
            .engine_factory
            .create(&link, &engine_cfg)
            .await
            .map_err(ClientError::EngineCreate)?;
        debug!(protocol = link.protocol.scheme(), "engine created");

        let server = link
            .resolve()
            .await
            .map_err(ClientError::UnresolvableServer)?;

        if let Err(err) = engine.start().await {
            self.close_engine(engine.as_ref()).await;
            return Err(ClientError::EngineStart(err).into());
        }
        tokio::time::sleep(ENGINE_WARMUP).await;
        debug!("engine started");

        let tun = match self.tun_factory.open(&TunOptions::new(self.tun_address)).await {
            Ok(tun) => tun,
            Err(err) => {
                self.close_engine(engine.as_ref()).await;
                return Err(ClientError::TunSetup(err).into());
            }
        };
        let tun_name = tun.name().to_string();
        let metrics = IoMetrics::wrap(tun);

        // Clear a dangling exception route from a previous crashed run.
        let exception = self.exception_route(server.address);
        match self.route_table.delete(&exception).await {
            Ok(()) => debug!("deleted dangling exception route"),
            Err(RouteError::NotFound) => {}
            Err(err) => debug!(error = %err, "dangling exception route cleanup failed"),
        }

        // The exception must exist before the tunnel routes, otherwise engine
        // packets to the server would be captured by 0.0.0.0/1 and loop.
        if let Err(err) = self.route_table.add(&exception).await {
            self.close_tun(&metrics).await;
            self.close_engine(engine.as_ref()).await;
            return Err(ClientError::RouteSetup(err).into());
        }
        debug!(server = %server.address, "exception route installed");

        let tunnel_routes = RouteSpec::via_interface(tun_name, self.routes_to_tun.clone());
        if let Err(err) = self.route_table.add(&tunnel_routes).await {
            self.delete_exception_route(server.address).await;
            self.close_tun(&metrics).await;
            self.close_engine(engine.as_ref()).await;
            return Err(ClientError::RouteSetup(err).into());
        }
        debug!(routes = ?self.routes_to_tun, "tunnel routes installed");

        let cancel = CancellationToken::new();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        {
            let pipe = Arc::clone(&self.pipe);
            let io: Arc<dyn PacketIo> = metrics.clone();
            let socks = self.inbound.socket_addr();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = pipe.copy(cancel, io, socks).await;
                match &result {
                    Ok(()) => debug!("tunnel pipe closed"),
                    Err(err) => warn!(error = %err, "tunnel pipe closed with error"),
                }
                let _ = stopped_tx.send(result);
            });
        }

        let mut observers = vec![watcher::spawn(
            Arc::clone(&self.gateway),
            Arc::clone(&self.route_table),
            server.address,
            self.debug_options.gateway_interval,
            cancel.clone(),
        )];
        if self.debug {
            observers.push(diag::spawn_resource_monitor(
                metrics.clone(),
                self.debug_options.resource_interval,
                cancel.clone(),
            ));
        }

        *self
            .last_metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(metrics.clone());
        *slot = Some(Session {
            engine,
            tun: metrics,
            server_ip: server.address,
            cancel,
            stopped: stopped_rx,
            observers,
        });
        debug!("client connected");

        Ok(())
    }

    /// Disconnects the tunnel.
    ///
    /// Idempotent: returns success when no session is up. All teardown steps
    /// are attempted regardless of individual failures; their errors are
    /// joined. The call returns within `min(deadline, 30s)` even if the pipe
    /// task has not finished, in which case the task is left to honour the
    /// cancellation on its own and a deadline error is included.
    pub async fn disconnect(&self, deadline: Option<Duration>) -> crate::Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        let Session {
            engine,
            tun,
            server_ip,
            cancel,
            stopped,
            observers,
        } = session;

        cancel.cancel();

        let mut failures = DisconnectError::default();
        if let Err(err) = engine.close().await {
            failures.push(ClientError::EngineClose(err));
        }
        if let Err(err) = tun.close().await {
            failures.push(ClientError::TunClose(err));
        }
        match self.route_table.delete(&self.exception_route(server_ip)).await {
            Ok(()) | Err(RouteError::NotFound) => {}
            Err(err) => failures.push(ClientError::RouteCleanup(err)),
        }

        // Wait for the pipe to actually stop processing, bounded.
        let effective = deadline.map_or(DISCONNECT_TIMEOUT, |d| d.min(DISCONNECT_TIMEOUT));
        match tokio::time::timeout(effective, stopped).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(pipe_err))) => failures.prepend(ClientError::Pipe(pipe_err)),
            // The pipe task dropped its sender without reporting; nothing
            // left to wait for.
            Ok(Err(_)) => {}
            Err(_) => failures.prepend(ClientError::DeadlineExceeded),
        }

        for observer in observers {
            observer.abort();
        }

        let result = failures.into_result();
        if let Err(err) = &result {
            warn!(error = %err, "disconnect encountered failures");
        } else {
            debug!("client disconnected");
        }

        result.map_err(Into::into)
    }

    async fn close_engine(&self, engine: &dyn ProxyEngine) {
        if let Err(err) = engine.close().await {
            warn!(error = %err, "engine close failed during rollback");
        }
    }

    async fn close_tun(&self, tun: &IoMetrics) {
        if let Err(err) = tun.close().await {
            warn!(error = %err, "TUN close failed during rollback");
        }
    }

    /// Best-effort exception-route removal during rollback; reporting the
    /// original connect error matters more than this one.
    async fn delete_exception_route(&self, server_ip: Ipv4Addr) {
        match self.route_table.delete(&self.exception_route(server_ip)).await {
            Ok(()) | Err(RouteError::NotFound) => {}
            Err(err) => warn!(error = %err, "exception route rollback failed"),
        }
    }
}
