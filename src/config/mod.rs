//! Client configuration
//!
//! [`Config`] carries optional overrides for the [`crate::client::Client`]
//! defaults; unset fields keep their defaults. [`FileConfig`] is the
//! TOML-file counterpart used by the command-line binary.

use crate::engine::{EngineFactory, EngineLogLevel};
use crate::pipe::PacketPipe;
use crate::route::RouteTable;
use crate::tun::TunFactory;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Port the inbound proxy falls back to when no ephemeral port can be
/// reserved.
pub const FALLBACK_INBOUND_PORT: u16 = 10808;

/// MTU new TUN devices are created with.
pub const DEFAULT_TUN_MTU: u16 = 1500;

/// Address of the inbound proxy the outbound engine listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAddr {
    /// Inbound proxy IP (e.g. 127.0.0.1).
    pub ip: Ipv4Addr,
    /// Inbound proxy port (e.g. 1080).
    pub port: u16,
}

impl ProxyAddr {
    /// Loopback proxy address on the given port.
    pub fn loopback(port: u16) -> Self {
        Self {
            ip: Ipv4Addr::LOCALHOST,
            port,
        }
    }

    /// The address as a connectable socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Tuning for the background observers that run alongside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugOptions {
    /// How often resource/traffic snapshots are logged.
    pub resource_interval: Duration,
    /// How often the default gateway is re-validated.
    pub gateway_interval: Duration,
    /// Wrap the packet pipe with start/stop/duration logging.
    pub verbose_pipe: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            resource_interval: Duration::from_secs(5),
            gateway_interval: Duration::from_secs(3),
            verbose_pipe: true,
        }
    }
}

impl DebugOptions {
    /// Replaces zero intervals with their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.resource_interval.is_zero() {
            self.resource_interval = defaults.resource_interval;
        }
        if self.gateway_interval.is_zero() {
            self.gateway_interval = defaults.gateway_interval;
        }
        self
    }
}

/// Options for a new [`crate::client::Client`]. Empty fields are filled with
/// defaults.
///
/// It is advised to not configure the client yourself; `Client::new_default`
/// picks working values, and normally you don't have to set these fields.
#[derive(Clone, Default)]
pub struct Config {
    /// Gateway IP to direct outbound traffic through. Must be able to reach
    /// the remote server (default: discovered from the system default
    /// gateway).
    pub gateway_ip: Option<Ipv4Addr>,
    /// Address the outbound engine creates its SOCKS inbound on
    /// (default: 127.0.0.1 on a freshly reserved ephemeral port).
    pub inbound_proxy: Option<ProxyAddr>,
    /// TUN device address (default: 192.18.0.1/32).
    pub tun_address: Option<Ipv4Net>,
    /// Prefixes to point at the TUN device (default: 0.0.0.0/1 and
    /// 128.0.0.0/1).
    ///
    /// An exception for the remote server IP is always added and cannot be
    /// suppressed.
    pub routes_to_tun: Option<Vec<Ipv4Net>>,
    /// Whether to accept self-signed upstream certificates.
    pub tls_allow_insecure: bool,
    /// Log severity handed to the outbound engine (default: derived from the
    /// active tracing level).
    pub outbound_log_level: Option<EngineLogLevel>,
    /// Toggles runtime instrumentation useful for collecting diagnostics.
    pub debug: bool,
    /// Fine-tunes instrumentation behavior.
    pub debug_options: Option<DebugOptions>,

    /// Replaces the outbound engine factory.
    pub engine_factory: Option<Arc<dyn EngineFactory>>,
    /// Replaces the TUN device factory.
    pub tun_factory: Option<Arc<dyn TunFactory>>,
    /// Replaces the routing-table adapter.
    pub route_table: Option<Arc<dyn RouteTable>>,
    /// Replaces the packet pipe.
    pub packet_pipe: Option<Arc<dyn PacketPipe>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("gateway_ip", &self.gateway_ip)
            .field("inbound_proxy", &self.inbound_proxy)
            .field("tun_address", &self.tun_address)
            .field("routes_to_tun", &self.routes_to_tun)
            .field("tls_allow_insecure", &self.tls_allow_insecure)
            .field("outbound_log_level", &self.outbound_log_level)
            .field("debug", &self.debug)
            .field("debug_options", &self.debug_options)
            .finish_non_exhaustive()
    }
}

/// Default TUN address, `192.18.0.1/32`.
pub fn default_tun_address() -> Ipv4Net {
    // /32 on a benchmarking-range address that never collides with LAN space.
    Ipv4Net::new(Ipv4Addr::new(192, 18, 0, 1), 32).expect("static prefix length is valid")
}

/// Default prefixes routed to the TUN device: the split-default pair that
/// overrides the default route without deleting it.
pub fn default_routes_to_tun() -> Vec<Ipv4Net> {
    vec![
        Ipv4Net::new(Ipv4Addr::new(0, 0, 0, 0), 1).expect("static prefix length is valid"),
        Ipv4Net::new(Ipv4Addr::new(128, 0, 0, 0), 1).expect("static prefix length is valid"),
    ]
}

/// Reserves a free TCP port on loopback for the inbound proxy.
///
/// The listener is bound and immediately closed, so another process may grab
/// the port before the engine rebinds it; that race surfaces as an engine
/// start failure and is not retried here.
pub fn free_inbound_port() -> u16 {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)) {
        Ok(listener) => listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(FALLBACK_INBOUND_PORT),
        Err(_) => FALLBACK_INBOUND_PORT,
    }
}

/// TOML-file form of [`Config`], used by the binary for overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Gateway IP override.
    pub gateway_ip: Option<Ipv4Addr>,
    /// Inbound proxy override.
    pub inbound_proxy: Option<ProxyAddr>,
    /// TUN device address (CIDR).
    pub tun_address: Option<Ipv4Net>,
    /// Prefixes routed to the TUN device.
    pub routes_to_tun: Option<Vec<Ipv4Net>>,
    /// Accept self-signed upstream certificates.
    pub tls_allow_insecure: Option<bool>,
    /// Enable runtime instrumentation.
    pub debug: Option<bool>,
    /// Resource snapshot interval, in seconds.
    pub resource_interval_secs: Option<u64>,
    /// Gateway re-validation interval, in seconds.
    pub gateway_interval_secs: Option<u64>,
}

impl FileConfig {
    /// Loads overrides from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::ClientError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::ClientError::Config(format!("read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| crate::ClientError::Config(format!("parse config: {e}")))
    }

    /// Converts file overrides into a [`Config`].
    pub fn into_config(self) -> Config {
        let mut debug_options = DebugOptions::default();
        if let Some(secs) = self.resource_interval_secs {
            debug_options.resource_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.gateway_interval_secs {
            debug_options.gateway_interval = Duration::from_secs(secs);
        }

        Config {
            gateway_ip: self.gateway_ip,
            inbound_proxy: self.inbound_proxy,
            tun_address: self.tun_address,
            routes_to_tun: self.routes_to_tun,
            tls_allow_insecure: self.tls_allow_insecure.unwrap_or(false),
            debug: self.debug.unwrap_or(false),
            debug_options: Some(debug_options.normalized()),
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_addr_display() {
        let addr = ProxyAddr::loopback(1080);
        assert_eq!(addr.to_string(), "127.0.0.1:1080");
        assert_eq!(addr.socket_addr().port(), 1080);
    }

    #[test]
    fn free_port_is_nonzero() {
        let port = free_inbound_port();
        assert_ne!(port, 0);
    }

    #[test]
    fn debug_options_normalize_zero_intervals() {
        let opts = DebugOptions {
            resource_interval: Duration::ZERO,
            gateway_interval: Duration::from_secs(1),
            verbose_pipe: false,
        }
        .normalized();

        assert_eq!(opts.resource_interval, Duration::from_secs(5));
        assert_eq!(opts.gateway_interval, Duration::from_secs(1));
    }

    #[test]
    fn default_routes_cover_full_space() {
        let routes = default_routes_to_tun();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].to_string(), "0.0.0.0/1");
        assert_eq!(routes[1].to_string(), "128.0.0.0/1");
    }

    #[test]
    fn file_config_parses_overrides() {
        let parsed: FileConfig = toml::from_str(
            r#"
            tun_address = "10.23.0.1/32"
            tls_allow_insecure = true
            gateway_interval_secs = 10
            "#,
        )
        .unwrap();

        let cfg = parsed.into_config();
        assert_eq!(cfg.tun_address.unwrap().to_string(), "10.23.0.1/32");
        assert!(cfg.tls_allow_insecure);
        assert_eq!(
            cfg.debug_options.unwrap().gateway_interval,
            Duration::from_secs(10)
        );
    }
}
