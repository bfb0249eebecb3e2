//! Host routing-table adapter
//!
//! [`RouteSpec`] describes a set of prefixes pointed either at a gateway or
//! at a named interface. [`SystemRouteTable`] applies specs with the
//! platform's routing tools (`ip` on Linux, `route` on macOS, `route.exe` /
//! PowerShell on Windows); operations are serialized by an internal lock so
//! concurrent sessions never interleave half-applied changes.
//!
//! Deleting a route that is not installed reports [`RouteError::NotFound`];
//! callers treat that as success during cleanup.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Routing errors.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("route not found")]
    NotFound,

    #[error("{tool} {action} {prefix}: {stderr}")]
    CommandFailed {
        tool: &'static str,
        action: &'static str,
        prefix: String,
        stderr: String,
    },

    #[error("no default gateway: {0}")]
    NoGateway(String),
}

/// A set of prefixes and where to send them.
///
/// Either `gateway` or `if_name` must be populated; the adapter uses
/// whichever is set (gateway wins when both are).
#[derive(Debug, Clone, Default)]
pub struct RouteSpec {
    /// Interface the prefixes are bound to.
    pub if_name: Option<String>,
    /// Next-hop gateway for the prefixes.
    pub gateway: Option<Ipv4Addr>,
    /// Destination prefixes.
    pub routes: Vec<Ipv4Net>,
}

impl RouteSpec {
    /// Prefixes routed via a gateway.
    pub fn via_gateway(gateway: Ipv4Addr, routes: Vec<Ipv4Net>) -> Self {
        Self {
            if_name: None,
            gateway: Some(gateway),
            routes,
        }
    }

    /// Prefixes bound to an interface.
    pub fn via_interface(if_name: impl Into<String>, routes: Vec<Ipv4Net>) -> Self {
        Self {
            if_name: Some(if_name.into()),
            gateway: None,
            routes,
        }
    }

    fn sorted_routes(&self) -> Vec<Ipv4Net> {
        let mut routes = self.routes.clone();
        routes.sort();
        routes
    }
}

// Spec equality ignores prefix ordering.
impl PartialEq for RouteSpec {
    fn eq(&self, other: &Self) -> bool {
        self.if_name == other.if_name
            && self.gateway == other.gateway
            && self.sorted_routes() == other.sorted_routes()
    }
}

impl Eq for RouteSpec {}

/// Host routing-table operations.
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Installs every prefix in `spec`. Re-adding an installed prefix is
    /// treated as success.
    async fn add(&self, spec: &RouteSpec) -> Result<(), RouteError>;

    /// Removes every prefix in `spec`. Returns [`RouteError::NotFound`] when
    /// none of them were installed.
    async fn delete(&self, spec: &RouteSpec) -> Result<(), RouteError>;

    /// The system's current default next-hop.
    async fn default_gateway(&self) -> Result<Ipv4Addr, RouteError>;
}

/// [`RouteTable`] talking to the real OS routing table.
#[derive(Debug, Default)]
pub struct SystemRouteTable {
    // Sequences route mutations issued by this process.
    lock: Mutex<()>,
}

#[async_trait]
impl RouteTable for SystemRouteTable {
    async fn add(&self, spec: &RouteSpec) -> Result<(), RouteError> {
        let _guard = self.lock.lock().await;
        for prefix in &spec.routes {
            add_route(spec, *prefix).await?;
            debug!(%prefix, gateway = ?spec.gateway, if_name = ?spec.if_name, "route added");
        }
        Ok(())
    }

    async fn delete(&self, spec: &RouteSpec) -> Result<(), RouteError> {
        let _guard = self.lock.lock().await;
        let mut removed = 0usize;
        for prefix in &spec.routes {
            match delete_route(spec, *prefix).await {
                Ok(()) => {
                    removed += 1;
                    debug!(%prefix, "route removed");
                }
                Err(RouteError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        if removed == 0 && !spec.routes.is_empty() {
            return Err(RouteError::NotFound);
        }
        Ok(())
    }

    async fn default_gateway(&self) -> Result<Ipv4Addr, RouteError> {
        discover_gateway().await
    }
}

/// Lines the platform tools print when a route already exists; adding such a
/// route is idempotent success.
fn is_already_exists(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("file exists")
        || lower.contains("eexist")
        || lower.contains("already exists")
        || lower.contains("object already exists")
}

/// Lines the platform tools print when a route is absent on delete.
fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such process")
        || lower.contains("not in table")
        || lower.contains("not found")
        || lower.contains("esrch")
        || lower.contains("does not exist")
}

async fn run_tool(
    tool: &'static str,
    action: &'static str,
    prefix: Ipv4Net,
    args: &[String],
) -> Result<(), RouteError> {
    let output = Command::new(tool).args(args).output().await?;
    if output.status.success() {
        return Ok(());
    }

    // Windows tools report errors on stdout.
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let combined = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };

    match action {
        "add" if is_already_exists(&combined) => {
            warn!(%prefix, "route already exists, treating as success");
            Ok(())
        }
        "delete" if is_not_found(&combined) => Err(RouteError::NotFound),
        _ => Err(RouteError::CommandFailed {
            tool,
            action,
            prefix: prefix.to_string(),
            stderr: combined,
        }),
    }
}

#[cfg(target_os = "linux")]
async fn add_route(spec: &RouteSpec, prefix: Ipv4Net) -> Result<(), RouteError> {
    let mut args = vec!["route".to_string(), "add".to_string(), prefix.to_string()];
    if let Some(gateway) = spec.gateway {
        args.extend(["via".to_string(), gateway.to_string()]);
    } else if let Some(if_name) = &spec.if_name {
        args.extend(["dev".to_string(), if_name.clone()]);
    }
    run_tool("ip", "add", prefix, &args).await
}

#[cfg(target_os = "linux")]
async fn delete_route(spec: &RouteSpec, prefix: Ipv4Net) -> Result<(), RouteError> {
    let mut args = vec!["route".to_string(), "del".to_string(), prefix.to_string()];
    if let Some(gateway) = spec.gateway {
        args.extend(["via".to_string(), gateway.to_string()]);
    } else if let Some(if_name) = &spec.if_name {
        args.extend(["dev".to_string(), if_name.clone()]);
    }
    run_tool("ip", "delete", prefix, &args).await
}

#[cfg(target_os = "linux")]
async fn discover_gateway() -> Result<Ipv4Addr, RouteError> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    // "default via 192.168.1.1 dev eth0 ..."
    parse_token_after(&stdout, "via")
        .ok_or_else(|| RouteError::NoGateway("no `via` entry in the default route".into()))
}

#[cfg(target_os = "macos")]
async fn add_route(spec: &RouteSpec, prefix: Ipv4Net) -> Result<(), RouteError> {
    let mut args = vec![
        "-n".to_string(),
        "add".to_string(),
        "-net".to_string(),
        prefix.to_string(),
    ];
    if let Some(gateway) = spec.gateway {
        args.push(gateway.to_string());
    } else if let Some(if_name) = &spec.if_name {
        args.extend(["-interface".to_string(), if_name.clone()]);
    }
    run_tool("route", "add", prefix, &args).await
}

#[cfg(target_os = "macos")]
async fn delete_route(spec: &RouteSpec, prefix: Ipv4Net) -> Result<(), RouteError> {
    let mut args = vec![
        "-n".to_string(),
        "delete".to_string(),
        "-net".to_string(),
        prefix.to_string(),
    ];
    if let Some(gateway) = spec.gateway {
        args.push(gateway.to_string());
    } else if let Some(if_name) = &spec.if_name {
        args.extend(["-interface".to_string(), if_name.clone()]);
    }
    run_tool("route", "delete", prefix, &args).await
}

#[cfg(target_os = "macos")]
async fn discover_gateway() -> Result<Ipv4Addr, RouteError> {
    let output = Command::new("route")
        .args(["-n", "get", "default"])
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    // "    gateway: 192.168.1.1"
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("gateway:"))
        .and_then(|rest| rest.trim().parse().ok())
        .ok_or_else(|| RouteError::NoGateway("no gateway line in `route get default`".into()))
}

#[cfg(target_os = "windows")]
async fn add_route(spec: &RouteSpec, prefix: Ipv4Net) -> Result<(), RouteError> {
    if let Some(gateway) = spec.gateway {
        let args = vec![
            "add".to_string(),
            prefix.network().to_string(),
            "mask".to_string(),
            prefix.netmask().to_string(),
            gateway.to_string(),
        ];
        run_tool("route", "add", prefix, &args).await
    } else if let Some(if_name) = &spec.if_name {
        let args = vec![
            "interface".to_string(),
            "ipv4".to_string(),
            "add".to_string(),
            "route".to_string(),
            format!("prefix={prefix}"),
            format!("interface={if_name}"),
            "store=active".to_string(),
        ];
        run_tool("netsh", "add", prefix, &args).await
    } else {
        Ok(())
    }
}

#[cfg(target_os = "windows")]
async fn delete_route(spec: &RouteSpec, prefix: Ipv4Net) -> Result<(), RouteError> {
    if let Some(gateway) = spec.gateway {
        let args = vec![
            "delete".to_string(),
            prefix.network().to_string(),
            "mask".to_string(),
            prefix.netmask().to_string(),
            gateway.to_string(),
        ];
        run_tool("route", "delete", prefix, &args).await
    } else if let Some(if_name) = &spec.if_name {
        let args = vec![
            "interface".to_string(),
            "ipv4".to_string(),
            "delete".to_string(),
            "route".to_string(),
            format!("prefix={prefix}"),
            format!("interface={if_name}"),
        ];
        run_tool("netsh", "delete", prefix, &args).await
    } else {
        Ok(())
    }
}

#[cfg(target_os = "windows")]
async fn discover_gateway() -> Result<Ipv4Addr, RouteError> {
    let output = Command::new("powershell")
        .args([
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            "(Get-NetRoute -DestinationPrefix 0.0.0.0/0 | Sort-Object RouteMetric | Select-Object -First 1).NextHop",
        ])
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    stdout
        .trim()
        .parse()
        .map_err(|_| RouteError::NoGateway(format!("unparsable next hop {:?}", stdout.trim())))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
async fn add_route(_spec: &RouteSpec, prefix: Ipv4Net) -> Result<(), RouteError> {
    Err(RouteError::CommandFailed {
        tool: "route",
        action: "add",
        prefix: prefix.to_string(),
        stderr: "route management not supported on this platform".into(),
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
async fn delete_route(_spec: &RouteSpec, prefix: Ipv4Net) -> Result<(), RouteError> {
    Err(RouteError::CommandFailed {
        tool: "route",
        action: "delete",
        prefix: prefix.to_string(),
        stderr: "route management not supported on this platform".into(),
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
async fn discover_gateway() -> Result<Ipv4Addr, RouteError> {
    Err(RouteError::NoGateway(
        "gateway discovery not supported on this platform".into(),
    ))
}

#[cfg(any(target_os = "linux", target_os = "windows", target_os = "macos"))]
#[allow(dead_code)]
fn parse_token_after(output: &str, marker: &str) -> Option<Ipv4Addr> {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    let idx = tokens.iter().position(|&t| t == marker)?;
    tokens.get(idx + 1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn spec_equality_ignores_route_order() {
        let a = RouteSpec::via_interface("utun4", vec![net("0.0.0.0/1"), net("128.0.0.0/1")]);
        let b = RouteSpec::via_interface("utun4", vec![net("128.0.0.0/1"), net("0.0.0.0/1")]);
        assert_eq!(a, b);
    }

    #[test]
    fn spec_equality_is_by_target() {
        let gw = RouteSpec::via_gateway("10.0.0.1".parse().unwrap(), vec![net("1.2.3.4/32")]);
        let ifc = RouteSpec::via_interface("utun4", vec![net("1.2.3.4/32")]);
        assert_ne!(gw, ifc);
    }

    #[test]
    fn detects_exists_and_not_found_strings() {
        assert!(is_already_exists("RTNETLINK answers: File exists"));
        assert!(is_already_exists("The object already exists."));
        assert!(is_not_found("RTNETLINK answers: No such process"));
        assert!(is_not_found("route: not in table"));
        assert!(is_not_found("The route deletion failed: Element not found."));
    }

    #[test]
    fn parses_gateway_token() {
        let out = "default via 192.168.1.254 dev eth0 proto dhcp metric 100";
        assert_eq!(
            parse_token_after(out, "via"),
            Some("192.168.1.254".parse().unwrap())
        );
        assert_eq!(parse_token_after(out, "nexthop"), None);
    }
}
