//! Gateway watcher
//!
//! While a session is up, the default gateway is re-validated periodically.
//! When it changes (wifi roam, DHCP renew), the shared gateway value is
//! swapped and the server-exception route is reissued so engine traffic keeps
//! bypassing the tunnel. Failure to reinstall the route leaves the session
//! running in a degraded state; it is logged, never propagated.

use crate::route::{RouteError, RouteSpec, RouteTable};
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Spawns the watcher task for one session.
pub(crate) fn spawn(
    gateway: Arc<RwLock<Ipv4Addr>>,
    routes: Arc<dyn RouteTable>,
    server_ip: Ipv4Addr,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; the first validation should wait one
        // full period.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    validate_gateway(&gateway, routes.as_ref(), server_ip).await;
                }
            }
        }
        debug!("gateway watcher stopped");
    })
}

async fn validate_gateway(
    gateway: &RwLock<Ipv4Addr>,
    routes: &dyn RouteTable,
    server_ip: Ipv4Addr,
) {
    let discovered = match routes.default_gateway().await {
        Ok(ip) => ip,
        Err(err) => {
            warn!(error = %err, "gateway discovery failed");
            return;
        }
    };

    let current = *gateway.read().unwrap_or_else(PoisonError::into_inner);
    if discovered == current {
        return;
    }
    info!(old = %current, new = %discovered, "default gateway changed");

    let old_route = RouteSpec::via_gateway(current, vec![server_ip.into()]);
    *gateway.write().unwrap_or_else(PoisonError::into_inner) = discovered;

    match routes.delete(&old_route).await {
        Ok(()) | Err(RouteError::NotFound) => {}
        Err(err) => warn!(error = %err, "stale exception route cleanup failed"),
    }

    let new_route = RouteSpec::via_gateway(discovered, vec![server_ip.into()]);
    if let Err(err) = routes.add(&new_route).await {
        error!(error = %err, "exception route update failed, server traffic may loop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Route table whose gateway answer is scripted.
    struct ScriptedRoutes {
        gateway: Ipv4Addr,
        adds: Mutex<Vec<RouteSpec>>,
        deletes: Mutex<Vec<RouteSpec>>,
    }

    #[async_trait]
    impl RouteTable for ScriptedRoutes {
        async fn add(&self, spec: &RouteSpec) -> Result<(), RouteError> {
            self.adds.lock().unwrap().push(spec.clone());
            Ok(())
        }

        async fn delete(&self, spec: &RouteSpec) -> Result<(), RouteError> {
            self.deletes.lock().unwrap().push(spec.clone());
            Err(RouteError::NotFound)
        }

        async fn default_gateway(&self) -> Result<Ipv4Addr, RouteError> {
            Ok(self.gateway)
        }
    }

    #[tokio::test]
    async fn swaps_gateway_and_reissues_exception_route() {
        let new_gw: Ipv4Addr = "10.0.0.254".parse().unwrap();
        let old_gw: Ipv4Addr = "192.168.1.1".parse().unwrap();
        let server: Ipv4Addr = "203.0.113.9".parse().unwrap();

        let routes = ScriptedRoutes {
            gateway: new_gw,
            adds: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        };
        let shared = RwLock::new(old_gw);

        validate_gateway(&shared, &routes, server).await;

        assert_eq!(*shared.read().unwrap(), new_gw);
        let deletes = routes.deletes.lock().unwrap();
        assert_eq!(
            deletes[0],
            RouteSpec::via_gateway(old_gw, vec![server.into()])
        );
        let adds = routes.adds.lock().unwrap();
        assert_eq!(adds[0], RouteSpec::via_gateway(new_gw, vec![server.into()]));
    }

    #[tokio::test]
    async fn unchanged_gateway_is_a_no_op() {
        let gw: Ipv4Addr = "192.168.1.1".parse().unwrap();
        let server: Ipv4Addr = "203.0.113.9".parse().unwrap();

        let routes = ScriptedRoutes {
            gateway: gw,
            adds: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        };
        let shared = RwLock::new(gw);

        validate_gateway(&shared, &routes, server).await;

        assert!(routes.adds.lock().unwrap().is_empty());
        assert!(routes.deletes.lock().unwrap().is_empty());
    }
}
