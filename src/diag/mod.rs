//! Background diagnostics
//!
//! Optional observers that run alongside a session when
//! [`Config::debug`](crate::config::Config::debug) is set. They only read
//! state and log; session correctness never depends on them.

use crate::metrics::IoMetrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawns a task that periodically logs a traffic/uptime snapshot until
/// `cancel` trips.
pub fn spawn_resource_monitor(
    stats: Arc<IoMetrics>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = stats.stats();
                    info!(
                        target: "tunshift::diag",
                        uptime_secs = started.elapsed().as_secs(),
                        tun_bytes_read = snapshot.bytes_read,
                        tun_bytes_written = snapshot.bytes_written,
                        tun_last_read = ?snapshot.last_read_at,
                        tun_last_write = ?snapshot.last_write_at,
                        "session resources"
                    );
                }
            }
        }
        debug!("resource monitor stopped");
    })
}
