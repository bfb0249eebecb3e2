//! Packet pipe
//!
//! The pipe is the bridge between a frame-level device and the SOCKS inbound:
//! it terminates TCP flows carried in raw IP frames and replays them as
//! SOCKS5 CONNECTs against the inbound proxy. [`LwipPipe`] is the bundled
//! implementation; [`InstrumentedPipe`] wraps any pipe with start/stop and
//! duration logging for diagnostics.

mod netstack;

pub use netstack::LwipPipe;

use crate::tun::PacketIo;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pipe errors.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netstack: {0}")]
    Netstack(String),

    #[error("socks handshake: {0}")]
    Socks(String),
}

/// Bidirectional, cancel-aware copy between a packet device and a SOCKS
/// endpoint.
#[async_trait]
pub trait PacketPipe: Send + Sync {
    /// Runs the pipe until `cancel` trips or an I/O error surfaces.
    /// Cancellation is a clean shutdown and returns `Ok`.
    ///
    /// The pipe may stay blocked in one device syscall after cancellation;
    /// closing the device is what unsticks it. This layer never retries.
    async fn copy(
        &self,
        cancel: CancellationToken,
        io: Arc<dyn PacketIo>,
        socks: SocketAddr,
    ) -> Result<(), PipeError>;
}

/// Debug wrapper recording when a copy started, stopped and how long it ran.
pub struct InstrumentedPipe {
    inner: Arc<dyn PacketPipe>,
}

impl InstrumentedPipe {
    /// Wraps `inner` with copy lifecycle logging.
    pub fn wrap(inner: Arc<dyn PacketPipe>) -> Arc<dyn PacketPipe> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl PacketPipe for InstrumentedPipe {
    async fn copy(
        &self,
        cancel: CancellationToken,
        io: Arc<dyn PacketIo>,
        socks: SocketAddr,
    ) -> Result<(), PipeError> {
        let started = Instant::now();
        info!(%socks, "pipe copy starting");

        let result = self.inner.copy(cancel, io, socks).await;

        let duration = started.elapsed();
        match &result {
            Ok(()) => info!(%socks, ?duration, "pipe copy finished"),
            Err(err) => warn!(%socks, ?duration, error = %err, "pipe copy finished with error"),
        }

        result
    }
}
