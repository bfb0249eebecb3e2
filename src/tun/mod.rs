//! TUN device adapter
//!
//! [`PacketIo`] is the frame-level I/O contract the pipe and the metrics
//! wrapper operate on: every `recv`/`send` moves one whole IP frame.
//! [`NativeTun`] backs it with a real kernel TUN device; closing the handle
//! unblocks any in-flight `recv`/`send`.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::config::DEFAULT_TUN_MTU;

/// TUN adapter errors.
#[derive(Debug, Error)]
pub enum TunError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("create device: {0}")]
    Create(String),
}

/// Options a TUN device is created with.
#[derive(Debug, Clone)]
pub struct TunOptions {
    /// Preferred device name; empty lets the kernel assign one.
    pub name_hint: String,
    /// Address (and prefix) the device is brought up with.
    pub address: Ipv4Net,
    /// Device MTU.
    pub mtu: u16,
}

impl TunOptions {
    /// Options for `address` with a kernel-assigned name and the default MTU.
    pub fn new(address: Ipv4Net) -> Self {
        Self {
            name_hint: String::new(),
            address,
            mtu: DEFAULT_TUN_MTU,
        }
    }
}

/// Whole-frame packet I/O.
///
/// Implementations never deliver partial frames; `close` must unblock
/// concurrent `recv`/`send` calls with an error.
#[async_trait]
pub trait PacketIo: Send + Sync {
    /// Reads one IP frame into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes one IP frame.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Closes the handle, unblocking pending I/O.
    async fn close(&self) -> io::Result<()>;
}

/// A packet handle that is a named network interface.
pub trait TunDevice: PacketIo {
    /// Kernel name of the interface (e.g. `utun4`, `tun0`).
    fn name(&self) -> &str;
}

/// Creates TUN devices.
#[async_trait]
pub trait TunFactory: Send + Sync {
    /// Creates a device and brings it up at `opts.address`.
    async fn open(&self, opts: &TunOptions) -> Result<Arc<dyn TunDevice>, TunError>;
}

/// Kernel-backed TUN device.
pub struct NativeTun {
    device: AsyncDevice,
    name: String,
    closed: CancellationToken,
}

impl NativeTun {
    /// Creates the device and brings it up; the interface peer is the device
    /// address itself (point-to-point to us).
    pub fn open(opts: &TunOptions) -> Result<Self, TunError> {
        let mut builder = DeviceBuilder::new()
            .ipv4(opts.address.addr(), opts.address.prefix_len(), None::<Ipv4Addr>)
            .mtu(opts.mtu);
        if !opts.name_hint.is_empty() {
            builder = builder.name(opts.name_hint.as_str());
        }

        let device = builder
            .build_async()
            .map_err(|e| TunError::Create(e.to_string()))?;
        let name = device.name()?;
        info!(name = %name, address = %opts.address, mtu = opts.mtu, "TUN device up");

        Ok(Self {
            device,
            name,
            closed: CancellationToken::new(),
        })
    }

    fn closed_err() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "tun device closed")
    }
}

#[async_trait]
impl PacketIo for NativeTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(Self::closed_err()),
            res = self.device.recv(buf) => res,
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(Self::closed_err()),
            res = self.device.send(buf) => res,
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

impl TunDevice for NativeTun {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Default [`TunFactory`] creating [`NativeTun`] devices.
#[derive(Debug, Default)]
pub struct NativeTunFactory;

#[async_trait]
impl TunFactory for NativeTunFactory {
    async fn open(&self, opts: &TunOptions) -> Result<Arc<dyn TunDevice>, TunError> {
        Ok(Arc::new(NativeTun::open(opts)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn options_default_mtu() {
        let addr = Ipv4Net::new(Ipv4Addr::new(192, 18, 0, 1), 32).unwrap();
        let opts = TunOptions::new(addr);
        assert_eq!(opts.mtu, DEFAULT_TUN_MTU);
        assert!(opts.name_hint.is_empty());
    }
}
