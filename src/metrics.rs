//! Traffic counters around a packet handle
//!
//! [`IoMetrics`] wraps any [`PacketIo`] and counts bytes moved through it,
//! along with when the handle was last active. Counters are plain atomics so
//! readers never contend with the data path; a zero timestamp encodes
//! "never".

use crate::tun::PacketIo;
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Snapshot of the counters of an [`IoMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStats {
    /// Total bytes successfully read from the handle.
    pub bytes_read: u64,
    /// Total bytes successfully written to the handle.
    pub bytes_written: u64,
    /// When the last successful read happened; `None` means never.
    pub last_read_at: Option<SystemTime>,
    /// When the last successful write happened; `None` means never.
    pub last_write_at: Option<SystemTime>,
}

/// Counting wrapper around a packet handle.
pub struct IoMetrics {
    inner: Arc<dyn PacketIo>,
    n_read: AtomicU64,
    n_written: AtomicU64,
    last_read: AtomicTime,
    last_write: AtomicTime,
}

impl IoMetrics {
    /// Wraps `inner`, starting all counters at zero.
    pub fn wrap(inner: Arc<dyn PacketIo>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            n_read: AtomicU64::new(0),
            n_written: AtomicU64::new(0),
            last_read: AtomicTime::default(),
            last_write: AtomicTime::default(),
        })
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.n_read.load(Ordering::Relaxed)
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.n_written.load(Ordering::Relaxed)
    }

    /// Consistent snapshot of all counters.
    pub fn stats(&self) -> IoStats {
        IoStats {
            bytes_read: self.bytes_read(),
            bytes_written: self.bytes_written(),
            last_read_at: self.last_read.load(),
            last_write_at: self.last_write.load(),
        }
    }
}

#[async_trait]
impl PacketIo for IoMetrics {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.recv(buf).await?;
        self.n_read.fetch_add(n as u64, Ordering::Relaxed);
        self.last_read.store_now();
        Ok(n)
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.send(buf).await?;
        self.n_written.fetch_add(n as u64, Ordering::Relaxed);
        self.last_write.store_now();
        Ok(n)
    }

    async fn close(&self) -> io::Result<()> {
        self.inner.close().await
    }
}

/// Unix-nanosecond timestamp readable without locks. Zero means never set.
#[derive(Default)]
struct AtomicTime {
    nanos: AtomicI64,
}

impl AtomicTime {
    fn store_now(&self) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        self.nanos.store(nanos, Ordering::Relaxed);
    }

    fn load(&self) -> Option<SystemTime> {
        match self.nanos.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(UNIX_EPOCH + Duration::from_nanos(nanos as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Packet handle that succeeds reads of a fixed size and fails writes.
    struct FixedIo {
        read_len: usize,
        fail_send: bool,
    }

    #[async_trait]
    impl PacketIo for FixedIo {
        async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(self.read_len)
        }

        async fn send(&self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_send {
                Err(io::Error::new(io::ErrorKind::Other, "send failed"))
            } else {
                Ok(buf.len())
            }
        }

        async fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn counters_grow_on_success() {
        let metrics = IoMetrics::wrap(Arc::new(FixedIo {
            read_len: 120,
            fail_send: false,
        }));

        let mut buf = [0u8; 256];
        metrics.recv(&mut buf).await.unwrap();
        metrics.recv(&mut buf).await.unwrap();
        metrics.send(&buf[..64]).await.unwrap();

        let stats = metrics.stats();
        assert_eq!(stats.bytes_read, 240);
        assert_eq!(stats.bytes_written, 64);
        assert!(stats.last_read_at.is_some());
        assert!(stats.last_write_at.is_some());
    }

    #[tokio::test]
    async fn failed_io_does_not_count() {
        let metrics = IoMetrics::wrap(Arc::new(FixedIo {
            read_len: 10,
            fail_send: true,
        }));

        let buf = [0u8; 32];
        metrics.send(&buf).await.unwrap_err();

        let stats = metrics.stats();
        assert_eq!(stats.bytes_written, 0);
        assert_eq!(stats.last_write_at, None);
    }

    #[test]
    fn zero_timestamp_means_never() {
        let t = AtomicTime::default();
        assert_eq!(t.load(), None);
        t.store_now();
        assert!(t.load().is_some());
    }
}
