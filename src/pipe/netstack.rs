//! lwIP-backed packet pipe
//!
//! Frames read from the device are fed into a userspace lwIP stack; TCP
//! connections surfacing from the stack are chained to the SOCKS inbound
//! with a plain CONNECT handshake and then copied bidirectionally.

use super::{PacketPipe, PipeError};
use crate::tun::PacketIo;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Read buffer large enough for any IP frame.
const FRAME_BUF_SIZE: usize = 65535;

/// SOCKS5 protocol bytes for the CONNECT handshake.
const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCEEDED: u8 = 0x00;

/// [`PacketPipe`] over the lwIP userspace TCP/IP stack.
#[derive(Debug, Default)]
pub struct LwipPipe;

#[async_trait]
impl PacketPipe for LwipPipe {
    async fn copy(
        &self,
        cancel: CancellationToken,
        io: Arc<dyn PacketIo>,
        socks: SocketAddr,
    ) -> Result<(), PipeError> {
        let (stack, mut tcp_listener, udp_socket) = netstack_lwip::NetStack::new()
            .map_err(|e| PipeError::Netstack(e.to_string()))?;
        // TODO: speak SOCKS5 UDP ASSOCIATE to the inbound so UDP flows
        // (mainly DNS) ride the tunnel instead of being dropped here.
        drop(udp_socket);
        debug!("UDP is not piped; datagrams from the device are dropped");

        let (mut stack_sink, mut stack_stream) = stack.split();

        // Device → stack.
        let device = Arc::clone(&io);
        let inbound = async move {
            let mut buf = vec![0u8; FRAME_BUF_SIZE];
            loop {
                let n = device.recv(&mut buf).await.map_err(PipeError::Io)?;
                if n == 0 {
                    return Ok::<(), PipeError>(());
                }
                stack_sink
                    .send(buf[..n].to_vec())
                    .await
                    .map_err(|e| PipeError::Netstack(e.to_string()))?;
            }
        };

        // Stack → device.
        let device = Arc::clone(&io);
        let outbound = async move {
            while let Some(frame) = stack_stream.next().await {
                let frame = frame.map_err(|e| PipeError::Netstack(e.to_string()))?;
                device.send(&frame).await.map_err(PipeError::Io)?;
            }
            Ok::<(), PipeError>(())
        };

        // Stack TCP connections → SOCKS inbound.
        let accept = async move {
            while let Some((stream, local, remote)) = tcp_listener.next().await {
                debug!(%local, %remote, "stack connection");
                tokio::spawn(async move {
                    if let Err(e) = relay_through_socks(stream, remote, socks).await {
                        debug!(%remote, error = %e, "stack connection ended with error");
                    }
                });
            }
            Ok::<(), PipeError>(())
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("pipe cancelled");
                Ok(())
            }
            res = inbound => res,
            res = outbound => res,
            res = accept => res,
        }
    }
}

/// Opens a SOCKS connection to the inbound proxy for `destination` and copies
/// both directions until either side closes.
async fn relay_through_socks(
    stream: Pin<Box<netstack_lwip::TcpStream>>,
    destination: SocketAddr,
    socks: SocketAddr,
) -> Result<(), PipeError> {
    let mut proxy = TcpStream::connect(socks).await?;
    proxy.set_nodelay(true).ok();

    socks5_connect(&mut proxy, destination).await?;

    let mut local = PinnedStream { inner: stream };
    match tokio::io::copy_bidirectional(&mut local, &mut proxy).await {
        Ok((tx, rx)) => debug!(%destination, tx, rx, "stack connection finished"),
        Err(e) => debug!(%destination, error = %e, "stack connection copy error"),
    }
    proxy.shutdown().await.ok();

    Ok(())
}

/// Plain no-auth SOCKS5 CONNECT handshake.
async fn socks5_connect(proxy: &mut TcpStream, destination: SocketAddr) -> Result<(), PipeError> {
    proxy
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;

    let mut chosen = [0u8; 2];
    proxy.read_exact(&mut chosen).await?;
    if chosen != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(PipeError::Socks(format!(
            "inbound refused no-auth (method {:#04x})",
            chosen[1]
        )));
    }

    proxy.write_all(&encode_connect(destination)).await?;

    let mut head = [0u8; 4];
    proxy.read_exact(&mut head).await?;
    if head[1] != REP_SUCCEEDED {
        return Err(PipeError::Socks(format!(
            "CONNECT to {destination} rejected (code {:#04x})",
            head[1]
        )));
    }

    // Skip the bound address to reach payload data.
    let skip = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            proxy.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(PipeError::Socks(format!(
                "bad bound address type {other:#04x}"
            )));
        }
    };
    let mut bound = vec![0u8; skip];
    proxy.read_exact(&mut bound).await?;

    Ok(())
}

/// Encodes the SOCKS5 CONNECT request for `destination`.
fn encode_connect(destination: SocketAddr) -> Vec<u8> {
    let mut req = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match destination {
        SocketAddr::V4(v4) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&v6.ip().octets());
        }
    }
    req.extend_from_slice(&destination.port().to_be_bytes());
    req
}

/// Adapter giving the pinned lwIP stream the `Unpin` surface
/// `copy_bidirectional` needs.
struct PinnedStream {
    inner: Pin<Box<netstack_lwip::TcpStream>>,
}

impl AsyncRead for PinnedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for PinnedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn connect_request_encoding() {
        let dst = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443));
        let req = encode_connect(dst);
        assert_eq!(&req[..4], &[0x05, 0x01, 0x00, 0x01]);
        assert_eq!(&req[4..8], &[93, 184, 216, 34]);
        assert_eq!(&req[8..], &443u16.to_be_bytes());
    }
}
