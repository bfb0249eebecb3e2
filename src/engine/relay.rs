//! Bundled outbound engine for the `socks://` protocol family
//!
//! [`RelayEngine`] accepts SOCKS5 CONNECTs on the loopback inbound and chains
//! each of them to an upstream SOCKS5 server, optionally over TLS and with
//! username/password authentication. Heavier protocol families (vless,
//! trojan, shadowsocks) need an embedder-provided
//! [`EngineFactory`](super::EngineFactory).

use super::{EngineConfig, EngineError, EngineFactory, ProxyEngine};
use crate::config::ProxyAddr;
use crate::link::{Link, Protocol};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// SOCKS5 version byte.
const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods.
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Request commands.
const CMD_CONNECT: u8 = 0x01;

/// Address types.
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes.
const REP_SUCCEEDED: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// A CONNECT destination extracted from a SOCKS5 request.
#[derive(Debug, Clone)]
enum TargetAddr {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{ip}:{port}"),
            TargetAddr::Ipv6(ip, port) => write!(f, "[{ip}]:{port}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl TargetAddr {
    /// Encodes the address the way SOCKS5 requests and replies carry it.
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            TargetAddr::Ipv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Ipv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Domain(host, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(host.len() as u8);
                buf.extend_from_slice(host.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }
}

/// Upstream server settings derived from a `socks://` link.
#[derive(Debug, Clone)]
struct UpstreamConfig {
    host: String,
    port: u16,
    auth: Option<(String, String)>,
    /// SNI when the upstream is wrapped in TLS; `None` means plain TCP.
    tls_sni: Option<String>,
    tls_allow_insecure: bool,
}

/// Factory for [`RelayEngine`]s.
#[derive(Debug, Default)]
pub struct RelayEngineFactory;

#[async_trait]
impl EngineFactory for RelayEngineFactory {
    async fn create(
        &self,
        link: &Link,
        cfg: &EngineConfig,
    ) -> Result<Box<dyn ProxyEngine>, EngineError> {
        if link.protocol != Protocol::Socks {
            return Err(EngineError::Unsupported(format!(
                "the bundled relay engine only handles socks links, got {}; \
                 supply an engine factory for this protocol",
                link.protocol.scheme()
            )));
        }

        let auth = link.credential.as_deref().and_then(|cred| {
            cred.split_once(':')
                .map(|(user, pass)| (user.to_string(), pass.to_string()))
        });

        let wants_tls = matches!(link.param("tls"), Some("1") | Some("true"))
            || link.param("security") == Some("tls");
        let tls_sni = wants_tls.then(|| {
            link.param("sni")
                .map(str::to_string)
                .unwrap_or_else(|| link.host.clone())
        });

        Ok(Box::new(RelayEngine {
            inbound: cfg.inbound,
            upstream: Arc::new(UpstreamConfig {
                host: link.host.clone(),
                port: link.port,
                auth,
                tls_sni,
                tls_allow_insecure: cfg.tls_allow_insecure,
            }),
            running: Mutex::new(None),
        }))
    }
}

struct Running {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// SOCKS-chaining outbound engine.
pub struct RelayEngine {
    inbound: ProxyAddr,
    upstream: Arc<UpstreamConfig>,
    running: Mutex<Option<Running>>,
}

#[async_trait]
impl ProxyEngine for RelayEngine {
    async fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(self.inbound.socket_addr())
            .await
            .map_err(|e| EngineError::Inbound(format!("bind {}: {e}", self.inbound)))?;
        info!(inbound = %self.inbound, upstream = %self.upstream.host, "relay engine listening");

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let upstream = Arc::clone(&self.upstream);
        let accept_task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "inbound accept failed");
                        continue;
                    }
                };
                debug!(%peer, "new inbound connection");

                let upstream = Arc::clone(&upstream);
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(stream, &upstream).await {
                        debug!(error = %e, "inbound connection ended with error");
                    }
                });
            }
            debug!("relay engine accept loop stopped");
        });

        *running = Some(Running {
            cancel,
            accept_task,
        });

        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.cancel.cancel();
        if let Err(e) = running.accept_task.await {
            return Err(EngineError::Shutdown(format!("accept loop: {e}")));
        }

        Ok(())
    }
}

/// Serves one inbound SOCKS5 connection and chains it upstream.
async fn handle_inbound(
    mut client: TcpStream,
    upstream: &UpstreamConfig,
) -> Result<(), EngineError> {
    // Greeting: the inbound is loopback-only, no authentication.
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(EngineError::Inbound(format!(
            "bad socks version {:#04x}",
            head[0]
        )));
    }
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        client
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(EngineError::Inbound("no acceptable auth method".into()));
    }
    client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request.
    let mut req = [0u8; 4];
    client.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(EngineError::Inbound(format!(
            "bad socks version {:#04x}",
            req[0]
        )));
    }

    let target = read_target(&mut client, req[3]).await?;

    if req[1] != CMD_CONNECT {
        reply(&mut client, REP_COMMAND_NOT_SUPPORTED, &target).await?;
        return Err(EngineError::Inbound(format!(
            "unsupported command {:#04x}",
            req[1]
        )));
    }

    let mut remote = match connect_upstream(upstream, &target).await {
        Ok(remote) => remote,
        Err(e) => {
            reply(&mut client, REP_HOST_UNREACHABLE, &target).await.ok();
            return Err(e);
        }
    };

    reply(&mut client, REP_SUCCEEDED, &target).await?;

    match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
        Ok((tx, rx)) => debug!(%target, tx, rx, "relay finished"),
        Err(e) => debug!(%target, error = %e, "relay ended with error"),
    }
    remote.shutdown().await.ok();

    Ok(())
}

async fn read_target(client: &mut TcpStream, atyp: u8) -> Result<TargetAddr, EngineError> {
    let target = match atyp {
        ATYP_IPV4 => {
            let mut raw = [0u8; 4];
            client.read_exact(&mut raw).await?;
            TargetAddr::Ipv4(Ipv4Addr::from(raw), read_port(client).await?)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut raw = vec![0u8; len[0] as usize];
            client.read_exact(&mut raw).await?;
            let host = String::from_utf8_lossy(&raw).into_owned();
            TargetAddr::Domain(host, read_port(client).await?)
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 16];
            client.read_exact(&mut raw).await?;
            TargetAddr::Ipv6(Ipv6Addr::from(raw), read_port(client).await?)
        }
        other => {
            return Err(EngineError::Inbound(format!(
                "unsupported address type {other:#04x}"
            )))
        }
    };

    Ok(target)
}

async fn read_port(client: &mut TcpStream) -> Result<u16, EngineError> {
    let mut raw = [0u8; 2];
    client.read_exact(&mut raw).await?;
    Ok(u16::from_be_bytes(raw))
}

async fn reply(client: &mut TcpStream, code: u8, target: &TargetAddr) -> Result<(), EngineError> {
    let mut buf = vec![SOCKS_VERSION, code, 0x00];
    target.encode(&mut buf);
    client.write_all(&buf).await?;
    Ok(())
}

/// A connected upstream: plain TCP or TLS.
trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamStream for T {}

/// Dials the upstream SOCKS server and performs the CONNECT handshake for
/// `target` on behalf of the inbound client.
async fn connect_upstream(
    upstream: &UpstreamConfig,
    target: &TargetAddr,
) -> Result<Box<dyn UpstreamStream>, EngineError> {
    let tcp = TcpStream::connect((upstream.host.as_str(), upstream.port))
        .await
        .map_err(|e| {
            EngineError::Upstream(format!("connect {}:{}: {e}", upstream.host, upstream.port))
        })?;
    tcp.set_nodelay(true).ok();

    let mut stream: Box<dyn UpstreamStream> = match &upstream.tls_sni {
        Some(sni) => {
            let connector = tls_connector(upstream.tls_allow_insecure)?;
            let server_name = ServerName::try_from(sni.clone())
                .map_err(|e| EngineError::Upstream(format!("invalid SNI {sni:?}: {e}")))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| EngineError::Upstream(format!("TLS handshake: {e}")))?;
            Box::new(tls)
        }
        None => Box::new(tcp),
    };

    socks5_connect(&mut stream, upstream, target).await?;

    Ok(stream)
}

/// Client-side SOCKS5 handshake against the upstream server.
async fn socks5_connect(
    stream: &mut Box<dyn UpstreamStream>,
    upstream: &UpstreamConfig,
    target: &TargetAddr,
) -> Result<(), EngineError> {
    let greeting: &[u8] = if upstream.auth.is_some() {
        &[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[SOCKS_VERSION, 1, METHOD_NO_AUTH]
    };
    stream.write_all(greeting).await?;

    let mut chosen = [0u8; 2];
    stream.read_exact(&mut chosen).await?;
    match chosen[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let Some((user, pass)) = &upstream.auth else {
                return Err(EngineError::Upstream(
                    "server demands credentials but none are configured".into(),
                ));
            };
            // RFC 1929 username/password subnegotiation.
            let mut req = vec![0x01, user.len() as u8];
            req.extend_from_slice(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend_from_slice(pass.as_bytes());
            stream.write_all(&req).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(EngineError::Upstream("authentication rejected".into()));
            }
        }
        other => {
            return Err(EngineError::Upstream(format!(
                "no acceptable auth method (server offered {other:#04x})"
            )));
        }
    }

    let mut req = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    target.encode(&mut req);
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != REP_SUCCEEDED {
        return Err(EngineError::Upstream(format!(
            "CONNECT to {target} rejected (code {:#04x})",
            head[1]
        )));
    }

    // Drain the bound address so the stream starts at payload data.
    let skip = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(EngineError::Upstream(format!(
                "bad bound address type {other:#04x}"
            )));
        }
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

fn tls_connector(allow_insecure: bool) -> Result<TlsConnector, EngineError> {
    let config = if allow_insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any certificate. Only reachable when the embedder set
/// `tls_allow_insecure`.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineLogLevel;

    fn test_engine_config(port: u16) -> EngineConfig {
        EngineConfig {
            inbound: ProxyAddr::loopback(port),
            tls_allow_insecure: false,
            log_level: EngineLogLevel::Info,
        }
    }

    #[tokio::test]
    async fn factory_rejects_non_socks_links() {
        let link = Link::parse("vless://abc@example.com:443").unwrap();
        let err = RelayEngineFactory
            .create(&link, &test_engine_config(0))
            .await
            .err()
            .expect("vless must be rejected");
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[tokio::test]
    async fn factory_extracts_auth_and_tls() {
        let link = Link::parse("socks://u:p@proxy.example.com:1080?tls=1&sni=cdn.example.com")
            .unwrap();
        // A successful create is enough; the upstream settings are private.
        RelayEngineFactory
            .create(&link, &test_engine_config(0))
            .await
            .expect("socks link must build");
    }

    #[tokio::test]
    async fn engine_start_close_cycle() {
        let link = Link::parse("socks://127.0.0.1:61081").unwrap();
        let engine = RelayEngineFactory
            .create(&link, &test_engine_config(0))
            .await
            .unwrap();

        engine.start().await.unwrap();
        engine.close().await.unwrap();
        // close is idempotent
        engine.close().await.unwrap();
    }

    #[test]
    fn target_addr_encoding() {
        let mut buf = Vec::new();
        TargetAddr::Ipv4(Ipv4Addr::new(1, 2, 3, 4), 80).encode(&mut buf);
        assert_eq!(buf, [0x01, 1, 2, 3, 4, 0, 80]);

        buf.clear();
        TargetAddr::Domain("example.com".into(), 443).encode(&mut buf);
        assert_eq!(buf[0], 0x03);
        assert_eq!(buf[1] as usize, "example.com".len());
        assert_eq!(&buf[2..13], b"example.com");
        assert_eq!(&buf[13..], &443u16.to_be_bytes());
    }
}
