//! Upstream connection establishment.
//!
//! Produces a bidirectional byte stream for a given upstream descriptor:
//! direct TCP, UNIX socket, TLS, or via a proxy hop that opens the final
//! TCP+TLS leg for us. Dial failures collapse into a small taxonomy that maps
//! onto the `err_*` codes surfaced to clients.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream, UnixStream};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::config::{ProxyConfig, UpstreamConfig};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("unknown host")]
    UnknownHost,
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("proxy negotiation failed: {0}")]
    Proxy(String),
    #[error("connection reset")]
    Reset,
    #[error("{0}")]
    Other(String),
}

impl ConnectError {
    /// Short code surfaced to the client, `err_`-prefixed by the session.
    /// Resets and unclassified errors surface as a bare close.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::Timeout => "timeout",
            ConnectError::Refused => "refused",
            ConnectError::UnknownHost => "unknown_host",
            ConnectError::Tls(_) => "tls",
            ConnectError::Proxy(_) => "proxy",
            ConnectError::Reset | ConnectError::Other(_) => "",
        }
    }
}

fn classify_dial(e: std::io::Error) -> ConnectError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::TimedOut => ConnectError::Timeout,
        ErrorKind::ConnectionRefused => ConnectError::Refused,
        ErrorKind::ConnectionReset => ConnectError::Reset,
        // Name resolution failures come through as uncategorized dial errors.
        _ => ConnectError::UnknownHost,
    }
}

/// An established upstream connection, split for the single-writer /
/// single-reader ownership the session enforces.
pub struct UpstreamStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub local_port: u16,
    pub remote_port: u16,
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .finish_non_exhaustive()
    }
}

impl UpstreamStream {
    fn from_stream<S>(stream: S, local_port: u16, remote_port: u16) -> UpstreamStream
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        UpstreamStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_port,
            remote_port,
        }
    }
}

/// Dial the descriptor. Port pairs are extracted before any TLS handshake so
/// the identd entry exists by the time the server looks it up.
pub async fn connect(config: &UpstreamConfig) -> Result<UpstreamStream, ConnectError> {
    if let Some(proxy) = &config.proxy {
        return connect_via_proxy(config, proxy).await;
    }

    let timeout = Duration::from_secs(config.timeout_secs.max(1));

    if config.network == "unix" {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(&config.hostname))
            .await
            .map_err(|_| ConnectError::Timeout)?
            .map_err(classify_dial)?;
        return Ok(UpstreamStream::from_stream(stream, 0, 0));
    }

    let tcp = tokio::time::timeout(timeout, dial_tcp(config))
        .await
        .map_err(|_| ConnectError::Timeout)??;

    let local_port = tcp.local_addr().map(|a| a.port()).unwrap_or(0);
    let remote_port = tcp.peer_addr().map(|a| a.port()).unwrap_or(0);

    if config.tls {
        let tls = tls_handshake(tcp, &config.hostname, timeout).await?;
        Ok(UpstreamStream::from_stream(tls, local_port, remote_port))
    } else {
        Ok(UpstreamStream::from_stream(tcp, local_port, remote_port))
    }
}

async fn dial_tcp(config: &UpstreamConfig) -> Result<TcpStream, ConnectError> {
    let addr = format!("{}:{}", config.hostname, config.port);

    match config.local_addr {
        None => TcpStream::connect(&addr).await.map_err(classify_dial),
        Some(local) => {
            let remote = tokio::net::lookup_host(&addr)
                .await
                .map_err(classify_dial)?
                .find(|a| a.is_ipv4() == local.is_ipv4())
                .ok_or(ConnectError::UnknownHost)?;

            let socket = if local.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
            .map_err(|e| ConnectError::Other(e.to_string()))?;
            socket
                .bind((local, 0).into())
                .map_err(|e| ConnectError::Other(e.to_string()))?;
            socket.connect(remote).await.map_err(classify_dial)
        }
    }
}

async fn tls_handshake<S>(
    stream: S,
    hostname: &str,
    timeout: Duration,
) -> Result<tokio_rustls::client::TlsStream<S>, ConnectError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let connector = TlsConnector::from(Arc::new(insecure_tls_config()));
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|e| ConnectError::Tls(e.to_string()))?;

    tokio::time::timeout(timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(|e| ConnectError::Tls(e.to_string()))
}

/// Ask the proxy to open the final leg. The envelope is a single request line
/// `CONNECT <host> <port> <tls|plain> <username> [interface]`, answered with
/// `OK` or an error word that feeds the dial taxonomy.
async fn connect_via_proxy(
    config: &UpstreamConfig,
    proxy: &ProxyConfig,
) -> Result<UpstreamStream, ConnectError> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let addr = format!("{}:{}", proxy.hostname, proxy.port);

    let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(|e| match classify_dial(e) {
            ConnectError::Reset | ConnectError::Other(_) => {
                ConnectError::Proxy("proxy unreachable".to_string())
            }
            other => other,
        })?;

    let mut request = format!(
        "CONNECT {} {} {} {}",
        config.hostname,
        config.port,
        if config.tls { "tls" } else { "plain" },
        proxy.username,
    );
    if !proxy.interface.is_empty() {
        request.push(' ');
        request.push_str(&proxy.interface);
    }
    request.push('\n');

    if proxy.tls {
        let tls = tls_handshake(tcp, &proxy.hostname, timeout).await?;
        negotiate_proxy(tls, &request, timeout).await
    } else {
        negotiate_proxy(tcp, &request, timeout).await
    }
}

async fn negotiate_proxy<S>(
    stream: S,
    request: &str,
    timeout: Duration,
) -> Result<UpstreamStream, ConnectError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut stream = BufReader::new(stream);
    stream
        .get_mut()
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ConnectError::Proxy(e.to_string()))?;

    let mut reply = String::new();
    tokio::time::timeout(timeout, stream.read_line(&mut reply))
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(|_| ConnectError::Refused)?;

    match reply.trim() {
        "OK" => Ok(UpstreamStream::from_stream(stream, 0, 0)),
        "conn_refused" => Err(ConnectError::Refused),
        "not_found" => Err(ConnectError::UnknownHost),
        "conn_timeout" => Err(ConnectError::Timeout),
        "conn_reset" => Err(ConnectError::Reset),
        other => Err(ConnectError::Proxy(other.to_string())),
    }
}

fn insecure_tls_config() -> rustls::ClientConfig {
    // The gateway is not the trust anchor for operator-configured upstreams;
    // certificate verification is intentionally disabled.
    let provider = rustls::crypto::ring::default_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyCert {
    provider: rustls::crypto::CryptoProvider,
}

impl ServerCertVerifier for AcceptAnyCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
