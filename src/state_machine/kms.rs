//! Raw TLS conversations with KMS endpoints, optionally through SOCKS5.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use super::tls::{KmsTlsOptions, TlsConfigs};
use crate::engine::{KmsRequest, State};
use crate::error::{ClientError, ClientErrorKind, Error, IoAction, Result};

pub const DEFAULT_KMS_PORT: u16 = 443;
pub const DEFAULT_PROXY_PORT: u16 = 1080;

/// Upper bound for a single read from a KMS connection.
const MAX_READ: usize = 16 * 1024;

/// SOCKS5 proxy used for KMS connections.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PROXY_PORT,
            username: None,
            password: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::configuration("proxy host must not be empty"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::configuration(
                "proxy username and password must be given together",
            ));
        }
        Ok(())
    }

    async fn connect(&self, host: &str, port: u16) -> std::result::Result<TcpStream, ClientError> {
        let proxy = (self.host.as_str(), self.port);
        let stream = match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                Socks5Stream::connect_with_password(proxy, (host, port), username, password).await
            }
            _ => Socks5Stream::connect(proxy, (host, port)).await,
        }
        .map_err(|e| match e {
            tokio_socks::Error::Io(io) => ClientError::from(io),
            other => ClientError::other(other),
        })?;
        Ok(stream.into_inner())
    }
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

pub trait KmsStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> KmsStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Opens an authenticated byte stream to a KMS endpoint.
#[async_trait]
pub trait KmsConnector: Send + Sync {
    async fn connect(
        &self,
        provider: &str,
        host: &str,
        port: u16,
    ) -> std::result::Result<Box<dyn KmsStream>, ClientError>;
}

/// TLS over TCP, with the provider's TLS settings and the optional proxy.
#[derive(Debug)]
pub struct TlsKmsConnector {
    tls: TlsConfigs,
    proxy: Option<ProxyOptions>,
}

impl TlsKmsConnector {
    pub fn new(tls_options: &KmsTlsOptions, proxy: Option<ProxyOptions>) -> Result<Self> {
        if let Some(proxy) = &proxy {
            proxy.validate()?;
        }
        Ok(Self {
            tls: TlsConfigs::build(tls_options)?,
            proxy,
        })
    }
}

#[async_trait]
impl KmsConnector for TlsKmsConnector {
    async fn connect(
        &self,
        provider: &str,
        host: &str,
        port: u16,
    ) -> std::result::Result<Box<dyn KmsStream>, ClientError> {
        let tcp = match &self.proxy {
            Some(proxy) => proxy.connect(host, port).await?,
            None => TcpStream::connect((host, port)).await?,
        };
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| ClientError::new(ClientErrorKind::Tls, e))?;
        let stream = tokio_rustls::TlsConnector::from(self.tls.for_provider(provider))
            .connect(server_name, tcp)
            .await
            .map_err(|e| ClientError::new(ClientErrorKind::Tls, e))?;
        Ok(Box::new(stream))
    }
}

/// Sends engine KMS requests over fresh connections.
#[derive(Clone)]
pub struct KmsTransport {
    connector: Arc<dyn KmsConnector>,
}

impl KmsTransport {
    pub fn new(connector: Arc<dyn KmsConnector>) -> Self {
        Self { connector }
    }

    pub fn tls(tls_options: &KmsTlsOptions, proxy: Option<ProxyOptions>) -> Result<Self> {
        Ok(Self::new(Arc::new(TlsKmsConnector::new(tls_options, proxy)?)))
    }

    /// Write the request, then feed the response back until the engine needs
    /// no more bytes. Returns everything read. A connection closed early is
    /// an error; the request is not retried.
    pub(crate) async fn send(&self, mut request: Box<dyn KmsRequest>) -> Result<Vec<u8>> {
        let kms_error = |e: ClientError| Error::io(IoAction::Kms, e);
        let (host, port) = parse_endpoint(request.endpoint())?;
        tracing::debug!(provider = request.provider(), %host, port, "sending KMS request");

        let mut stream = self
            .connector
            .connect(request.provider(), &host, port)
            .await
            .map_err(kms_error)?;
        stream
            .write_all(request.message())
            .await
            .map_err(|e| kms_error(e.into()))?;
        stream.flush().await.map_err(|e| kms_error(e.into()))?;

        let mut received = Vec::new();
        let mut buf = vec![0u8; MAX_READ];
        while request.bytes_needed() > 0 {
            let want = request.bytes_needed().min(MAX_READ);
            let n = stream
                .read(&mut buf[..want])
                .await
                .map_err(|e| kms_error(e.into()))?;
            if n == 0 {
                return Err(kms_error(ClientError::new(
                    ClientErrorKind::ConnectionClosed,
                    format!(
                        "{host}:{port} closed the connection with {} bytes outstanding",
                        request.bytes_needed()
                    ),
                )));
            }
            request
                .feed(&buf[..n])
                .map_err(|e| Error::engine(State::NeedKms, e))?;
            received.extend_from_slice(&buf[..n]);
        }

        if let Err(e) = stream.shutdown().await {
            tracing::debug!(%host, error = %e, "KMS connection did not close cleanly");
        }
        Ok(received)
    }
}

impl fmt::Debug for KmsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsTransport").finish_non_exhaustive()
    }
}

/// Split `host[:port]`, defaulting to port 443. IPv6 hosts are bracketed
/// when a port follows; a bare IPv6 address takes the default port.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let invalid = || {
        Error::io(
            IoAction::Kms,
            ClientError::other(format!("invalid KMS endpoint {endpoint:?}")),
        )
    };
    let parse_port = |port: &str| port.parse::<u16>().map_err(|_| invalid());
    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        match after {
            "" => (host, DEFAULT_KMS_PORT),
            _ => (host, parse_port(after.strip_prefix(':').ok_or_else(invalid)?)?),
        }
    } else {
        match endpoint.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, parse_port(port)?),
            _ => (endpoint, DEFAULT_KMS_PORT),
        }
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_owned(), port))
}
