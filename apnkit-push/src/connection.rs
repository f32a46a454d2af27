//! TLS sessions to the gateway and feedback service.

use async_trait::async_trait;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::credential::require_credential;
use crate::{Credential, PushError, Result};

/// APNs environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Sandbox environment for development builds.
    Sandbox,
    /// Production environment.
    #[default]
    Production,
}

impl FromStr for Environment {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sandbox" | "development" | "dev" => Ok(Self::Sandbox),
            "production" | "prod" => Ok(Self::Production),
            other => Err(PushError::Config(format!("unknown environment: {}", other))),
        }
    }
}

/// Which Apple service a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gateway {
    /// Notification gateway.
    Delivery,
    /// Feedback service.
    Feedback,
}

impl Gateway {
    /// Apple's host and port for this service.
    pub fn default_endpoint(self, environment: Environment) -> Endpoint {
        match (self, environment) {
            (Self::Delivery, Environment::Production) => Endpoint::new("gateway.push.apple.com", 2195),
            (Self::Delivery, Environment::Sandbox) => {
                Endpoint::new("gateway.sandbox.push.apple.com", 2195)
            }
            (Self::Feedback, Environment::Production) => {
                Endpoint::new("feedback.push.apple.com", 2196)
            }
            (Self::Feedback, Environment::Sandbox) => {
                Endpoint::new("feedback.sandbox.push.apple.com", 2196)
            }
        }
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivery => f.write_str("delivery"),
            Self::Feedback => f.write_str("feedback"),
        }
    }
}

/// Host and port of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name, also used for SNI and certificate verification.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Socket timeouts applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect plus TLS handshake.
    pub connect: Duration,
    /// Single read.
    pub read: Duration,
    /// Single write.
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
        }
    }
}

/// Byte stream underneath a session.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// An open session to a gateway.
///
/// Dropping the session closes the socket; [`Session::close`] also sends
/// the TLS close notification.
pub struct Session {
    stream: Box<dyn SessionStream>,
    gateway: Gateway,
    timeouts: Timeouts,
}

impl Session {
    /// Wrap an established stream.
    pub fn new(stream: impl SessionStream + 'static, gateway: Gateway, timeouts: Timeouts) -> Self {
        Self {
            stream: Box::new(stream),
            gateway,
            timeouts,
        }
    }

    /// Service this session talks to.
    pub fn gateway(&self) -> Gateway {
        self.gateway
    }

    /// Write all bytes and flush.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let write = async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        };
        match tokio::time::timeout(self.timeouts.write, write).await {
            Ok(result) => result.map_err(|e| PushError::Connection(format!("write failed: {}", e))),
            Err(_) => Err(PushError::Timeout("write")),
        }
    }

    /// Read into `buf`, returning the number of bytes read (0 at end of stream).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match tokio::time::timeout(self.timeouts.read, self.stream.read(buf)).await {
            Ok(result) => result.map_err(|e| PushError::Connection(format!("read failed: {}", e))),
            Err(_) => Err(PushError::Timeout("read")),
        }
    }

    /// Shut the session down.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(gateway = %self.gateway, error = %e, "Session shutdown failed");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("gateway", &self.gateway)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

/// Opens sessions to Apple's services.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session authenticated with `credential`.
    async fn connect(&self, credential: &Credential, gateway: Gateway) -> Result<Session>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self, credential: &Credential, gateway: Gateway) -> Result<Session> {
        (**self).connect(credential, gateway).await
    }
}

/// Run `body` with an open session, closing it on every exit path.
///
/// Fails with [`PushError::MissingCredential`] before any network I/O when
/// `credential` is absent or empty. Connection failures are returned
/// as-is; nothing is retried.
pub async fn with_connection<C, T, F>(
    connector: &C,
    credential: Option<&Credential>,
    gateway: Gateway,
    body: F,
) -> Result<T>
where
    C: Connector + ?Sized,
    F: AsyncFnOnce(&mut Session) -> Result<T>,
{
    let credential = require_credential(credential, &format!("{} session", gateway))?;
    let mut session = connector.connect(credential, gateway).await?;
    let result = body(&mut session).await;
    session.close().await;
    result
}

/// Connector speaking TLS over TCP with the credential as client certificate.
#[derive(Clone)]
pub struct TlsConnector {
    environment: Environment,
    delivery: Endpoint,
    feedback: Endpoint,
    timeouts: Timeouts,
    roots: Arc<RootCertStore>,
}

impl TlsConnector {
    /// Create a connector for Apple's hosts in `environment`, trusting the web PKI roots.
    pub fn new(environment: Environment) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        Self {
            environment,
            delivery: Gateway::Delivery.default_endpoint(environment),
            feedback: Gateway::Feedback.default_endpoint(environment),
            timeouts: Timeouts::default(),
            roots: Arc::new(roots),
        }
    }

    /// Override the delivery endpoint.
    pub fn delivery_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.delivery = endpoint;
        self
    }

    /// Override the feedback endpoint.
    pub fn feedback_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.feedback = endpoint;
        self
    }

    /// Set socket timeouts.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Trust additional CA certificates given as PEM.
    pub fn add_trust_anchors(mut self, pem: &[u8]) -> Result<Self> {
        let certs = CertificateDer::pem_slice_iter(pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PushError::Certificate(format!("failed to parse CA certificates: {e}")))?;
        if certs.is_empty() {
            return Err(PushError::Certificate("no CA certificates found".into()));
        }
        let roots = Arc::make_mut(&mut self.roots);
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| PushError::Certificate(format!("failed to add CA certificate: {e}")))?;
        }
        Ok(self)
    }

    /// Environment the default endpoints were chosen for.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Endpoint used for `gateway`.
    pub fn endpoint(&self, gateway: Gateway) -> &Endpoint {
        match gateway {
            Gateway::Delivery => &self.delivery,
            Gateway::Feedback => &self.feedback,
        }
    }

    fn client_config(&self, credential: &Credential) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(credential.certificates()?, credential.private_key()?)
            .map_err(|e| PushError::Tls(format!("client config error: {e}")))?;
        Ok(config)
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("environment", &self.environment)
            .field("delivery", &self.delivery)
            .field("feedback", &self.feedback)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, credential: &Credential, gateway: Gateway) -> Result<Session> {
        let endpoint = self.endpoint(gateway);
        let config = self.client_config(credential)?;
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| PushError::Tls(format!("invalid server name {}: {}", endpoint.host, e)))?;

        debug!(%gateway, endpoint = %endpoint, "Opening APNs session");

        let handshake = async {
            let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
                .await
                .map_err(|e| PushError::Connection(format!("connect to {} failed: {}", endpoint, e)))?;
            tokio_rustls::TlsConnector::from(Arc::new(config))
                .connect(server_name, tcp)
                .await
                .map_err(|e| PushError::Tls(format!("handshake with {} failed: {}", endpoint, e)))
        };

        let stream = match tokio::time::timeout(self.timeouts.connect, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(%gateway, endpoint = %endpoint, "APNs connect timed out");
                return Err(PushError::Timeout("connect"));
            }
        };

        Ok(Session::new(stream, gateway, self.timeouts))
    }
}
