//! Persistent TLS/TCP connections for the binary gateway and feedback service.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};

use pushgate_common::types::App;

use crate::error::{ConnectionError, DispatchError};

/// Object-safe duplex stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;
pub type StreamReader = ReadHalf<BoxedStream>;
pub type StreamWriter = WriteHalf<BoxedStream>;

/// Opens connections to a gateway host.
#[derive(Clone)]
pub enum Connector {
    /// TLS with the app's client certificate.
    Tls {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    /// Unencrypted TCP, for local gateways.
    Plain,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connector::Tls { server_name, .. } => {
                f.debug_struct("Tls").field("server_name", server_name).finish()
            }
            Connector::Plain => f.write_str("Plain"),
        }
    }
}

impl Connector {
    /// TLS connector presenting the certificate chain and key from the app's
    /// PEM bundle to `host`.
    pub fn for_app(app: &App, host: &str) -> Result<Self, DispatchError> {
        let pem = app
            .certificate
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                DispatchError::Configuration(format!("App {} has no certificate", app.name))
            })?;

        let config = client_config(pem)?;
        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            DispatchError::Configuration(format!("Invalid gateway host '{}': {}", host, e))
        })?;

        Ok(Connector::Tls {
            config: Arc::new(config),
            server_name,
        })
    }

    /// Connect, bounded by `timeout` for the TCP and TLS handshakes each.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<BoxedStream, ConnectionError> {
        let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;
        tcp.set_nodelay(true)?;

        match self {
            Connector::Plain => Ok(Box::new(tcp)),
            Connector::Tls {
                config,
                server_name,
            } => {
                let connector = TlsConnector::from(config.clone());
                let tls = tokio::time::timeout(timeout, connector.connect(server_name.clone(), tcp))
                    .await
                    .map_err(|_| ConnectionError::Timeout(timeout))?
                    .map_err(|e| ConnectionError::Tls(e.to_string()))?;
                Ok(Box::new(tls))
            }
        }
    }

    /// Connect and split into independently owned halves.
    pub async fn connect_split(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(StreamReader, StreamWriter), ConnectionError> {
        let stream = self.connect(host, port, timeout).await?;
        Ok(tokio::io::split(stream))
    }
}

fn client_config(pem: &str) -> Result<ClientConfig, DispatchError> {
    if pem.contains("ENCRYPTED") {
        return Err(DispatchError::Configuration(
            "Encrypted private keys are not supported; store the key unencrypted".to_string(),
        ));
    }

    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DispatchError::Configuration(format!("Invalid certificate PEM: {:?}", e)))?;
    if certs.is_empty() {
        return Err(DispatchError::Configuration(
            "Certificate bundle contains no certificates".to_string(),
        ));
    }

    let key = PrivateKeyDer::from_pem_slice(pem.as_bytes()).map_err(|e| {
        DispatchError::Configuration(format!("Certificate bundle has no usable private key: {:?}", e))
    })?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| DispatchError::Configuration(format!("TLS setup failed: {}", e)))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| DispatchError::Configuration(format!("Client certificate rejected: {}", e)))
}
