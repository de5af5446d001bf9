//! Establishing raw connections to endpoints.

use crate::config::{ClientConfig, TlsContext};
use crate::error::{Error, NetworkError, Result};
use crate::types::Endpoint;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, trace};

/// A bidirectional byte stream a [`Connection`](super::Connection) runs over.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Channel for T {}

/// Opens channels to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the endpoint. Failures are reported as
    /// [`Error::TransientEndpoint`].
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>>;
}

/// Upgrades a connected socket to a secure channel.
#[async_trait]
pub trait SecureConnector: Send + Sync {
    async fn wrap(&self, endpoint: &Endpoint, stream: TcpStream) -> io::Result<Box<dyn Channel>>;
}

/// Plain TCP connector with optional TLS wrapping.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    tcp_no_delay: bool,
    tcp_keep_alive: bool,
    connect_timeout: Duration,
    tls: Option<TlsContext>,
}

impl TcpConnector {
    /// Socket options taken from the client configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            tcp_no_delay: config.tcp_no_delay,
            tcp_keep_alive: config.tcp_keep_alive,
            connect_timeout: config.connect_timeout,
            tls: config.tls.clone(),
        }
    }

    async fn open(&self, endpoint: &Endpoint) -> std::result::Result<TcpStream, NetworkError> {
        let addrs = tokio::time::timeout(
            self.connect_timeout,
            lookup_host((endpoint.host(), endpoint.port())),
        )
        .await
        .map_err(|_| NetworkError::Timeout(self.connect_timeout))??;

        let mut last_error = None;
        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(self.tcp_keep_alive)?;

            match tokio::time::timeout(self.connect_timeout, socket.connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(self.tcp_no_delay)?;
                    trace!(%endpoint, %addr, "Socket connected");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(%endpoint, %addr, error = %e, "Connect attempt failed");
                    last_error = Some(NetworkError::Io(e));
                }
                Err(_) => last_error = Some(NetworkError::Timeout(self.connect_timeout)),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            NetworkError::ConnectionFailed(format!("no addresses resolved for {}", endpoint))
        }))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>> {
        let stream = self
            .open(endpoint)
            .await
            .map_err(|e| Error::transient(endpoint, e))?;

        match &self.tls {
            Some(tls) => tls
                .connector()
                .wrap(endpoint, stream)
                .await
                .map_err(|e| Error::transient(endpoint, e)),
            None => Ok(Box::new(stream)),
        }
    }
}
