//! Error types for the client router and the server dispatcher.

use crate::types::{Endpoint, TopologyId, TxId};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Connect refused or reset, or a read timed out.
    #[error("transient failure on {endpoint}: {source}")]
    TransientEndpoint {
        endpoint: Endpoint,
        #[source]
        source: NetworkError,
    },

    /// No connection became available within the connect timeout.
    #[error("connection pool exhausted for {endpoint} after {waited:?}")]
    PoolExhausted { endpoint: Endpoint, waited: Duration },

    /// The server is not the owner of the key, or its view is newer.
    #[error("stale topology for cache '{cache}' (server topology {server_topology:?})")]
    StaleTopology {
        cache: String,
        endpoint: Option<Endpoint>,
        server_topology: Option<TopologyId>,
    },

    /// Retry budget and failover clusters are both exhausted.
    #[error("no reachable servers for cache '{0}'")]
    NoReachableServers(String),

    /// Malformed frame or unexpected message.
    #[error("protocol error: {message}")]
    Protocol {
        endpoint: Option<Endpoint>,
        message: String,
    },

    /// Application level failure reported by the server.
    #[error("application error: {0}")]
    Application(String),

    /// A command waited for a topology that never got installed.
    #[error("topology {expected} not installed for cache '{cache}' (installed {installed}) within {waited:?}")]
    TopologyTimeout {
        cache: String,
        expected: TopologyId,
        installed: TopologyId,
        waited: Duration,
    },

    /// Lock acquisition exceeded its timeout.
    #[error("unable to acquire lock after {0:?}")]
    LockTimeout(Duration),

    /// Lock acquisition would deadlock.
    #[error("deadlock detected: {requestor} waits on {holder}")]
    Deadlock { requestor: TxId, holder: TxId },

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The cache, pool or executor was shut down.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Raw I/O level failures, classified into [`Error`] by the router.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Read or write did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Serializable discriminant of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    TransientEndpoint,
    PoolExhausted,
    StaleTopology,
    NoReachableServers,
    Protocol,
    Application,
    TopologyTimeout,
    LockTimeout,
    Deadlock,
    Config,
    Cancelled,
    Internal,
}

impl Error {
    /// Build a transient failure for an endpoint.
    pub fn transient(endpoint: &Endpoint, source: impl Into<NetworkError>) -> Self {
        Error::TransientEndpoint {
            endpoint: endpoint.clone(),
            source: source.into(),
        }
    }

    /// Build a protocol error tied to an endpoint.
    pub fn protocol(endpoint: Option<&Endpoint>, message: impl Into<String>) -> Self {
        Error::Protocol {
            endpoint: endpoint.cloned(),
            message: message.into(),
        }
    }

    /// The taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransientEndpoint { .. } => ErrorKind::TransientEndpoint,
            Error::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Error::StaleTopology { .. } => ErrorKind::StaleTopology,
            Error::NoReachableServers(_) => ErrorKind::NoReachableServers,
            Error::Protocol { .. } => ErrorKind::Protocol,
            Error::Application(_) => ErrorKind::Application,
            Error::TopologyTimeout { .. } => ErrorKind::TopologyTimeout,
            Error::LockTimeout(_) => ErrorKind::LockTimeout,
            Error::Deadlock { .. } => ErrorKind::Deadlock,
            Error::Config(_) => ErrorKind::Config,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may reissue the operation against another server.
    ///
    /// Lock failures are excluded here; operations opt into retrying them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientEndpoint
                | ErrorKind::PoolExhausted
                | ErrorKind::StaleTopology
                | ErrorKind::Protocol
                | ErrorKind::TopologyTimeout
        )
    }

    /// Whether the connection that produced this error must be discarded.
    pub fn invalidates_connection(&self) -> bool {
        matches!(
            self,
            Error::TransientEndpoint { .. } | Error::Protocol { .. }
        )
    }

    /// The endpoint blamed for the failure, if any.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            Error::TransientEndpoint { endpoint, .. } | Error::PoolExhausted { endpoint, .. } => {
                Some(endpoint)
            }
            Error::StaleTopology { endpoint, .. } | Error::Protocol { endpoint, .. } => {
                endpoint.as_ref()
            }
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::protocol(None, format!("serialization: {}", e))
    }
}
