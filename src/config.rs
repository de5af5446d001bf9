//! Configuration types for the client router and the server dispatcher.

use crate::error::{Error, Result};
use crate::pool::SecureConnector;
use crate::types::{Endpoint, LockingMode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Name of the cluster built from [`ClientConfig::servers`].
pub const DEFAULT_CLUSTER_NAME: &str = "default";

/// Client side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bootstrap servers of the primary cluster.
    pub servers: Vec<Endpoint>,

    /// Failover clusters, tried in order after the primary one.
    pub failover_clusters: Vec<ClusterConfig>,

    /// Disable Nagle's algorithm on client sockets.
    pub tcp_no_delay: bool,

    /// Enable OS level keepalive.
    pub tcp_keep_alive: bool,

    /// Per-operation retry budget.
    pub max_retries: u32,

    /// Per-I/O read/write timeout.
    pub so_timeout: Duration,

    /// Connection establishment and pool borrow timeout.
    pub connect_timeout: Duration,

    /// Maximum number of connections per endpoint.
    pub max_active_per_endpoint: usize,

    /// Largest frame accepted on a connection.
    pub max_frame_size: usize,

    /// When present, every connection is wrapped by this context.
    pub tls: Option<TlsContext>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            failover_clusters: Vec::new(),
            tcp_no_delay: true,
            tcp_keep_alive: false,
            max_retries: 10,
            so_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(60),
            max_active_per_endpoint: 16,
            max_frame_size: 16 * 1024 * 1024,
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Create a configuration bootstrapping from the given servers.
    pub fn new(servers: Vec<Endpoint>) -> Self {
        Self {
            servers,
            ..Default::default()
        }
    }

    /// Add a failover cluster.
    pub fn with_failover_cluster(mut self, name: impl Into<String>, servers: Vec<Endpoint>) -> Self {
        self.failover_clusters.push(ClusterConfig::new(name, servers));
        self
    }

    /// Set TCP_NODELAY.
    pub fn with_tcp_no_delay(mut self, enabled: bool) -> Self {
        self.tcp_no_delay = enabled;
        self
    }

    /// Set SO_KEEPALIVE.
    pub fn with_tcp_keep_alive(mut self, enabled: bool) -> Self {
        self.tcp_keep_alive = enabled;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the socket timeout.
    pub fn with_so_timeout(mut self, timeout: Duration) -> Self {
        self.so_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-endpoint connection cap.
    pub fn with_max_active(mut self, max: usize) -> Self {
        self.max_active_per_endpoint = max;
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Wrap connections with a security context.
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    /// All clusters, primary first.
    pub fn clusters(&self) -> Vec<ClusterConfig> {
        let mut clusters = Vec::with_capacity(1 + self.failover_clusters.len());
        clusters.push(ClusterConfig::new(DEFAULT_CLUSTER_NAME, self.servers.clone()));
        clusters.extend(self.failover_clusters.iter().cloned());
        clusters
    }

    /// Check the configuration for values the router cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config("at least one server is required".into()));
        }
        if self.max_active_per_endpoint == 0 {
            return Err(Error::Config("max_active_per_endpoint must be at least 1".into()));
        }
        if self.connect_timeout.is_zero() || self.so_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        if self.max_frame_size < 4 {
            return Err(Error::Config("max_frame_size is too small".into()));
        }
        for cluster in &self.failover_clusters {
            if cluster.name == DEFAULT_CLUSTER_NAME {
                return Err(Error::Config(format!(
                    "failover cluster name '{}' is reserved",
                    DEFAULT_CLUSTER_NAME
                )));
            }
        }
        Ok(())
    }
}

/// A named set of bootstrap servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Cluster name.
    pub name: String,

    /// Bootstrap servers.
    pub servers: Vec<Endpoint>,
}

impl ClusterConfig {
    /// Create a new cluster definition.
    pub fn new(name: impl Into<String>, servers: Vec<Endpoint>) -> Self {
        Self {
            name: name.into(),
            servers,
        }
    }
}

/// Transport security context applied to freshly connected sockets.
#[derive(Clone)]
pub struct TlsContext {
    connector: Arc<dyn SecureConnector>,
}

impl TlsContext {
    /// Create a context from a secure connector.
    pub fn new(connector: Arc<dyn SecureConnector>) -> Self {
        Self { connector }
    }

    /// The connector that wraps plain sockets.
    pub fn connector(&self) -> &Arc<dyn SecureConnector> {
        &self.connector
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

/// Server side per-cache dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Locking mode of the transactional cache.
    pub locking_mode: LockingMode,

    /// Upper bound on lock acquisition, including the pending transaction wait.
    pub lock_acquisition_timeout: Duration,

    /// How long a command may wait for a topology more than one view ahead.
    pub topology_wait_timeout: Duration,

    /// Views the installed topology may advance past a parked command before
    /// the command is cancelled.
    pub topology_horizon: i32,

    /// Maximum number of commands executing concurrently.
    pub max_concurrent_tasks: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            locking_mode: LockingMode::Optimistic,
            lock_acquisition_timeout: Duration::from_secs(10),
            topology_wait_timeout: Duration::from_secs(30),
            topology_horizon: 1,
            max_concurrent_tasks: 64,
        }
    }
}

impl DispatcherConfig {
    /// Set the locking mode.
    pub fn with_locking_mode(mut self, mode: LockingMode) -> Self {
        self.locking_mode = mode;
        self
    }

    /// Set the lock acquisition timeout.
    pub fn with_lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = timeout;
        self
    }

    /// Set the topology wait timeout.
    pub fn with_topology_wait_timeout(mut self, timeout: Duration) -> Self {
        self.topology_wait_timeout = timeout;
        self
    }

    /// Set the topology horizon.
    pub fn with_topology_horizon(mut self, views: i32) -> Self {
        self.topology_horizon = views;
        self
    }

    /// Set the executor concurrency.
    pub fn with_max_concurrent_tasks(mut self, tasks: usize) -> Self {
        self.max_concurrent_tasks = tasks;
        self
    }

    /// Whether prepares arrive with their locks already held.
    pub fn is_pessimistic(&self) -> bool {
        self.locking_mode == LockingMode::Pessimistic
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(Error::Config("max_concurrent_tasks must be at least 1".into()));
        }
        if self.topology_horizon < 0 {
            return Err(Error::Config("topology_horizon must not be negative".into()));
        }
        Ok(())
    }
}
