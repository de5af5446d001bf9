//! Per-endpoint connection pooling.

use super::connector::Connector;
use super::transport::{Connection, Transport};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::metrics::{inc, PoolMetrics, PoolMetricsSnapshot};
use crate::types::Endpoint;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Point-in-time view of one endpoint's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStats {
    pub checked_out: usize,
    pub idle: usize,
    pub open: usize,
    pub max_active: usize,
}

/// Idle connections and the lease budget of one endpoint.
///
/// Every checked-out transport holds one permit of `permits`, so at most
/// `max_active` leases exist at any time.
pub(crate) struct EndpointPool {
    endpoint: Endpoint,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connection>>,
    checked_out: AtomicUsize,
    retired: AtomicBool,
    max_active: usize,
}

impl EndpointPool {
    fn new(endpoint: Endpoint, max_active: usize) -> Self {
        Self {
            endpoint,
            permits: Arc::new(Semaphore::new(max_active)),
            idle: Mutex::new(VecDeque::new()),
            checked_out: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            max_active,
        }
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn push_idle(&self, conn: Connection) {
        self.idle.lock().push_back(conn);
    }

    pub(crate) fn checked_in(&self) {
        self.checked_out.fetch_sub(1, Ordering::AcqRel);
    }

    /// Stop accepting connections back and close the idle ones.
    fn retire(&self) -> usize {
        self.retired.store(true, Ordering::Release);
        let drained: Vec<Connection> = self.idle.lock().drain(..).collect();
        drained.len()
    }

    fn stats(&self) -> EndpointStats {
        let checked_out = self.checked_out.load(Ordering::Acquire);
        let idle = self.idle.lock().len();
        EndpointStats {
            checked_out,
            idle,
            open: checked_out + idle,
            max_active: self.max_active,
        }
    }
}

/// Connection pool keyed by endpoint.
///
/// The pool never retries. It hands out transports, takes them back, and
/// reports failures to the caller.
pub struct ConnectionPool {
    endpoints: DashMap<Endpoint, Arc<EndpointPool>>,
    connector: Arc<dyn Connector>,
    max_active: usize,
    connect_timeout: Duration,
    so_timeout: Duration,
    max_frame_size: usize,
    closed: AtomicBool,
    next_id: AtomicU64,
    metrics: Arc<PoolMetrics>,
}

impl ConnectionPool {
    /// Create a pool using the limits in `config`.
    pub fn new(config: &ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            endpoints: DashMap::new(),
            connector,
            max_active: config.max_active_per_endpoint,
            connect_timeout: config.connect_timeout,
            so_timeout: config.so_timeout,
            max_frame_size: config.max_frame_size,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// The pool of `endpoint`, created on first use.
    ///
    /// `closed` is checked after the entry exists: a pool created while
    /// `shutdown` runs is closed here rather than handed out.
    fn endpoint_pool(&self, endpoint: &Endpoint) -> Result<Arc<EndpointPool>> {
        let pool = self
            .endpoints
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(EndpointPool::new(endpoint.clone(), self.max_active)))
            .clone();
        if self.is_closed() {
            pool.permits.close();
            pool.retire();
            self.endpoints.remove(endpoint);
            return Err(Error::Cancelled("connection pool is shut down".into()));
        }
        Ok(pool)
    }

    /// Lease a connection to `endpoint`.
    ///
    /// Reuses an idle connection when there is one, otherwise opens a new one
    /// if the endpoint is below its limit. Waits up to the connect timeout for
    /// a lease to free up, then fails with [`Error::PoolExhausted`].
    pub async fn borrow(&self, endpoint: &Endpoint) -> Result<Transport> {
        if self.is_closed() {
            return Err(Error::Cancelled("connection pool is shut down".into()));
        }

        let pool = self.endpoint_pool(endpoint)?;
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.connect_timeout,
            pool.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Cancelled("connection pool is shut down".into())),
            Err(_) => {
                inc(&self.metrics.exhausted);
                warn!(%endpoint, max_active = self.max_active, "Connection pool exhausted");
                return Err(Error::PoolExhausted {
                    endpoint: endpoint.clone(),
                    waited: started.elapsed(),
                });
            }
        };

        let idle = pool.idle.lock().pop_front();
        let conn = match idle {
            Some(conn) => conn,
            None => match self.connector.connect(endpoint).await {
                Ok(channel) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    inc(&self.metrics.connections_created);
                    debug!(%endpoint, conn_id = id, "Connection opened");
                    Connection::new(id, endpoint.clone(), channel)
                }
                Err(e) => {
                    inc(&self.metrics.connect_failures);
                    return Err(e);
                }
            },
        };

        pool.checked_out.fetch_add(1, Ordering::AcqRel);
        inc(&self.metrics.borrows);
        Ok(Transport::new(
            conn,
            permit,
            &pool,
            self.metrics.clone(),
            self.so_timeout,
            self.max_frame_size,
        ))
    }

    /// Return a transport. Healthy connections go back to the idle queue.
    pub fn release(&self, mut transport: Transport) {
        transport.release();
    }

    /// Discard a transport's connection.
    pub fn invalidate(&self, mut transport: Transport) {
        debug!(endpoint = %transport.endpoint(), conn_id = ?transport.connection_id(), "Invalidating connection");
        transport.mark_broken();
        transport.release();
    }

    /// Close idle connections to `endpoint` and forget it. Transports still
    /// out are closed when they come back. Returns the number closed now.
    pub fn drain(&self, endpoint: &Endpoint) -> usize {
        let Some((_, pool)) = self.endpoints.remove(endpoint) else {
            return 0;
        };
        let closed = pool.retire();
        self.metrics
            .connections_closed
            .fetch_add(closed as u64, Ordering::Relaxed);
        debug!(%endpoint, closed, "Endpoint drained");
        closed
    }

    /// Close all idle connections and refuse further borrows.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut closed = 0;
        for entry in self.endpoints.iter() {
            entry.permits.close();
            closed += entry.retire();
        }
        self.endpoints.clear();
        self.metrics
            .connections_closed
            .fetch_add(closed as u64, Ordering::Relaxed);
        info!(closed, "Connection pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stats for an endpoint the pool knows about.
    pub fn stats(&self, endpoint: &Endpoint) -> Option<EndpointStats> {
        self.endpoints.get(endpoint).map(|pool| pool.stats())
    }

    /// Endpoints with a live pool.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.iter().map(|e| e.endpoint.clone()).collect()
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoints", &self.endpoints.len())
            .field("max_active", &self.max_active)
            .field("closed", &self.is_closed())
            .finish()
    }
}
