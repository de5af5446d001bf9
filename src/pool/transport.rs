//! Leased connections and length-prefixed framing.

use super::connection_pool::EndpointPool;
use super::connector::Channel;
use crate::error::{Error, NetworkError, Result};
use crate::metrics::{inc, PoolMetrics};
use crate::types::Endpoint;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, trace};

/// An open channel to one endpoint, owned by the pool while idle.
pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    channel: Box<dyn Channel>,
    created_at: Instant,
}

impl Connection {
    pub(crate) fn new(id: u64, endpoint: Endpoint, channel: Box<dyn Channel>) -> Self {
        Self {
            id,
            endpoint,
            channel,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("age", &self.age())
            .finish()
    }
}

/// Exclusive lease on a pooled connection.
///
/// Return it with `ConnectionPool::release` or `ConnectionPool::invalidate`.
/// A transport dropped without either is discarded, since whatever was in
/// flight on it is unknown.
pub struct Transport {
    endpoint: Endpoint,
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Weak<EndpointPool>,
    metrics: Arc<PoolMetrics>,
    broken: bool,
    epoch: u64,
    so_timeout: Duration,
    max_frame_size: usize,
}

impl Transport {
    pub(crate) fn new(
        conn: Connection,
        permit: OwnedSemaphorePermit,
        pool: &Arc<EndpointPool>,
        metrics: Arc<PoolMetrics>,
        so_timeout: Duration,
        max_frame_size: usize,
    ) -> Self {
        Self {
            endpoint: conn.endpoint().clone(),
            conn: Some(conn),
            permit: Some(permit),
            pool: Arc::downgrade(pool),
            metrics,
            broken: false,
            epoch: 0,
            so_timeout,
            max_frame_size,
        }
    }

    /// The endpoint this transport talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Id of the underlying connection, `None` once released.
    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(Connection::id)
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Flag the connection so that release discards it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Cluster generation this transport was leased under.
    pub fn cluster_epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn set_cluster_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Write one frame.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_frame_size {
            self.broken = true;
            return Err(Error::protocol(
                Some(&self.endpoint),
                format!(
                    "frame of {} bytes exceeds limit {}",
                    payload.len(),
                    self.max_frame_size
                ),
            ));
        }

        let so_timeout = self.so_timeout;
        let channel = self.channel()?;
        let len = payload.len() as u32;

        let result = match tokio::time::timeout(so_timeout, write_frame(channel, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(NetworkError::Io(e)),
            Err(_) => Err(NetworkError::Timeout(so_timeout)),
        };
        self.io_result(result)?;
        trace!(endpoint = %self.endpoint, len, "Frame sent");
        Ok(())
    }

    /// Read one frame.
    pub async fn receive(&mut self) -> Result<Bytes> {
        let so_timeout = self.so_timeout;
        let max_frame_size = self.max_frame_size;
        let channel = self.channel()?;

        let read = read_frame(channel, max_frame_size);

        let result = match tokio::time::timeout(so_timeout, read).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(NetworkError::ConnectionClosed)
            }
            Ok(Err(e)) => Err(NetworkError::Io(e)),
            Err(_) => Err(NetworkError::Timeout(so_timeout)),
        };

        match self.io_result(result)? {
            Ok(buf) => {
                trace!(endpoint = %self.endpoint, len = buf.len(), "Frame received");
                Ok(Bytes::from(buf))
            }
            Err(len) => {
                self.broken = true;
                Err(Error::protocol(
                    Some(&self.endpoint),
                    format!("incoming frame of {} bytes exceeds limit {}", len, max_frame_size),
                ))
            }
        }
    }

    /// Write a frame and wait for the reply frame.
    pub async fn request(&mut self, payload: &[u8]) -> Result<Bytes> {
        self.send(payload).await?;
        self.receive().await
    }

    fn channel(&mut self) -> Result<&mut Box<dyn Channel>> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut conn.channel),
            None => Err(Error::Internal(format!(
                "transport to {} used after release",
                self.endpoint
            ))),
        }
    }

    fn io_result<T>(&mut self, result: std::result::Result<T, NetworkError>) -> Result<T> {
        result.map_err(|e| {
            self.broken = true;
            Error::transient(&self.endpoint, e)
        })
    }

    /// Hand the connection back to its endpoint pool, or close it if broken
    /// or if the pool was retired. Calling this more than once is a no-op.
    pub(crate) fn release(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        match self.pool.upgrade() {
            Some(pool) => {
                pool.checked_in();
                if self.broken || pool.is_retired() {
                    debug!(endpoint = %self.endpoint, conn_id = conn.id(), broken = self.broken, "Closing connection");
                    inc(&self.metrics.connections_closed);
                } else {
                    pool.push_idle(conn);
                }
            }
            None => inc(&self.metrics.connections_closed),
        }

        // Idle first, then the permit, so a waiter finds the connection.
        self.permit.take();
    }
}

async fn write_frame(channel: &mut Box<dyn Channel>, payload: &[u8]) -> io::Result<()> {
    channel.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    channel.write_all(payload).await?;
    channel.flush().await
}

/// Reads a frame, or returns the announced length if it is over the limit.
async fn read_frame(
    channel: &mut Box<dyn Channel>,
    max_frame_size: usize,
) -> io::Result<std::result::Result<Vec<u8>, usize>> {
    let len = channel.read_u32().await? as usize;
    if len > max_frame_size {
        return Ok(Err(len));
    }
    let mut buf = vec![0u8; len];
    channel.read_exact(&mut buf).await?;
    Ok(Ok(buf))
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.conn.is_some() {
            self.broken = true;
            self.release();
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint)
            .field("connection_id", &self.connection_id())
            .field("broken", &self.broken)
            .field("epoch", &self.epoch)
            .finish()
    }
}
