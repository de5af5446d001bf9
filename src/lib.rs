//! Topology-aware Hot Rod client transport and transactional inbound
//! command dispatcher for an in-memory data grid.
//!
//! This crate provides both sides of a grid's key routing:
//! - **Client router** that leases pooled connections to the owner of a key
//! - **Topology registry** fed by piggybacked updates, strictly monotonic per cache
//! - **Cluster failover** across named server sets
//! - **Inbound dispatcher** that runs transactional commands once their
//!   topology, pending transactions and locks allow it
//!
//! # Features
//!
//! - Segment-based and legacy hash wheel consistent hashing
//! - Bounded per-endpoint connection pools with length-prefixed framing
//! - Retry driver classifying failures by error kind
//! - Non-blocking ready actions with first-wins completion
//! - Sum aggregation over numeric query columns
//!
//! # Example
//!
//! ```rust,no_run
//! use hotrod::{ClientConfig, Endpoint, Invoker, RemoteOperation, Result, Router, Transport};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl RemoteOperation for Ping {
//!     type Output = bytes::Bytes;
//!
//!     fn cache_name(&self) -> &str {
//!         "users"
//!     }
//!
//!     async fn execute(&mut self, transport: &mut Transport) -> Result<Self::Output> {
//!         transport.request(b"ping").await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new(vec!["127.0.0.1:11222".parse::<Endpoint>()?])
//!         .with_failover_cluster("backup", vec![Endpoint::new("10.0.1.5", 11222)]);
//!
//!     let router = Arc::new(Router::new(config)?);
//!     let invoker = Invoker::new(router.clone());
//!
//!     let reply = invoker.execute(&mut Ping).await?;
//!     println!("{} bytes from cluster '{}'", reply.len(), router.cluster_name());
//!
//!     router.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!           client                                  server
//! ┌─────────────────────────┐          ┌─────────────────────────────┐
//! │ Invoker (retry driver)  │          │ TxInboundHandler            │
//! └────────────┬────────────┘          │  classify -> ready action   │
//!              ▼                       └──────────────┬──────────────┘
//! ┌─────────────────────────┐                         ▼
//! │ Router                  │          ┌─────────────────────────────┐
//! │  key -> segment -> owner│          │ ReadyExecutor               │
//! └─────┬─────────────┬─────┘          │  parked gates, bounded pool │
//!       ▼             ▼                └──────────────┬──────────────┘
//! ┌───────────┐ ┌─────────────┐                       ▼
//! │ Topology  │ │ Connection  │        ┌─────────────────────────────┐
//! │ Registry  │ │ Pool        │        │ topology -> pending -> lock │
//! └───────────┘ └─────────────┘        └─────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Topology**: a cache's topology id only grows; stale updates are dropped
//! - **Routing**: best effort; a stale owner answers with a fresher topology
//! - **Locks**: a command runs only while its transaction holds every key it locks

pub mod client;
pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod pool;
pub mod query;
pub mod server;
pub mod topology;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use client::{Invoker, RemoteOperation, RoundRobinBalancer, Router};
pub use config::{ClientConfig, ClusterConfig, DispatcherConfig, TlsContext, DEFAULT_CLUSTER_NAME};
pub use error::{Error, ErrorKind, NetworkError, Result};
pub use types::{DeliverOrder, Endpoint, LockingMode, SegmentId, TopologyId, TxId};

// Re-export hashing and topology types
pub use hash::{ConsistentHash, ConsistentHashFactory, HashFunction};
pub use topology::{CacheTopologyInfo, TopologyEvent, TopologyRegistry, TopologyUpdate};

// Re-export transport types
pub use pool::{ConnectionPool, Connector, SecureConnector, TcpConnector, Transport};

// Re-export dispatcher types
pub use server::{
    CommandInvoker, KeyLockManager, LockManager, PendingTxTracker, RemoteCommand, Reply, Response,
    TopologyTracker, TxInboundHandler,
};

// Re-export metrics types
pub use metrics::{DispatcherMetricsSnapshot, PoolMetricsSnapshot, RouterMetricsSnapshot};

// Re-export query types
pub use query::{FieldType, FieldValue, SumAccumulator};
