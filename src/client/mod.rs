//! Client transport and topology routing.
//!
//! The [`Router`] turns a cache name (and optionally a key) into a leased
//! [`Transport`](crate::pool::Transport). The [`Invoker`] drives a
//! [`RemoteOperation`] through the router, retrying on failures that another
//! server or a fresher topology can fix, and switching to a failover cluster
//! once the current one is unreachable.

mod balancer;
mod invoker;
mod router;

pub use balancer::RoundRobinBalancer;
pub use invoker::{Invoker, RemoteOperation};
pub use router::Router;
