//! Pooled client connections.
//!
//! A [`ConnectionPool`] keeps idle connections per endpoint and hands out
//! exclusive [`Transport`] leases. Transports frame every message with a
//! 4-byte big-endian length prefix:
//!
//! ```text
//! +----------------+---------------------+
//! | len (u32, BE)  | payload (len bytes) |
//! +----------------+---------------------+
//! ```

mod connection_pool;
mod connector;
mod transport;

pub use connection_pool::{ConnectionPool, EndpointStats};
pub use connector::{Channel, Connector, SecureConnector, TcpConnector};
pub use transport::{Connection, Transport};
