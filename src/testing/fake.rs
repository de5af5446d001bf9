//! In-memory connector whose endpoints echo framed requests.

use crate::error::{Error, NetworkError, Result};
use crate::pool::{Channel, Connector};
use crate::types::Endpoint;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Connector backed by `tokio::io::duplex` pipes.
///
/// Every endpoint answers a frame `p` with the frame `"<endpoint>|" + p`.
/// Endpoints can be switched to refuse connections.
#[derive(Default)]
pub(crate) struct FakeConnector {
    refused: Mutex<HashSet<Endpoint>>,
    connects: Mutex<HashMap<Endpoint, usize>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn refuse(&self, endpoint: &Endpoint) {
        self.refused.lock().insert(endpoint.clone());
    }

    pub(crate) fn accept(&self, endpoint: &Endpoint) {
        self.refused.lock().remove(endpoint);
    }

    /// Successful connects to `endpoint` so far.
    pub(crate) fn connect_count(&self, endpoint: &Endpoint) -> usize {
        self.connects.lock().get(endpoint).copied().unwrap_or(0)
    }

    pub(crate) fn echo_reply(endpoint: &Endpoint, payload: &[u8]) -> Vec<u8> {
        let mut reply = format!("{}|", endpoint).into_bytes();
        reply.extend_from_slice(payload);
        reply
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>> {
        if self.refused.lock().contains(endpoint) {
            return Err(Error::transient(
                endpoint,
                NetworkError::ConnectionFailed("connection refused".into()),
            ));
        }
        *self.connects.lock().entry(endpoint.clone()).or_insert(0) += 1;

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(echo(endpoint.clone(), server));
        Ok(Box::new(client))
    }
}

async fn echo(endpoint: Endpoint, mut stream: DuplexStream) {
    loop {
        let Ok(len) = stream.read_u32().await else {
            return;
        };
        let mut payload = vec![0u8; len as usize];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }
        let reply = FakeConnector::echo_reply(&endpoint, &payload);
        if stream.write_u32(reply.len() as u32).await.is_err()
            || stream.write_all(&reply).await.is_err()
        {
            return;
        }
    }
}
