//! Remote cache commands, replies and the invocation seam.

use crate::error::{Error, ErrorKind, Result};
use crate::types::{DeliverOrder, Endpoint, TopologyId, TxId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Command id of a batch of commands.
pub const MULTIPLE_RPC_COMMAND_ID: u8 = 2;
/// Command id of a lock control command.
pub const LOCK_CONTROL_COMMAND_ID: u8 = 3;
/// Command id of a prepare.
pub const PREPARE_COMMAND_ID: u8 = 12;
/// Command id of a state transfer request.
pub const STATE_REQUEST_COMMAND_ID: u8 = 15;
/// Command id of a versioned prepare.
pub const VERSIONED_PREPARE_COMMAND_ID: u8 = 26;

/// A command received from another node for one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub cache_name: String,
    /// Topology the sender issued the command in.
    pub topology_id: TopologyId,
    pub origin: Option<Endpoint>,
    /// Ordering the sender requested. Only meaningful inside a batch.
    pub issued_order: DeliverOrder,
    pub payload: CommandPayload,
}

/// What a command asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPayload {
    /// Several commands delivered together.
    MultipleRpc(Vec<RemoteCommand>),
    Prepare(LockRequest),
    VersionedPrepare(LockRequest),
    /// Eager lock (or unlock) of keys in a pessimistic transaction.
    LockControl { lock: LockRequest, unlock: bool },
    /// State transfer request for a set of segments.
    StateRequest { segments: Vec<u32> },
    /// Anything this dispatcher does not look into.
    Other { command_id: u8, body: Bytes },
}

/// The transactional locking part of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub tx: TxId,
    pub keys: Vec<Bytes>,
    pub skip_locking: bool,
    /// Fail instead of waiting when a key is held.
    pub zero_lock_acquisition: bool,
}

impl LockRequest {
    pub fn new(tx: TxId, keys: Vec<Bytes>) -> Self {
        Self {
            tx,
            keys,
            skip_locking: false,
            zero_lock_acquisition: false,
        }
    }

    pub fn with_skip_locking(mut self) -> Self {
        self.skip_locking = true;
        self
    }

    pub fn with_zero_lock_acquisition(mut self) -> Self {
        self.zero_lock_acquisition = true;
        self
    }
}

impl RemoteCommand {
    pub fn new(cache_name: impl Into<String>, topology_id: TopologyId, payload: CommandPayload) -> Self {
        Self {
            cache_name: cache_name.into(),
            topology_id,
            origin: None,
            issued_order: DeliverOrder::None,
            payload,
        }
    }

    pub fn with_origin(mut self, origin: Endpoint) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_order(mut self, order: DeliverOrder) -> Self {
        self.issued_order = order;
        self
    }

    /// Wire id of the command.
    pub fn command_id(&self) -> u8 {
        match &self.payload {
            CommandPayload::MultipleRpc(_) => MULTIPLE_RPC_COMMAND_ID,
            CommandPayload::Prepare(_) => PREPARE_COMMAND_ID,
            CommandPayload::VersionedPrepare(_) => VERSIONED_PREPARE_COMMAND_ID,
            CommandPayload::LockControl { .. } => LOCK_CONTROL_COMMAND_ID,
            CommandPayload::StateRequest { .. } => STATE_REQUEST_COMMAND_ID,
            CommandPayload::Other { command_id, .. } => *command_id,
        }
    }

    /// The locking part, for prepares and lock controls.
    pub fn lock_request(&self) -> Option<&LockRequest> {
        match &self.payload {
            CommandPayload::Prepare(lock)
            | CommandPayload::VersionedPrepare(lock)
            | CommandPayload::LockControl { lock, .. } => Some(lock),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Outcome sent back to the command's origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Success(Option<Bytes>),
    Unsuccessful,
    Exception(ErrorEnvelope),
}

impl Response {
    pub fn is_exception(&self) -> bool {
        matches!(self, Response::Exception(_))
    }

    pub fn exception(&self) -> Option<&ErrorEnvelope> {
        match self {
            Response::Exception(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// A failure wrapped for the command that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub command_id: u8,
    pub topology_id: TopologyId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn for_command(command: &RemoteCommand, error: &Error) -> Self {
        Self {
            command_id: command.command_id(),
            topology_id: command.topology_id,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command {} (topology {}) failed with {:?}: {}",
            self.command_id, self.topology_id, self.kind, self.message
        )
    }
}

/// Consume-once reply callback.
pub struct Reply(Box<dyn FnOnce(Response) + Send>);

impl Reply {
    pub fn new(f: impl FnOnce(Response) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// A reply that delivers into a oneshot channel.
    pub fn channel() -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let reply = Self::new(move |response| {
            let _ = tx.send(response);
        });
        (reply, rx)
    }

    pub fn send(self, response: Response) {
        (self.0)(response)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reply")
    }
}

/// Runs a command through the cache. Invoked once the command is ready.
#[async_trait]
pub trait CommandInvoker: Send + Sync {
    async fn invoke(&self, command: Arc<RemoteCommand>) -> Result<Response>;
}
