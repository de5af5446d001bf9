//! Server side: inbound dispatch of transactional cache commands.
//!
//! Commands received from other nodes are run only once their
//! preconditions hold (topology installed, older transactions resolved,
//! keys locked). Those preconditions are expressed as [`ReadyAction`]s,
//! polled without blocking by a [`ReadyExecutor`].

pub mod action;
mod command;
mod dispatcher;
mod executor;
mod locks;
mod pending;
mod promise;
mod runnable;
mod topology;

pub use action::{
    ActionContext, ActionFailure, ActionListener, ActionState, ActionStatus, CompositeAction,
    DefaultReadyAction, ReadyAction,
};
pub use command::{
    CommandInvoker, CommandPayload, ErrorEnvelope, LockRequest, RemoteCommand, Reply, Response,
    LOCK_CONTROL_COMMAND_ID, MULTIPLE_RPC_COMMAND_ID, PREPARE_COMMAND_ID,
    STATE_REQUEST_COMMAND_ID, VERSIONED_PREPARE_COMMAND_ID,
};
pub use dispatcher::TxInboundHandler;
pub use executor::{Job, ReadinessCheck, ReadyExecutor, ScheduledTask};
pub use locks::{KeyLockManager, LockManager, LockOutcome, LockPromise};
pub use pending::{PendingLockManager, PendingPromise, PendingTxTracker};
pub use promise::{Completer, Promise};
pub use runnable::{CommandGate, CommandRunnable, TopologyWait};
pub use topology::{SubscriptionId, TopologyListener, TopologyTracker};
