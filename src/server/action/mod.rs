//! Ready actions: non-blocking preconditions guarding command execution.
//!
//! A [`ReadyAction`] is polled with [`ReadyAction::status`]. Each poll
//! advances it as far as it can go without blocking; when it cannot go
//! further it registers for the event that unblocks it and reports
//! `NotReady`. Such events fire the action's listener, which is expected to
//! schedule another poll rather than poll inline.
//!
//! ```text
//! DefaultReadyAction:  [guards] -> topology -> pending tx -> lock
//! CompositeAction:     ready iff every child is ready
//! ```

mod composite;
mod default;
mod steps;

pub use composite::CompositeAction;
pub use default::{ActionContext, ActionState, DefaultReadyAction};
pub use steps::{LockStep, PendingTxStep, ReadyStep, StepStatus, TopologyStep};

use crate::error::Error;
use crate::types::{TopologyId, TxId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Callback fired when a ready action may have progressed.
pub type ActionListener = Arc<dyn Fn() + Send + Sync>;

/// Why an action gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionFailure {
    LockTimeout(Duration),
    Deadlock { requestor: TxId, holder: TxId },
    TopologyTimeout {
        expected: TopologyId,
        installed: TopologyId,
        waited: Duration,
    },
    /// The installed topology moved past the command's horizon.
    OutdatedTopology {
        command: TopologyId,
        installed: TopologyId,
    },
    Cancelled(String),
}

impl ActionFailure {
    /// The error reported to the command's sender.
    pub fn into_error(self, cache: &str) -> Error {
        match self {
            ActionFailure::LockTimeout(timeout) => Error::LockTimeout(timeout),
            ActionFailure::Deadlock { requestor, holder } => Error::Deadlock { requestor, holder },
            ActionFailure::TopologyTimeout {
                expected,
                installed,
                waited,
            } => Error::TopologyTimeout {
                cache: cache.to_string(),
                expected,
                installed,
                waited,
            },
            ActionFailure::OutdatedTopology { installed, .. } => Error::StaleTopology {
                cache: cache.to_string(),
                endpoint: None,
                server_topology: Some(installed),
            },
            ActionFailure::Cancelled(reason) => Error::Cancelled(reason),
        }
    }
}

/// State of a ready action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    NotReady,
    Ready,
    Canceled(ActionFailure),
}

impl ActionStatus {
    /// Ready or canceled. Either way the command can proceed to its reply.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionStatus::NotReady)
    }
}

/// A monotonic precondition for running a command.
pub trait ReadyAction: Send + Sync {
    /// Advance without blocking and report the current state.
    fn status(&self) -> ActionStatus;

    /// Whether the command can be run (or failed). Safe to call from any
    /// thread at any time.
    fn is_ready(&self) -> bool {
        self.status().is_terminal()
    }

    /// Set the progress listener. Only the last one registered is notified.
    fn add_listener(&self, listener: ActionListener);

    /// Give up, releasing anything acquired so far.
    fn cancel(&self, reason: ActionFailure);

    /// Called after the command ran. On failure, held locks are released.
    fn on_finally(&self, success: bool);
}

/// Holds the current listener of an action.
#[derive(Default)]
pub struct Notifier {
    listener: Mutex<Option<ActionListener>>,
}

impl Notifier {
    pub fn set(&self, listener: ActionListener) {
        *self.listener.lock() = Some(listener);
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Call the listener, if any, with no lock held.
    pub fn notify(&self) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("has_listener", &self.has_listener())
            .finish()
    }
}
