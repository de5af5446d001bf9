//! The individual checks a [`DefaultReadyAction`](super::DefaultReadyAction)
//! runs in order.
//!
//! A step is polled repeatedly. It starts whatever asynchronous work it needs
//! on the first poll, keeps the handle, and reports `NotReady` until that work
//! resolves. Completion is signalled through the action's notifier.

use super::default::{ActionContext, ActionState};
use super::ActionFailure;
use crate::server::locks::{LockManager, LockOutcome, LockPromise};
use crate::server::pending::{PendingLockManager, PendingPromise};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Result of polling one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Ready,
    NotReady,
    Canceled(ActionFailure),
}

/// One precondition of a ready action.
pub trait ReadyStep: Send + Sync {
    fn check(&self, state: &ActionState, ctx: &ActionContext) -> StepStatus;

    /// The action gave up. Release whatever this step holds.
    fn cancel(&self, _state: &ActionState) {}

    fn on_finally(&self, _state: &ActionState, _success: bool) {}
}

struct TopologyWait {
    since: Instant,
    timer: AbortHandle,
}

/// Waits until transaction data for the command's topology has arrived.
///
/// A command more than `horizon` views ahead of the installed topology is
/// rejected once `topology_wait_timeout` has passed.
#[derive(Default)]
pub struct TopologyStep {
    wait: Mutex<Option<TopologyWait>>,
}

impl TopologyStep {
    pub fn new() -> Self {
        Self::default()
    }

    fn stop_timer(&self) {
        if let Some(wait) = self.wait.lock().take() {
            wait.timer.abort();
        }
    }
}

impl ReadyStep for TopologyStep {
    fn check(&self, state: &ActionState, ctx: &ActionContext) -> StepStatus {
        if ctx.tracker.tx_data_received() >= state.topology_id {
            self.stop_timer();
            return StepStatus::Ready;
        }

        let since = {
            let mut wait = self.wait.lock();
            match &*wait {
                Some(wait) => wait.since,
                None => {
                    let notifier = state.notifier().clone();
                    let timeout = ctx.topology_wait_timeout;
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        notifier.notify();
                    });
                    let since = Instant::now();
                    *wait = Some(TopologyWait {
                        since,
                        timer: timer.abort_handle(),
                    });
                    trace!(tx = %state.tx, topology_id = state.topology_id, "Waiting for transaction data");
                    since
                }
            }
        };

        let waited = since.elapsed();
        let installed = ctx.tracker.installed();
        if waited >= ctx.topology_wait_timeout
            && state.topology_id > installed.saturating_add(ctx.horizon)
        {
            return StepStatus::Canceled(ActionFailure::TopologyTimeout {
                expected: state.topology_id,
                installed,
                waited,
            });
        }
        StepStatus::NotReady
    }

    fn cancel(&self, _state: &ActionState) {
        self.stop_timer();
    }

    fn on_finally(&self, _state: &ActionState, _success: bool) {
        self.stop_timer();
    }
}

/// Handle of the request a step started.
///
/// Once closed by a cancel, the step never starts a request again, so a
/// poll racing with the cancel cannot acquire anything.
enum Slot<T> {
    Idle,
    Started(T),
    Closed,
}

impl<T: Clone> Slot<T> {
    /// The started request and whether this call started it. `None` once closed.
    fn get_or_start(&mut self, start: impl FnOnce() -> T) -> Option<(T, bool)> {
        match self {
            Slot::Closed => None,
            Slot::Started(handle) => Some((handle.clone(), false)),
            Slot::Idle => {
                let handle = start();
                *self = Slot::Started(handle.clone());
                Some((handle, true))
            }
        }
    }

    /// Close the slot, returning the request if one was started.
    fn close(&mut self) -> Option<T> {
        match std::mem::replace(self, Slot::Closed) {
            Slot::Started(handle) => Some(handle),
            _ => None,
        }
    }
}

fn closed(what: &str) -> StepStatus {
    StepStatus::Canceled(ActionFailure::Cancelled(format!("{} cancelled", what)))
}

/// Waits for transactions from older topologies that touch the same keys.
///
/// The time spent here is taken out of the lock acquisition budget.
pub struct PendingTxStep {
    manager: Arc<dyn PendingLockManager>,
    slot: Mutex<Slot<PendingPromise>>,
}

impl PendingTxStep {
    pub fn new(manager: Arc<dyn PendingLockManager>) -> Self {
        Self {
            manager,
            slot: Mutex::new(Slot::Idle),
        }
    }
}

impl ReadyStep for PendingTxStep {
    fn check(&self, state: &ActionState, _ctx: &ActionContext) -> StepStatus {
        let started = self.slot.lock().get_or_start(|| {
            self.manager
                .await_pending(state.tx, state.topology_id, &state.keys, state.timeout)
        });
        let Some((promise, fresh)) = started else {
            return closed("pending transaction wait");
        };
        if fresh && !promise.is_done() {
            let notifier = state.notifier().clone();
            promise.on_complete(move || notifier.notify());
        }

        match promise.value() {
            Some(remaining) => {
                state.set_lock_budget(remaining);
                StepStatus::Ready
            }
            None => StepStatus::NotReady,
        }
    }

    fn cancel(&self, _state: &ActionState) {
        if let Some(promise) = self.slot.lock().close() {
            promise.cancel();
        }
    }
}

/// Acquires the command's keys for its transaction.
pub struct LockStep {
    manager: Arc<dyn LockManager>,
    slot: Mutex<Slot<LockPromise>>,
    released: Arc<AtomicBool>,
}

impl LockStep {
    pub fn new(manager: Arc<dyn LockManager>) -> Self {
        Self {
            manager,
            slot: Mutex::new(Slot::Idle),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn release(&self, state: &ActionState) {
        let Some(promise) = self.slot.lock().close() else {
            return;
        };
        // Cancelling a pending request releases its partial locks. A request
        // that completed, or completes while being cancelled, holds every key
        // and is unlocked once its outcome is known.
        promise.cancel();
        let manager = self.manager.clone();
        let released = self.released.clone();
        let tx = state.tx;
        let keys = state.keys.clone();
        let outcome = promise.clone();
        promise.on_complete(move || {
            if outcome.value() == Some(LockOutcome::Acquired)
                && !released.swap(true, Ordering::AcqRel)
            {
                debug!(%tx, keys = keys.len(), "Releasing locks");
                manager.unlock_all(tx, &keys);
            }
        });
    }
}

impl ReadyStep for LockStep {
    fn check(&self, state: &ActionState, _ctx: &ActionContext) -> StepStatus {
        let started = self.slot.lock().get_or_start(|| {
            let timeout = state.lock_budget().unwrap_or(state.timeout);
            self.manager.lock_all(state.tx, &state.keys, timeout)
        });
        let Some((promise, fresh)) = started else {
            return closed("lock request");
        };
        if fresh && !promise.is_done() {
            let notifier = state.notifier().clone();
            promise.on_complete(move || notifier.notify());
        }

        match promise.value() {
            None => StepStatus::NotReady,
            Some(LockOutcome::Acquired) => StepStatus::Ready,
            Some(LockOutcome::Failed(failure)) => StepStatus::Canceled(failure),
        }
    }

    fn cancel(&self, state: &ActionState) {
        self.release(state);
    }

    fn on_finally(&self, state: &ActionState, success: bool) {
        if !success {
            self.release(state);
        }
    }
}
