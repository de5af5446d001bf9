//! Transactions from older topologies that may still take locks.
//!
//! After a topology change, transactions started in an older topology can
//! still be completing on this node. A new transaction touching the same
//! keys waits for them, bounded by its lock acquisition timeout.

use super::promise::{Completer, Promise};
use crate::types::{TopologyId, TxId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::debug;

/// Resolves with the part of the timeout that is left for lock acquisition.
pub type PendingPromise = Promise<Duration>;

/// Pending-transaction service used by ready actions.
pub trait PendingLockManager: Send + Sync {
    /// Wait until no older transaction other than `tx` overlaps `keys`, or
    /// until `timeout` elapses. Never fails; on timeout the remaining budget
    /// is zero.
    fn await_pending(
        &self,
        tx: TxId,
        topology_id: TopologyId,
        keys: &[Bytes],
        timeout: Duration,
    ) -> PendingPromise;
}

struct TrackedTx {
    topology_id: TopologyId,
    keys: HashSet<Bytes>,
}

struct PendingWaiter {
    tx: TxId,
    topology_id: TopologyId,
    keys: Vec<Bytes>,
    started: Instant,
    timeout: Duration,
    completer: Completer<Duration>,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct PendingState {
    txs: HashMap<TxId, TrackedTx>,
    waiters: HashMap<u64, PendingWaiter>,
    next_id: u64,
}

impl PendingState {
    fn blocked(&self, tx: TxId, topology_id: TopologyId, keys: &[Bytes]) -> bool {
        self.txs.iter().any(|(id, tracked)| {
            *id != tx
                && tracked.topology_id < topology_id
                && keys.iter().any(|key| tracked.keys.contains(key))
        })
    }
}

/// In-memory [`PendingLockManager`].
#[derive(Default)]
pub struct PendingTxTracker {
    state: Arc<Mutex<PendingState>>,
}

impl PendingTxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a transaction that may lock `keys`.
    pub fn track(&self, tx: TxId, topology_id: TopologyId, keys: &[Bytes]) {
        self.state.lock().txs.insert(
            tx,
            TrackedTx {
                topology_id,
                keys: keys.iter().cloned().collect(),
            },
        );
    }

    /// The transaction committed or rolled back.
    pub fn complete(&self, tx: TxId) {
        let ready = {
            let mut state = self.state.lock();
            if state.txs.remove(&tx).is_none() {
                return;
            }
            let unblocked: Vec<u64> = state
                .waiters
                .iter()
                .filter(|(_, w)| !state.blocked(w.tx, w.topology_id, &w.keys))
                .map(|(id, _)| *id)
                .collect();
            unblocked
                .into_iter()
                .filter_map(|id| state.waiters.remove(&id))
                .collect::<Vec<_>>()
        };

        for waiter in ready {
            if let Some(timer) = waiter.timer {
                timer.abort();
            }
            let remaining = waiter.timeout.saturating_sub(waiter.started.elapsed());
            debug!(tx = %waiter.tx, ?remaining, "Pending transactions resolved");
            waiter.completer.complete(remaining);
        }
    }

    pub fn tracked(&self) -> usize {
        self.state.lock().txs.len()
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn expire(state: &Weak<Mutex<PendingState>>, id: u64) {
        let Some(state) = state.upgrade() else {
            return;
        };
        let waiter = state.lock().waiters.remove(&id);
        if let Some(waiter) = waiter {
            debug!(tx = %waiter.tx, "Gave up waiting for pending transactions");
            waiter.completer.complete(Duration::ZERO);
        }
    }
}

impl PendingLockManager for PendingTxTracker {
    fn await_pending(
        &self,
        tx: TxId,
        topology_id: TopologyId,
        keys: &[Bytes],
        timeout: Duration,
    ) -> PendingPromise {
        let mut state = self.state.lock();
        if !state.blocked(tx, topology_id, keys) {
            return Promise::ready(timeout);
        }
        if timeout.is_zero() {
            return Promise::ready(Duration::ZERO);
        }

        let (promise, completer) = Promise::new();
        let id = state.next_id;
        state.next_id += 1;

        let weak = Arc::downgrade(&self.state);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            Self::expire(&weak, id);
        });
        state.waiters.insert(
            id,
            PendingWaiter {
                tx,
                topology_id,
                keys: keys.to_vec(),
                started: Instant::now(),
                timeout,
                completer,
                timer: Some(timer.abort_handle()),
            },
        );

        let weak = Arc::downgrade(&self.state);
        promise.with_canceller(move || Self::expire(&weak, id))
    }
}
