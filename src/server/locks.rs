//! Per-key transactional locks.

use super::action::ActionFailure;
use super::promise::{Completer, Promise};
use crate::types::TxId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Result of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Failed(ActionFailure),
}

/// Resolves once every key of a request is held, or the request failed.
pub type LockPromise = Promise<LockOutcome>;

/// Lock service used by ready actions.
pub trait LockManager: Send + Sync {
    /// Acquire all `keys` for `owner`. A zero timeout means try-lock.
    ///
    /// On failure every key acquired by this request is released again.
    fn lock_all(&self, owner: TxId, keys: &[Bytes], timeout: Duration) -> LockPromise;

    /// Release the keys `owner` holds among `keys`.
    fn unlock_all(&self, owner: TxId, keys: &[Bytes]);

    fn owner_of(&self, key: &[u8]) -> Option<TxId>;
}

type Completion = (Completer<LockOutcome>, LockOutcome);

fn complete_all(completions: Vec<Completion>) {
    for (completer, outcome) in completions {
        completer.complete(outcome);
    }
}

struct LockRequestState {
    owner: TxId,
    keys: Vec<Bytes>,
    next: usize,
    acquired: Vec<Bytes>,
    try_only: bool,
    completer: Completer<LockOutcome>,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct LockTable {
    holders: HashMap<Bytes, TxId>,
    queues: HashMap<Bytes, VecDeque<u64>>,
    requests: HashMap<u64, LockRequestState>,
    waits_for: HashMap<TxId, TxId>,
    next_id: u64,
}

impl LockTable {
    /// Acquire keys in order until one is held by someone else.
    fn advance(&mut self, id: u64, done: &mut Vec<Completion>) {
        loop {
            let next = match self.requests.get(&id) {
                None => return,
                Some(request) if request.next == request.keys.len() => None,
                Some(request) => Some((
                    request.owner,
                    request.keys[request.next].clone(),
                    request.try_only,
                )),
            };
            let Some((owner, key, try_only)) = next else {
                self.succeed(id, done);
                return;
            };

            match self.holders.get(&key).copied() {
                None => {
                    self.holders.insert(key.clone(), owner);
                    self.granted(id, key, true);
                }
                Some(holder) if holder == owner => self.granted(id, key, false),
                Some(holder) => {
                    if try_only {
                        self.fail(id, ActionFailure::LockTimeout(Duration::ZERO), done);
                    } else if self.would_deadlock(owner, holder) {
                        debug!(requestor = %owner, %holder, "Deadlock detected");
                        self.fail(
                            id,
                            ActionFailure::Deadlock {
                                requestor: owner,
                                holder,
                            },
                            done,
                        );
                    } else {
                        trace!(requestor = %owner, %holder, "Waiting for lock");
                        self.queues.entry(key).or_default().push_back(id);
                        self.waits_for.insert(owner, holder);
                    }
                    return;
                }
            }
        }
    }

    fn granted(&mut self, id: u64, key: Bytes, newly: bool) {
        if let Some(request) = self.requests.get_mut(&id) {
            if newly {
                request.acquired.push(key);
            }
            request.next += 1;
        }
    }

    fn succeed(&mut self, id: u64, done: &mut Vec<Completion>) {
        let Some(request) = self.requests.remove(&id) else {
            return;
        };
        self.waits_for.remove(&request.owner);
        if let Some(timer) = request.timer {
            timer.abort();
        }
        done.push((request.completer, LockOutcome::Acquired));
    }

    /// Drop a request and release what it acquired, newest first.
    fn fail(&mut self, id: u64, failure: ActionFailure, done: &mut Vec<Completion>) {
        let Some(request) = self.requests.remove(&id) else {
            return;
        };
        self.waits_for.remove(&request.owner);
        if let Some(timer) = request.timer {
            timer.abort();
        }
        if let Some(key) = request.keys.get(request.next) {
            if let Some(queue) = self.queues.get_mut(key) {
                queue.retain(|queued| *queued != id);
                if queue.is_empty() {
                    self.queues.remove(key);
                }
            }
        }
        for key in request.acquired.iter().rev() {
            if self.holders.get(key) == Some(&request.owner) {
                self.release(key, done);
            }
        }
        done.push((request.completer, LockOutcome::Failed(failure)));
    }

    /// Free a key and hand it to the first queued request.
    fn release(&mut self, key: &Bytes, done: &mut Vec<Completion>) {
        self.holders.remove(key);

        loop {
            let Some(next) = self.queues.get_mut(key).and_then(VecDeque::pop_front) else {
                self.queues.remove(key);
                return;
            };
            let Some(owner) = self.requests.get(&next).map(|r| r.owner) else {
                continue;
            };

            self.holders.insert(key.clone(), owner);
            self.waits_for.remove(&owner);
            self.granted(next, key.clone(), true);

            // Whoever is still queued now waits for the new holder.
            let remaining: Vec<u64> = match self.queues.get(key) {
                Some(queue) if !queue.is_empty() => queue.iter().copied().collect(),
                _ => {
                    self.queues.remove(key);
                    Vec::new()
                }
            };
            for waiter in remaining {
                if let Some(waiting) = self.requests.get(&waiter).map(|r| r.owner) {
                    self.waits_for.insert(waiting, owner);
                }
            }

            self.advance(next, done);
            return;
        }
    }

    fn would_deadlock(&self, requestor: TxId, holder: TxId) -> bool {
        let mut current = holder;
        for _ in 0..=self.waits_for.len() {
            if current == requestor {
                return true;
            }
            match self.waits_for.get(&current) {
                Some(next) => current = *next,
                None => return false,
            }
        }
        false
    }
}

/// In-memory [`LockManager`].
///
/// Keys are deduplicated and acquired in sorted order. Waiters on a key are
/// served FIFO. A transaction already holding a key acquires it again
/// without waiting.
#[derive(Default)]
pub struct KeyLockManager {
    table: Arc<Mutex<LockTable>>,
}

impl KeyLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held by `owner`.
    pub fn held_by(&self, owner: TxId) -> Vec<Bytes> {
        let table = self.table.lock();
        let mut keys: Vec<Bytes> = table
            .holders
            .iter()
            .filter(|(_, holder)| **holder == owner)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Requests blocked on a held key.
    pub fn waiting(&self) -> usize {
        self.table.lock().requests.len()
    }

    fn fail_request(table: &Weak<Mutex<LockTable>>, id: u64, failure: ActionFailure) {
        let Some(table) = table.upgrade() else {
            return;
        };
        let mut done = Vec::new();
        table.lock().fail(id, failure, &mut done);
        complete_all(done);
    }
}

impl LockManager for KeyLockManager {
    fn lock_all(&self, owner: TxId, keys: &[Bytes], timeout: Duration) -> LockPromise {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let (promise, completer) = Promise::new();
        let mut done = Vec::new();
        let id = {
            let mut table = self.table.lock();
            let id = table.next_id;
            table.next_id += 1;
            table.requests.insert(
                id,
                LockRequestState {
                    owner,
                    keys,
                    next: 0,
                    acquired: Vec::new(),
                    try_only: timeout.is_zero(),
                    completer,
                    timer: None,
                },
            );
            table.advance(id, &mut done);

            if let Some(request) = table.requests.get_mut(&id) {
                let weak = Arc::downgrade(&self.table);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    Self::fail_request(&weak, id, ActionFailure::LockTimeout(timeout));
                });
                request.timer = Some(timer.abort_handle());
            }
            id
        };
        complete_all(done);

        let weak = Arc::downgrade(&self.table);
        promise.with_canceller(move || {
            Self::fail_request(
                &weak,
                id,
                ActionFailure::Cancelled("lock request cancelled".into()),
            )
        })
    }

    fn unlock_all(&self, owner: TxId, keys: &[Bytes]) {
        let mut done = Vec::new();
        {
            let mut table = self.table.lock();
            for key in keys.iter().rev() {
                if table.holders.get(key) == Some(&owner) {
                    table.release(key, &mut done);
                }
            }
        }
        complete_all(done);
    }

    fn owner_of(&self, key: &[u8]) -> Option<TxId> {
        self.table.lock().holders.get(key).copied()
    }
}

impl std::fmt::Debug for KeyLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("KeyLockManager")
            .field("held", &table.holders.len())
            .field("waiting", &table.requests.len())
            .finish()
    }
}
