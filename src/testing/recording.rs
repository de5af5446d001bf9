//! A [`CommandInvoker`] that records what it ran.

use crate::error::Result;
use crate::server::{
    CommandInvoker, CommandPayload, KeyLockManager, LockManager, RemoteCommand, Response,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Records invoked commands and, when given the lock manager, checks that
/// every key a command locks is held by its transaction at invocation time.
#[derive(Default)]
pub(crate) struct RecordingInvoker {
    locks: Option<Arc<KeyLockManager>>,
    invoked: Mutex<Vec<Arc<RemoteCommand>>>,
    unheld_keys: AtomicUsize,
}

impl RecordingInvoker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn checking_locks(locks: Arc<KeyLockManager>) -> Self {
        Self {
            locks: Some(locks),
            ..Self::default()
        }
    }

    pub(crate) fn invocations(&self) -> usize {
        self.invoked.lock().len()
    }

    pub(crate) fn invoked(&self) -> Vec<Arc<RemoteCommand>> {
        self.invoked.lock().clone()
    }

    /// Keys that were not held by their transaction when invoked.
    pub(crate) fn unheld_keys(&self) -> usize {
        self.unheld_keys.load(Ordering::SeqCst)
    }

    fn check_locks(&self, locks: &KeyLockManager, command: &RemoteCommand) {
        if let CommandPayload::MultipleRpc(children) = &command.payload {
            children.iter().for_each(|child| self.check_locks(locks, child));
            return;
        }
        let Some(lock) = command.lock_request() else {
            return;
        };
        if lock.skip_locking || matches!(command.payload, CommandPayload::LockControl { unlock: true, .. }) {
            return;
        }
        for key in &lock.keys {
            if locks.owner_of(key) != Some(lock.tx) {
                self.unheld_keys.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl CommandInvoker for RecordingInvoker {
    async fn invoke(&self, command: Arc<RemoteCommand>) -> Result<Response> {
        if let Some(locks) = &self.locks {
            self.check_locks(locks, &command);
        }
        self.invoked.lock().push(command);
        Ok(Response::Success(None))
    }
}
