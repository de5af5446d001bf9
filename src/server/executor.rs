//! Executor that holds back tasks until their readiness check passes.
//!
//! Tasks arrive either ready to run or guarded by a [`ReadinessCheck`].
//! Guarded tasks are parked; a single checker task re-evaluates the parked
//! set whenever it is poked and spawns the ones that became ready. Running
//! tasks are bounded by a semaphore.

use super::action::{ActionFailure, ActionListener};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace};

/// Unit of work run by the executor.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Non-blocking readiness predicate of a parked task.
pub trait ReadinessCheck: Send + Sync {
    /// Ready to run, or failed and ready to report the failure.
    fn is_ready(&self) -> bool;

    /// Force the check into a failed, ready state.
    fn cancel(&self, reason: ActionFailure);
}

/// A task handed to [`ReadyExecutor::submit`].
pub enum ScheduledTask {
    ReadyNow(Job),
    Pending {
        gate: Arc<dyn ReadinessCheck>,
        job: Job,
    },
}

struct Parked {
    gate: Arc<dyn ReadinessCheck>,
    job: Job,
}

struct ExecutorInner {
    name: String,
    parked: Mutex<Vec<Parked>>,
    wakeup: Arc<Notify>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    shutdown: AtomicBool,
    checker: Mutex<Option<AbortHandle>>,
}

impl ExecutorInner {
    fn spawn(&self, job: Job) {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        });
    }

    /// Spawn every parked task whose gate is ready.
    ///
    /// Gates are checked with the parked list unlocked, so `shutdown` may
    /// run meanwhile; the tasks still waiting are then cancelled here.
    fn run_ready(&self) {
        let parked = std::mem::take(&mut *self.parked.lock());
        if parked.is_empty() {
            return;
        }
        let total = parked.len();
        let mut waiting = Vec::with_capacity(total);
        for task in parked {
            if task.gate.is_ready() {
                self.spawn(task.job);
            } else {
                waiting.push(task);
            }
        }
        trace!(executor = %self.name, ready = total - waiting.len(), waiting = waiting.len(), "Checked parked tasks");
        let rejected = self.park(waiting);
        self.cancel_all(rejected);
    }

    /// Park `tasks` unless the executor is shut down, in which case they are
    /// handed back. The flag is read under the parked lock, after which
    /// `shutdown` is guaranteed to see whatever was parked.
    fn park(&self, tasks: Vec<Parked>) -> Vec<Parked> {
        let mut parked = self.parked.lock();
        if self.shutdown.load(Ordering::Acquire) {
            return tasks;
        }
        parked.extend(tasks);
        Vec::new()
    }

    fn cancel_all(&self, tasks: Vec<Parked>) {
        for task in tasks {
            task.gate.cancel(ActionFailure::Cancelled(format!(
                "executor '{}' is shut down",
                self.name
            )));
            self.spawn(task.job);
        }
    }
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        if let Some(checker) = self.checker.lock().take() {
            checker.abort();
        }
    }
}

/// Cloneable handle to a ready-checking executor.
#[derive(Clone)]
pub struct ReadyExecutor {
    inner: Arc<ExecutorInner>,
}

impl ReadyExecutor {
    /// Start an executor running at most `max_concurrent` tasks at a time.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let inner = Arc::new(ExecutorInner {
            name: name.into(),
            parked: Mutex::new(Vec::new()),
            wakeup: Arc::new(Notify::new()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            shutdown: AtomicBool::new(false),
            checker: Mutex::new(None),
        });

        let checker = tokio::spawn(Self::checker_loop(Arc::downgrade(&inner)));
        *inner.checker.lock() = Some(checker.abort_handle());
        Self { inner }
    }

    async fn checker_loop(inner: Weak<ExecutorInner>) {
        loop {
            let wakeup = {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                inner.run_ready();
                inner.wakeup.clone()
            };
            wakeup.notified().await;
        }
    }

    /// Run a task now or park it until its gate is ready.
    ///
    /// After shutdown, guarded tasks are cancelled and run immediately so
    /// they can report the cancellation.
    pub fn submit(&self, task: ScheduledTask) {
        match task {
            ScheduledTask::ReadyNow(job) => self.inner.spawn(job),
            ScheduledTask::Pending { gate, job } => {
                let rejected = self.inner.park(vec![Parked { gate, job }]);
                if rejected.is_empty() {
                    self.inner.wakeup.notify_one();
                } else {
                    self.inner.cancel_all(rejected);
                }
            }
        }
    }

    /// Ask the checker to re-evaluate parked tasks.
    pub fn check_for_ready_tasks(&self) {
        self.inner.wakeup.notify_one();
    }

    /// A listener that pokes the checker. Never runs tasks inline.
    pub fn waker(&self) -> ActionListener {
        let wakeup = self.inner.wakeup.clone();
        Arc::new(move || wakeup.notify_one())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.parked.lock().len()
    }

    /// Tasks currently holding an execution slot.
    pub fn active_count(&self) -> usize {
        self.inner.max_concurrent - self.inner.permits.available_permits()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop the checker and flush parked tasks as cancelled.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let parked = std::mem::take(&mut *self.inner.parked.lock());
        info!(executor = %self.inner.name, parked = parked.len(), "Shutting down executor");
        self.inner.cancel_all(parked);
        debug!(executor = %self.inner.name, "Parked tasks flushed");
        self.inner.wakeup.notify_one();
    }
}

impl std::fmt::Debug for ReadyExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyExecutor")
            .field("name", &self.inner.name)
            .field("pending", &self.pending_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
