//! The transactional ready action: topology, pending transactions, locks.

use super::steps::{LockStep, PendingTxStep, ReadyStep, StepStatus, TopologyStep};
use super::{ActionFailure, ActionListener, ActionStatus, Notifier, ReadyAction};
use crate::config::DispatcherConfig;
use crate::server::locks::LockManager;
use crate::server::pending::PendingLockManager;
use crate::server::topology::{SubscriptionId, TopologyTracker};
use crate::types::{TopologyId, TxId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// What a ready action is guarding, shared by its steps.
#[derive(Debug)]
pub struct ActionState {
    pub tx: TxId,
    pub topology_id: TopologyId,
    pub keys: Vec<Bytes>,
    /// Lock acquisition timeout. Zero means try-lock.
    pub timeout: Duration,
    created: Instant,
    lock_budget: Mutex<Option<Duration>>,
    notifier: Arc<Notifier>,
}

impl ActionState {
    pub fn new(tx: TxId, topology_id: TopologyId, keys: Vec<Bytes>, timeout: Duration) -> Self {
        Self {
            tx,
            topology_id,
            keys,
            timeout,
            created: Instant::now(),
            lock_budget: Mutex::new(None),
            notifier: Arc::new(Notifier::default()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    /// What is left of `timeout` once pending transactions resolved.
    pub fn lock_budget(&self) -> Option<Duration> {
        *self.lock_budget.lock()
    }

    pub fn set_lock_budget(&self, budget: Duration) {
        *self.lock_budget.lock() = Some(budget);
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }
}

/// Cache-wide collaborators of ready actions.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub tracker: Arc<TopologyTracker>,
    /// Views the installed topology may move past the command before it is
    /// cancelled.
    pub horizon: i32,
    pub topology_wait_timeout: Duration,
}

impl ActionContext {
    pub fn new(tracker: Arc<TopologyTracker>, config: &DispatcherConfig) -> Self {
        Self {
            tracker,
            horizon: config.topology_horizon,
            topology_wait_timeout: config.topology_wait_timeout,
        }
    }
}

/// Runs its steps in order; ready once all are.
///
/// Before the steps, the action is cancelled if the cache is stopping or if
/// the installed topology moved more than `horizon` views past the command.
/// The first terminal status sticks.
pub struct DefaultReadyAction {
    state: ActionState,
    ctx: ActionContext,
    steps: Vec<Box<dyn ReadyStep>>,
    terminal: Mutex<Option<ActionStatus>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl DefaultReadyAction {
    pub fn new(state: ActionState, ctx: ActionContext) -> Self {
        Self {
            state,
            ctx,
            steps: Vec::new(),
            terminal: Mutex::new(None),
            subscription: Mutex::new(None),
        }
    }

    pub fn with_step(mut self, step: impl ReadyStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Topology, then pending transactions, then locks.
    pub fn transactional(
        state: ActionState,
        ctx: ActionContext,
        pending: Arc<dyn PendingLockManager>,
        locks: Arc<dyn LockManager>,
    ) -> Self {
        Self::new(state, ctx)
            .with_step(TopologyStep::new())
            .with_step(PendingTxStep::new(pending))
            .with_step(LockStep::new(locks))
    }

    pub fn state(&self) -> &ActionState {
        &self.state
    }

    fn evaluate(&self) -> ActionStatus {
        let tracker = &self.ctx.tracker;
        if tracker.is_stopped() {
            return ActionStatus::Canceled(ActionFailure::Cancelled(format!(
                "cache '{}' is stopping",
                tracker.cache_name()
            )));
        }
        let installed = tracker.installed();
        if installed > self.state.topology_id.saturating_add(self.ctx.horizon) {
            return ActionStatus::Canceled(ActionFailure::OutdatedTopology {
                command: self.state.topology_id,
                installed,
            });
        }

        for step in &self.steps {
            match step.check(&self.state, &self.ctx) {
                StepStatus::Ready => {}
                StepStatus::NotReady => return ActionStatus::NotReady,
                StepStatus::Canceled(failure) => return ActionStatus::Canceled(failure),
            }
        }
        ActionStatus::Ready
    }

    /// Record a terminal status. Returns the winning status and whether this
    /// call set it.
    fn finish(&self, status: ActionStatus) -> (ActionStatus, bool) {
        {
            let mut terminal = self.terminal.lock();
            if let Some(existing) = &*terminal {
                return (existing.clone(), false);
            }
            *terminal = Some(status.clone());
        }
        self.unsubscribe();

        if let ActionStatus::Canceled(failure) = &status {
            debug!(
                cache = %self.ctx.tracker.cache_name(),
                tx = %self.state.tx,
                ?failure,
                "Ready action cancelled"
            );
            for step in self.steps.iter().rev() {
                step.cancel(&self.state);
            }
        }
        (status, true)
    }

    fn subscribe(&self) {
        let mut subscription = self.subscription.lock();
        if subscription.is_none() {
            let notifier = self.state.notifier.clone();
            *subscription = Some(self.ctx.tracker.subscribe(Arc::new(move || notifier.notify())));
        }
    }

    fn unsubscribe(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.ctx.tracker.unsubscribe(id);
        }
    }
}

impl ReadyAction for DefaultReadyAction {
    fn status(&self) -> ActionStatus {
        if let Some(status) = &*self.terminal.lock() {
            return status.clone();
        }
        match self.evaluate() {
            ActionStatus::NotReady => {
                self.subscribe();
                ActionStatus::NotReady
            }
            status => self.finish(status).0,
        }
    }

    fn add_listener(&self, listener: ActionListener) {
        self.state.notifier.set(listener);
    }

    fn cancel(&self, reason: ActionFailure) {
        if self.finish(ActionStatus::Canceled(reason)).1 {
            self.state.notifier.notify();
        }
    }

    fn on_finally(&self, success: bool) {
        for step in &self.steps {
            step.on_finally(&self.state, success);
        }
    }
}

impl Drop for DefaultReadyAction {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for DefaultReadyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultReadyAction")
            .field("tx", &self.state.tx)
            .field("topology_id", &self.state.topology_id)
            .field("steps", &self.steps.len())
            .field("terminal", &*self.terminal.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::locks::KeyLockManager;
    use crate::server::pending::PendingTxTracker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(name: &str) -> Bytes {
        Bytes::copy_from_slice(name.as_bytes())
    }

    struct Fixture {
        tracker: Arc<TopologyTracker>,
        locks: Arc<KeyLockManager>,
        pending: Arc<PendingTxTracker>,
        ctx: ActionContext,
    }

    fn fixture(installed: TopologyId) -> Fixture {
        let tracker = Arc::new(TopologyTracker::new("c", installed));
        let config = DispatcherConfig::default().with_topology_wait_timeout(Duration::from_millis(50));
        Fixture {
            ctx: ActionContext::new(tracker.clone(), &config),
            tracker,
            locks: Arc::new(KeyLockManager::new()),
            pending: Arc::new(PendingTxTracker::new()),
        }
    }

    fn action(f: &Fixture, tx: TxId, topology_id: TopologyId, keys: &[&str]) -> DefaultReadyAction {
        let state = ActionState::new(
            tx,
            topology_id,
            keys.iter().map(|k| key(k)).collect(),
            Duration::from_secs(5),
        );
        DefaultReadyAction::transactional(state, f.ctx.clone(), f.pending.clone(), f.locks.clone())
    }

    fn counting_listener() -> (ActionListener, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        (
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn test_ready_immediately_when_uncontended() {
        let f = fixture(3);
        let tx = TxId::new();
        let action = action(&f, tx, 3, &["a", "b"]);

        assert_eq!(action.status(), ActionStatus::Ready);
        assert_eq!(f.locks.held_by(tx), vec![key("a"), key("b")]);
    }

    #[tokio::test]
    async fn test_waits_for_topology_then_lock() {
        let f = fixture(1);
        let tx = TxId::new();
        let action = action(&f, tx, 2, &["a"]);
        let (listener, calls) = counting_listener();
        action.add_listener(listener);

        assert_eq!(action.status(), ActionStatus::NotReady);
        assert!(f.locks.held_by(tx).is_empty());

        f.tracker.install_with_tx_data(2);
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(action.status(), ActionStatus::Ready);
        assert_eq!(f.locks.held_by(tx), vec![key("a")]);
    }

    #[tokio::test]
    async fn test_lock_contention_notifies_on_release() {
        let f = fixture(1);
        let holder = TxId::new();
        f.locks.lock_all(holder, &[key("a")], Duration::ZERO);

        let tx = TxId::new();
        let action = action(&f, tx, 1, &["a"]);
        let (listener, calls) = counting_listener();
        action.add_listener(listener);
        assert_eq!(action.status(), ActionStatus::NotReady);

        f.locks.unlock_all(holder, &[key("a")]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(action.is_ready());
        assert_eq!(f.locks.owner_of(b"a"), Some(tx));
    }

    #[tokio::test]
    async fn test_outdated_topology_cancels() {
        let f = fixture(5);
        let action = action(&f, TxId::new(), 2, &["a"]);
        assert!(matches!(
            action.status(),
            ActionStatus::Canceled(ActionFailure::OutdatedTopology {
                command: 2,
                installed: 5
            })
        ));
        assert_eq!(f.locks.owner_of(b"a"), None);
    }

    #[tokio::test]
    async fn test_cancel_releases_locks_and_sticks() {
        let f = fixture(1);
        let tx = TxId::new();
        let action = action(&f, tx, 1, &["a"]);
        assert_eq!(action.status(), ActionStatus::Ready);

        // Terminal status wins over a later cancel.
        action.cancel(ActionFailure::Cancelled("late".into()));
        assert_eq!(action.status(), ActionStatus::Ready);

        action.on_finally(false);
        assert!(f.locks.held_by(tx).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let f = fixture(1);
        let holder = TxId::new();
        f.locks.lock_all(holder, &[key("b")], Duration::ZERO);

        let tx = TxId::new();
        let action = action(&f, tx, 1, &["a", "b"]);
        let (listener, calls) = counting_listener();
        action.add_listener(listener);
        assert_eq!(action.status(), ActionStatus::NotReady);
        assert_eq!(f.locks.owner_of(b"a"), Some(tx));

        action.cancel(ActionFailure::Cancelled("shutdown".into()));
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert!(matches!(action.status(), ActionStatus::Canceled(_)));
        assert_eq!(f.locks.owner_of(b"a"), None);
        assert_eq!(f.locks.owner_of(b"b"), Some(holder));
    }

    /// Parks the polling thread until the test lets it continue.
    struct Hold {
        entered: std::sync::mpsc::SyncSender<()>,
        proceed: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl ReadyStep for Hold {
        fn check(&self, _state: &ActionState, _ctx: &ActionContext) -> StepStatus {
            let _ = self.entered.send(());
            let _ = self.proceed.lock().recv();
            StepStatus::Ready
        }
    }

    #[tokio::test]
    async fn test_cancel_during_poll_leaves_no_locks() {
        let f = fixture(1);
        let (entered_tx, entered_rx) = std::sync::mpsc::sync_channel(1);
        let (proceed_tx, proceed_rx) = std::sync::mpsc::channel();
        let tx = TxId::new();
        let state = ActionState::new(tx, 1, vec![key("a")], Duration::from_secs(5));
        let action = Arc::new(
            DefaultReadyAction::new(state, f.ctx.clone())
                .with_step(Hold {
                    entered: entered_tx,
                    proceed: Mutex::new(proceed_rx),
                })
                .with_step(LockStep::new(f.locks.clone())),
        );

        let poller = {
            let action = action.clone();
            std::thread::spawn(move || action.status())
        };
        entered_rx.recv().unwrap();
        action.cancel(ActionFailure::Cancelled("shutdown".into()));
        proceed_tx.send(()).unwrap();

        assert!(matches!(poller.join().unwrap(), ActionStatus::Canceled(_)));
        assert!(matches!(action.status(), ActionStatus::Canceled(_)));
        assert_eq!(f.locks.owner_of(b"a"), None);
        assert_eq!(f.locks.waiting(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_acquire_on_poll_releases() {
        let f = fixture(1);
        let tx = TxId::new();
        let action = action(&f, tx, 1, &["a", "b"]);
        let lock_step = LockStep::new(f.locks.clone());

        // Poll then cancel the step directly, as a racing cancel would.
        assert_eq!(lock_step.check(action.state(), &f.ctx), StepStatus::Ready);
        assert_eq!(f.locks.held_by(tx), vec![key("a"), key("b")]);
        lock_step.cancel(action.state());
        assert!(f.locks.held_by(tx).is_empty());
        assert!(matches!(
            lock_step.check(action.state(), &f.ctx),
            StepStatus::Canceled(ActionFailure::Cancelled(_))
        ));
        assert!(f.locks.held_by(tx).is_empty());
    }

    #[tokio::test]
    async fn test_stopped_tracker_cancels() {
        let f = fixture(1);
        f.tracker.stop();
        let action = action(&f, TxId::new(), 1, &["a"]);
        assert!(matches!(
            action.status(),
            ActionStatus::Canceled(ActionFailure::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_topology_timeout_far_ahead() {
        let f = fixture(1);
        let action = action(&f, TxId::new(), 4, &["a"]);
        let (listener, calls) = counting_listener();
        action.add_listener(listener);
        assert_eq!(action.status(), ActionStatus::NotReady);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert!(matches!(
            action.status(),
            ActionStatus::Canceled(ActionFailure::TopologyTimeout { expected: 4, .. })
        ));
    }
}
