//! Conjunction of ready actions.

use super::{ActionFailure, ActionListener, ActionStatus, Notifier, ReadyAction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Ready when every child is. If one child is cancelled, the others are
/// cancelled with the same failure.
///
/// The listener fires at most once, from whichever thread completes the
/// last child.
pub struct CompositeAction {
    actions: Vec<Arc<dyn ReadyAction>>,
    notifier: Notifier,
    fired: AtomicBool,
}

impl CompositeAction {
    pub fn new(actions: Vec<Arc<dyn ReadyAction>>) -> Arc<Self> {
        let composite = Arc::new(Self {
            actions,
            notifier: Notifier::default(),
            fired: AtomicBool::new(false),
        });
        for action in &composite.actions {
            let weak = Arc::downgrade(&composite);
            action.add_listener(Arc::new(move || {
                if let Some(composite) = weak.upgrade() {
                    composite.on_child_complete();
                }
            }));
        }
        composite
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn on_child_complete(&self) {
        if self.is_ready() {
            self.fire();
        }
    }

    fn fire(&self) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!(children = self.actions.len(), "Composite action complete");
            self.notifier.notify();
        }
    }
}

impl ReadyAction for CompositeAction {
    fn status(&self) -> ActionStatus {
        let mut ready = true;
        for action in &self.actions {
            match action.status() {
                ActionStatus::Ready => {}
                ActionStatus::NotReady => ready = false,
                ActionStatus::Canceled(failure) => {
                    for other in &self.actions {
                        other.cancel(failure.clone());
                    }
                    return ActionStatus::Canceled(failure);
                }
            }
        }
        if ready {
            ActionStatus::Ready
        } else {
            ActionStatus::NotReady
        }
    }

    fn add_listener(&self, listener: ActionListener) {
        self.notifier.set(listener);
    }

    fn cancel(&self, reason: ActionFailure) {
        for action in &self.actions {
            action.cancel(reason.clone());
        }
        self.fire();
    }

    fn on_finally(&self, success: bool) {
        for action in &self.actions {
            action.on_finally(success);
        }
    }
}

impl std::fmt::Debug for CompositeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeAction")
            .field("children", &self.actions.len())
            .field("fired", &self.fired.load(Ordering::Relaxed))
            .finish()
    }
}
