//! Completion handles with synchronous callbacks.
//!
//! Lock and pending-transaction requests complete from whichever task
//! releases the blocking resource. Ready actions observe them by polling
//! `value()` and by registering a callback, which runs on the completing
//! thread (or immediately if already complete). Callbacks run with no
//! internal lock held.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Callback = Box<dyn FnOnce() + Send>;

struct PromiseState<T> {
    value: Option<T>,
    callbacks: Vec<Callback>,
}

/// Read side of a completion.
pub struct Promise<T> {
    state: Arc<Mutex<PromiseState<T>>>,
    canceller: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Write side of a completion. The first value wins.
pub struct Completer<T> {
    state: Arc<Mutex<PromiseState<T>>>,
}

impl<T: Clone> Promise<T> {
    /// An unresolved promise and its completer.
    pub fn new() -> (Self, Completer<T>) {
        let state = Arc::new(Mutex::new(PromiseState {
            value: None,
            callbacks: Vec::new(),
        }));
        (
            Self {
                state: state.clone(),
                canceller: None,
            },
            Completer { state },
        )
    }

    /// An already resolved promise.
    pub fn ready(value: T) -> Self {
        let (promise, completer) = Self::new();
        completer.complete(value);
        promise
    }

    /// Attach the action run by [`Promise::cancel`].
    pub fn with_canceller(mut self, canceller: impl Fn() + Send + Sync + 'static) -> Self {
        self.canceller = Some(Arc::new(canceller));
        self
    }

    pub fn value(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Run `callback` once the promise resolves.
    pub fn on_complete(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if state.value.is_some() {
            drop(state);
            callback();
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }

    /// Ask the producer to give up. No-op once resolved.
    pub fn cancel(&self) {
        if self.is_done() {
            return;
        }
        if let Some(canceller) = &self.canceller {
            canceller();
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            canceller: self.canceller.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("value", &self.state.lock().value)
            .finish()
    }
}

impl<T> Completer<T> {
    /// Resolve the promise and run its callbacks. Returns false if it was
    /// already resolved.
    pub fn complete(&self, value: T) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value);
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback();
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().value.is_some()
    }
}
