//! One-shot coordination primitives: gates and externally-completable values.

use std::sync::Arc;

use tokio::sync::watch;

/// A one-shot gate. Waiters suspend until [`Barrier::open`] is called;
/// once open, every current and future `wait` resolves immediately.
///
/// There is no cancellation and no timeout, and opening never fails.
#[derive(Debug, Clone)]
pub struct Barrier {
    state: Arc<watch::Sender<bool>>,
}

impl Barrier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { state: Arc::new(tx) }
    }

    /// Opens the gate, releasing all waiters. Idempotent.
    pub fn open(&self) {
        self.state.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        while !*rx.borrow_and_update() {
            // The sender half lives in `self`, so `changed` cannot fail
            // while we are borrowing it.
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

/// An externally-completable one-shot value.
///
/// The creator (or any clone) calls [`Deferred::complete`] once; any number
/// of consumers `wait` for the value. Used to bridge event-style readiness
/// signals into awaitable form.
#[derive(Debug, Clone)]
pub struct Deferred<T: Clone> {
    cell: Arc<watch::Sender<Option<T>>>,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { cell: Arc::new(tx) }
    }

    /// Completes with `value`. Only the first call has any effect; returns
    /// whether this call was the one that settled the value.
    pub fn complete(&self, value: T) -> bool {
        self.cell.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        })
    }

    pub fn is_settled(&self) -> bool {
        self.cell.borrow().is_some()
    }

    /// Resolves with the completed value, immediately if already settled.
    pub async fn wait(&self) -> T {
        let mut rx = self.cell.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().as_ref() {
                return value.clone();
            }
            // The sender half lives in `self`; `changed` cannot fail here.
            let _ = rx.changed().await;
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
