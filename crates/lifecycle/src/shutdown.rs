//! Shutdown coordination: the before-shutdown and will-shutdown sequence.
//!
//! Subscribers register asynchronous cleanup against the will-shutdown
//! notification by joining it with a future. All joiners are settled
//! (failures logged, never propagated) before the durable state store is
//! flushed, and a second will-shutdown while one is in flight shares the
//! same completion instead of re-running the sequence.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use state::StateStore;

/// Why the application is going down. Distinguishes a graceful quit from
/// a forced termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownReason {
    Quit,
    Kill,
}

struct ShutdownJoiner {
    id: String,
    task: BoxFuture<'static, anyhow::Result<()>>,
}

/// The will-shutdown notification. Subscribers that need asynchronous
/// cleanup call [`WillShutdownEvent::join`] while the event fires.
pub struct WillShutdownEvent<'a> {
    pub reason: ShutdownReason,
    joiners: &'a mut Vec<ShutdownJoiner>,
}

impl WillShutdownEvent<'_> {
    /// Registers cleanup work that must settle before the process exits.
    /// A failing joiner is logged and never blocks shutdown.
    pub fn join<F>(&mut self, id: impl Into<String>, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.joiners.push(ShutdownJoiner {
            id: id.into(),
            task: task.boxed(),
        });
    }
}

type BeforeShutdownHandler = Box<dyn Fn(ShutdownReason) + Send + Sync>;
type WillShutdownHandler = Box<dyn Fn(&mut WillShutdownEvent<'_>) + Send + Sync>;

/// A completed (or in-flight) will-shutdown sequence.
pub type ShutdownFuture = Shared<BoxFuture<'static, ()>>;

/// Runs the two shutdown notifications exactly once per process lifetime
/// and guarantees all subscriber cleanup settles before termination.
pub struct ShutdownCoordinator {
    store: Arc<dyn StateStore>,
    before_handlers: Mutex<Vec<BeforeShutdownHandler>>,
    will_handlers: Mutex<Vec<WillShutdownHandler>>,
    pending: Mutex<Option<ShutdownFuture>>,
}

impl ShutdownCoordinator {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            before_handlers: Mutex::new(Vec::new()),
            will_handlers: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
        }
    }

    pub fn on_before_shutdown(&self, handler: impl Fn(ShutdownReason) + Send + Sync + 'static) {
        self.before_handlers.lock().push(Box::new(handler));
    }

    pub fn on_will_shutdown(
        &self,
        handler: impl Fn(&mut WillShutdownEvent<'_>) + Send + Sync + 'static,
    ) {
        self.will_handlers.lock().push(Box::new(handler));
    }

    /// Fires the before-shutdown notification: synchronous fan-out, no
    /// joiners.
    pub fn fire_before_shutdown(&self, reason: ShutdownReason) {
        for handler in self.before_handlers.lock().iter() {
            handler(reason);
        }
    }

    /// Whether the will-shutdown sequence has been entered.
    pub fn has_fired_will_shutdown(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Runs the will-shutdown sequence: collect joiners synchronously,
    /// settle them all, then flush the state store. Idempotent — a second
    /// call while one is in flight returns the same completion.
    pub fn fire_will_shutdown(&self, reason: ShutdownReason) -> ShutdownFuture {
        let mut pending = self.pending.lock();
        if let Some(inflight) = pending.as_ref() {
            return inflight.clone();
        }

        info!(?reason, "will-shutdown");

        let mut joiners = Vec::new();
        {
            let handlers = self.will_handlers.lock();
            let mut event = WillShutdownEvent {
                reason,
                joiners: &mut joiners,
            };
            for handler in handlers.iter() {
                handler(&mut event);
            }
        }

        let store = self.store.clone();
        let sequence = async move {
            let settling = joiners.into_iter().map(|joiner| async move {
                if let Err(err) = joiner.task.await {
                    error!(joiner = %joiner.id, "shutdown joiner failed: {err:#}");
                }
            });
            join_all(settling).await;

            // All joiners have settled; only now flush durable state. A
            // flush failure is logged but must not hang the shutdown.
            if let Err(err) = store.close().await {
                error!("state flush during shutdown failed: {err:#}");
            }
        }
        .boxed()
        .shared();

        *pending = Some(sequence.clone());
        sequence
    }
}
