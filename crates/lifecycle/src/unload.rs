//! Per-window unload negotiation: a two-phase veto protocol.
//!
//! A window is first asked for consent to unload (it may veto, e.g. while
//! a save dialog is open); only after consent is it told that the unload
//! will happen, so it can run cleanup. Each round trip is correlated by
//! fresh one-time reply channels. Neither round trip carries a timeout:
//! the window is trusted to always answer, and the forced-kill path is the
//! designed escape hatch for an unresponsive window.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::window::{LifecycleWindow, UnloadReason, WindowId, WindowMessage};

/// An in-flight unload negotiation; resolves to `true` when vetoed.
pub type UnloadFuture = Shared<BoxFuture<'static, bool>>;

/// Routes one-time reply channels back to the negotiation waiting on them.
///
/// The shell delivers every lifecycle reply a window emits through
/// [`ReplyRegistry::deliver`].
#[derive(Default)]
pub struct ReplyRegistry {
    channels: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl ReplyRegistry {
    fn register(&self, channel: String, tx: oneshot::Sender<()>) {
        self.channels.lock().insert(channel, tx);
    }

    fn unregister(&self, channel: &str) {
        self.channels.lock().remove(channel);
    }

    /// Delivers a window's reply on a named one-time channel. Returns
    /// whether a negotiation was still waiting on it.
    pub fn deliver(&self, channel: &str) -> bool {
        match self.channels.lock().remove(channel) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Negotiates window unloads, at most one in flight per window.
pub struct UnloadNegotiator {
    pending: Arc<Mutex<HashMap<WindowId, UnloadFuture>>>,
    replies: Arc<ReplyRegistry>,
}

impl UnloadNegotiator {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            replies: Arc::new(ReplyRegistry::default()),
        }
    }

    /// The registry the shell routes window replies into.
    pub fn replies(&self) -> Arc<ReplyRegistry> {
        self.replies.clone()
    }

    pub fn has_pending(&self, id: WindowId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Drops any in-flight negotiation for a window that went away.
    pub fn discard(&self, id: WindowId) {
        if self.pending.lock().remove(&id).is_some() {
            trace!(window = %id, "discarded pending unload");
        }
    }

    /// Asks `window` whether it consents to unloading for `reason`;
    /// resolves to `true` when the window vetoes.
    ///
    /// Concurrent calls for the same window share one in-flight future and
    /// trigger exactly one veto-query round trip.
    pub fn unload(&self, window: Arc<dyn LifecycleWindow>, reason: UnloadReason) -> UnloadFuture {
        let mut pending = self.pending.lock();
        if let Some(inflight) = pending.get(&window.id()) {
            return inflight.clone();
        }

        let id = window.id();
        trace!(window = %id, ?reason, "starting unload negotiation");

        let replies = self.replies.clone();
        let map = self.pending.clone();
        let negotiation = async move {
            let veto = negotiate(window, reason, replies).await;
            map.lock().remove(&id);
            veto
        }
        .boxed()
        .shared();

        pending.insert(id, negotiation.clone());
        negotiation
    }
}

impl Default for UnloadNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

async fn negotiate(
    window: Arc<dyn LifecycleWindow>,
    reason: UnloadReason,
    replies: Arc<ReplyRegistry>,
) -> bool {
    // A window that never finished its initial load has nothing to save
    // and cannot veto.
    if !window.is_ready() {
        return false;
    }

    let id = window.id();

    // First round trip: the before-unload consent query.
    let ok_channel = format!("lifecycle:ok:{}", Uuid::new_v4());
    let cancel_channel = format!("lifecycle:cancel:{}", Uuid::new_v4());
    let (ok_tx, ok_rx) = oneshot::channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    replies.register(ok_channel.clone(), ok_tx);
    replies.register(cancel_channel.clone(), cancel_tx);

    window.post(WindowMessage::BeforeUnload {
        ok_channel: ok_channel.clone(),
        cancel_channel: cancel_channel.clone(),
        reason,
    });

    let vetoed = tokio::select! {
        _ = ok_rx => false,
        _ = cancel_rx => true,
    };
    replies.unregister(&ok_channel);
    replies.unregister(&cancel_channel);

    if vetoed {
        debug!(window = %id, ?reason, "window vetoed unload");
        return true;
    }

    // Second round trip: the will-unload notice, acknowledged once the
    // window finished its cleanup.
    let reply_channel = format!("lifecycle:reply:{}", Uuid::new_v4());
    let (reply_tx, reply_rx) = oneshot::channel();
    replies.register(reply_channel.clone(), reply_tx);

    window.post(WindowMessage::WillUnload {
        reply_channel,
        reason,
    });

    let _ = reply_rx.await;
    trace!(window = %id, "window unloaded");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct TestWindow {
        id: WindowId,
        ready: bool,
        posted: Mutex<Vec<WindowMessage>>,
    }

    impl TestWindow {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: WindowId(id),
                ready: true,
                posted: Mutex::new(Vec::new()),
            })
        }

        fn unready(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: WindowId(id),
                ready: false,
                posted: Mutex::new(Vec::new()),
            })
        }

        async fn posted_message(&self, index: usize) -> WindowMessage {
            loop {
                if let Some(message) = self.posted.lock().get(index) {
                    return message.clone();
                }
                tokio::task::yield_now().await;
            }
        }
    }

    #[async_trait]
    impl LifecycleWindow for TestWindow {
        fn id(&self) -> WindowId {
            self.id
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        fn post(&self, message: WindowMessage) {
            self.posted.lock().push(message);
        }

        fn close(&self) {}

        async fn destroy(&self) {}

        fn reload(&self) {}
    }

    #[tokio::test]
    async fn unready_window_never_vetoes() {
        let negotiator = UnloadNegotiator::new();
        let window = TestWindow::unready(1);

        let veto = negotiator.unload(window.clone(), UnloadReason::Close).await;

        assert!(!veto);
        assert!(window.posted.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_reply_vetoes_the_unload() {
        let negotiator = UnloadNegotiator::new();
        let replies = negotiator.replies();
        let window = TestWindow::new(1);

        let unload = tokio::spawn(negotiator.unload(window.clone(), UnloadReason::Close));

        let WindowMessage::BeforeUnload { cancel_channel, .. } = window.posted_message(0).await
        else {
            panic!("expected a before-unload query");
        };
        assert!(replies.deliver(&cancel_channel));

        assert!(unload.await.unwrap());
        // No will-unload notice after a veto.
        assert_eq!(window.posted.lock().len(), 1);
    }

    #[tokio::test]
    async fn ok_reply_proceeds_to_will_unload() {
        let negotiator = UnloadNegotiator::new();
        let replies = negotiator.replies();
        let window = TestWindow::new(1);

        let unload = tokio::spawn(negotiator.unload(window.clone(), UnloadReason::Quit));

        let WindowMessage::BeforeUnload { ok_channel, .. } = window.posted_message(0).await else {
            panic!("expected a before-unload query");
        };
        replies.deliver(&ok_channel);

        let WindowMessage::WillUnload {
            reply_channel,
            reason,
        } = window.posted_message(1).await
        else {
            panic!("expected a will-unload notice");
        };
        assert_eq!(reason, UnloadReason::Quit);
        replies.deliver(&reply_channel);

        assert!(!unload.await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_unloads_share_one_negotiation() {
        let negotiator = UnloadNegotiator::new();
        let replies = negotiator.replies();
        let window = TestWindow::new(1);

        let first = tokio::spawn(negotiator.unload(window.clone(), UnloadReason::Close));
        let second = tokio::spawn(negotiator.unload(window.clone(), UnloadReason::Close));

        let WindowMessage::BeforeUnload { ok_channel, .. } = window.posted_message(0).await else {
            panic!("expected a before-unload query");
        };
        replies.deliver(&ok_channel);

        let WindowMessage::WillUnload { reply_channel, .. } = window.posted_message(1).await
        else {
            panic!("expected a will-unload notice");
        };
        replies.deliver(&reply_channel);

        assert!(!first.await.unwrap());
        assert!(!second.await.unwrap());
        // Exactly one veto-query round trip for both callers.
        assert_eq!(window.posted.lock().len(), 2);
        assert!(!negotiator.has_pending(WindowId(1)));
    }

    #[tokio::test]
    async fn discard_clears_the_pending_entry() {
        let negotiator = UnloadNegotiator::new();
        let window = TestWindow::new(1);

        let _unload = negotiator.unload(window.clone(), UnloadReason::Close);
        assert!(negotiator.has_pending(WindowId(1)));

        negotiator.discard(WindowId(1));
        assert!(!negotiator.has_pending(WindowId(1)));
    }

    #[tokio::test]
    async fn reply_on_an_unknown_channel_is_ignored() {
        let negotiator = UnloadNegotiator::new();
        assert!(!negotiator.replies().deliver("lifecycle:ok:bogus"));
    }
}
