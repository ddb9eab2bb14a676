//! Window-side lifecycle abstractions and the unload wire messages.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifies one open window for its whole open lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a window is being asked to unload. Carried on the wire so the
/// renderer can decide whether to prompt: once a quit is in progress the
/// prompt is suppressed so multiple windows cannot each block one quit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnloadReason {
    Close,
    Quit,
    Reload,
}

/// Why a window is loading content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadReason {
    /// First load after the window was created.
    Initial,
    /// A different workspace is being loaded into the window.
    Load,
    /// The same content is reloading in place.
    Reload,
}

/// Lifecycle messages posted to a renderer window. JSON-shaped; the window
/// replies by emitting on exactly one of the named one-time channels, with
/// no payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WindowMessage {
    /// Asks the window for consent to unload. A reply on `cancel_channel`
    /// vetoes; a reply on `ok_channel` consents.
    #[serde(rename_all = "camelCase")]
    BeforeUnload {
        ok_channel: String,
        cancel_channel: String,
        reason: UnloadReason,
    },
    /// Tells the window it is about to unload so it can run cleanup. The
    /// window acknowledges on `reply_channel`.
    #[serde(rename_all = "camelCase")]
    WillUnload {
        reply_channel: String,
        reason: UnloadReason,
    },
}

/// A window as seen by the lifecycle service.
///
/// The windowing shell owns the native window and routes its native events
/// to the service: a close request to
/// [`LifecycleService::handle_close_request`](crate::LifecycleService::handle_close_request)
/// and the closed event to
/// [`LifecycleService::unregister_window`](crate::LifecycleService::unregister_window).
/// Window replies to posted messages are routed to the service's
/// [`ReplyRegistry`](crate::ReplyRegistry).
#[async_trait]
pub trait LifecycleWindow: Send + Sync {
    fn id(&self) -> WindowId;

    /// Whether the window finished its initial load. An unready window is
    /// never asked for unload consent.
    fn is_ready(&self) -> bool;

    /// Posts a lifecycle message to the renderer. Fire-and-forget.
    fn post(&self, message: WindowMessage);

    /// Closes the native window for real, bypassing close interception.
    fn close(&self);

    /// Force-destroys the window; resolves once the window is gone.
    async fn destroy(&self);

    /// Reloads the window contents in place.
    fn reload(&self);
}
