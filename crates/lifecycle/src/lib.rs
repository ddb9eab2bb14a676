//! # Kestrel Lifecycle
//!
//! Application lifecycle orchestration for the main process: startup
//! phases, the window close/unload veto protocol, quit and relaunch, and
//! the coordinated shutdown sequence that lets subscribers finish
//! asynchronous cleanup before the process exits.
//!
//! The [`LifecycleService`] is the root object; the shell constructs one
//! at startup, registers its windows with it and routes native close and
//! quit events through it.

pub mod barrier;
pub mod host;
pub mod phase;
pub mod process;
pub mod service;
pub mod shutdown;
pub mod unload;
pub mod window;

pub use barrier::{Barrier, Deferred};
pub use host::{PlatformConventions, PlatformHost, RelaunchHandler, RelaunchOptions};
pub use phase::{LifecyclePhase, PhaseTracker};
pub use process::{
    ProcessChannel, ProcessConfig, ProcessEnd, ProcessHandle, wire_process_shutdown,
};
pub use service::{LifecycleService, RESTART_MARKER_KEY};
pub use shutdown::{ShutdownCoordinator, ShutdownReason, WillShutdownEvent};
pub use unload::{ReplyRegistry, UnloadFuture, UnloadNegotiator};
pub use window::{LifecycleWindow, LoadReason, UnloadReason, WindowId, WindowMessage};
