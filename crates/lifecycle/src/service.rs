//! The root lifecycle service for the main process.
//!
//! Composes phase tracking, the per-window unload negotiation and the
//! shutdown coordination into the quit/relaunch/kill surface the rest of
//! the application talks to. All state lives in one context object built
//! at process start and handed around explicitly; there are no ambient
//! singletons.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use state::StateStore;

use crate::barrier::Deferred;
use crate::host::{PlatformConventions, PlatformHost, RelaunchHandler, RelaunchOptions};
use crate::phase::{LifecyclePhase, PhaseTracker};
use crate::shutdown::{ShutdownCoordinator, ShutdownReason, WillShutdownEvent};
use crate::unload::{ReplyRegistry, UnloadNegotiator};
use crate::window::{LifecycleWindow, LoadReason, UnloadReason, WindowId};

/// State-store key for the restart marker. Written before a restart-quit,
/// read (and removed) exactly once at service construction.
pub const RESTART_MARKER_KEY: &str = "lifecycle.wasRestarted";

/// Budget for destroying windows during a forced kill; a hung window is
/// abandoned once it expires.
const KILL_WINDOW_TIMEOUT: Duration = Duration::from_millis(1000);

type QuitFuture = Shared<BoxFuture<'static, bool>>;
type BeforeCloseWindowHandler = Box<dyn Fn(WindowId) + Send + Sync>;
type WillLoadWindowHandler = Box<dyn Fn(WindowId, LoadReason) + Send + Sync>;

struct Inner {
    host: Arc<dyn PlatformHost>,
    store: Arc<dyn StateStore>,
    conventions: PlatformConventions,

    phases: PhaseTracker,
    shutdown: ShutdownCoordinator,
    unloads: UnloadNegotiator,

    windows: Mutex<BTreeMap<WindowId, Arc<dyn LifecycleWindow>>>,
    aux_windows: Mutex<BTreeMap<WindowId, Arc<dyn LifecycleWindow>>>,

    quit_requested: AtomicBool,
    restarting: AtomicBool,
    /// Termination may be entered exactly once.
    terminating: AtomicBool,
    was_restarted: bool,

    pending_quit: Mutex<Option<(QuitFuture, Deferred<bool>)>>,
    pending_relaunch: Mutex<Option<(RelaunchOptions, Vec<String>)>>,
    relaunch_handler: Mutex<Option<Arc<dyn RelaunchHandler>>>,

    before_close_handlers: Mutex<Vec<BeforeCloseWindowHandler>>,
    will_load_handlers: Mutex<Vec<WillLoadWindowHandler>>,

    startup_cwd: Option<PathBuf>,
    argv: Vec<String>,
}

/// Cheaply cloneable handle to the lifecycle state of the main process.
#[derive(Clone)]
pub struct LifecycleService {
    inner: Arc<Inner>,
}

impl LifecycleService {
    pub fn new(
        host: Arc<dyn PlatformHost>,
        store: Arc<dyn StateStore>,
        conventions: PlatformConventions,
    ) -> Self {
        Self::with_argv(
            host,
            store,
            conventions,
            std::env::args().skip(1).collect(),
        )
    }

    /// Like [`LifecycleService::new`] with an explicit startup argument
    /// vector (the basis for relaunches).
    pub fn with_argv(
        host: Arc<dyn PlatformHost>,
        store: Arc<dyn StateStore>,
        conventions: PlatformConventions,
        argv: Vec<String>,
    ) -> Self {
        // The restart marker is one-shot: read it, then remove it so a
        // stale marker cannot leak into a later, unrelated session.
        let was_restarted = store.get_bool(RESTART_MARKER_KEY).unwrap_or(false);
        if was_restarted {
            store.remove(RESTART_MARKER_KEY);
        }

        Self {
            inner: Arc::new(Inner {
                shutdown: ShutdownCoordinator::new(store.clone()),
                host,
                store,
                conventions,
                phases: PhaseTracker::new(),
                unloads: UnloadNegotiator::new(),
                windows: Mutex::new(BTreeMap::new()),
                aux_windows: Mutex::new(BTreeMap::new()),
                quit_requested: AtomicBool::new(false),
                restarting: AtomicBool::new(false),
                terminating: AtomicBool::new(false),
                was_restarted,
                pending_quit: Mutex::new(None),
                pending_relaunch: Mutex::new(None),
                relaunch_handler: Mutex::new(None),
                before_close_handlers: Mutex::new(Vec::new()),
                will_load_handlers: Mutex::new(Vec::new()),
                startup_cwd: std::env::current_dir().ok(),
                argv,
            }),
        }
    }

    // ── Phase ────────────────────────────────────────────────────────────

    pub fn phase(&self) -> LifecyclePhase {
        self.inner.phases.phase()
    }

    pub fn set_phase(&self, phase: LifecyclePhase) {
        self.inner.phases.set_phase(phase);
    }

    /// Resolves once `phase` has been reached.
    pub async fn when(&self, phase: LifecyclePhase) {
        self.inner.phases.when(phase).await;
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn quit_requested(&self) -> bool {
        self.inner.quit_requested.load(Ordering::SeqCst)
    }

    /// Whether this process was started by a restart-quit of its
    /// predecessor. Computed once at construction.
    pub fn was_restarted(&self) -> bool {
        self.inner.was_restarted
    }

    pub fn window_count(&self) -> usize {
        self.inner.windows.lock().len()
    }

    /// The registry the shell routes window lifecycle replies into.
    pub fn reply_registry(&self) -> Arc<ReplyRegistry> {
        self.inner.unloads.replies()
    }

    // ── Notifications ────────────────────────────────────────────────────

    pub fn on_before_shutdown(&self, handler: impl Fn(ShutdownReason) + Send + Sync + 'static) {
        self.inner.shutdown.on_before_shutdown(handler);
    }

    pub fn on_will_shutdown(
        &self,
        handler: impl Fn(&mut WillShutdownEvent<'_>) + Send + Sync + 'static,
    ) {
        self.inner.shutdown.on_will_shutdown(handler);
    }

    /// Fired after a window's unload was accepted, just before the real
    /// native close.
    pub fn on_before_close_window(&self, handler: impl Fn(WindowId) + Send + Sync + 'static) {
        self.inner.before_close_handlers.lock().push(Box::new(handler));
    }

    pub fn on_will_load_window(
        &self,
        handler: impl Fn(WindowId, LoadReason) + Send + Sync + 'static,
    ) {
        self.inner.will_load_handlers.lock().push(Box::new(handler));
    }

    /// Announces that a window is about to load content. Fired internally
    /// for reloads; the shell fires it for initial and workspace loads.
    pub fn notify_will_load_window(&self, id: WindowId, reason: LoadReason) {
        for handler in self.inner.will_load_handlers.lock().iter() {
            handler(id, reason);
        }
    }

    fn fire_before_close_window(&self, id: WindowId) {
        for handler in self.inner.before_close_handlers.lock().iter() {
            handler(id);
        }
    }

    pub fn set_relaunch_handler(&self, handler: Arc<dyn RelaunchHandler>) {
        *self.inner.relaunch_handler.lock() = Some(handler);
    }

    // ── Window registry ──────────────────────────────────────────────────

    /// Tracks a newly created window. The shell routes the window's native
    /// close request to [`LifecycleService::handle_close_request`] and its
    /// native closed event to [`LifecycleService::unregister_window`].
    pub fn register_window(&self, window: Arc<dyn LifecycleWindow>) {
        let id = window.id();
        self.inner.windows.lock().insert(id, window);
        trace!(window = %id, "window registered");
    }

    /// Handles a window's native closed event: forgets the window (and any
    /// pending unload) and, when this was the last open window on a
    /// platform that quits with it — or a quit is already underway —
    /// enters the shutdown sequence.
    pub fn unregister_window(&self, id: WindowId) {
        let (removed, remaining) = {
            let mut windows = self.inner.windows.lock();
            (windows.remove(&id).is_some(), windows.len())
        };
        if !removed {
            return;
        }
        self.inner.unloads.discard(id);
        trace!(window = %id, remaining, "window unregistered");

        if remaining == 0
            && (self.inner.conventions.quits_when_last_window_closed || self.quit_requested())
        {
            let this = self.clone();
            tokio::spawn(async move { this.finish_quit().await });
        }
    }

    /// Tracks an auxiliary window (for example a detached panel). Its
    /// close is suppressed only while a quit is in progress, deferring to
    /// the parent window's close sequence.
    pub fn register_aux_window(&self, window: Arc<dyn LifecycleWindow>) {
        let id = window.id();
        self.inner.aux_windows.lock().insert(id, window);
        trace!(window = %id, "auxiliary window registered");
    }

    pub fn unregister_aux_window(&self, id: WindowId) {
        self.inner.aux_windows.lock().remove(&id);
    }

    /// Whether an auxiliary window may close right now. While a quit is in
    /// flight the parent window drives teardown; an auxiliary window
    /// closing early would race state capture.
    pub fn handle_aux_close_request(&self, _id: WindowId) -> bool {
        !self.quit_requested()
    }

    // ── Close interception ───────────────────────────────────────────────

    /// Native close interception for a registered window: negotiates the
    /// unload and, when not vetoed, performs the real close. Returns
    /// `true` when a veto kept the window open; a veto also abandons an
    /// in-flight quit.
    pub async fn handle_close_request(&self, id: WindowId) -> bool {
        let Some(window) = self.inner.windows.lock().get(&id).cloned() else {
            return false;
        };

        // Once a quit is underway the renderer suppresses its prompt, so
        // several windows cannot each block a single quit.
        let reason = if self.quit_requested() {
            UnloadReason::Quit
        } else {
            UnloadReason::Close
        };

        if self.inner.unloads.unload(window.clone(), reason).await {
            self.handle_unload_veto();
            return true;
        }

        self.fire_before_close_window(id);
        window.close();
        false
    }

    /// Reloads a window in place after a successful unload negotiation.
    /// Returns `true` when the window vetoed.
    pub async fn reload(&self, id: WindowId) -> bool {
        let Some(window) = self.inner.windows.lock().get(&id).cloned() else {
            return false;
        };

        if self
            .inner
            .unloads
            .unload(window.clone(), UnloadReason::Reload)
            .await
        {
            return true;
        }

        self.notify_will_load_window(id, LoadReason::Reload);
        window.reload();
        false
    }

    // ── Quit / relaunch / kill ───────────────────────────────────────────

    /// Begins a graceful quit. Resolves to `true` when some window vetoed
    /// the attempt; the caller may retry later. A second call while a quit
    /// is outstanding joins the pending attempt.
    pub async fn quit(&self, will_restart: bool) -> bool {
        let (pending, is_new) = {
            let mut slot = self.inner.pending_quit.lock();
            if let Some((inflight, _)) = slot.as_ref() {
                (inflight.clone(), false)
            } else {
                let deferred = Deferred::new();
                let settled = deferred.clone();
                let pending: QuitFuture =
                    async move { settled.wait().await }.boxed().shared();
                *slot = Some((pending.clone(), deferred));
                (pending, true)
            }
        };

        if is_new {
            info!(will_restart, "quit requested");
            if will_restart {
                self.inner.restarting.store(true, Ordering::SeqCst);
                // Persisted before the quit is issued so the next session
                // can tell it was spawned by a restart.
                self.inner.store.set(RESTART_MARKER_KEY, Value::Bool(true));
            }

            self.inner.host.request_quit();
            let this = self.clone();
            tokio::spawn(async move { this.run_quit_sequence().await });
        }

        pending.await
    }

    /// Entry point for a native OS quit signal (dock quit, session end)
    /// arriving without a prior [`LifecycleService::quit`] call.
    pub fn handle_quit_signal(&self) {
        if self.inner.terminating.load(Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.run_quit_sequence().await });
    }

    /// Restarts the application: a restart-quit followed by a respawn with
    /// the (optionally mutated) startup argument vector, unless a
    /// registered relaunch handler takes over. Returns `true` when vetoed.
    pub async fn relaunch(&self, options: RelaunchOptions) -> bool {
        let mut argv = self.inner.argv.clone();
        argv.retain(|arg| !options.remove_args.contains(arg));
        argv.extend(options.add_args.iter().cloned());
        info!(?argv, "relaunch requested");

        *self.inner.pending_relaunch.lock() = Some((options, argv));

        let veto = self.quit(true).await;
        if veto {
            self.inner.pending_relaunch.lock().take();
        }
        veto
    }

    /// Forced termination: gives subscribers one last best-effort cleanup
    /// pass, destroys every still-open window within a bounded budget, and
    /// exits with `code`.
    pub async fn kill(&self, code: i32) {
        info!(code, "kill requested");
        self.inner.terminating.store(true, Ordering::SeqCst);

        self.inner
            .shutdown
            .fire_will_shutdown(ShutdownReason::Kill)
            .await;

        let windows: Vec<Arc<dyn LifecycleWindow>> = {
            let main = self.inner.windows.lock();
            let aux = self.inner.aux_windows.lock();
            main.values().chain(aux.values()).cloned().collect()
        };
        if !windows.is_empty() {
            let destroy_all = join_all(windows.iter().map(|window| window.destroy()));
            // A hung window must never block a forced kill.
            tokio::select! {
                _ = tokio::time::sleep(KILL_WINDOW_TIMEOUT) => {
                    warn!("timed out waiting for windows to be destroyed");
                }
                _ = destroy_all => {}
            }
        }

        self.inner.host.exit(code);
    }

    // ── Shutdown sequence ────────────────────────────────────────────────

    async fn run_quit_sequence(self) {
        // The before-shutdown notification fires once per quit attempt.
        if self.inner.quit_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .shutdown
            .fire_before_shutdown(ShutdownReason::Quit);

        let windows: Vec<Arc<dyn LifecycleWindow>> =
            self.inner.windows.lock().values().cloned().collect();

        if windows.is_empty() {
            // Nothing can veto with zero open windows.
            self.finish_quit().await;
            return;
        }

        for window in windows {
            if self.handle_close_request(window.id()).await {
                // Vetoed; the pending quit promise is already settled.
                return;
            }
        }
        // Termination continues from `unregister_window` once the shell
        // reports the last window closed.
    }

    fn handle_unload_veto(&self) {
        if !self.inner.quit_requested.swap(false, Ordering::SeqCst) {
            // A plain window-close veto outside a quit changes nothing.
            return;
        }
        debug!("quit vetoed by window unload");

        if self.inner.restarting.swap(false, Ordering::SeqCst) {
            // The marker must not survive an abandoned restart-quit.
            self.inner.store.remove(RESTART_MARKER_KEY);
        }
        self.inner.pending_relaunch.lock().take();

        if let Some((_, deferred)) = self.inner.pending_quit.lock().take() {
            deferred.complete(true);
        }
    }

    async fn finish_quit(&self) {
        if self.inner.terminating.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner
            .shutdown
            .fire_will_shutdown(ShutdownReason::Quit)
            .await;

        if self.inner.restarting.load(Ordering::SeqCst)
            && self.inner.conventions.restores_cwd_on_quit
        {
            if let Some(cwd) = &self.inner.startup_cwd {
                if let Err(err) = std::env::set_current_dir(cwd) {
                    warn!("failed to restore startup working directory: {err}");
                }
            }
        }

        if let Some((_, deferred)) = self.inner.pending_quit.lock().take() {
            deferred.complete(false);
        }

        // A pending relaunch is issued before the process goes away,
        // unless a relaunch handler takes over.
        if let Some((options, argv)) = self.inner.pending_relaunch.lock().take() {
            let handled = self
                .inner
                .relaunch_handler
                .lock()
                .clone()
                .is_some_and(|handler| handler.handle_relaunch(&options));
            if !handled {
                self.inner.host.relaunch(argv);
            }
        }

        self.inner.host.exit(0);
    }
}
