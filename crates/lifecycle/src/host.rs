//! The native platform seam: OS-level operations and platform conventions.

/// OS-level operations the lifecycle service needs from the native shell.
///
/// `exit` forwards its code to the OS process exit verbatim; `relaunch`
/// schedules a respawn of the process with the given argument vector
/// before the current process goes away.
pub trait PlatformHost: Send + Sync {
    /// Notifies the shell that a quit sequence is beginning.
    fn request_quit(&self);

    /// Schedules a relaunch with `argv` (without the executable itself).
    fn relaunch(&self, argv: Vec<String>);

    /// Terminates the process with the given exit code.
    fn exit(&self, code: i32);
}

/// Lets an external component (for example an updater) take over a
/// requested relaunch instead of the plain respawn.
pub trait RelaunchHandler: Send + Sync {
    /// Returns `true` when the handler performs the relaunch itself.
    fn handle_relaunch(&self, options: &RelaunchOptions) -> bool;
}

/// Mutations applied to the startup argument vector on relaunch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaunchOptions {
    pub add_args: Vec<String>,
    pub remove_args: Vec<String>,
}

/// Windowing conventions of the host platform.
#[derive(Debug, Clone, Copy)]
pub struct PlatformConventions {
    /// Whether closing the last window implies quitting the application.
    /// macOS keeps the application alive with zero open windows.
    pub quits_when_last_window_closed: bool,

    /// Whether the startup working directory has to be restored before a
    /// restart; macOS changes the process cwd during normal operation.
    pub restores_cwd_on_quit: bool,
}

impl PlatformConventions {
    pub fn current() -> Self {
        let macos = cfg!(target_os = "macos");
        Self {
            quits_when_last_window_closed: !macos,
            restores_cwd_on_quit: macos,
        }
    }
}
