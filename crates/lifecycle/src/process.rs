//! Auxiliary background process collaborators (shared worker, pty host).
//!
//! The lifecycle service never owns these processes; it only sees them
//! through the opaque [`ProcessHandle`] interface, and ties them into
//! shutdown so they are torn down before the main process exits.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::service::LifecycleService;

/// Configuration handed to an auxiliary process when it starts.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// How an auxiliary process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEnd {
    /// Exited on its own with the given code.
    Exited(i32),
    /// Crashed or was signalled.
    Crashed,
}

/// Raw message channel obtained by connecting to a running process.
pub struct ProcessChannel {
    pub sender: mpsc::UnboundedSender<Vec<u8>>,
    pub receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Opaque handle over a spawned auxiliary process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    async fn start(&self, config: ProcessConfig) -> Result<()>;

    /// Connects to the running process, yielding its message channel.
    async fn connect(&self) -> Result<ProcessChannel>;

    /// Requests termination. Fire-and-forget; completion is observed via
    /// [`ProcessHandle::subscribe_end`].
    fn kill(&self);

    /// Subscribes to crash/exit notifications.
    fn subscribe_end(&self) -> broadcast::Receiver<ProcessEnd>;
}

/// Ties an auxiliary process to application shutdown: registers a
/// will-shutdown joiner that kills the process and waits for it to go
/// away, so the main process never exits while it is still running.
pub fn wire_process_shutdown(
    service: &LifecycleService,
    id: &str,
    handle: Arc<dyn ProcessHandle>,
) {
    let id = id.to_string();
    service.on_will_shutdown(move |event| {
        let handle = handle.clone();
        event.join(id.clone(), async move {
            let mut end = handle.subscribe_end();
            handle.kill();
            let _ = end.recv().await;
            Ok(())
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use crate::host::PlatformConventions;
    use crate::service::test_support::TestHost;
    use state::MemoryStateStore;

    struct FakeProcess {
        killed: AtomicBool,
        end_tx: broadcast::Sender<ProcessEnd>,
    }

    impl FakeProcess {
        fn new() -> Arc<Self> {
            let (end_tx, _) = broadcast::channel(4);
            Arc::new(Self {
                killed: AtomicBool::new(false),
                end_tx,
            })
        }
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        async fn start(&self, _config: ProcessConfig) -> Result<()> {
            Ok(())
        }

        async fn connect(&self) -> Result<ProcessChannel> {
            let (sender, receiver) = mpsc::unbounded_channel();
            // Loopback channel is enough for the interface contract.
            Ok(ProcessChannel { sender, receiver })
        }

        fn kill(&self) {
            self.killed.store(true, Ordering::Release);
            let _ = self.end_tx.send(ProcessEnd::Exited(0));
        }

        fn subscribe_end(&self) -> broadcast::Receiver<ProcessEnd> {
            self.end_tx.subscribe()
        }
    }

    #[tokio::test]
    async fn shutdown_kills_the_wired_process_and_awaits_its_exit() {
        let host = Arc::new(TestHost::default());
        let service = LifecycleService::new(
            host.clone(),
            Arc::new(MemoryStateStore::new()),
            PlatformConventions {
                quits_when_last_window_closed: false,
                restores_cwd_on_quit: false,
            },
        );

        let process = FakeProcess::new();
        wire_process_shutdown(&service, "shared-worker", process.clone());

        let ends: Arc<Mutex<Vec<ProcessEnd>>> = Arc::new(Mutex::new(Vec::new()));
        let mut end_rx = process.subscribe_end();
        let ends_task = {
            let ends = ends.clone();
            tokio::spawn(async move {
                while let Ok(end) = end_rx.recv().await {
                    ends.lock().push(end);
                }
            })
        };

        assert!(!service.quit(false).await);

        assert!(process.killed.load(Ordering::Acquire));
        assert_eq!(host.exit_code(), Some(0));

        ends_task.abort();
        assert_eq!(*ends.lock(), vec![ProcessEnd::Exited(0)]);
    }
}
