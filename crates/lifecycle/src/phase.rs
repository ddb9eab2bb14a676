//! Startup phase tracking for the main process.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::barrier::Barrier;

/// Startup phases of the main process, in strictly increasing order.
///
/// The phase only ever moves forward; forward jumps may skip values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum LifecyclePhase {
    /// The process has just started and core services are coming up.
    Starting = 1,
    /// Services are in place and the first window is about to open.
    Ready = 2,
    /// The first window has opened and finished loading.
    AfterWindowOpen = 3,
    /// Some time after the first window opened, when it is safe to run
    /// low-priority background work.
    Eventually = 4,
}

/// Tracks the monotonically increasing [`LifecyclePhase`] and lets callers
/// await a target phase.
pub struct PhaseTracker {
    phase: Mutex<LifecyclePhase>,
    barriers: Mutex<HashMap<LifecyclePhase, Barrier>>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(LifecyclePhase::Starting),
            barriers: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.lock()
    }

    /// Advances the phase, releasing every waiter registered for a phase
    /// up to and including the new one.
    ///
    /// # Panics
    ///
    /// Setting a lower phase than the current one is a programming error
    /// and panics immediately; the phase is left unchanged.
    pub fn set_phase(&self, phase: LifecyclePhase) {
        let mut current = self.phase.lock();
        if phase < *current {
            panic!(
                "lifecycle phase cannot go backwards (from {:?} to {:?})",
                *current, phase
            );
        }
        if phase == *current {
            return;
        }

        trace!(from = ?*current, to = ?phase, "lifecycle phase advanced");
        *current = phase;

        let mut barriers = self.barriers.lock();
        let reached: Vec<LifecyclePhase> = barriers
            .keys()
            .copied()
            .filter(|registered| *registered <= phase)
            .collect();
        for registered in reached {
            if let Some(barrier) = barriers.remove(&registered) {
                barrier.open();
            }
        }
    }

    /// Resolves immediately if `phase` has been reached, otherwise once the
    /// tracker advances to it (or past it).
    pub async fn when(&self, phase: LifecyclePhase) {
        let barrier = {
            let current = self.phase.lock();
            if phase <= *current {
                return;
            }
            self.barriers
                .lock()
                .entry(phase)
                .or_insert_with(Barrier::new)
                .clone()
        };
        barrier.wait().await;
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "cannot go backwards")]
    fn backwards_phase_panics() {
        let tracker = PhaseTracker::new();
        tracker.set_phase(LifecyclePhase::Ready);
        tracker.set_phase(LifecyclePhase::Starting);
    }

    #[test]
    fn phase_is_unchanged_after_backwards_attempt() {
        let tracker = PhaseTracker::new();
        tracker.set_phase(LifecyclePhase::AfterWindowOpen);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracker.set_phase(LifecyclePhase::Ready);
        }));
        assert!(result.is_err());
        assert_eq!(tracker.phase(), LifecyclePhase::AfterWindowOpen);
    }

    #[test]
    fn setting_the_same_phase_is_a_no_op() {
        let tracker = PhaseTracker::new();
        tracker.set_phase(LifecyclePhase::Ready);
        tracker.set_phase(LifecyclePhase::Ready);
        assert_eq!(tracker.phase(), LifecyclePhase::Ready);
    }

    #[tokio::test]
    async fn when_resolves_immediately_for_reached_phase() {
        let tracker = PhaseTracker::new();
        tracker.set_phase(LifecyclePhase::Ready);

        tracker.when(LifecyclePhase::Starting).await;
        tracker.when(LifecyclePhase::Ready).await;
    }

    #[tokio::test]
    async fn when_waits_for_a_future_phase() {
        let tracker = std::sync::Arc::new(PhaseTracker::new());

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.when(LifecyclePhase::Ready).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tracker.set_phase(LifecyclePhase::Ready);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn forward_jump_releases_intermediate_waiters() {
        let tracker = std::sync::Arc::new(PhaseTracker::new());

        let ready = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.when(LifecyclePhase::Ready).await })
        };
        let window_open = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.when(LifecyclePhase::AfterWindowOpen).await })
        };
        tokio::task::yield_now().await;

        tracker.set_phase(LifecyclePhase::Eventually);
        ready.await.unwrap();
        window_open.await.unwrap();
    }
}
