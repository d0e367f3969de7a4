use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerPhase {
    Idle,
    Busy,
}

/// State shared by every connection a runner serves.
///
/// Transitions: `Idle -> Busy` when a `runtest` is accepted, `Busy -> Idle`
/// when the [`BusyGuard`] for that job is dropped, which happens after the
/// results report has been attempted whatever the test outcome.
#[derive(Debug)]
pub struct RunnerState {
    busy: AtomicBool,
    last_communication: RwLock<Instant>,
}

impl Default for RunnerState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerState {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            last_communication: RwLock::new(Instant::now()),
        }
    }

    pub fn phase(&self) -> RunnerPhase {
        if self.busy.load(Ordering::Acquire) {
            RunnerPhase::Busy
        } else {
            RunnerPhase::Idle
        }
    }

    /// Move from Idle to Busy. Returns `None` if a job is already running.
    pub fn try_begin_job(self: &Arc<Self>) -> Option<BusyGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard {
                state: Arc::clone(self),
            })
    }

    /// Record contact from the dispatcher.
    pub async fn touch(&self) {
        *self.last_communication.write().await = Instant::now();
    }

    pub async fn since_last_communication(&self) -> Duration {
        self.last_communication.read().await.elapsed()
    }
}

/// Holds the runner in `Busy`; dropping it returns the runner to `Idle`.
#[derive(Debug)]
pub struct BusyGuard {
    state: Arc<RunnerState>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.state.busy.store(false, Ordering::Release);
    }
}
