use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::dispatch::{dispatch_commit, DispatchOutcome, DispatchPolicy};
use crate::dispatcher::state::DispatcherState;

/// Background loop that keeps trying to place every pending commit.
///
/// Each pass works through a snapshot of the pending queue, dispatching one
/// commit at a time and pausing `interval` after each. Commits placed or
/// completed elsewhere drop out of the next snapshot. With nothing pending the
/// loop idles for `interval` before looking again.
pub struct Redistributor {
    state: Arc<RwLock<DispatcherState>>,
    policy: DispatchPolicy,
    interval: Duration,
}

impl Redistributor {
    pub fn new(state: Arc<RwLock<DispatcherState>>, policy: DispatchPolicy, interval: Duration) -> Self {
        Self {
            state,
            policy,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        'outer: while !shutdown.is_cancelled() {
            let pending = self.state.read().await.pending_commits();
            if !pending.is_empty() {
                tracing::debug!(pending = ?pending, "Redistributing pending commits");
            }

            let mut attempted = false;
            for commit_id in pending {
                let outcome = dispatch_commit(&self.state, &commit_id, &self.policy, &shutdown).await;
                match outcome {
                    DispatchOutcome::Assigned(runner) => {
                        tracing::info!(commit_id = %commit_id, runner = %runner, "Redistributed commit");
                    }
                    DispatchOutcome::Skipped | DispatchOutcome::Withdrawn => continue,
                    DispatchOutcome::Cancelled => break 'outer,
                }
                attempted = true;
                if !self.pause(&shutdown).await {
                    break 'outer;
                }
            }

            // Nothing pending, or every pending commit is owned by another task.
            if !attempted && !self.pause(&shutdown).await {
                break;
            }
        }
        tracing::debug!("Redistributor stopped");
    }

    /// Sleep for one interval. Returns false if shutdown fired first.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.interval) => true,
        }
    }
}
