use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::state::{Assignment, DispatcherState, RunnerAddr};
use crate::protocol::{communicate, Request, Response};

/// Timing knobs for the dispatch loop.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    /// Pause after a full pass over the runners in which nobody accepted.
    pub backoff: Duration,
    /// Bound on each connect/write/read with a runner.
    pub attempt_timeout: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Assigned(RunnerAddr),
    /// The commit is no longer pending, or another task is placing it.
    Skipped,
    /// Results for the commit arrived while it was still being placed.
    Withdrawn,
    Cancelled,
}

/// Place `commit_id` on the first runner that accepts it.
///
/// Runners are offered `runtest:<commit_id>` in registration order; anything
/// but `OK` (including `BUSY` and transport errors) moves on to the next one.
/// When a full pass finds no taker the loop sleeps for `policy.backoff` and
/// starts again from a fresh snapshot of the registry, so newly registered
/// runners are picked up. The loop ends on acceptance, when the commit stops
/// being pending (its results arrived), or when `shutdown` fires.
///
/// The commit must be pending. Only one task at a time may dispatch a given
/// commit id: the id is claimed in the shared state first and a losing caller
/// returns [`DispatchOutcome::Skipped`] right away.
pub async fn dispatch_commit(
    state: &Arc<RwLock<DispatcherState>>,
    commit_id: &str,
    policy: &DispatchPolicy,
    shutdown: &CancellationToken,
) -> DispatchOutcome {
    {
        let mut state = state.write().await;
        if !state.try_claim(commit_id) {
            let reason = if state.is_claimed(commit_id) {
                "already being dispatched"
            } else {
                "not pending"
            };
            tracing::debug!(commit_id, reason, "Skipping dispatch");
            return DispatchOutcome::Skipped;
        }
    }

    let outcome = tokio::select! {
        placed = place_commit(state, commit_id, policy) => match placed {
            Some(runner) => DispatchOutcome::Assigned(runner),
            None => DispatchOutcome::Withdrawn,
        },
        _ = shutdown.cancelled() => DispatchOutcome::Cancelled,
    };

    match outcome {
        DispatchOutcome::Cancelled => {
            state.write().await.release_claim(commit_id);
            tracing::debug!(commit_id, "Dispatch cancelled");
        }
        DispatchOutcome::Withdrawn => {
            state.write().await.release_claim(commit_id);
            tracing::info!(commit_id, "Commit completed before dispatch, stopping");
        }
        DispatchOutcome::Assigned(_) | DispatchOutcome::Skipped => {}
    }
    outcome
}

async fn place_commit(
    state: &Arc<RwLock<DispatcherState>>,
    commit_id: &str,
    policy: &DispatchPolicy,
) -> Option<RunnerAddr> {
    let request = Request::RunTest {
        commit_id: commit_id.to_string(),
    };

    loop {
        let runners = state.read().await.runners();
        tracing::debug!(commit_id, runners = runners.len(), "Trying to dispatch to runners");

        for runner in runners {
            if !state.read().await.is_pending(commit_id) {
                return None;
            }
            let addr = runner.to_string();
            match communicate(&addr, &request, policy.attempt_timeout).await {
                Ok(Response::Ok) => {
                    let assignment = state.write().await.assign(commit_id, &runner);
                    match assignment {
                        Assignment::Recorded => return Some(runner),
                        Assignment::Withdrawn => return None,
                        Assignment::RunnerGone => {
                            tracing::warn!(
                                commit_id,
                                runner = %runner,
                                "Runner accepted but was evicted before assignment"
                            );
                        }
                    }
                }
                Ok(reply) => {
                    tracing::debug!(commit_id, runner = %runner, reply = %reply, "Runner declined");
                }
                Err(e) => {
                    tracing::warn!(
                        commit_id,
                        runner = %runner,
                        error = %e,
                        "Failed to communicate with runner"
                    );
                }
            }
        }

        tokio::time::sleep(policy.backoff).await;
        if !state.read().await.is_pending(commit_id) {
            return None;
        }
    }
}
