use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::state::{DispatcherState, RunnerAddr};
use crate::protocol::{communicate, Request, Response};

/// Periodically pings every registered runner and evicts the ones that do
/// not answer `pong`.
pub struct HealthMonitor {
    state: Arc<RwLock<DispatcherState>>,
    interval: Duration,
    ping_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        state: Arc<RwLock<DispatcherState>>,
        interval: Duration,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            state,
            interval,
            ping_timeout,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        tracing::debug!("Health monitor stopped");
    }

    /// Ping every runner once. Returns the runners evicted in this sweep.
    ///
    /// The registry is only read for the snapshot; pings run without the lock
    /// and each eviction takes the write lock on its own.
    pub async fn sweep(&self) -> Vec<RunnerAddr> {
        let runners = self.state.read().await.runners();
        let mut evicted = Vec::new();

        for runner in runners {
            // Duplicate registrations share one eviction.
            let registered = self.state.read().await.is_registered(&runner);
            if !registered || self.ping(&runner).await {
                continue;
            }
            let orphaned = self.state.write().await.remove_runner(&runner);
            if !orphaned.is_empty() {
                tracing::info!(runner = %runner, commits = ?orphaned, "Requeued commits of dead runner");
            }
            evicted.push(runner);
        }
        evicted
    }

    async fn ping(&self, runner: &RunnerAddr) -> bool {
        let addr = runner.to_string();
        match communicate(&addr, &Request::Ping, self.ping_timeout).await {
            Ok(Response::Pong) => true,
            Ok(reply) => {
                tracing::warn!(runner = %runner, reply = %reply, "Unexpected ping reply, removing runner");
                false
            }
            Err(e) => {
                tracing::warn!(runner = %runner, error = %e, "Runner unreachable, removing runner");
                false
            }
        }
    }
}
