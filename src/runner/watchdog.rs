use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::protocol::{expect_reply, Request, Response};
use crate::runner::state::RunnerState;

/// Watches for the dispatcher going quiet.
///
/// The dispatcher pings every runner regularly. If no ping has arrived for
/// `silence`, the watchdog asks the dispatcher for `status` directly; anything
/// but `OK` cancels the runner.
pub struct DispatcherWatchdog {
    state: Arc<RunnerState>,
    dispatcher_addr: String,
    interval: Duration,
    silence: Duration,
    io_timeout: Duration,
}

impl DispatcherWatchdog {
    pub fn new(
        state: Arc<RunnerState>,
        dispatcher_addr: impl Into<String>,
        interval: Duration,
        silence: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            state,
            dispatcher_addr: dispatcher_addr.into(),
            interval,
            silence,
            io_timeout,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if !self.dispatcher_alive().await {
                        shutdown.cancel();
                        break;
                    }
                }
            }
        }
        tracing::debug!("Dispatcher watchdog stopped");
    }

    /// True unless the dispatcher has been silent too long and then fails a
    /// direct status check.
    pub async fn dispatcher_alive(&self) -> bool {
        let silent_for = self.state.since_last_communication().await;
        if silent_for <= self.silence {
            return true;
        }

        tracing::debug!(silent_ms = silent_for.as_millis() as u64, "Dispatcher silent, probing status");
        match expect_reply(&self.dispatcher_addr, &Request::Status, Response::Ok, self.io_timeout).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(dispatcher = %self.dispatcher_addr, error = %e, "Dispatcher is no longer functional");
                false
            }
        }
    }
}
