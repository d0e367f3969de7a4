use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::CiError;
use crate::protocol::{communicate, read_request, write_response, FrameLimits, Request, Response};
use crate::runner::executor::TestExecutor;
use crate::runner::state::{BusyGuard, RunnerState};

/// Serves `ping` and `runtest` on a runner.
#[derive(Clone)]
pub struct RunnerHandler {
    state: Arc<RunnerState>,
    executor: TestExecutor,
    dispatcher_addr: String,
    limits: FrameLimits,
}

impl RunnerHandler {
    pub fn new(
        state: Arc<RunnerState>,
        executor: TestExecutor,
        dispatcher_addr: impl Into<String>,
        limits: FrameLimits,
    ) -> Self {
        Self {
            state,
            executor,
            dispatcher_addr: dispatcher_addr.into(),
            limits,
        }
    }

    /// Serve one request on `stream`.
    ///
    /// An accepted `runtest` is acknowledged and the connection closed before
    /// the tests start; this call then returns only after the results report
    /// has been attempted.
    pub async fn handle_connection<S>(&self, mut stream: S, peer: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = match read_request(&mut stream, peer, &self.limits).await {
            Ok(request) => request,
            Err(CiError::Protocol(e)) => {
                tracing::debug!(peer, error = %e, "Rejected malformed request");
                self.reply(&mut stream, peer, &e.response()).await;
                return;
            }
            Err(e) => {
                tracing::warn!(peer, error = %e, "Failed to read request");
                return;
            }
        };

        let (response, job) = match request {
            Request::Ping => {
                self.state.touch().await;
                tracing::trace!(peer, "Pinged");
                (Response::Pong, None)
            }
            Request::RunTest { commit_id } => match self.state.try_begin_job() {
                Some(guard) => (Response::Ok, Some((commit_id, guard))),
                None => {
                    tracing::debug!(peer, commit_id = %commit_id, "Declined test run, already busy");
                    (Response::Busy, None)
                }
            },
            _ => (Response::InvalidCommand, None),
        };

        self.reply(&mut stream, peer, &response).await;
        drop(stream);

        if let Some((commit_id, guard)) = job {
            self.run_job(&commit_id, guard).await;
        }
    }

    async fn reply<S>(&self, stream: &mut S, peer: &str, response: &Response)
    where
        S: AsyncWrite + Unpin,
    {
        if let Err(e) = write_response(stream, peer, response, self.limits.io_timeout).await {
            tracing::warn!(peer, error = %e, "Failed to send response");
        }
    }

    /// Run the tests for `commit_id` and report them. The runner stays busy
    /// until `guard` drops at the end of this call.
    async fn run_job(&self, commit_id: &str, guard: BusyGuard) {
        let outcome = self.executor.run(commit_id).await;
        let request = outcome.report();

        match communicate(&self.dispatcher_addr, &request, self.limits.io_timeout).await {
            Ok(Response::Ok) => {
                tracing::info!(commit_id, success = outcome.success, "Reported test results");
            }
            Ok(other) => {
                tracing::warn!(commit_id, reply = %other, "Dispatcher rejected test results");
            }
            Err(e) => {
                tracing::warn!(commit_id, error = %e, "Failed to report test results");
            }
        }
        drop(guard);
    }
}
