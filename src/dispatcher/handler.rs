//! Per-connection request handling on the dispatcher.
//!
//! A connection moves through: await message, parse, (for `results`, receive
//! overflow chunks), respond, close. Each connection runs in its own task, so
//! a slow `results` upload only suspends its own handler.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::dispatch::{dispatch_commit, DispatchOutcome, DispatchPolicy};
use crate::dispatcher::results::ResultStore;
use crate::dispatcher::state::{DispatcherState, RunnerAddr};
use crate::error::CiError;
use crate::protocol::{read_request, write_response, FrameLimits, Request, Response};

#[derive(Clone)]
pub struct ConnectionHandler {
    state: Arc<RwLock<DispatcherState>>,
    results: ResultStore,
    limits: FrameLimits,
    policy: DispatchPolicy,
    shutdown: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        state: Arc<RwLock<DispatcherState>>,
        results: ResultStore,
        limits: FrameLimits,
        policy: DispatchPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            results,
            limits,
            policy,
            shutdown,
        }
    }

    /// Serve one request on `stream` and close it.
    pub async fn handle_connection<S>(&self, mut stream: S, peer: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let response = match read_request(&mut stream, peer, &self.limits).await {
            Ok(request) => {
                tracing::debug!(peer, command = request.name(), "Received request");
                self.handle_request(request).await
            }
            Err(CiError::Protocol(e)) => {
                tracing::debug!(peer, error = %e, "Rejected malformed request");
                e.response()
            }
            Err(e) => {
                tracing::warn!(peer, error = %e, "Failed to read request");
                return;
            }
        };

        if let Err(e) = write_response(&mut stream, peer, &response, self.limits.io_timeout).await {
            tracing::warn!(peer, error = %e, "Failed to send response");
        }
    }

    pub async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Status => Response::Ok,
            Request::Register { host, port } => {
                self.state
                    .write()
                    .await
                    .register_runner(RunnerAddr::new(host, port));
                Response::Ok
            }
            Request::Dispatch { commit_id } => self.handle_dispatch(commit_id).await,
            Request::Results { commit_id, payload } => self.handle_results(commit_id, payload).await,
            Request::Ping | Request::RunTest { .. } => Response::InvalidCommand,
        }
    }

    /// Queue the commit and acknowledge at once; placement happens in a
    /// background task that retries until some runner accepts.
    async fn handle_dispatch(&self, commit_id: String) -> Response {
        {
            let mut state = self.state.write().await;
            if state.runner_count() == 0 {
                return Response::NoRunners;
            }
            state.enqueue_pending(&commit_id);
        }
        tracing::info!(commit_id = %commit_id, "Dispatch requested");

        let state = self.state.clone();
        let policy = self.policy;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            match dispatch_commit(&state, &commit_id, &policy, &shutdown).await {
                DispatchOutcome::Assigned(_)
                | DispatchOutcome::Withdrawn
                | DispatchOutcome::Cancelled => {}
                DispatchOutcome::Skipped => {
                    tracing::debug!(commit_id = %commit_id, "Commit already dispatched or in progress");
                }
            }
        });

        Response::Ok
    }

    /// Persist the payload, then drop the commit from the ledger. A failed
    /// write leaves the registry untouched.
    async fn handle_results(&self, commit_id: String, payload: Vec<u8>) -> Response {
        if let Err(e) = self.results.store(&commit_id, &payload).await {
            tracing::error!(commit_id = %commit_id, error = %e, "Failed to store test results");
            return Response::InvalidResults;
        }

        let runner = self.state.write().await.complete(&commit_id);
        match runner {
            Some(runner) => {
                tracing::info!(commit_id = %commit_id, runner = %runner, "Commit completed");
            }
            None => {
                tracing::info!(commit_id = %commit_id, "Results received for commit not in ledger");
            }
        }
        Response::Ok
    }
}
