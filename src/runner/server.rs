use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::dispatcher::RunnerAddr;
use crate::error::{CiError, Result};
use crate::protocol::{expect_reply, Request, Response};
use crate::runner::executor::TestExecutor;
use crate::runner::handler::RunnerHandler;
use crate::runner::state::RunnerState;
use crate::runner::watchdog::DispatcherWatchdog;

/// A test runner: listens for the dispatcher, runs one test job at a time.
pub struct RunnerServer {
    config: RunnerConfig,
    listener: TcpListener,
    state: Arc<RunnerState>,
}

impl RunnerServer {
    /// Bind the configured port, or the first free port in the search range.
    pub async fn bind(config: RunnerConfig) -> Result<Self> {
        let listener = match config.port {
            Some(port) => TcpListener::bind((config.host.as_str(), port)).await?,
            None => Self::bind_first_free(&config).await?,
        };
        Ok(Self {
            config,
            listener,
            state: Arc::new(RunnerState::new()),
        })
    }

    async fn bind_first_free(config: &RunnerConfig) -> Result<TcpListener> {
        let start = config.port_range_start;
        let end = start.saturating_add(config.port_search_limit);
        for port in start..end {
            match TcpListener::bind((config.host.as_str(), port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    tracing::debug!(port, "Port in use, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CiError::NoFreePort { start, end })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The address the dispatcher should use to reach this runner.
    pub fn advertised_addr(&self) -> Result<RunnerAddr> {
        Ok(RunnerAddr::new(self.config.host.clone(), self.local_addr()?.port()))
    }

    pub fn state(&self) -> Arc<RunnerState> {
        self.state.clone()
    }

    /// Announce this runner to the dispatcher. Anything but `OK` is fatal.
    pub async fn register(&self) -> Result<()> {
        let addr = self.advertised_addr()?;
        let request = Request::Register {
            host: addr.host.clone(),
            port: addr.port,
        };
        let dispatcher = &self.config.dispatcher_addr;
        expect_reply(dispatcher, &request, Response::Ok, self.config.io_timeout())
            .await
            .map_err(|e| {
                tracing::error!(dispatcher = %dispatcher, error = %e, "Registration failed");
                CiError::Registration(dispatcher.clone())
            })?;
        tracing::info!(runner = %addr, dispatcher = %dispatcher, "Registered with dispatcher");
        Ok(())
    }

    /// Serve until `shutdown` is cancelled, either externally or by the
    /// watchdog deciding the dispatcher is gone.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;

        let watchdog = DispatcherWatchdog::new(
            self.state.clone(),
            self.config.dispatcher_addr.clone(),
            Duration::from_millis(self.config.watchdog_interval_ms),
            Duration::from_millis(self.config.dispatcher_silence_ms),
            self.config.io_timeout(),
        );
        let watchdog_handle = tokio::spawn(watchdog.run(shutdown.clone()));

        let handler = RunnerHandler::new(
            self.state.clone(),
            TestExecutor::new(&self.config.test_script, &self.config.repo),
            self.config.dispatcher_addr.clone(),
            self.config.frame_limits(),
        );

        tracing::info!(addr = %addr, repo = %self.config.repo.display(), "Runner serving");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle_connection(stream, &peer.to_string()).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        drop(self.listener);
        tracing::info!(addr = %addr, "Runner shutting down");
        let _ = watchdog_handle.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: Option<u16>, start: u16, limit: u16) -> RunnerConfig {
        RunnerConfig {
            port,
            port_range_start: start,
            port_search_limit: limit,
            ..RunnerConfig::new("127.0.0.1:1", ".")
        }
    }

    #[tokio::test]
    async fn fixed_port_zero_binds_ephemeral() {
        let server = RunnerServer::bind(config(Some(0), 0, 0)).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.advertised_addr().unwrap().host, "127.0.0.1");
    }

    #[tokio::test]
    async fn exhausted_port_range_fails() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        match RunnerServer::bind(config(None, port, 1)).await {
            Err(CiError::NoFreePort { start, end }) => {
                assert_eq!(start, port);
                assert_eq!(end, port.saturating_add(1));
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("bound a port that is in use"),
        }
    }

    #[tokio::test]
    async fn registration_without_dispatcher_fails() {
        let server = RunnerServer::bind(config(Some(0), 0, 0)).await.unwrap();
        assert!(matches!(server.register().await, Err(CiError::Registration(_))));
    }
}
