use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::dispatcher::handler::ConnectionHandler;
use crate::dispatcher::monitor::HealthMonitor;
use crate::dispatcher::redistributor::Redistributor;
use crate::dispatcher::results::ResultStore;
use crate::dispatcher::state::DispatcherState;
use crate::error::Result;

/// The central coordinator: accepts connections and runs the health monitor
/// and redistributor against one shared [`DispatcherState`].
pub struct DispatcherServer {
    config: DispatcherConfig,
    listener: TcpListener,
    state: Arc<RwLock<DispatcherState>>,
}

impl DispatcherServer {
    pub async fn bind(config: DispatcherConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(Self {
            config,
            listener,
            state: Arc::new(RwLock::new(DispatcherState::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the shared registry, for inspection.
    pub fn state(&self) -> Arc<RwLock<DispatcherState>> {
        self.state.clone()
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Spawns the background loops, then accepts connections, one task each.
    /// On shutdown the listener is dropped and the background loops are
    /// awaited; they exit within one of their sleep intervals.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let policy = self.config.dispatch_policy();

        let monitor = HealthMonitor::new(
            self.state.clone(),
            Duration::from_millis(self.config.ping_interval_ms),
            self.config.io_timeout(),
        );
        let monitor_handle = tokio::spawn(monitor.run(shutdown.clone()));

        let redistributor = Redistributor::new(
            self.state.clone(),
            policy,
            Duration::from_millis(self.config.redistribute_interval_ms),
        );
        let redistributor_handle = tokio::spawn(redistributor.run(shutdown.clone()));

        let handler = ConnectionHandler::new(
            self.state.clone(),
            ResultStore::new(&self.config.results_dir),
            self.config.frame_limits(),
            policy,
            shutdown.clone(),
        );

        tracing::info!(addr = %addr, results_dir = %self.config.results_dir.display(), "Dispatcher serving");

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
        tracing::info!(addr = %addr, "Dispatcher shutting down");
        let _ = tokio::join!(monitor_handle, redistributor_handle);
        Ok(())
    }
}
