//! Test harness for dispatcher/runner integration tests.
//!
//! Spawns a real dispatcher on an ephemeral port with short intervals, and
//! scriptable fake runners that answer `ping`/`runtest` the way a real runner
//! would, recording every command they receive.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ci_lite::config::DispatcherConfig;
use ci_lite::dispatcher::{DispatcherServer, DispatcherState, RunnerAddr};
use ci_lite::protocol::{read_request, write_response, FrameLimits, Request, Response};

/// Dispatcher configuration with millisecond intervals for fast tests
pub fn test_dispatcher_config(results_dir: &Path) -> DispatcherConfig {
    DispatcherConfig {
        max_payload_bytes: 64 * 1024,
        io_timeout_ms: 500,
        ping_interval_ms: 50,
        dispatch_backoff_ms: 50,
        redistribute_interval_ms: 50,
        ..DispatcherConfig::new("127.0.0.1", 0).with_results_dir(results_dir)
    }
}

/// Handle to a running dispatcher
pub struct TestDispatcher {
    pub addr: String,
    pub state: Arc<RwLock<DispatcherState>>,
    results: TempDir,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TestDispatcher {
    pub async fn start() -> Self {
        let results = tempfile::tempdir().unwrap();
        Self::start_with(test_dispatcher_config(results.path()), results).await
    }

    pub async fn start_with(config: DispatcherConfig, results: TempDir) -> Self {
        let server = DispatcherServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let state = server.state();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            server.run(token).await.unwrap();
        });

        Self {
            addr,
            state,
            results,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn results_dir(&self) -> &Path {
        self.results.path()
    }

    pub fn results_path(&self, commit_id: &str) -> PathBuf {
        self.results.path().join(commit_id)
    }

    /// Send raw bytes and return the reply
    pub async fn send(&self, raw: &[u8]) -> String {
        send_raw(&self.addr, raw).await
    }

    pub async fn register(&self, runner: &FakeRunner) {
        let message = format!("register:{}", runner.addr);
        assert_eq!(self.send(message.as_bytes()).await, "OK");
    }

    pub async fn assigned_runner(&self, commit_id: &str) -> Option<RunnerAddr> {
        self.state.read().await.assigned_runner(commit_id).cloned()
    }

    pub async fn is_pending(&self, commit_id: &str) -> bool {
        self.state.read().await.is_pending(commit_id)
    }

    pub async fn runners(&self) -> Vec<RunnerAddr> {
        self.state.read().await.runners()
    }

    /// Stop the dispatcher and wait for its listener to close
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestDispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// How a fake runner answers `runtest`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMode {
    Accept,
    Busy,
}

/// A runner stand-in that answers pings and records every command
pub struct FakeRunner {
    pub addr: RunnerAddr,
    mode: Arc<RwLock<FakeMode>>,
    received: Arc<RwLock<Vec<Request>>>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FakeRunner {
    pub async fn start(mode: FakeMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mode = Arc::new(RwLock::new(mode));
        let received = Arc::new(RwLock::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(Self::serve(
            listener,
            mode.clone(),
            received.clone(),
            shutdown.clone(),
        ));

        Self {
            addr: RunnerAddr::new("127.0.0.1", port),
            mode,
            received,
            shutdown,
            handle: Some(handle),
        }
    }

    async fn serve(
        listener: TcpListener,
        mode: Arc<RwLock<FakeMode>>,
        received: Arc<RwLock<Vec<Request>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let (mut stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(_) => continue,
                },
            };
            let peer = peer.to_string();
            let limits = FrameLimits::default();
            let Ok(request) = read_request(&mut stream, &peer, &limits).await else {
                continue;
            };

            let response = match &request {
                Request::Ping => Response::Pong,
                Request::RunTest { .. } => match *mode.read().await {
                    FakeMode::Accept => Response::Ok,
                    FakeMode::Busy => Response::Busy,
                },
                _ => Response::InvalidCommand,
            };
            received.write().await.push(request);
            let _ = write_response(&mut stream, &peer, &response, limits.io_timeout).await;
        }
    }

    pub async fn set_mode(&self, mode: FakeMode) {
        *self.mode.write().await = mode;
    }

    /// Commit ids of every `runtest` received, in order
    pub async fn runtests(&self) -> Vec<String> {
        self.received
            .read()
            .await
            .iter()
            .filter_map(|request| match request {
                Request::RunTest { commit_id } => Some(commit_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn ping_count(&self) -> usize {
        self.received
            .read()
            .await
            .iter()
            .filter(|request| matches!(request, Request::Ping))
            .count()
    }

    /// Stop listening; later connections are refused
    pub async fn kill(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for FakeRunner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Write `raw`, half-close, and read the reply to EOF
pub async fn send_raw(addr: &str, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    reply
}

/// Write `raw` in `piece`-sized writes with a pause between them
pub async fn send_in_pieces(addr: &str, raw: &[u8], piece: usize, pause: Duration) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    for chunk in raw.chunks(piece) {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(pause).await;
    }
    stream.shutdown().await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    reply
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "Condition not met within {:?}: {}", timeout_duration, message);
}

/// Write a shell script into `dir`; runners invoke it through `sh`
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}
