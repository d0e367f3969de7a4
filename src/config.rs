use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::DispatchPolicy;
use crate::protocol::{FrameLimits, FRAME_SIZE};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DISPATCHER_PORT: u16 = 8888;
pub const DEFAULT_RUNNER_PORT_START: u16 = 8900;

/// Configuration for the dispatcher process.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub host: String,
    pub port: u16,
    /// Read chunk size; `results` payloads larger than this arrive in overflow reads.
    pub frame_size: usize,
    /// Largest `results` payload accepted.
    pub max_payload_bytes: usize,
    /// Bound on every connect, read and write.
    pub io_timeout_ms: u64,
    /// Interval between health ping sweeps over all runners.
    pub ping_interval_ms: u64,
    /// Pause after a dispatch pass in which no runner accepted.
    pub dispatch_backoff_ms: u64,
    /// Pause between redistribution attempts.
    pub redistribute_interval_ms: u64,
    /// Directory receiving one file per completed commit.
    pub results_dir: PathBuf,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_DISPATCHER_PORT,
            frame_size: FRAME_SIZE,
            max_payload_bytes: 16 * 1024 * 1024,
            io_timeout_ms: 5000,
            ping_interval_ms: 1000,
            dispatch_backoff_ms: 2000,
            redistribute_interval_ms: 5000,
            results_dir: PathBuf::from("test_results"),
        }
    }
}

impl DispatcherConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_results_dir(mut self, results_dir: impl Into<PathBuf>) -> Self {
        self.results_dir = results_dir.into();
        self
    }

    /// `host:port` to listen on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            frame_size: self.frame_size,
            max_payload_bytes: self.max_payload_bytes,
            io_timeout: self.io_timeout(),
        }
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            backoff: Duration::from_millis(self.dispatch_backoff_ms),
            attempt_timeout: self.io_timeout(),
        }
    }
}

/// Configuration for a runner process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub host: String,
    /// Fixed port. When `None` the first free port from `port_range_start` is used.
    pub port: Option<u16>,
    pub port_range_start: u16,
    pub port_search_limit: u16,
    /// Dispatcher address in `host:port` form.
    pub dispatcher_addr: String,
    /// Working copy of the repository under test.
    pub repo: PathBuf,
    /// Script invoked as `<test_script> <repo> <commit_id>`.
    pub test_script: PathBuf,
    pub frame_size: usize,
    pub io_timeout_ms: u64,
    /// How often the runner checks whether the dispatcher has gone quiet.
    pub watchdog_interval_ms: u64,
    /// Silence (no pings) after which the dispatcher is checked directly.
    pub dispatcher_silence_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            port_range_start: DEFAULT_RUNNER_PORT_START,
            port_search_limit: 100,
            dispatcher_addr: format!("{DEFAULT_HOST}:{DEFAULT_DISPATCHER_PORT}"),
            repo: PathBuf::from("."),
            test_script: PathBuf::from("./test_runner_script.sh"),
            frame_size: FRAME_SIZE,
            io_timeout_ms: 5000,
            watchdog_interval_ms: 5000,
            dispatcher_silence_ms: 10_000,
        }
    }
}

impl RunnerConfig {
    pub fn new(dispatcher_addr: impl Into<String>, repo: impl Into<PathBuf>) -> Self {
        Self {
            dispatcher_addr: dispatcher_addr.into(),
            repo: repo.into(),
            ..Default::default()
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            frame_size: self.frame_size,
            io_timeout: self.io_timeout(),
            ..FrameLimits::default()
        }
    }
}

/// Configuration for the repository observer.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub dispatcher_addr: String,
    pub repo: PathBuf,
    /// Script invoked as `<update_script> <repo>`; writes the commit id file
    /// when a new commit is found.
    pub update_script: PathBuf,
    pub commit_id_file: PathBuf,
    pub poll_interval_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            dispatcher_addr: format!("{DEFAULT_HOST}:{DEFAULT_DISPATCHER_PORT}"),
            repo: PathBuf::from("."),
            update_script: PathBuf::from("./update_repo.sh"),
            commit_id_file: PathBuf::from(".commit_id"),
            poll_interval_ms: 5000,
            io_timeout_ms: 5000,
        }
    }
}

impl ObserverConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
