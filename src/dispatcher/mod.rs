//! The dispatcher: owns the runner registry and commit ledger and keeps
//! commits moving onto live runners.
//!
//! # Components
//!
//! - [`DispatcherState`]: registry, ledger, pending queue (one lock)
//! - [`dispatch_commit`]: place one commit, retrying with backoff
//! - [`HealthMonitor`]: ping runners, evict the dead, requeue their work
//! - [`Redistributor`]: keep retrying pending commits
//! - [`ConnectionHandler`]: `status`, `register`, `dispatch`, `results`
//! - [`ResultStore`]: results directory
//! - [`DispatcherServer`]: listener and task wiring

pub mod dispatch;
pub mod handler;
pub mod monitor;
pub mod redistributor;
pub mod results;
pub mod server;
pub mod state;

pub use dispatch::{dispatch_commit, DispatchOutcome, DispatchPolicy};
pub use handler::ConnectionHandler;
pub use monitor::HealthMonitor;
pub use redistributor::Redistributor;
pub use results::ResultStore;
pub use server::DispatcherServer;
pub use state::{Assignment, DispatcherState, RunnerAddr};
