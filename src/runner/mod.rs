//! The test runner: registers with a dispatcher, answers its pings and runs
//! one test job at a time.
//!
//! - [`RunnerState`]: Idle/Busy flag and the time of the last ping
//! - [`TestExecutor`]: runs the test script for a commit
//! - [`RunnerHandler`]: `ping` and `runtest`
//! - [`DispatcherWatchdog`]: shuts the runner down when the dispatcher is gone
//! - [`RunnerServer`]: port selection, registration and the accept loop

pub mod executor;
pub mod handler;
pub mod server;
pub mod state;
pub mod watchdog;

pub use executor::{TestExecutor, TestOutcome};
pub use handler::RunnerHandler;
pub use server::RunnerServer;
pub use state::{BusyGuard, RunnerPhase, RunnerState};
pub use watchdog::DispatcherWatchdog;
