use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ci_lite::config::{
    DispatcherConfig, ObserverConfig, RunnerConfig, DEFAULT_DISPATCHER_PORT, DEFAULT_HOST,
};
use ci_lite::dispatcher::DispatcherServer;
use ci_lite::error::CiError;
use ci_lite::observer::RepoObserver;
use ci_lite::runner::RunnerServer;
use ci_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "ci-lite")]
#[command(version)]
#[command(about = "A small distributed continuous integration system")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dispatcher that hands commits to test runners
    Dispatcher(DispatcherArgs),

    /// Start a test runner and register it with a dispatcher
    Runner(RunnerArgs),

    /// Poll a repository and dispatch new commits
    Observer(ObserverArgs),
}

// =============================================================================
// Dispatcher Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DispatcherArgs {
    /// Host to listen on
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_DISPATCHER_PORT)]
    port: u16,

    /// Directory receiving one results file per commit
    #[arg(long, default_value = "test_results")]
    results_dir: PathBuf,

    /// Interval between health pings of registered runners (ms)
    #[arg(long, default_value_t = 1000)]
    ping_interval_ms: u64,
}

// =============================================================================
// Runner Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunnerArgs {
    /// Host the runner listens on and advertises to the dispatcher
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on (default: first free port from 8900)
    #[arg(long)]
    port: Option<u16>,

    /// Dispatcher address as host:port
    #[arg(long, default_value = "127.0.0.1:8888")]
    dispatcher_server: String,

    /// Script run as `<script> <repo> <commit_id>` for each test job
    #[arg(long, default_value = "./test_runner_script.sh")]
    test_script: PathBuf,

    /// Working copy of the repository under test
    repo: PathBuf,
}

// =============================================================================
// Observer Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ObserverArgs {
    /// Dispatcher address as host:port
    #[arg(long, default_value = "127.0.0.1:8888")]
    dispatcher_server: String,

    /// Repository to observe
    #[arg(long)]
    repo: PathBuf,

    /// Script run as `<script> <repo>` on every poll
    #[arg(long, default_value = "./update_repo.sh")]
    update_script: PathBuf,

    /// File the update script writes the new commit id to
    #[arg(long, default_value = ".commit_id")]
    commit_id_file: PathBuf,

    /// Interval between polls (ms)
    #[arg(long, default_value_t = 5000)]
    poll_interval_ms: u64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Accepts `host:port` with a non-empty host and a non-zero port.
fn parse_dispatcher_addr(addr: &str) -> Result<String, CiError> {
    let valid = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0));
    if valid {
        Ok(addr.to_string())
    } else {
        Err(CiError::InvalidAddress(addr.to_string()))
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_dispatcher(args: DispatcherArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = DispatcherConfig {
        ping_interval_ms: args.ping_interval_ms,
        ..DispatcherConfig::new(args.host, args.port).with_results_dir(args.results_dir)
    };

    let shutdown = install_shutdown_handler()?;
    let server = DispatcherServer::bind(config).await?;
    server.run(shutdown).await?;
    Ok(())
}

async fn run_runner(args: RunnerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunnerConfig {
        host: args.host,
        port: args.port,
        test_script: args.test_script,
        ..RunnerConfig::new(parse_dispatcher_addr(&args.dispatcher_server)?, args.repo)
    };

    let shutdown = install_shutdown_handler()?;
    let server = RunnerServer::bind(config).await?;
    server.register().await?;
    server.run(shutdown).await?;
    Ok(())
}

async fn run_observer(args: ObserverArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ObserverConfig {
        dispatcher_addr: parse_dispatcher_addr(&args.dispatcher_server)?,
        repo: args.repo,
        update_script: args.update_script,
        commit_id_file: args.commit_id_file,
        poll_interval_ms: args.poll_interval_ms,
        ..ObserverConfig::default()
    };

    let shutdown = install_shutdown_handler()?;
    RepoObserver::new(config).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Dispatcher(dispatcher_args) => run_dispatcher(dispatcher_args).await?,
        Commands::Runner(runner_args) => run_runner(runner_args).await?,
        Commands::Observer(observer_args) => run_observer(observer_args).await?,
    }

    Ok(())
}
