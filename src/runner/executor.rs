use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::protocol::Request;

/// Result of one test run.
#[derive(Debug)]
pub struct TestOutcome {
    pub commit_id: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl TestOutcome {
    /// Body of the `results` message sent to the dispatcher.
    ///
    /// A passing run reports its stdout. A failing run is prefixed with its
    /// exit status and also carries stderr.
    pub fn report_payload(&self) -> Vec<u8> {
        if self.success {
            return self.stdout.clone().into_bytes();
        }
        let status = match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated without exit code".to_string(),
        };
        format!("FAILED ({status})\n{}{}", self.stdout, self.stderr).into_bytes()
    }

    /// The `results` message reporting this run.
    pub fn report(&self) -> Request {
        Request::Results {
            commit_id: self.commit_id.clone(),
            payload: self.report_payload(),
        }
    }
}

/// Runs the test script for a commit against the runner's working copy.
///
/// The script is invoked as `sh <script> <repo> <commit_id>` and is expected
/// to check out the commit and run the suite, printing the report on stdout.
#[derive(Debug, Clone)]
pub struct TestExecutor {
    script: PathBuf,
    repo: PathBuf,
}

impl TestExecutor {
    pub fn new(script: impl Into<PathBuf>, repo: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            repo: repo.into(),
        }
    }

    pub async fn run(&self, commit_id: &str) -> TestOutcome {
        tracing::info!(
            commit_id,
            script = %self.script.display(),
            repo = %self.repo.display(),
            "Running tests"
        );

        let result = Command::new("sh")
            .arg(&self.script)
            .arg(&self.repo)
            .arg(commit_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        Self::process_output(commit_id, result)
    }

    fn process_output(
        commit_id: &str,
        result: Result<std::process::Output, std::io::Error>,
    ) -> TestOutcome {
        match result {
            Ok(output) => {
                let outcome = TestOutcome {
                    commit_id: commit_id.to_string(),
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };
                tracing::info!(
                    commit_id,
                    success = outcome.success,
                    exit_code = ?outcome.exit_code,
                    "Tests finished"
                );
                outcome
            }
            Err(e) => {
                tracing::error!(commit_id, error = %e, "Failed to start test script");
                TestOutcome {
                    commit_id: commit_id.to_string(),
                    success: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                }
            }
        }
    }
}
