//! Repository observer: polls a working copy for new commits and hands each
//! one to the dispatcher.
//!
//! The update script is run as `sh <update_script> <repo>`. When it finds a
//! new commit it writes the id to the commit id file; the observer then checks
//! the dispatcher is up and sends `dispatch:<id>`. Any failure ends the loop.

use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ObserverConfig;
use crate::error::{CiError, Result};
use crate::protocol::{expect_reply, Request, Response};

pub struct RepoObserver {
    config: ObserverConfig,
}

impl RepoObserver {
    pub fn new(config: ObserverConfig) -> Self {
        Self { config }
    }

    /// Poll until `shutdown` is cancelled or a poll fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let interval = std::time::Duration::from_millis(self.config.poll_interval_ms);
        tracing::info!(
            repo = %self.config.repo.display(),
            dispatcher = %self.config.dispatcher_addr,
            "Observing repository"
        );

        loop {
            if let Some(commit_id) = self.poll_once().await? {
                tracing::info!(commit_id = %commit_id, "Dispatched commit");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("Observer stopped");
        Ok(())
    }

    /// One poll: update the repository and dispatch the new commit, if any.
    pub async fn poll_once(&self) -> Result<Option<String>> {
        self.update_repo().await?;

        let commit_id = match tokio::fs::read_to_string(&self.config.commit_id_file).await {
            Ok(contents) => contents.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if commit_id.is_empty() {
            return Ok(None);
        }

        let addr = &self.config.dispatcher_addr;
        let io_timeout = self.config.io_timeout();
        expect_reply(addr, &Request::Status, Response::Ok, io_timeout).await?;
        expect_reply(
            addr,
            &Request::Dispatch {
                commit_id: commit_id.clone(),
            },
            Response::Ok,
            io_timeout,
        )
        .await?;
        Ok(Some(commit_id))
    }

    async fn update_repo(&self) -> Result<()> {
        let output = Command::new("sh")
            .arg(&self.config.update_script)
            .arg(&self.config.repo)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CiError::RepoUpdate(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CiError::RepoUpdate(format!(
                "{} exited with {}: {}",
                self.config.update_script.display(),
                output.status,
                stderr.trim()
            )));
        }
        tracing::debug!(repo = %self.config.repo.display(), "Repository updated");
        Ok(())
    }
}
