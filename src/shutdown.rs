use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Cancel `token` on SIGINT or SIGTERM.
///
/// The dispatcher, runner and observer all stop on the same token, so a
/// runner whose watchdog gives up and an operator pressing Ctrl-C take the
/// same exit path.
pub fn cancel_on_signal(token: &CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down");
            }
            _ = token.cancelled() => return,
        }
        token.cancel();
    });

    Ok(())
}

/// A fresh token wired to SIGINT and SIGTERM.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    cancel_on_signal(&token)?;
    Ok(token)
}
