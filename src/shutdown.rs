use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received.
/// Workers, readiness gates and the sync loop watch this token; teardown runs
/// once it fires.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating teardown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating teardown");
            }
            _ = token_clone.cancelled() => return,
        }

        token_clone.cancel();
    });

    Ok(token)
}

/// Cancel `token` once `budget` has elapsed, unless it is cancelled first.
pub fn install_time_budget(token: &CancellationToken, budget: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(budget) => {
                tracing::warn!(budget_secs = budget.as_secs(), "Time budget exhausted, initiating teardown");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}
