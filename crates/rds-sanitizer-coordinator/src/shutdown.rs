//! Process shutdown signals
//!
//! A run stopped by Ctrl-C, or by SIGTERM from a container runtime, service
//! manager or scheduler, is cancelled rather than killed, so it still
//! removes its ephemeral resources before the process exits.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Resolve with the signal's name on Ctrl-C, or on SIGTERM where there is one
///
/// Handlers are installed when this is called, not when the future is
/// first polled.
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        let interrupt = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        {
            tokio::select! {
                () = interrupt => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            }
        }
        #[cfg(not(unix))]
        {
            interrupt.await;
            "Ctrl-C"
        }
    })
}

/// Cancel `token` when the process is asked to shut down
pub fn cancel_on_shutdown(token: CancellationToken) {
    match shutdown_signal() {
        Ok(signal) => {
            tokio::spawn(async move {
                let name = signal.await;
                warn!(signal = name, "Shutdown requested, cancelling run and cleaning up");
                token.cancel();
            });
        }
        Err(e) => warn!(
            error = %e,
            "Failed to install shutdown signal handlers; a killed run will leave resources behind"
        ),
    }
}
