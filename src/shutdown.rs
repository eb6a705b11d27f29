use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Process-wide shutdown token, cancelled on SIGTERM or SIGINT.
///
/// The claim loop, every worker loop and every in-flight job step derive from
/// it. If the unix handlers cannot be installed, ctrl-c is used instead.
pub fn install_shutdown_handler() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Signal handlers unavailable, waiting for ctrl-c");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for ctrl-c");
                    }
                    trigger.cancel();
                    return;
                }
            };

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "Stopping claim loop and workers");
        trigger.cancel();
    });

    shutdown
}
