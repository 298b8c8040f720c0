//! Process shutdown signal handling.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Installs handlers for SIGINT, SIGTERM, and SIGQUIT.
///
/// Returns the root cancellation token every suspension point in the
/// process watches. The first signal cancels the token; components then
/// drain cooperatively rather than being torn down.
pub fn install_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
            _ = quit.recv() => info!("received SIGQUIT, shutting down"),
        }

        trigger.cancel();
    });

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
        }
        trigger.cancel();
    });

    token
}
