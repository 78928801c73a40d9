pub mod tcp;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub type ShutdownRx = watch::Receiver<bool>;
pub type ShutdownTx = watch::Sender<bool>;

pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Flip `shutdown` on Ctrl-C, or SIGTERM on unix.
pub fn spawn_shutdown_listener(shutdown: ShutdownTx) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = signal::ctrl_c() => match res {
                Ok(()) => info!("ctrl_c received; initiating shutdown"),
                Err(err) => {
                    warn!(error = %err, "failed to listen for ctrl_c");
                    return;
                }
            },
            _ = terminate => info!("SIGTERM received; initiating shutdown"),
        }
        let _ = shutdown.send(true);
    })
}
