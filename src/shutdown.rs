//! Cooperative shutdown signalling over `tokio::sync::watch`.

use tokio::sync::watch;

/// Resolve once `rx` reads `true`, or once its sender is gone.
pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolve once either signal fires.
pub(crate) async fn wait_either(a: &mut watch::Receiver<bool>, b: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = wait_cancelled(a) => {}
        _ = wait_cancelled(b) => {}
    }
}
