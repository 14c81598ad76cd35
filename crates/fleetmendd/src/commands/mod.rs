pub mod daemon;
pub mod enqueue;
pub mod rules;
pub mod toggle;

use tokio::sync::watch;
use tracing::{info, warn};

/// A shutdown channel flipped by Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping after the current pass");
                let _ = tx.send(true);
            }
            Err(e) => {
                // A dropped sender reads as shutdown; keep it alive.
                warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
                drop(tx);
            }
        }
    });
    rx
}
