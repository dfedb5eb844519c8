// src/core/rebalance/mod.rs

//! The rebalance machinery: the top-level orchestrator, the per-bucket
//! vbucket mover, replication verification, and the cancellation plumbing
//! shared by every long-running worker.

pub mod mover;
pub mod orchestrator;
pub mod verify;

use tokio::sync::watch;

/// Creates a linked stop handle/token pair. The handle side belongs to the
/// supervisor; tokens are cloned down into workers.
pub fn stop_channel() -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopToken { rx })
}

/// The supervisor's side of the cancellation link.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Requests a clean stop. Delivering a stop to a worker that already
    /// finished is indistinguishable from success.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// The worker's side of the cancellation link. Checked at every checkpoint
/// and awaited at every select point.
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    /// A token that can never fire, for callers without a supervisor.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        StopToken { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested; pends forever otherwise.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Supervisor is gone without stopping us; keep running.
                std::future::pending::<()>().await;
            }
        }
    }
}
