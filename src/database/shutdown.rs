use std::sync::Arc;

use tokio::sync::watch;

use super::checkpoint::CheckpointOutcome;
use super::controller::LifecycleController;
use super::engine::StorageEngine;

/// Process termination request. The binary waits on it and returns from
/// `main` once it fires.
#[derive(Clone)]
pub struct ExitSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn terminate(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_terminated(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender is owned by `self`; the channel cannot close under us.
        let _ = rx.wait_for(|terminated| *terminated).await;
    }
}

impl<E: StorageEngine> LifecycleController<E> {
    /// Best-effort final save, then exit. Never blocks termination on the
    /// outcome of the save.
    pub async fn save_and_terminate(&self) -> CheckpointOutcome {
        let outcome = self.checkpoint().await;
        match &outcome {
            CheckpointOutcome::Failed(e) => {
                log::error!("final checkpoint failed, terminating anyway: {e}")
            }
            CheckpointOutcome::Skipped => {
                log::warn!("final checkpoint skipped: store is not open or a condition is set")
            }
            CheckpointOutcome::Saved { .. } => log::info!("final checkpoint written"),
        }
        self.exit_signal().terminate();
        outcome
    }
}
