use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::conditions;
use super::controller::LifecycleController;
use super::engine::{EngineError, StorageEngine};
use super::status::LifecycleState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// A condition was set or the store was not open; the engine was not called.
    Skipped,
    Saved { attempts: u8 },
    Failed(EngineError),
}

impl<E: StorageEngine> LifecycleController<E> {
    pub async fn try_save(&self) -> Result<(), EngineError> {
        self.engine().store().await
    }

    /// One durable save with a single immediate retry. Only the second
    /// failure is surfaced; it blocks the UI with a fatal condition.
    pub async fn checkpoint(&self) -> CheckpointOutcome {
        let _gate = self.save_gate.lock().await;

        let snap = self.status().snapshot();
        if snap.condition.is_some() || snap.state != LifecycleState::Open {
            return CheckpointOutcome::Skipped;
        }

        let first = match self.try_save().await {
            Ok(()) => {
                log::debug!("checkpoint written");
                return CheckpointOutcome::Saved { attempts: 1 };
            }
            Err(e) => e,
        };
        log::warn!("checkpoint failed ({first}), retrying once");

        match self.try_save().await {
            Ok(()) => {
                log::info!("checkpoint written on retry");
                CheckpointOutcome::Saved { attempts: 2 }
            }
            Err(second) => {
                log::error!("checkpoint failed twice: first={first} second={second}");
                self.settle(
                    snap.generation,
                    LifecycleState::Blocked,
                    Some(conditions::save_failed(&second)),
                    "checkpoint",
                );
                CheckpointOutcome::Failed(second)
            }
        }
    }
}

/// Handle to the periodic checkpoint task. Dropping it leaves the task
/// running for the rest of the process.
pub struct CheckpointHandle {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl CheckpointHandle {
    /// Stops ticking. A save that is already running completes first.
    pub async fn stop(self) {
        self.stop.notify_one();
        if let Err(e) = self.task.await {
            log::warn!("checkpoint scheduler ended abnormally: {e}");
        }
    }
}

/// Starts the recurring checkpoint. The first tick fires one full `period`
/// after start; ticks while a condition is set do nothing.
pub fn start_checkpoint_scheduler<E: StorageEngine>(
    controller: Arc<LifecycleController<E>>,
    period: Duration,
) -> CheckpointHandle {
    let stop = Arc::new(Notify::new());
    let task = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("checkpoint scheduler started (every {}s)", period.as_secs());
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {}
                }
                if controller.status().is_blocked() {
                    log::debug!("checkpoint tick skipped: blocking condition set");
                    continue;
                }
                let _ = controller.checkpoint().await;
            }
            log::info!("checkpoint scheduler stopped");
        })
    };
    CheckpointHandle { stop, task }
}
