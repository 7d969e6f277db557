//! Terminal stand-in for the desktop modal: prints the current blocking
//! condition and runs its action when the operator presses Enter.

use std::io::BufRead;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::database::{BlockingCondition, LifecycleController, StatusSnapshot, StorageEngine};

pub fn render(snapshot: &StatusSnapshot) -> Option<String> {
    let cond = snapshot.condition.as_ref()?;
    let mut out = format!("== {} ==", cond.title);
    if let Some(detail) = cond.detail.as_deref() {
        for line in detail.lines() {
            out.push('\n');
            out.push_str("   ");
            out.push_str(line);
        }
    }
    if let (Some(label), Some(_)) = (cond.action_label.as_deref(), cond.action) {
        out.push_str(&format!("\n[{label}] press Enter"));
    }
    Some(out)
}

/// Renders every status change and dispatches the offered action on Enter.
/// Runs until the exit signal fires or stdin closes.
pub async fn run_console<E: StorageEngine>(controller: Arc<LifecycleController<E>>) {
    let (line_tx, lines) = mpsc::channel::<()>(4);

    // Plain thread: a blocking stdin read must not hold up runtime shutdown.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            if line.is_err() || line_tx.blocking_send(()).is_err() {
                break;
            }
        }
    });

    drive(controller, lines, |text| println!("{text}")).await;
}

async fn drive<E, F>(
    controller: Arc<LifecycleController<E>>,
    mut lines: mpsc::Receiver<()>,
    mut out: F,
) where
    E: StorageEngine,
    F: FnMut(String),
{
    let mut status = controller.status().subscribe();
    // A claim bumps the generation without changing what is shown.
    let mut shown: Option<Option<BlockingCondition>> = None;
    loop {
        let snap = status.borrow_and_update().clone();
        if shown.as_ref() != Some(&snap.condition) {
            match render(&snap) {
                Some(text) => out(text),
                None => log::debug!("no blocking condition ({})", snap.state.as_str()),
            }
            shown = Some(snap.condition.clone());
        }

        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            line = lines.recv() => {
                if line.is_none() {
                    log::debug!("input closed, console renderer stopping");
                    break;
                }
                let Some(action) = snap.condition.as_ref().and_then(|c| c.action) else {
                    continue;
                };
                // Off the render loop, so progress conditions show while the
                // engine call runs.
                let controller = controller.clone();
                let generation = snap.generation;
                tokio::spawn(async move {
                    if let Err(e) = controller.dispatch(generation, action).await {
                        log::warn!("action {action:?} not run: {e}");
                    }
                });
            }
            _ = controller.exit_signal().wait() => break,
        }
    }
}
