use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};

use crate::consolidator::ConsolidationCompletion;
use crate::error::RemoteError;
use crate::visual::VisualCompletion;

/// Results posted by worker threads back to the owning `Companion`.
#[derive(Debug, Clone)]
pub enum Completion {
    Consolidation(ConsolidationCompletion),
    Visual(VisualCompletion),
}

/// Runs `work` on a named thread and posts its completion. A panic in `work`
/// still posts one, built by `on_panic`, so the owner never waits forever.
pub(crate) fn spawn_worker<F, P>(
    name: &str,
    sender: mpsc::Sender<Completion>,
    work: F,
    on_panic: P,
) -> Result<()>
where
    F: FnOnce() -> Completion + Send + 'static,
    P: FnOnce(RemoteError) -> Completion + Send + 'static,
{
    let worker = name.to_string();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let completion = panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
                let reason = panic_text(payload.as_ref());
                tracing::error!(worker = %worker, reason = %reason, "background worker panicked");
                on_panic(RemoteError::Transport(format!("{worker} panicked: {reason}")))
            });
            // The receiver is gone once the companion is dropped.
            let _ = sender.send(completion);
        })
        .with_context(|| format!("{name} thread spawn failed"))?;
    Ok(())
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
