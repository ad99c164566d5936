//! Recurring due-check sweep as a tokio task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::Engine;

/// Start sweeping every `interval`. Send `true` on the returned sender to stop.
///
/// The sweep itself is synchronous store work, so it runs on the blocking pool.
pub fn spawn(engine: Arc<Engine>, interval: Duration) -> (JoinHandle<()>, watch::Sender<bool>) {
  let (stop_tx, mut stop_rx) = watch::channel(false);
  let handle = tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs_f64(), "due sweeper started");
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let engine = engine.clone();
          match tokio::task::spawn_blocking(move || engine.sweep_due()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "sweep failed, retrying next tick"),
            Err(e) => warn!(error = %e, "sweep task panicked"),
          }
        }
        changed = stop_rx.changed() => {
          if changed.is_err() || *stop_rx.borrow() {
            break;
          }
        }
      }
    }
    info!("due sweeper stopped");
  });
  (handle, stop_tx)
}
