//! Pump (§4.4): three concurrent feeders into the Dispatcher.
//!
//! Each feeder is spawned as its own background task and restarts its own
//! failure modes internally — a crash in one must never take down the
//! others or the process (§4.4 "may fail and restart without affecting the
//! others").

mod feeder_a_broker;
mod feeder_b_poller;
mod feeder_c_tasks;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::state::{AppState, TaskJob};

/// Spawn all three feeders. `task_rx` is the receiving half of the channel
/// whose sender half was already wired into `AppState` (`ws.rs` handlers
/// enqueue onto it directly). `shutdown` notifies Feeder B to release its
/// leader lock immediately on process shutdown (SPEC_FULL §5.1).
pub fn spawn_all(
    app: Arc<AppState>,
    task_rx: mpsc::UnboundedReceiver<TaskJob>,
    shutdown: watch::Receiver<bool>,
) {
    feeder_a_broker::spawn(app.clone());
    feeder_b_poller::spawn(app.clone(), shutdown);
    feeder_c_tasks::spawn(app, task_rx);
}
