use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::FetchCycle;

struct RunningLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the enabled flag and the background loop that runs a cycle, then
/// waits `interval`, for as long as scheduling stays enabled.
///
/// Stopping interrupts the wait immediately; a cycle already in flight runs
/// to completion so no dataset is left half-updated.
pub struct Scheduler {
    cycle: Arc<FetchCycle>,
    interval: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl Scheduler {
    pub fn new(cycle: Arc<FetchCycle>, interval: Duration) -> Self {
        Self {
            cycle,
            interval,
            running: Mutex::new(None),
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Returns `false` when a loop was already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return false;
        }
        *running = Some(self.spawn_loop());
        true
    }

    /// Returns `false` when scheduling was already disabled.
    pub async fn stop(&self) -> bool {
        match self.running.lock().await.take() {
            Some(current) => {
                signal_stop(&current);
                true
            }
            None => false,
        }
    }

    /// Flips scheduling and returns the new enabled state.
    pub async fn toggle(&self) -> bool {
        let mut running = self.running.lock().await;
        match running.take() {
            Some(current) => {
                signal_stop(&current);
                false
            }
            None => {
                *running = Some(self.spawn_loop());
                true
            }
        }
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(&self) {
        let current = self.running.lock().await.take();
        if let Some(current) = current {
            signal_stop(&current);
            if let Err(err) = current.handle.await {
                warn!(error = %err, "scheduler task ended abnormally");
            }
        }
    }

    fn spawn_loop(&self) -> RunningLoop {
        let (stop, mut stop_rx) = watch::channel(false);
        let cycle = Arc::clone(&self.cycle);
        let interval = self.interval;
        info!(interval_secs = interval.as_secs(), "scheduler enabled");

        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                if let Err(err) = cycle.run_scheduled().await {
                    warn!(error = %err, "scheduled fetch cycle failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => break,
                }
            }
            info!("scheduler loop exited");
        });

        RunningLoop { stop, handle }
    }
}

/// Interrupts the pending wait; an in-flight cycle still finishes.
fn signal_stop(current: &RunningLoop) {
    let _ = current.stop.send(true);
    info!("scheduler disabled");
}
