//! Tokio glue for hosts that want the clock driven for them.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::manager::EnhancedManager;
use crate::transfer::IoJob;

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Tick `manager` every `period` until it stops running. File jobs queued by then are handed
/// to [`spawn_io`].
pub fn spawn_ticker(manager: Arc<Mutex<EnhancedManager>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let mut mgr = manager.lock().await;
            if !mgr.is_running() {
                tracing::debug!("ticker exiting");
                break;
            }
            mgr.tick(now_millis());
            let jobs = mgr.take_io_jobs();
            drop(mgr);
            spawn_io(&manager, jobs);
        }
    })
}

/// Run `jobs` on the blocking pool and feed each outcome back to `manager`, along with any
/// follow-up jobs it queues. Hosts feeding `on_receive` themselves call this afterwards.
pub fn spawn_io(manager: &Arc<Mutex<EnhancedManager>>, jobs: Vec<IoJob>) {
    for job in jobs {
        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            let transfer_id = job.transfer_id().to_string();
            let outcome = match tokio::task::spawn_blocking(move || job.run()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(transfer = %transfer_id, "file job did not finish: {}", e);
                    return;
                }
            };
            let mut mgr = manager.lock().await;
            mgr.complete_io(outcome);
            let more = mgr.take_io_jobs();
            drop(mgr);
            spawn_io(&manager, more);
        });
    }
}
