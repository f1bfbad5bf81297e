//! Interval ticker that feeds the scheduler while the loop is running.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::trigger::Trigger;
use crate::scheduler::Scheduler;

/// Requests an `interval` cycle every period until stopped.
///
/// Each tick is handed to the scheduler on its own task, so ticks that land
/// during a long cycle are coalesced rather than queued behind it.
pub struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Ticker {
    pub fn spawn(scheduler: Arc<Scheduler>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs(), "ticker started");
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticks.tick() => {
                        debug!("interval tick");
                        let scheduler = Arc::clone(&scheduler);
                        tokio::spawn(async move { scheduler.request(Trigger::Interval).await });
                    }
                }
            }
            info!("ticker stopped");
        });
        Self { cancel, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop ticking. A cycle already requested keeps running.
    pub fn stop(self) {
        self.cancel.cancel();
    }
}
