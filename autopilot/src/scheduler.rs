//! Single-flight cycle scheduling.
//!
//! At most one cycle runs at a time. Requests that arrive while a cycle is
//! active are folded into one pending follow-up trigger (see
//! [`coalesce`](crate::core::trigger::coalesce)); when the active cycle ends,
//! exactly one follow-up runs with that trigger.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::trigger::{Trigger, coalesce};
use crate::cycle::CycleReport;

/// Something that can execute one cycle end to end.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    /// Run one cycle. Must always return a report; `cancel` fires when the
    /// operator interrupts in-flight work.
    async fn run_cycle(&self, trigger: Trigger, cancel: CancellationToken) -> CycleReport;
}

/// What happened to a cycle request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// This request ran the cycle (plus any follow-ups requested meanwhile).
    Ran(Vec<CycleReport>),
    /// A cycle was already active; the request was recorded as the follow-up.
    Coalesced { pending: Trigger },
}

#[derive(Debug)]
struct ActiveCycle {
    trigger: Trigger,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Slot {
    active: Option<ActiveCycle>,
    pending: Option<Trigger>,
}

pub struct Scheduler {
    runner: Arc<dyn CycleRunner>,
    slot: Mutex<Slot>,
}

/// Frees the slot when a request future is dropped before its cycles finish.
struct SlotRelease<'a> {
    scheduler: &'a Scheduler,
    armed: bool,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.scheduler.slot();
        if let Some(active) = slot.active.take() {
            warn!(trigger = %active.trigger, "cycle request dropped mid-cycle; releasing slot");
            active.cancel.cancel();
        }
        slot.pending = None;
    }
}

impl Scheduler {
    pub fn new(runner: Arc<dyn CycleRunner>) -> Self {
        Self {
            runner,
            slot: Mutex::new(Slot::default()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        // A poisoned slot only means a panic elsewhere; the data is still usable.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a cycle for `trigger`, or record it as the follow-up if one is active.
    pub async fn request(&self, trigger: Trigger) -> ScheduleOutcome {
        let cancel = {
            let mut slot = self.slot();
            if slot.active.is_some() {
                let pending = coalesce(slot.pending, trigger);
                slot.pending = Some(pending);
                debug!(%trigger, %pending, "cycle active; coalesced request");
                return ScheduleOutcome::Coalesced { pending };
            }
            let cancel = CancellationToken::new();
            slot.active = Some(ActiveCycle {
                trigger,
                cancel: cancel.clone(),
            });
            cancel
        };

        let mut release = SlotRelease {
            scheduler: self,
            armed: true,
        };
        let mut reports = Vec::new();
        let mut current = (trigger, cancel);
        loop {
            let (trigger, cancel) = current;
            info!(%trigger, "cycle starting");
            reports.push(self.runner.run_cycle(trigger, cancel).await);

            let follow_up = {
                let mut slot = self.slot();
                match slot.pending.take() {
                    Some(next) => {
                        let cancel = CancellationToken::new();
                        slot.active = Some(ActiveCycle {
                            trigger: next,
                            cancel: cancel.clone(),
                        });
                        Some((next, cancel))
                    }
                    None => {
                        slot.active = None;
                        None
                    }
                }
            };
            match follow_up {
                Some(next) => {
                    debug!(trigger = %next.0, "running follow-up cycle");
                    current = next;
                }
                None => break,
            }
        }
        release.armed = false;
        ScheduleOutcome::Ran(reports)
    }

    /// Cancel the active cycle's in-flight calls. Returns false when idle.
    pub fn cancel_inflight(&self) -> bool {
        match &self.slot().active {
            Some(active) => {
                info!(trigger = %active.trigger, "cancelling in-flight work");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_trigger(&self) -> Option<Trigger> {
        self.slot().active.as_ref().map(|a| a.trigger)
    }

    pub fn pending_trigger(&self) -> Option<Trigger> {
        self.slot().pending
    }
}
