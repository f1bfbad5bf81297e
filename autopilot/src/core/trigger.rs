//! Cycle triggers and the coalescing rule for overlapping requests.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Explicit "run one cycle now" from a caller.
    Manual,
    /// Periodic timer tick.
    Interval,
    /// First cycle after the loop starts.
    Startup,
    /// Operator directive arrived while the loop was running.
    Interrupt,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Interval => "interval",
            Trigger::Startup => "startup",
            Trigger::Interrupt => "interrupt",
        }
    }

    /// Interval ticks are the only low-intent trigger.
    pub fn is_high_intent(self) -> bool {
        !matches!(self, Trigger::Interval)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merge an incoming trigger into the pending follow-up slot.
///
/// An interval tick never replaces a recorded high-intent trigger. Any
/// high-intent trigger replaces whatever is recorded, so the latest operator
/// intent wins.
pub fn coalesce(pending: Option<Trigger>, incoming: Trigger) -> Trigger {
    match pending {
        Some(recorded) if recorded.is_high_intent() && !incoming.is_high_intent() => recorded,
        _ => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slot_takes_incoming() {
        assert_eq!(coalesce(None, Trigger::Interval), Trigger::Interval);
        assert_eq!(coalesce(None, Trigger::Manual), Trigger::Manual);
    }

    #[test]
    fn interval_never_overwrites_high_intent() {
        for recorded in [Trigger::Manual, Trigger::Startup, Trigger::Interrupt] {
            assert_eq!(coalesce(Some(recorded), Trigger::Interval), recorded);
        }
    }

    #[test]
    fn high_intent_overwrites_interval() {
        for incoming in [Trigger::Manual, Trigger::Startup, Trigger::Interrupt] {
            assert_eq!(coalesce(Some(Trigger::Interval), incoming), incoming);
        }
    }

    #[test]
    fn sequence_keeps_highest_intent_recorded() {
        let sequence = [
            Trigger::Interval,
            Trigger::Interrupt,
            Trigger::Interval,
            Trigger::Interval,
        ];
        let slot = sequence
            .iter()
            .fold(None, |slot, t| Some(coalesce(slot, *t)));
        assert_eq!(slot, Some(Trigger::Interrupt));
    }
}
