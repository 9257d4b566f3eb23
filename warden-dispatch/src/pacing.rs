//! Claim-attempt pacing (spec.md §4.6 "Pacing"): dispatch is rate-limited to
//! at most `max_tasks_in_interval` claim attempts per `poll_interval_ms`, by
//! spacing successive attempts `poll_interval_ms / max_tasks_in_interval`
//! apart rather than tracking a sliding window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::DispatcherConfig;

#[derive(Debug, PartialEq, Eq)]
pub enum PacingDecision {
    /// A claim attempt may proceed now.
    Proceed,
    /// Too soon; the caller should schedule a retry after this delay.
    Delay(Duration),
}

/// Tracks the last claim-attempt timestamp and whether a delayed retry has
/// already been scheduled, so concurrent callers coalesce onto one timer
/// instead of each arming their own (spec.md §4.6: "coalesce multiple
/// pending schedules into one").
pub struct PacingClock {
    min_spacing: Duration,
    last_claim: Mutex<Option<Instant>>,
    schedule_pending: AtomicBool,
}

impl PacingClock {
    pub fn new(config: &DispatcherConfig) -> Self {
        PacingClock {
            min_spacing: Duration::from_millis(config.min_claim_spacing_ms()),
            last_claim: Mutex::new(None),
            schedule_pending: AtomicBool::new(false),
        }
    }

    pub async fn gate(&self) -> PacingDecision {
        let mut last = self.last_claim.lock().await;
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_spacing => {
                PacingDecision::Delay(self.min_spacing - now.duration_since(prev))
            }
            _ => {
                *last = Some(now);
                PacingDecision::Proceed
            }
        }
    }

    /// Returns `true` if this caller won the right to arm the coalesced
    /// retry timer (and must call [`Self::release_schedule_slot`] once it
    /// fires), `false` if one is already pending.
    pub fn try_claim_schedule_slot(&self) -> bool {
        !self.schedule_pending.swap(true, Ordering::AcqRel)
    }

    pub fn release_schedule_slot(&self) {
        self.schedule_pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_claim_always_proceeds() {
        let clock = PacingClock::new(&DispatcherConfig::default());
        assert_eq!(clock.gate().await, PacingDecision::Proceed);
    }

    #[tokio::test]
    async fn back_to_back_claim_is_delayed() {
        let mut config = DispatcherConfig::default();
        config.poll_interval_ms = 1_000;
        config.max_tasks_in_interval = 10;
        let clock = PacingClock::new(&config);
        assert_eq!(clock.gate().await, PacingDecision::Proceed);
        match clock.gate().await {
            PacingDecision::Delay(d) => assert!(d <= Duration::from_millis(100)),
            PacingDecision::Proceed => panic!("expected a delay on the second immediate claim"),
        }
    }

    #[test]
    fn schedule_slot_is_exclusive_until_released() {
        let clock = PacingClock::new(&DispatcherConfig::default());
        assert!(clock.try_claim_schedule_slot());
        assert!(!clock.try_claim_schedule_slot());
        clock.release_schedule_slot();
        assert!(clock.try_claim_schedule_slot());
    }
}
