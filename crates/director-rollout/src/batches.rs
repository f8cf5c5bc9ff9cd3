//! Batch state machine for one instance group.
//!
//! Canaries go first as their own batch; the rest follow in batches of
//! `max_in_flight`. The executor runs each batch to completion before
//! asking for the next, so the canary batch is a barrier.

use std::ops::Range;

use serde::Serialize;
use tracing::{info, warn};

/// Where a group's rollout stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RolloutPhase {
    /// Not started.
    Pending,
    /// Canary batch is next.
    Canaries,
    /// Regular batch `current` of `total` is next.
    Batch { current: u32, total: u32 },
    /// Every batch has been handed out.
    Completed,
    /// A batch failed; nothing more is handed out.
    Failed { reason: String },
}

/// A slice of the group's pending instances to converge together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub canary: bool,
    /// Positions into the group's pending instance list.
    pub range: Range<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GroupRollout {
    pub group: String,
    pub phase: RolloutPhase,
    pending: usize,
    canaries: usize,
    max_in_flight: usize,
}

impl GroupRollout {
    pub fn new(group: &str, pending: usize, canaries: u32, max_in_flight: u32) -> Self {
        Self {
            group: group.to_string(),
            phase: RolloutPhase::Pending,
            pending,
            canaries: (canaries as usize).min(pending),
            max_in_flight: max_in_flight.max(1) as usize,
        }
    }

    pub fn start(&mut self) {
        self.phase = if self.pending == 0 {
            RolloutPhase::Completed
        } else if self.canaries > 0 {
            RolloutPhase::Canaries
        } else {
            RolloutPhase::Batch {
                current: 1,
                total: batch_count(self.pending, self.max_in_flight),
            }
        };
        info!(
            group = %self.group,
            pending = self.pending,
            canaries = self.canaries,
            max_in_flight = self.max_in_flight,
            "started instance group rollout"
        );
    }

    /// Hand out the next batch, or `None` once completed or failed.
    pub fn advance(&mut self) -> Option<Batch> {
        match self.phase {
            RolloutPhase::Pending | RolloutPhase::Completed | RolloutPhase::Failed { .. } => None,

            RolloutPhase::Canaries => {
                let remaining = self.pending - self.canaries;
                self.phase = if remaining == 0 {
                    RolloutPhase::Completed
                } else {
                    RolloutPhase::Batch {
                        current: 1,
                        total: batch_count(remaining, self.max_in_flight),
                    }
                };
                Some(Batch {
                    canary: true,
                    range: 0..self.canaries,
                })
            }

            RolloutPhase::Batch { current, total } => {
                let start = self.canaries + (current as usize - 1) * self.max_in_flight;
                let end = (start + self.max_in_flight).min(self.pending);
                self.phase = if current >= total {
                    RolloutPhase::Completed
                } else {
                    RolloutPhase::Batch {
                        current: current + 1,
                        total,
                    }
                };
                Some(Batch {
                    canary: false,
                    range: start..end,
                })
            }
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(group = %self.group, reason = %reason, "instance group rollout failed");
        self.phase = RolloutPhase::Failed { reason };
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.phase, RolloutPhase::Failed { .. })
    }
}

/// Number of batches needed for `total` instances.
pub fn batch_count(total: usize, batch_size: usize) -> u32 {
    if batch_size == 0 {
        return 0;
    }
    total.div_ceil(batch_size) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rollout: &mut GroupRollout) -> Vec<(bool, Range<usize>)> {
        let mut out = Vec::new();
        while let Some(batch) = rollout.advance() {
            out.push((batch.canary, batch.range));
        }
        out
    }

    #[test]
    fn canaries_then_max_in_flight() {
        let mut rollout = GroupRollout::new("dea", 5, 1, 2);
        rollout.start();
        assert_eq!(rollout.phase, RolloutPhase::Canaries);
        assert_eq!(drain(&mut rollout), vec![(true, 0..1), (false, 1..3), (false, 3..5)]);
        assert_eq!(rollout.phase, RolloutPhase::Completed);
    }

    #[test]
    fn no_canaries() {
        let mut rollout = GroupRollout::new("dea", 3, 0, 2);
        rollout.start();
        assert_eq!(rollout.phase, RolloutPhase::Batch { current: 1, total: 2 });
        assert_eq!(drain(&mut rollout), vec![(false, 0..2), (false, 2..3)]);
    }

    #[test]
    fn canaries_capped_at_pending() {
        let mut rollout = GroupRollout::new("dea", 2, 5, 1);
        rollout.start();
        assert_eq!(drain(&mut rollout), vec![(true, 0..2)]);
    }

    #[test]
    fn nothing_pending_completes_immediately() {
        let mut rollout = GroupRollout::new("dea", 0, 1, 1);
        assert!(rollout.advance().is_none());
        rollout.start();
        assert_eq!(rollout.phase, RolloutPhase::Completed);
        assert!(rollout.advance().is_none());
    }

    #[test]
    fn failure_stops_the_rollout() {
        let mut rollout = GroupRollout::new("dea", 4, 1, 1);
        rollout.start();
        assert!(rollout.advance().unwrap().canary);
        rollout.fail("dea/0 failed");
        assert!(rollout.is_failed());
        assert!(rollout.advance().is_none());
    }

    #[test]
    fn batch_count_rounds_up() {
        assert_eq!(batch_count(10, 3), 4);
        assert_eq!(batch_count(9, 3), 3);
        assert_eq!(batch_count(0, 3), 0);
        assert_eq!(batch_count(5, 0), 0);
    }
}
