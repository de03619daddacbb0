//! Hybrid logical clock.
//!
//! The coordinator is the sole issuer of HLCs; every other component only
//! carries, compares and merges them. Ordering is lexicographic with the
//! logical counter most significant, so the wall-clock reading is
//! informational and never affects transaction ordering.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Hlc {
    /// Monotone counter allocated by the coordinator.
    pub logical_id: u64,
    /// Coordinator wall clock (milliseconds since the Unix epoch) at issue
    /// time.
    pub coordinator_wall_clock: u64,
}

impl Hlc {
    pub fn new(logical_id: u64, coordinator_wall_clock: u64) -> Self {
        Self {
            logical_id,
            coordinator_wall_clock,
        }
    }

    /// Field-wise maximum of two clocks.
    pub fn merge(self, other: Hlc) -> Hlc {
        Hlc {
            logical_id: self.logical_id.max(other.logical_id),
            coordinator_wall_clock: self.coordinator_wall_clock.max(other.coordinator_wall_clock),
        }
    }

    /// Advance this clock past an observed one.
    pub fn observe(&mut self, other: Hlc) {
        *self = self.merge(other);
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.logical_id, self.coordinator_wall_clock)
            .cmp(&(other.logical_id, other.coordinator_wall_clock))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Current wall clock in milliseconds, used by the coordinator when stamping
/// freshly allocated HLCs.
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic_by_logical_id() {
        let a = Hlc::new(1, 100);
        let b = Hlc::new(2, 50);
        assert!(a < b, "logical counter dominates wall clock");
    }

    #[test]
    fn merge_takes_fieldwise_max() {
        let a = Hlc::new(5, 100);
        let b = Hlc::new(3, 200);
        let m = a.merge(b);
        assert_eq!(m.logical_id, 5);
        assert_eq!(m.coordinator_wall_clock, 200);
    }

    #[test]
    fn observe_advances_past_remote() {
        let mut local = Hlc::new(1, 10);
        local.observe(Hlc::new(7, 5));
        assert_eq!(local.logical_id, 7);
        assert_eq!(local.coordinator_wall_clock, 10);
    }
}
