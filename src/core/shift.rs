//! Upward level-shift detection
//!
//! A shift is declared only once every stamp of the trailing `shift_win`
//! window sits above the baseline by more than the threshold: the window
//! minimum `RTThat_sh` exceeding `RTThat + threshold` says exactly that. A
//! false positive corrupts the baseline for the rest of the run.
//!
//! Downward shifts need no detector: the running minimum follows them as soon
//! as a lower sample arrives.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::rtt::RttTracker;

/// Event handed forward to the frequency and offset stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelShift {
    /// Stamp at which the shift was confirmed
    pub index: u64,
    /// First stamp of the shift window; state derived from here on is rebased
    pub from_index: u64,
    pub old_rtt_hat: u64,
    pub new_rtt_hat: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelShiftDetector {
    shift_win: u64,
    /// Threshold in seconds, converted to ticks with the current period
    threshold: f64,
    detected: u64,
}

impl LevelShiftDetector {
    pub fn new(shift_win: u64, threshold: f64) -> Self {
        Self {
            shift_win,
            threshold,
            detected: 0,
        }
    }

    /// Threshold in counter ticks for the given period.
    pub fn threshold_ticks(&self, phat: f64) -> u64 {
        if phat > 0.0 && phat.is_finite() {
            (self.threshold / phat).ceil() as u64
        } else {
            u64::MAX
        }
    }

    /// Test for a sustained upward shift at stamp `index`.
    pub fn check(&mut self, index: u64, rtt: &RttTracker, phat: f64) -> Option<LevelShift> {
        if !rtt.shift_window_full(index) {
            return None;
        }
        let rtt_hat = rtt.rtt_hat()?;
        let rtt_hat_sh = rtt.rtt_hat_shift()?;

        if rtt_hat_sh <= rtt_hat.saturating_add(self.threshold_ticks(phat)) {
            return None;
        }

        self.detected += 1;
        let shift = LevelShift {
            index,
            from_index: (index + 1).saturating_sub(self.shift_win),
            old_rtt_hat: rtt_hat,
            new_rtt_hat: rtt_hat_sh,
        };
        info!(
            index,
            from_index = shift.from_index,
            old_rtt_hat = rtt_hat,
            new_rtt_hat = rtt_hat_sh,
            "Upward RTT level shift detected"
        );
        Some(shift)
    }

    pub fn detected(&self) -> u64 {
        self.detected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_conversion() {
        let detector = LevelShiftDetector::new(10, 1.5e-4);
        // 1 MHz counter: 150us is 150 ticks
        assert_eq!(detector.threshold_ticks(1e-6), 150);
        assert_eq!(detector.threshold_ticks(0.0), u64::MAX);
    }

    #[test]
    fn test_shift_needs_full_elevated_window() {
        let mut tracker = RttTracker::new(5);
        let mut detector = LevelShiftDetector::new(5, 1e-3);
        let phat = 1e-6; // threshold = 1000 ticks

        for i in 0..10u64 {
            tracker.observe(i, 20_000, false);
            assert!(detector.check(i, &tracker, phat).is_none());
        }

        // shift of +5000 ticks from stamp 10 on
        let mut fired = None;
        for i in 10..20u64 {
            tracker.observe(i, 25_000, false);
            if let Some(shift) = detector.check(i, &tracker, phat) {
                fired = Some(shift);
                break;
            }
        }

        let shift = fired.expect("shift should be detected");
        assert_eq!(shift.index, 14);
        assert_eq!(shift.from_index, 10);
        assert_eq!(shift.old_rtt_hat, 20_000);
        assert_eq!(shift.new_rtt_hat, 25_000);
        assert_eq!(detector.detected(), 1);
    }

    #[test]
    fn test_transient_spike_is_not_a_shift() {
        let mut tracker = RttTracker::new(5);
        let mut detector = LevelShiftDetector::new(5, 1e-3);
        for i in 0..30u64 {
            // every fourth stamp is back at the floor
            let rtt = if i % 4 == 0 { 20_000 } else { 40_000 };
            tracker.observe(i, rtt, false);
            assert!(detector.check(i, &tracker, 1e-6).is_none());
        }
    }

    #[test]
    fn test_small_rise_below_threshold() {
        let mut tracker = RttTracker::new(3);
        let mut detector = LevelShiftDetector::new(3, 1e-3);
        tracker.observe(0, 20_000, false);
        for i in 1..10u64 {
            tracker.observe(i, 20_900, false);
            assert!(detector.check(i, &tracker, 1e-6).is_none());
        }
    }
}
