//! Minimum round-trip time tracking
//!
//! Three minima are kept side by side:
//! - `RTThat`: the baseline every point error is measured against
//! - `RTThat_new`: the minimum since the last history rollover, swapped in at
//!   the next one so the rollover never rescans history
//! - `RTThat_sh`: the minimum over the trailing `shift_win` stamps, used by the
//!   level-shift detector

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::window::SlidingExtremum;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RttTracker {
    rtt_hat: Option<u64>,
    rtt_hat_new: Option<u64>,
    shift_window: SlidingExtremum<u64>,
    shift_win: u64,
    observed: u64,
}

impl RttTracker {
    pub fn new(shift_win: u64) -> Self {
        Self {
            rtt_hat: None,
            rtt_hat_new: None,
            shift_window: SlidingExtremum::min(shift_win),
            shift_win,
            observed: 0,
        }
    }

    /// Feed the RTT of stamp `index`. Anomalous (floored) stamps only advance
    /// the shift window so its span stays aligned with stamp indices.
    pub fn observe(&mut self, index: u64, rtt: u64, anomalous: bool) {
        if anomalous {
            self.shift_window.evict_before((index + 1).saturating_sub(self.shift_win));
            trace!(index, "anomalous RTT excluded from minima");
            return;
        }

        self.observed += 1;
        self.rtt_hat = Some(self.rtt_hat.map_or(rtt, |m| m.min(rtt)));
        self.rtt_hat_new = Some(self.rtt_hat_new.map_or(rtt, |m| m.min(rtt)));
        self.shift_window.push(index, rtt as f64, rtt);
    }

    /// History rollover: the minimum of the recent half becomes the baseline.
    ///
    /// `carried` is the RTT of the stamp that triggered the rollover, already
    /// observed but retained in the new half, so it seeds the next minimum.
    pub fn rollover(&mut self, carried: Option<u64>) {
        if let Some(new) = self.rtt_hat_new.take() {
            self.rtt_hat = Some(new);
        }
        // Nothing observed since the last rollover: keep the old baseline
        self.rtt_hat_new = carried;
    }

    /// Warmup hand-off: the warmup minimum seeds the next replacement.
    pub fn begin_main(&mut self) {
        self.rtt_hat_new = self.rtt_hat;
    }

    /// Level-shift reset of both the baseline and its prepared replacement.
    pub fn reset_to(&mut self, rtt_hat: u64) {
        self.rtt_hat = Some(rtt_hat);
        self.rtt_hat_new = Some(rtt_hat);
    }

    pub fn rtt_hat(&self) -> Option<u64> {
        self.rtt_hat
    }

    pub fn rtt_hat_new(&self) -> Option<u64> {
        self.rtt_hat_new
    }

    pub fn rtt_hat_shift(&self) -> Option<u64> {
        self.shift_window.front().map(|e| e.value)
    }

    /// Whether the trailing shift window spans `shift_win` stamps ending at `index`.
    pub fn shift_window_full(&self, index: u64) -> bool {
        index + 1 >= self.shift_win && !self.shift_window.is_empty()
    }

    pub fn shift_win(&self) -> u64 {
        self.shift_win
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }
}
