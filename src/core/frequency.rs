//! Counter period estimation
//!
//! Both estimators work on pairs of stamps: a "far" one in the past and a
//! "near" one that is recent, each chosen for a small RTT. The rate between
//! them is the average of the backward (ta/tb) and forward (te/tf) paths, so
//! constant asymmetry cancels.
//!
//! `phat` uses the longest baseline the history allows and is the period of
//! the absolute clock. `plocal` uses a fixed window and tracks short-term
//! drift for the difference clock and for rate-correcting offset samples.
//!
//! Both run a quality filter (is this candidate worth taking) and a separate
//! sanity gate (is the jump plausible at all). A quality failure is routine,
//! a sanity failure is logged at `warn` level.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::algo::Phase;
use super::diagnostics::{EstimateDiagnostic, Verdict};
use super::history::{History, HistoryRecord, Rollover, RolloverKind};
use super::shift::LevelShift;
use super::window::{Extremum, SlidingExtremum};
use crate::config::{EstimatorConfig, WindowConfig};

/// Period estimate from one stamp pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateCandidate {
    pub period: f64,
    /// Server-time baseline of the pair, seconds
    pub delta_t: f64,
    pub far: u64,
    pub near: u64,
}

/// Average of the backward and forward path rates between two stamps.
pub fn pair_rate(far: &HistoryRecord, near: &HistoryRecord) -> Option<RateCandidate> {
    let backward_ticks = near.ta - far.ta;
    let forward_ticks = near.tf - far.tf;
    if backward_ticks <= 0.0 || forward_ticks <= 0.0 {
        return None;
    }

    let backward = (near.tb - far.tb) / backward_ticks;
    let forward = (near.te - far.te) / forward_ticks;
    let period = (backward + forward) / 2.0;
    let delta_t = near.tb - far.tb;

    if !period.is_finite() || period <= 0.0 || !delta_t.is_finite() || delta_t <= 0.0 {
        return None;
    }

    Some(RateCandidate {
        period,
        delta_t,
        far: far.index,
        near: near.index,
    })
}

/// Accepted change of the long-term period, carrying what the intercept
/// needs to stay continuous.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhatUpdate {
    pub old: f64,
    pub new: f64,
    /// Relative counter value (`tf` of the accepting stamp) at which the old
    /// and new clocks must agree
    pub counter_boundary: f64,
}

impl PhatUpdate {
    /// Amount to add to `C`.
    pub fn c_correction(&self) -> f64 {
        (self.old - self.new) * self.counter_boundary
    }
}

/// Inputs handed to the phat stage for one stamp.
#[derive(Debug, Clone, Copy)]
pub struct PhatInputs<'a> {
    /// Record of the current stamp
    pub record: &'a HistoryRecord,
    /// Baseline after any level-shift reset on this stamp
    pub rtt_hat: u64,
    pub rollover: Option<Rollover>,
    pub shift: Option<LevelShift>,
    pub history: &'a History,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhatOutcome {
    pub report: EstimateDiagnostic,
    pub update: Option<PhatUpdate>,
}

impl PhatOutcome {
    fn without_update(report: EstimateDiagnostic) -> Self {
        Self {
            report,
            update: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhatEstimator {
    phat: f64,
    phat_err: f64,
    /// Error to beat for a candidate to pass the quality filter
    ref_err: f64,
    /// Tightened excellence threshold after a rollover, until the next accept
    fussy: bool,
    main: bool,

    warmup_winratio: u64,
    jsearch_win: u64,
    best_skm_rate: f64,
    phat_sanity: f64,
    rollover_fussiness: f64,

    // warmup: minimum-RTT stamp of the growing prefix [0, w)
    warmup_far: Option<HistoryRecord>,
    warmup_far_filled: u64,
    warmup_near: SlidingExtremum<HistoryRecord>,

    /// Far stamp of the MAIN pair
    pkt_j: Option<HistoryRecord>,
    /// Replacement for `pkt_j`, searched over the first `jsearch_win` stamps
    /// after each rollover
    next_j: Option<HistoryRecord>,
    jsearch_from: u64,

    accepted: u64,
    quality_rejected: u64,
    sanity_rejected: u64,
}

impl PhatEstimator {
    pub fn new(windows: &WindowConfig, estimator: &EstimatorConfig) -> Self {
        Self {
            phat: 1.0 / estimator.counter_frequency_hz,
            phat_err: f64::MAX,
            ref_err: f64::MAX,
            fussy: false,
            main: false,
            warmup_winratio: estimator.warmup_winratio.max(1),
            jsearch_win: windows.jsearch_win,
            best_skm_rate: estimator.best_skm_rate,
            phat_sanity: estimator.phat_sanity,
            rollover_fussiness: estimator.rollover_fussiness,
            warmup_far: None,
            warmup_far_filled: 0,
            warmup_near: SlidingExtremum::min(1),
            pkt_j: None,
            next_j: None,
            jsearch_from: 0,
            accepted: 0,
            quality_rejected: 0,
            sanity_rejected: 0,
        }
    }

    pub fn phat(&self) -> f64 {
        self.phat
    }

    pub fn phat_err(&self) -> f64 {
        self.phat_err
    }

    pub fn reference_error(&self) -> f64 {
        self.ref_err
    }

    pub fn is_fussy(&self) -> bool {
        self.fussy
    }

    /// Far stamp currently paired against every new stamp.
    pub fn baseline(&self) -> Option<&HistoryRecord> {
        self.pkt_j.as_ref()
    }

    pub fn prepared_baseline(&self) -> Option<&HistoryRecord> {
        self.next_j.as_ref()
    }

    pub fn counts(&self) -> (u64, u64, u64) {
        (self.accepted, self.quality_rejected, self.sanity_rejected)
    }

    pub fn process(&mut self, inputs: PhatInputs<'_>) -> PhatOutcome {
        if let Some(rollover) = inputs.rollover {
            match rollover.kind {
                RolloverKind::Handoff => self.begin_main(rollover.index),
                RolloverKind::Periodic => self.rollover(rollover.index, &inputs),
            }
        }

        if !self.main {
            return self.warmup_step(&inputs);
        }

        if let Some(shift) = inputs.shift {
            self.apply_shift(&shift);
        }
        self.search_next_baseline(inputs.record);
        self.main_step(&inputs)
    }

    fn begin_main(&mut self, index: u64) {
        self.main = true;
        self.pkt_j = self.warmup_far;
        self.next_j = None;
        self.jsearch_from = index;
        self.ref_err = self.phat_err;
        self.warmup_near.clear();
        info!(
            index,
            phat = self.phat,
            phat_err = self.phat_err,
            baseline = self.pkt_j.map(|r| r.index),
            "phat estimator entering main phase"
        );
    }

    fn rollover(&mut self, index: u64, inputs: &PhatInputs<'_>) {
        if let Some(next) = self.next_j.take() {
            self.pkt_j = Some(next);
        }
        self.jsearch_from = index;

        let e_new = self
            .pkt_j
            .as_ref()
            .filter(|_| !inputs.record.anomalous)
            .and_then(|far| self.pair_error(far, inputs.record, inputs.rtt_hat))
            .map(|(_, err)| err)
            .unwrap_or(0.0);
        self.ref_err = self.phat_err.max(e_new) * self.rollover_fussiness;
        self.fussy = true;

        debug!(
            index,
            baseline = self.pkt_j.map(|r| r.index),
            ref_err = self.ref_err,
            "phat baseline rolled over"
        );
    }

    fn apply_shift(&mut self, shift: &LevelShift) {
        for record in [self.pkt_j.as_mut(), self.next_j.as_mut()].into_iter().flatten() {
            if record.index >= shift.from_index {
                record.rtt_hat = shift.new_rtt_hat;
            }
        }
    }

    fn search_next_baseline(&mut self, record: &HistoryRecord) {
        if record.anomalous || record.index >= self.jsearch_from + self.jsearch_win {
            return;
        }
        let better = self.next_j.map_or(true, |j| record.rtt < j.rtt);
        if better {
            self.next_j = Some(*record);
        }
    }

    fn warmup_step(&mut self, inputs: &PhatInputs<'_>) -> PhatOutcome {
        let record = inputs.record;
        let index = record.index;
        let w = ((index + 1) / self.warmup_winratio).max(1);

        while self.warmup_far_filled < w {
            if let Some(candidate) = inputs.history.get(self.warmup_far_filled) {
                let better = self.warmup_far.map_or(true, |far| candidate.rtt < far.rtt);
                if !candidate.anomalous && better {
                    self.warmup_far = Some(*candidate);
                }
            }
            self.warmup_far_filled += 1;
        }

        self.warmup_near.set_window(w);
        if record.anomalous {
            self.warmup_near.evict_before((index + 1).saturating_sub(w));
        } else {
            self.warmup_near.push(index, record.rtt as f64, *record);
        }

        let (Some(far), Some(near)) = (self.warmup_far, self.warmup_near.front().map(|e| e.value))
        else {
            return PhatOutcome::without_update(EstimateDiagnostic::skipped());
        };
        if near.index <= far.index {
            return PhatOutcome::without_update(EstimateDiagnostic::skipped());
        }
        let Some((rate, err)) = self.pair_error(&far, &near, inputs.rtt_hat) else {
            return PhatOutcome::without_update(EstimateDiagnostic::skipped());
        };

        let update = self.accept(rate.period, err, record.tf);
        PhatOutcome {
            report: EstimateDiagnostic::new(Verdict::Unchecked, Some(rate.period), Some(err)),
            update,
        }
    }

    fn main_step(&mut self, inputs: &PhatInputs<'_>) -> PhatOutcome {
        let record = inputs.record;
        if record.anomalous {
            return PhatOutcome::without_update(EstimateDiagnostic::skipped());
        }
        let Some(far) = self.pkt_j else {
            return PhatOutcome::without_update(EstimateDiagnostic::skipped());
        };
        let Some((rate, err)) = self.pair_error(&far, record, inputs.rtt_hat) else {
            return PhatOutcome::without_update(EstimateDiagnostic::skipped());
        };

        let excellent = if self.fussy {
            self.best_skm_rate * self.rollover_fussiness
        } else {
            self.best_skm_rate
        };
        if !(err < self.ref_err || err < excellent) {
            self.quality_rejected += 1;
            debug!(index = record.index, err, ref_err = self.ref_err, "phat candidate below quality");
            return PhatOutcome::without_update(EstimateDiagnostic::new(
                Verdict::QualityRejected,
                Some(rate.period),
                Some(err),
            ));
        }

        let jump = (rate.period - self.phat).abs() / self.phat;
        if record.quality_warning || !jump.is_finite() || jump > self.phat_sanity + self.phat_err {
            self.sanity_rejected += 1;
            warn!(
                index = record.index,
                candidate = rate.period,
                phat = self.phat,
                jump,
                quality_warning = record.quality_warning,
                "phat sanity check failed, keeping previous period"
            );
            return PhatOutcome::without_update(EstimateDiagnostic::new(
                Verdict::SanityRejected,
                Some(rate.period),
                Some(err),
            ));
        }

        let update = self.accept(rate.period, err, record.tf);
        self.ref_err = err;
        self.fussy = false;
        PhatOutcome {
            report: EstimateDiagnostic::new(Verdict::Accepted, Some(rate.period), Some(err)),
            update,
        }
    }

    fn accept(&mut self, period: f64, err: f64, boundary: f64) -> Option<PhatUpdate> {
        self.accepted += 1;
        self.phat_err = err;
        if period == self.phat {
            return None;
        }
        let update = PhatUpdate {
            old: self.phat,
            new: period,
            counter_boundary: boundary,
        };
        self.phat = period;
        Some(update)
    }

    /// Rate and relative error of a pair. The near stamp is judged against
    /// the current baseline, the far one against its own plus the drift of
    /// the baseline since.
    fn pair_error(
        &self,
        far: &HistoryRecord,
        near: &HistoryRecord,
        rtt_hat: u64,
    ) -> Option<(RateCandidate, f64)> {
        let rate = pair_rate(far, near)?;
        let q_near = self.phat * near.rtt.saturating_sub(rtt_hat) as f64;
        let q_far = self.phat * far.rtt_excess() as f64;
        let baseline = self.phat * rtt_hat.abs_diff(far.rtt_hat) as f64;
        Some((rate, (q_near + q_far + baseline) / rate.delta_t))
    }
}

/// Inputs handed to the plocal stage for one stamp.
#[derive(Debug, Clone, Copy)]
pub struct PlocalInputs<'a> {
    pub record: &'a HistoryRecord,
    /// Long-term period after this stamp's phat stage
    pub phat: f64,
    pub phase: Phase,
    pub history: &'a History,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlocalEstimator {
    plocal: f64,
    plocal_err: f64,
    /// Whether `plocal` is its own estimate rather than a copy of phat
    own_estimate: bool,

    plocal_win: u64,
    /// Width of the near and far sub-windows
    sub_win: u64,
    winratio: u64,
    quality: f64,
    sanity: f64,
    in_warmup: bool,

    near: SlidingExtremum<HistoryRecord>,
    far: SlidingExtremum<HistoryRecord>,

    warmup_far: Option<HistoryRecord>,
    warmup_far_filled: u64,
    warmup_near: SlidingExtremum<HistoryRecord>,

    accepted: u64,
    quality_rejected: u64,
    sanity_rejected: u64,
}

impl PlocalEstimator {
    pub fn new(windows: &WindowConfig, estimator: &EstimatorConfig) -> Self {
        let winratio = estimator.plocal_winratio.max(1);
        let sub_win = (windows.plocal_win / winratio).max(1);
        Self {
            plocal: 1.0 / estimator.counter_frequency_hz,
            plocal_err: f64::MAX,
            own_estimate: false,
            plocal_win: windows.plocal_win,
            sub_win,
            winratio,
            quality: estimator.plocal_quality,
            sanity: estimator.plocal_sanity,
            in_warmup: estimator.plocal_in_warmup,
            near: SlidingExtremum::min(sub_win),
            // earliest of equal RTTs gives the longer baseline
            far: SlidingExtremum::new(Extremum::Min, sub_win, false),
            warmup_far: None,
            warmup_far_filled: 0,
            warmup_near: SlidingExtremum::min(1),
            accepted: 0,
            quality_rejected: 0,
            sanity_rejected: 0,
        }
    }

    pub fn plocal(&self) -> f64 {
        self.plocal
    }

    pub fn plocal_err(&self) -> f64 {
        self.plocal_err
    }

    pub fn has_own_estimate(&self) -> bool {
        self.own_estimate
    }

    pub fn counts(&self) -> (u64, u64, u64) {
        (self.accepted, self.quality_rejected, self.sanity_rejected)
    }

    pub fn process(&mut self, inputs: PlocalInputs<'_>) -> EstimateDiagnostic {
        self.feed_windows(&inputs);

        match inputs.phase {
            Phase::Warmup if self.in_warmup => self.warmup_step(&inputs),
            Phase::Warmup => {
                self.plocal = inputs.phat;
                EstimateDiagnostic::inactive()
            }
            Phase::Main => self.main_step(&inputs),
        }
    }

    // The near window holds the newest `sub_win` stamps, the far window the
    // oldest `sub_win` of the trailing `plocal_win`.
    fn feed_windows(&mut self, inputs: &PlocalInputs<'_>) {
        let record = inputs.record;
        let index = record.index;
        if record.anomalous {
            self.near.evict_before((index + 1).saturating_sub(self.sub_win));
        } else {
            self.near.push(index, record.rtt as f64, *record);
        }

        if index + self.sub_win >= self.plocal_win {
            let k = index + self.sub_win - self.plocal_win;
            match inputs.history.get(k) {
                Some(far) if !far.anomalous => self.far.push(k, far.rtt as f64, *far),
                _ => self.far.evict_before((k + 1).saturating_sub(self.sub_win)),
            }
        }
    }

    fn warmup_step(&mut self, inputs: &PlocalInputs<'_>) -> EstimateDiagnostic {
        let record = inputs.record;
        let index = record.index;
        let w = ((index + 1) / self.winratio).max(1);

        while self.warmup_far_filled < w {
            if let Some(candidate) = inputs.history.get(self.warmup_far_filled) {
                let better = self.warmup_far.map_or(true, |far| candidate.rtt < far.rtt);
                if !candidate.anomalous && better {
                    self.warmup_far = Some(*candidate);
                }
            }
            self.warmup_far_filled += 1;
        }

        self.warmup_near.set_window(w);
        if record.anomalous {
            self.warmup_near.evict_before((index + 1).saturating_sub(w));
        } else {
            self.warmup_near.push(index, record.rtt as f64, *record);
        }

        let (Some(far), Some(near)) = (self.warmup_far, self.warmup_near.front().map(|e| e.value))
        else {
            self.plocal = inputs.phat;
            return EstimateDiagnostic::skipped();
        };
        match Self::pair_error(&far, &near, inputs.phat) {
            Some((rate, err)) if near.index > far.index => {
                self.accept(rate.period, err);
                EstimateDiagnostic::new(Verdict::Unchecked, Some(rate.period), Some(err))
            }
            _ => {
                if !self.own_estimate {
                    self.plocal = inputs.phat;
                }
                EstimateDiagnostic::skipped()
            }
        }
    }

    fn main_step(&mut self, inputs: &PlocalInputs<'_>) -> EstimateDiagnostic {
        let record = inputs.record;
        if record.index + 1 < self.plocal_win {
            if !self.own_estimate {
                self.plocal = inputs.phat;
            }
            return EstimateDiagnostic::inactive();
        }

        if !self.own_estimate {
            self.plocal = inputs.phat;
        }

        let (Some(far), Some(near)) = (
            self.far.front().map(|e| e.value),
            self.near.front().map(|e| e.value),
        ) else {
            return EstimateDiagnostic::skipped();
        };
        let Some((rate, err)) = Self::pair_error(&far, &near, inputs.phat) else {
            return EstimateDiagnostic::skipped();
        };

        if !(err < self.quality || err < self.plocal_err) {
            self.quality_rejected += 1;
            debug!(index = record.index, err, "plocal candidate below quality");
            return EstimateDiagnostic::new(Verdict::QualityRejected, Some(rate.period), Some(err));
        }

        let jump = (rate.period - self.plocal).abs() / self.plocal;
        if record.quality_warning || !jump.is_finite() || jump > self.sanity {
            self.sanity_rejected += 1;
            warn!(
                index = record.index,
                candidate = rate.period,
                plocal = self.plocal,
                jump,
                "plocal sanity check failed, keeping previous period"
            );
            return EstimateDiagnostic::new(Verdict::SanityRejected, Some(rate.period), Some(err));
        }

        self.accept(rate.period, err);
        EstimateDiagnostic::new(Verdict::Accepted, Some(rate.period), Some(err))
    }

    fn accept(&mut self, period: f64, err: f64) {
        self.plocal = period;
        self.plocal_err = err;
        self.own_estimate = true;
        self.accepted += 1;
    }

    fn pair_error(
        far: &HistoryRecord,
        near: &HistoryRecord,
        phat: f64,
    ) -> Option<(RateCandidate, f64)> {
        let rate = pair_rate(far, near)?;
        let q = phat * (far.rtt_excess() + near.rtt_excess()) as f64;
        Some((rate, q / rate.delta_t))
    }
}
