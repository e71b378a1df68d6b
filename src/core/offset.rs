//! Offset estimation (`thetahat`)
//!
//! Every stamp yields a naive offset: the midpoint of the exchange on the
//! uncorrected clock minus the midpoint on the server. Its point error is the
//! RTT excess over the baseline plus whatever skew against the window's best
//! sample the excess cannot explain. The estimate is an exponentially weighted
//! average over the trailing `offset_win` samples, each projected to the
//! current stamp with the local rate.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::algo::Phase;
use super::diagnostics::{EstimateDiagnostic, Verdict};
use super::history::HistoryRecord;
use super::shift::LevelShift;
use super::window::{RingBuffer, SlidingExtremum};
use crate::config::{EstimatorConfig, WindowConfig};

/// Naive offset sample retained in the offset window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub index: u64,
    /// Relative receive counter
    pub tf: f64,
    pub rtt: u64,
    /// Naive offset after any causality clamp, seconds
    pub theta: f64,
    /// RTT excess over the baseline, seconds
    pub q: f64,
    /// Skew the RTT excess does not account for, seconds
    pub penalty: f64,
    pub anomalous: bool,
}

impl OffsetRecord {
    pub fn point_error(&self) -> f64 {
        self.q + self.penalty
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OffsetInputs<'a> {
    pub record: &'a HistoryRecord,
    pub phase: Phase,
    pub phat: f64,
    pub plocal: f64,
    /// Relative intercept after this stamp's phat stage
    pub c: f64,
    pub rtt_hat: u64,
    pub shift: Option<LevelShift>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetOutcome {
    pub report: EstimateDiagnostic,
    pub theta_naive: Option<f64>,
    pub skew: Option<f64>,
    pub causality_clamped: bool,
    pub worst_gap: f64,
    pub gap_relevant: bool,
}

impl OffsetOutcome {
    fn skipped(worst_gap: f64, gap_relevant: bool) -> Self {
        Self {
            report: EstimateDiagnostic::skipped(),
            theta_naive: None,
            skew: None,
            causality_clamped: false,
            worst_gap,
            gap_relevant,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetEstimator {
    records: RingBuffer<OffsetRecord>,
    gaps: SlidingExtremum<()>,
    offset_win: u64,
    last_tf: Option<f64>,
    main: bool,

    thetahat: Option<f64>,
    thetahat_err: f64,
    thetahat_tf: f64,
    /// Receive counter of the last estimate that passed quality and sanity
    last_reliable_tf: Option<f64>,

    eoffset: f64,
    eoffset_quality: f64,
    rate_err_bound: f64,
    skm_scale: f64,
    sanity_min: f64,
    sanity_rate: f64,
    using_plocal: bool,

    accepted: u64,
    quality_rejected: u64,
    sanity_rejected: u64,
}

impl OffsetEstimator {
    pub fn new(windows: &WindowConfig, estimator: &EstimatorConfig) -> Self {
        let mut records = RingBuffer::new(windows.offset_win as usize);
        // stamp 0 never enters the window, so ring indices match stamp indices
        records.reset_at(1);

        Self {
            records,
            gaps: SlidingExtremum::max(windows.offset_win),
            offset_win: windows.offset_win,
            last_tf: None,
            main: false,
            thetahat: None,
            thetahat_err: f64::MAX,
            thetahat_tf: 0.0,
            last_reliable_tf: None,
            eoffset: estimator.eoffset(),
            eoffset_quality: estimator.eoffset_quality(),
            rate_err_bound: estimator.rate_err_bound,
            skm_scale: estimator.skm_scale,
            sanity_min: estimator.offset_sanity_min,
            sanity_rate: estimator.offset_sanity_rate,
            using_plocal: estimator.using_plocal,
            accepted: 0,
            quality_rejected: 0,
            sanity_rejected: 0,
        }
    }

    pub fn thetahat(&self) -> Option<f64> {
        self.thetahat
    }

    pub fn thetahat_err(&self) -> f64 {
        self.thetahat_err
    }

    pub fn record(&self, index: u64) -> Option<&OffsetRecord> {
        self.records.get(index)
    }

    pub fn window_len(&self) -> usize {
        self.records.len()
    }

    pub fn counts(&self) -> (u64, u64, u64) {
        (self.accepted, self.quality_rejected, self.sanity_rejected)
    }

    pub fn process(&mut self, inputs: OffsetInputs<'_>) -> OffsetOutcome {
        let record = inputs.record;
        if inputs.phase == Phase::Main && !self.main {
            self.main = true;
            self.last_reliable_tf = Some(record.tf);
            info!(index = record.index, thetahat = self.thetahat, "offset estimator entering main phase");
        }
        if let Some(shift) = inputs.shift {
            self.apply_shift(&shift, inputs.phat);
        }

        // No period exists yet for the very first stamp
        if record.index == 0 {
            self.last_tf = Some(record.tf);
            return OffsetOutcome::skipped(0.0, false);
        }

        let naive = (inputs.phat * (record.ta + record.tf) + 2.0 * inputs.c
            - (record.tb + record.te))
            / 2.0;

        if record.anomalous || !naive.is_finite() {
            self.gaps
                .evict_before((record.index + 1).saturating_sub(self.offset_win));
            self.records.push(OffsetRecord {
                index: record.index,
                tf: record.tf,
                rtt: record.rtt,
                // never read: anomalous records carry no weight
                theta: 0.0,
                q: f64::MAX,
                penalty: 0.0,
                anomalous: true,
            });
            let (worst_gap, gap_relevant) = self.worst_gap();
            return OffsetOutcome::skipped(worst_gap, gap_relevant);
        }

        if let Some(last_tf) = self.last_tf {
            let gap = inputs.phat * (record.tf - last_tf);
            self.gaps.push(record.index, gap, ());
        }
        self.last_tf = Some(record.tf);
        let (worst_gap, gap_relevant) = self.worst_gap();

        let q = inputs.phat * record.rtt.saturating_sub(inputs.rtt_hat) as f64;
        let mut theta = naive;
        let mut skew = None;
        let mut clamped = false;
        let mut penalty = 0.0;

        if let Some(reference) = self.reference(record.tf, inputs.phat) {
            let theta_ref = self.project(&reference, record.tf, &inputs);
            let budget = inputs.phat * (record.rtt + reference.rtt) as f64;
            let mut sd = 2.0 * (naive - theta_ref);
            if sd.abs() > budget {
                // implied one-way delay would be negative
                sd = budget.copysign(sd);
                theta = theta_ref + sd / 2.0;
                clamped = true;
                debug!(index = record.index, naive, clamped = theta, "causality breach clamped");
            }
            penalty = (sd.abs() / 2.0 - (q + reference.q) / 2.0).max(0.0);
            skew = Some(sd);
        }

        self.records.push(OffsetRecord {
            index: record.index,
            tf: record.tf,
            rtt: record.rtt,
            theta,
            q,
            penalty,
            anomalous: false,
        });

        let mut outcome = OffsetOutcome {
            report: EstimateDiagnostic::skipped(),
            theta_naive: Some(theta),
            skew,
            causality_clamped: clamped,
            worst_gap,
            gap_relevant,
        };
        let Some((estimate, min_err)) = self.weighted(record.tf, &inputs) else {
            return outcome;
        };

        outcome.report = match inputs.phase {
            Phase::Warmup => self.warmup_decide(record, estimate, min_err, inputs.phat),
            Phase::Main => {
                self.main_decide(record, estimate, min_err, inputs.phat, worst_gap, gap_relevant)
            }
        };
        outcome
    }

    fn warmup_decide(
        &mut self,
        record: &HistoryRecord,
        estimate: f64,
        min_err: f64,
        phat: f64,
    ) -> EstimateDiagnostic {
        let held_err = self
            .thetahat
            .map(|_| self.thetahat_err + self.aging(self.thetahat_tf, record.tf, phat));

        if held_err.map_or(true, |held| min_err <= held) {
            self.set(estimate, min_err, record.tf);
            EstimateDiagnostic::new(Verdict::Unchecked, Some(estimate), Some(min_err))
        } else {
            EstimateDiagnostic::new(Verdict::Held, Some(estimate), Some(min_err))
        }
    }

    fn main_decide(
        &mut self,
        record: &HistoryRecord,
        estimate: f64,
        min_err: f64,
        phat: f64,
        worst_gap: f64,
        gap_relevant: bool,
    ) -> EstimateDiagnostic {
        let Some(previous) = self.thetahat else {
            self.set(estimate, min_err, record.tf);
            self.last_reliable_tf = Some(record.tf);
            return EstimateDiagnostic::new(Verdict::Accepted, Some(estimate), Some(min_err));
        };

        let (candidate, verdict) = if min_err < self.eoffset_quality {
            (estimate, Verdict::Accepted)
        } else if gap_relevant {
            let bias = worst_gap / (worst_gap + self.skm_scale);
            (previous + bias * (estimate - previous), Verdict::GapBiased)
        } else {
            self.quality_rejected += 1;
            trace!(index = record.index, min_err, "offset window below quality, holding");
            return EstimateDiagnostic::new(Verdict::QualityRejected, Some(estimate), Some(min_err));
        };

        let age = self
            .last_reliable_tf
            .map_or(0.0, |tf| phat * (record.tf - tf).max(0.0));
        let bound = self.sanity_min + self.sanity_rate * age;
        let jump = (candidate - previous).abs();
        if record.quality_warning || !candidate.is_finite() || jump > bound {
            self.sanity_rejected += 1;
            warn!(
                index = record.index,
                candidate,
                thetahat = previous,
                jump,
                bound,
                quality_warning = record.quality_warning,
                "thetahat sanity check failed, keeping previous offset"
            );
            return EstimateDiagnostic::new(Verdict::SanityRejected, Some(candidate), Some(min_err));
        }

        self.set(candidate, min_err, record.tf);
        if verdict == Verdict::Accepted {
            self.last_reliable_tf = Some(record.tf);
        }
        EstimateDiagnostic::new(verdict, Some(candidate), Some(min_err))
    }

    fn set(&mut self, value: f64, err: f64, tf: f64) {
        self.thetahat = Some(value);
        self.thetahat_err = err;
        self.thetahat_tf = tf;
        self.accepted += 1;
    }

    fn apply_shift(&mut self, shift: &LevelShift, phat: f64) {
        for (_, record) in self.records.iter_mut_from(shift.from_index) {
            if !record.anomalous {
                record.q = phat * record.rtt.saturating_sub(shift.new_rtt_hat) as f64;
            }
        }
    }

    fn worst_gap(&self) -> (f64, bool) {
        let worst = self.gaps.front().map_or(0.0, |e| e.key);
        (worst, worst > self.skm_scale)
    }

    fn aging(&self, from_tf: f64, to_tf: f64, phat: f64) -> f64 {
        self.rate_err_bound * phat * (to_tf - from_tf).max(0.0)
    }

    fn aged_error(&self, record: &OffsetRecord, tf: f64, phat: f64) -> f64 {
        record.point_error() + self.aging(record.tf, tf, phat)
    }

    /// Naive offset of `record` carried forward to counter `tf`.
    fn project(&self, record: &OffsetRecord, tf: f64, inputs: &OffsetInputs<'_>) -> f64 {
        if self.using_plocal {
            record.theta + (inputs.phat - inputs.plocal) * (tf - record.tf)
        } else {
            record.theta
        }
    }

    // Lowest aged error in the window; the later of equal ones
    fn reference(&self, tf: f64, phat: f64) -> Option<OffsetRecord> {
        let mut best: Option<(f64, OffsetRecord)> = None;
        for (_, record) in self.records.iter().filter(|(_, r)| !r.anomalous) {
            let err = self.aged_error(record, tf, phat);
            if best.map_or(true, |(best_err, _)| err <= best_err) {
                best = Some((err, *record));
            }
        }
        best.map(|(_, record)| record)
    }

    fn weighted(&self, tf: f64, inputs: &OffsetInputs<'_>) -> Option<(f64, f64)> {
        let mut weight_sum = 0.0;
        let mut acc = 0.0;
        let mut best: Option<(f64, f64)> = None;

        for (_, record) in self.records.iter().filter(|(_, r)| !r.anomalous) {
            let err = self.aged_error(record, tf, inputs.phat);
            let theta = self.project(record, tf, inputs);
            let w = (-(err / self.eoffset).powi(2)).exp();
            weight_sum += w;
            acc += w * theta;
            if best.map_or(true, |(best_err, _)| err <= best_err) {
                best = Some((err, theta));
            }
        }

        let (min_err, best_theta) = best?;
        let estimate = if weight_sum > 0.0 && weight_sum.is_finite() {
            acc / weight_sum
        } else {
            // every weight underflowed: fall back to the best sample
            best_theta
        };
        Some((estimate, min_err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;

    const P: f64 = 1e-6;

    fn estimator() -> OffsetEstimator {
        let mut config = SyncConfig::default();
        config.windows.offset_win = 16;
        config.estimator.counter_frequency_hz = 1e6;
        OffsetEstimator::new(&config.windows, &config.estimator)
    }

    /// Stamp sent `at` seconds into the run, with the given RTT and true offset.
    fn record(index: u64, at: f64, rtt: u64, offset: f64) -> HistoryRecord {
        let ta = at * 1e6;
        let tf = ta + rtt as f64;
        let server = P * (ta + rtt as f64 / 2.0) - offset;
        HistoryRecord {
            index,
            id: index,
            ta,
            tb: server,
            te: server,
            tf,
            rtt,
            rtt_hat: rtt,
            anomalous: false,
            quality_warning: false,
        }
    }

    fn feed(
        est: &mut OffsetEstimator,
        record: &HistoryRecord,
        rtt_hat: u64,
        phase: Phase,
    ) -> OffsetOutcome {
        est.process(OffsetInputs {
            record,
            phase,
            phat: P,
            plocal: P,
            c: 0.0,
            rtt_hat,
            shift: None,
        })
    }

    fn phase(index: u64) -> Phase {
        if index < 10 {
            Phase::Warmup
        } else {
            Phase::Main
        }
    }

    fn steady(est: &mut OffsetEstimator, upto: u64, offset: f64) {
        for i in 0..upto {
            feed(est, &record(i, i as f64, 500, offset), 500, phase(i));
        }
    }

    #[test]
    fn test_first_stamp_discarded() {
        let mut est = estimator();
        let outcome = feed(&mut est, &record(0, 0.0, 500, 1e-4), 500, Phase::Warmup);
        assert_eq!(outcome.report.verdict, Verdict::Skipped);
        assert!(outcome.theta_naive.is_none());
        assert!(est.thetahat().is_none());

        let outcome = feed(&mut est, &record(1, 1.0, 500, 1e-4), 500, Phase::Warmup);
        assert_eq!(outcome.report.verdict, Verdict::Unchecked);
        assert!((est.thetahat().unwrap() - 1e-4).abs() < 1e-9);
    }

    #[test]
    fn test_tracks_constant_offset() {
        let mut est = estimator();
        for i in 0..40 {
            let outcome = feed(&mut est, &record(i, i as f64, 500, 2e-4), 500, phase(i));
            if i >= 10 {
                assert_eq!(outcome.report.verdict, Verdict::Accepted);
                assert!(!outcome.gap_relevant);
            }
        }
        assert!((est.thetahat().unwrap() - 2e-4).abs() < 1e-9);
        assert_eq!(est.window_len(), 16);
    }

    #[test]
    fn test_causality_breach_is_clamped() {
        let mut est = estimator();
        steady(&mut est, 20, 0.0);

        let outcome = feed(&mut est, &record(20, 20.0, 500, 0.01), 500, Phase::Main);
        assert!(outcome.causality_clamped);
        // clamped to half the combined RTT of the pair
        assert!((outcome.theta_naive.unwrap() - 5e-4).abs() < 1e-9);
        assert_eq!(outcome.report.verdict, Verdict::Accepted);
        assert!(est.thetahat().unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_quality_failure_holds_previous() {
        let mut est = estimator();
        steady(&mut est, 20, 1e-4);

        let mut last = None;
        for i in 20..45 {
            last = Some(feed(&mut est, &record(i, i as f64, 5_000, 1e-4), 500, Phase::Main));
        }
        let outcome = last.unwrap();
        assert_eq!(outcome.report.verdict, Verdict::QualityRejected);
        assert!((est.thetahat().unwrap() - 1e-4).abs() < 1e-9);
        assert!(est.counts().1 > 0);
    }

    #[test]
    fn test_gap_biases_toward_new_data() {
        let mut est = estimator();
        steady(&mut est, 21, 0.0);

        // 2000s of silence, then a mildly congested stamp at a new offset
        let outcome = feed(&mut est, &record(21, 2020.0, 900, 5e-4), 500, Phase::Main);
        assert!(outcome.gap_relevant);
        assert!(!outcome.causality_clamped);
        assert_eq!(outcome.report.verdict, Verdict::GapBiased);

        let gap = outcome.worst_gap;
        assert!((gap - 2000.0).abs() < 1e-2);
        let expected = 5e-4 * gap / (gap + 1024.0);
        assert!((est.thetahat().unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_rejection_run_does_not_lock_out_good_sample() {
        let mut config = SyncConfig::default();
        config.windows.offset_win = 16;
        config.estimator.counter_frequency_hz = 1e6;
        config.estimator.offset_sanity_min = 1e-6;
        let mut est = OffsetEstimator::new(&config.windows, &config.estimator);
        steady(&mut est, 31, 0.0);

        // the offset moves by 1ms while every exchange is badly congested
        let mut rejected = 0;
        for i in 31..250 {
            let outcome = feed(&mut est, &record(i, i as f64, 2_500, 1e-3), 500, Phase::Main);
            if outcome.report.verdict == Verdict::QualityRejected {
                rejected += 1;
            }
        }
        assert!(rejected > 150);
        assert!(est.thetahat().unwrap().abs() < 1e-4);

        let outcome = feed(&mut est, &record(250, 250.0, 500, 1e-3), 500, Phase::Main);
        assert_eq!(outcome.report.verdict, Verdict::Accepted);
        assert!((est.thetahat().unwrap() - 1e-3).abs() < 1e-6);
    }

    #[test]
    fn test_quality_warning_fails_sanity() {
        let mut est = estimator();
        steady(&mut est, 20, 0.0);
        let mut warned = record(20, 20.0, 500, 0.0);
        warned.quality_warning = true;
        let outcome = feed(&mut est, &warned, 500, Phase::Main);
        assert_eq!(outcome.report.verdict, Verdict::SanityRejected);
        assert_eq!(est.counts().2, 1);
    }

    #[test]
    fn test_level_shift_rebases_window() {
        let mut est = estimator();
        steady(&mut est, 20, 0.0);
        for i in 20..25 {
            feed(&mut est, &record(i, i as f64, 900, 0.0), 500, Phase::Main);
        }
        assert!((est.record(22).unwrap().q - 4e-4).abs() < 1e-12);

        let shift = LevelShift {
            index: 25,
            from_index: 21,
            old_rtt_hat: 500,
            new_rtt_hat: 900,
        };
        est.process(OffsetInputs {
            record: &record(25, 25.0, 900, 0.0),
            phase: Phase::Main,
            phat: P,
            plocal: P,
            c: 0.0,
            rtt_hat: 900,
            shift: Some(shift),
        });
        assert!((est.record(20).unwrap().q - 4e-4).abs() < 1e-12);
        assert_eq!(est.record(22).unwrap().q, 0.0);
        assert_eq!(est.record(25).unwrap().q, 0.0);
    }

    #[test]
    fn test_anomalous_stamp_has_no_weight() {
        let mut est = estimator();
        steady(&mut est, 20, 0.0);
        let mut bad = record(20, 20.0, 1, 0.0);
        bad.anomalous = true;
        bad.tf = bad.ta;
        let outcome = feed(&mut est, &bad, 500, Phase::Main);
        assert_eq!(outcome.report.verdict, Verdict::Skipped);
        assert!(est.record(20).unwrap().anomalous);
        assert!(est.thetahat().unwrap().abs() < 1e-9);
    }
}
