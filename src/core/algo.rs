//! Phase controller and per-stamp pipeline
//!
//! One call to [`AlgoState::process_stamp`] runs the whole pipeline:
//! ingest, RTT, history (and rollover), level shift, phat, plocal, offset,
//! publish. Each stage gets an explicit input struct built from the outputs
//! of the stages before it. Nothing feeds back from a later stage.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::diagnostics::{EstimateDiagnostic, StampDiagnostic, Verdict};
use super::frequency::{PhatEstimator, PhatInputs, PlocalEstimator, PlocalInputs};
use super::history::{History, HistoryRecord, RolloverKind};
use super::offset::{OffsetEstimator, OffsetInputs};
use super::params::{ClockParameters, StatusFlags};
use super::rtt::RttTracker;
use super::shift::LevelShiftDetector;
use super::stamp::{Stamp, Timebase};
use crate::config::{EstimatorConfig, SyncConfig, WindowConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Warmup,
    Main,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgoStatistics {
    pub processed: u64,
    pub anomalous: u64,
    pub rollovers: u64,
    pub level_shifts: u64,
    pub published: u64,
    pub sanity_rejections: u64,
}

/// Result of one pipeline pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StampOutcome {
    pub diagnostic: StampDiagnostic,
    /// New parameter set, when some estimate was accepted on this stamp
    pub published: Option<ClockParameters>,
}

/// Complete estimation state for one synchronization peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoState {
    windows: WindowConfig,
    estimator: EstimatorConfig,
    phase: Phase,
    next_index: u64,
    last_id: Option<u64>,
    counter_origin: Option<u64>,
    /// Fixed by the first stamp with finite server times
    timebase: Option<Timebase>,
    /// Intercept relative to the timebase
    c: f64,
    rtt: RttTracker,
    history: History,
    shift: LevelShiftDetector,
    phat: PhatEstimator,
    plocal: PlocalEstimator,
    offset: OffsetEstimator,
    status: StatusFlags,
    parameters: Option<ClockParameters>,
    stats: AlgoStatistics,
}

impl AlgoState {
    /// Fresh WARMUP state. Window invariant violations are fatal.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        config.windows.validate()?;
        config.estimator.validate()?;

        let windows = config.windows;
        let estimator = config.estimator.clone();

        Ok(Self {
            rtt: RttTracker::new(windows.shift_win),
            history: History::new(windows.history_win, windows.warmup_win),
            shift: LevelShiftDetector::new(windows.shift_win, estimator.shift_threshold),
            phat: PhatEstimator::new(&windows, &estimator),
            plocal: PlocalEstimator::new(&windows, &estimator),
            offset: OffsetEstimator::new(&windows, &estimator),
            windows,
            estimator,
            phase: Phase::Warmup,
            next_index: 0,
            last_id: None,
            counter_origin: None,
            timebase: None,
            c: 0.0,
            status: StatusFlags {
                warmup: true,
                ..StatusFlags::default()
            },
            parameters: None,
            stats: AlgoStatistics::default(),
        })
    }

    /// Controlled restart into WARMUP, possibly with new windows.
    pub fn reinitialize(&mut self, config: &SyncConfig) -> Result<()> {
        let fresh = Self::new(config)?;
        info!(
            processed = self.stats.processed,
            warmup_win = config.windows.warmup_win,
            history_win = config.windows.history_win,
            "Reinitializing clock synchronization state"
        );
        *self = fresh;
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Index the next stamp will receive.
    pub fn index(&self) -> u64 {
        self.next_index
    }

    pub fn parameters(&self) -> Option<&ClockParameters> {
        self.parameters.as_ref()
    }

    pub fn statistics(&self) -> &AlgoStatistics {
        &self.stats
    }

    pub fn windows(&self) -> &WindowConfig {
        &self.windows
    }

    pub fn rtt_hat(&self) -> Option<u64> {
        self.rtt.rtt_hat()
    }

    /// Deepest history read so far, in stamps behind the newest.
    #[cfg(test)]
    pub fn history_lookback(&self) -> u64 {
        self.history.max_lookback()
    }

    pub fn snapshot(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restore a snapshot; it must have been taken with the same windows and
    /// estimator constants, otherwise a fresh WARMUP is the only safe start.
    pub fn from_snapshot(snapshot: &str, config: &SyncConfig) -> Result<Self> {
        config.windows.validate()?;
        let state: AlgoState = serde_json::from_str(snapshot)?;
        if state.windows != config.windows {
            return Err(Error::invalid_state(
                "snapshot was taken with a different window configuration",
            ));
        }
        if state.estimator != config.estimator {
            return Err(Error::invalid_state(
                "snapshot was taken with different estimator constants",
            ));
        }
        Ok(state)
    }

    /// Run one stamp through the pipeline.
    ///
    /// Fails only when the producer breaks ordering; the state is then left
    /// exactly as it was.
    pub fn process_stamp(&mut self, stamp: &Stamp) -> Result<StampOutcome> {
        if let Some(last) = self.last_id {
            if stamp.id <= last {
                return Err(Error::invalid_input(format!(
                    "stamp id {} does not follow {}",
                    stamp.id, last
                )));
            }
        }
        self.last_id = Some(stamp.id);

        let index = self.next_index;
        self.next_index += 1;
        self.stats.processed += 1;

        // Ingest
        let counter_origin = *self.counter_origin.get_or_insert(stamp.ta);
        let finite = stamp.has_finite_times();
        let anchored = self.timebase.is_none() && finite;
        if anchored {
            self.timebase = Some(Timebase::new(counter_origin, stamp.tb));
        }
        // Before the first usable stamp only the counters matter
        let timebase = self
            .timebase
            .unwrap_or_else(|| Timebase::new(counter_origin, 0.0));
        let rtt = stamp.rtt();
        let anomalous = !stamp.is_causal() || !finite;
        if anomalous {
            self.stats.anomalous += 1;
            if finite {
                debug!(index, id = stamp.id, ta = stamp.ta, tf = stamp.tf, "non-causal stamp, RTT floored");
            } else {
                debug!(index, id = stamp.id, tb = stamp.tb, te = stamp.te, "non-finite server time, stamp ignored");
            }
        }

        // RTT
        self.rtt.observe(index, rtt, anomalous);

        // History
        let record = HistoryRecord {
            index,
            id: stamp.id,
            ta: timebase.counter(stamp.ta),
            // non-finite server times never enter state; the record is anomalous
            tb: if finite { timebase.time(stamp.tb) } else { 0.0 },
            te: if finite { timebase.time(stamp.te) } else { 0.0 },
            tf: timebase.counter(stamp.tf),
            rtt,
            rtt_hat: self.rtt.rtt_hat().unwrap_or(rtt),
            anomalous,
            quality_warning: stamp.quality_warning,
        };
        if anchored {
            // Midpoints agree on the first usable stamp, so its naive offset is zero
            self.c = (record.tb + record.te) / 2.0 - self.phat.phat() * (record.ta + record.tf) / 2.0;
        }

        let rollover = self.history.push(record);
        let mut phase_changed = false;
        if let Some(rollover) = rollover {
            self.stats.rollovers += 1;
            match rollover.kind {
                RolloverKind::Handoff => {
                    self.rtt.begin_main();
                    self.phase = Phase::Main;
                    phase_changed = true;
                    info!(
                        index,
                        rtt_hat = self.rtt.rtt_hat(),
                        phat = self.phat.phat(),
                        "Warmup complete, entering main phase"
                    );
                }
                RolloverKind::Periodic => self.rtt.rollover((!anomalous).then_some(rtt)),
            }
        }
        let mut record = record;
        if let Some(rtt_hat) = self.rtt.rtt_hat() {
            record.rtt_hat = rtt_hat;
            if let Some(newest) = self.history.newest_mut() {
                newest.rtt_hat = rtt_hat;
            }
        }

        // Level shift
        let shift = match self.phase {
            Phase::Main => self.shift.check(index, &self.rtt, self.phat.phat()),
            Phase::Warmup => None,
        };
        if let Some(shift) = shift {
            self.rtt.reset_to(shift.new_rtt_hat);
            self.stats.level_shifts += 1;
        }
        let rtt_hat = self.rtt.rtt_hat().unwrap_or(rtt);

        // Frequency
        let phat = self.phat.process(PhatInputs {
            record: &record,
            rtt_hat,
            rollover,
            shift,
            history: &self.history,
        });
        if let Some(update) = phat.update {
            self.c += update.c_correction();
        }
        let plocal = self.plocal.process(PlocalInputs {
            record: &record,
            phat: self.phat.phat(),
            phase: self.phase,
            history: &self.history,
        });

        // Offset
        let offset = self.offset.process(OffsetInputs {
            record: &record,
            phase: self.phase,
            phat: self.phat.phat(),
            plocal: self.plocal.plocal(),
            c: self.c,
            rtt_hat,
            shift,
        });

        // Publish
        self.update_status(&phat.report, &plocal, &offset.report, stamp, offset.gap_relevant);
        self.status.level_shift |= shift.is_some();

        let changed = phat.report.verdict.is_accepted()
            || plocal.verdict.is_accepted()
            || offset.report.verdict.is_accepted();
        let published = match (changed, self.offset.thetahat()) {
            (true, Some(thetahat)) => {
                let params = ClockParameters {
                    phat: self.phat.phat(),
                    c: timebase.absolute_c(self.c, self.phat.phat()),
                    thetahat,
                    plocal: self.plocal.plocal(),
                    phat_err: self.phat.phat_err(),
                    plocal_err: self.plocal.plocal_err(),
                    thetahat_err: self.offset.thetahat_err(),
                    status: self.status,
                    last_changed: index,
                    last_changed_id: stamp.id,
                    last_changed_counter: stamp.tf,
                    valid: self.phase == Phase::Main,
                };
                self.parameters = Some(params.clone());
                self.stats.published += 1;
                self.status.level_shift = false;
                Some(params)
            }
            _ => None,
        };

        let diagnostic = StampDiagnostic {
            index,
            id: stamp.id,
            phase: self.phase,
            phase_changed,
            rtt,
            anomalous,
            rtt_hat,
            rtt_hat_shift: self.rtt.rtt_hat_shift(),
            rollover,
            level_shift: shift,
            phat: phat.report,
            plocal,
            thetahat: offset.report,
            theta_naive: offset.theta_naive,
            skew: offset.skew,
            causality_clamped: offset.causality_clamped,
            worst_gap: offset.worst_gap,
            gap_relevant: offset.gap_relevant,
            quality_warning: stamp.quality_warning,
            published: published.is_some(),
        };
        self.stats.sanity_rejections += diagnostic.sanity_failures().len() as u64;

        debug!(
            index,
            rtt,
            rtt_hat,
            phat = ?diagnostic.phat.verdict,
            plocal = ?diagnostic.plocal.verdict,
            thetahat = ?diagnostic.thetahat.verdict,
            "stamp processed"
        );

        Ok(StampOutcome {
            diagnostic,
            published,
        })
    }

    fn update_status(
        &mut self,
        phat: &EstimateDiagnostic,
        plocal: &EstimateDiagnostic,
        offset: &EstimateDiagnostic,
        stamp: &Stamp,
        gap_relevant: bool,
    ) {
        let status = &mut self.status;
        status.warmup = self.phase == Phase::Warmup;
        status.quality_warning = stamp.quality_warning;
        status.gap = gap_relevant;

        match phat.verdict {
            Verdict::SanityRejected => status.phat_sanity = true,
            v if v.is_accepted() => status.phat_sanity = false,
            _ => {}
        }
        match plocal.verdict {
            Verdict::SanityRejected => status.plocal_sanity = true,
            v if v.is_accepted() => status.plocal_sanity = false,
            _ => {}
        }
        match offset.verdict {
            Verdict::SanityRejected => status.offset_sanity = true,
            Verdict::QualityRejected => status.offset_quality = true,
            Verdict::GapBiased => {
                status.offset_quality = true;
                status.offset_sanity = false;
            }
            Verdict::Accepted | Verdict::Unchecked => {
                status.offset_quality = false;
                status.offset_sanity = false;
            }
            _ => {}
        }
    }
}
