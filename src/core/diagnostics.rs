//! Per-stamp diagnostic record

use std::fmt;

use serde::{Deserialize, Serialize};

use super::algo::Phase;
use super::history::Rollover;
use super::shift::LevelShift;

/// What an estimator did with the candidate of one stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Passed quality and sanity
    Accepted,
    /// Taken without checks (warmup)
    Unchecked,
    /// Warmup candidate not better than the held value
    Held,
    QualityRejected,
    SanityRejected,
    /// Quality failed but a large gap moved the estimate part of the way
    GapBiased,
    /// No usable candidate on this stamp
    Skipped,
    /// Estimator not running in this phase
    Inactive,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted | Verdict::Unchecked | Verdict::GapBiased)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimateDiagnostic {
    pub verdict: Verdict,
    pub candidate: Option<f64>,
    pub error: Option<f64>,
}

impl EstimateDiagnostic {
    pub fn new(verdict: Verdict, candidate: Option<f64>, error: Option<f64>) -> Self {
        Self {
            verdict,
            candidate,
            error,
        }
    }

    pub fn skipped() -> Self {
        Self::new(Verdict::Skipped, None, None)
    }

    pub fn inactive() -> Self {
        Self::new(Verdict::Inactive, None, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimator {
    Phat,
    Plocal,
    Thetahat,
}

impl fmt::Display for Estimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Estimator::Phat => write!(f, "phat"),
            Estimator::Plocal => write!(f, "plocal"),
            Estimator::Thetahat => write!(f, "thetahat"),
        }
    }
}

/// One record per processed stamp, in index order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampDiagnostic {
    pub index: u64,
    pub id: u64,
    pub phase: Phase,
    /// Set on the stamp that entered MAIN
    pub phase_changed: bool,
    pub rtt: u64,
    /// RTT was floored to one tick (`tf <= ta`)
    pub anomalous: bool,
    pub rtt_hat: u64,
    pub rtt_hat_shift: Option<u64>,
    pub rollover: Option<Rollover>,
    pub level_shift: Option<LevelShift>,
    pub phat: EstimateDiagnostic,
    pub plocal: EstimateDiagnostic,
    pub thetahat: EstimateDiagnostic,
    /// Naive offset of this stamp, seconds (after any causality clamp)
    pub theta_naive: Option<f64>,
    /// Measured skew against the window reference, seconds
    pub skew: Option<f64>,
    pub causality_clamped: bool,
    /// Largest inter-stamp gap in the offset window, seconds
    pub worst_gap: f64,
    pub gap_relevant: bool,
    pub quality_warning: bool,
    /// Whether this stamp produced a new published parameter set
    pub published: bool,
}

impl StampDiagnostic {
    /// Estimators whose sanity gate fired on this stamp.
    pub fn sanity_failures(&self) -> Vec<Estimator> {
        [
            (Estimator::Phat, &self.phat),
            (Estimator::Plocal, &self.plocal),
            (Estimator::Thetahat, &self.thetahat),
        ]
        .into_iter()
        .filter(|(_, report)| report.verdict == Verdict::SanityRejected)
        .map(|(estimator, _)| estimator)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diagnostic() -> StampDiagnostic {
        StampDiagnostic {
            index: 7,
            id: 107,
            phase: Phase::Main,
            phase_changed: false,
            rtt: 510,
            anomalous: false,
            rtt_hat: 500,
            rtt_hat_shift: Some(505),
            rollover: None,
            level_shift: None,
            phat: EstimateDiagnostic::new(Verdict::SanityRejected, Some(1.1e-6), Some(0.0)),
            plocal: EstimateDiagnostic::inactive(),
            thetahat: EstimateDiagnostic::new(Verdict::SanityRejected, Some(0.2), Some(1e-5)),
            theta_naive: Some(0.2),
            skew: None,
            causality_clamped: false,
            worst_gap: 1.0,
            gap_relevant: false,
            quality_warning: false,
            published: false,
        }
    }

    #[test]
    fn test_sanity_failures() {
        let d = diagnostic();
        assert_eq!(d.sanity_failures(), vec![Estimator::Phat, Estimator::Thetahat]);
        assert_eq!(Estimator::Thetahat.to_string(), "thetahat");
    }

    #[test]
    fn test_verdict_acceptance() {
        assert!(Verdict::Accepted.is_accepted());
        assert!(Verdict::GapBiased.is_accepted());
        assert!(!Verdict::Held.is_accepted());
        assert!(!Verdict::SanityRejected.is_accepted());
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(diagnostic()).unwrap();
        assert_eq!(json["phat"]["verdict"], "sanity_rejected");
        assert_eq!(json["phase"], "main");
        let back: StampDiagnostic = serde_json::from_value(json).unwrap();
        assert_eq!(back, diagnostic());
    }
}
