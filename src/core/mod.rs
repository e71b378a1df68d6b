//! Estimation core: synchronous, single-writer, no I/O

pub mod algo;
pub mod diagnostics;
pub mod frequency;
pub mod history;
pub mod offset;
pub mod params;
pub mod rtt;
pub mod shift;
pub mod stamp;
pub mod window;

pub use algo::{AlgoState, AlgoStatistics, Phase, StampOutcome};
pub use diagnostics::{EstimateDiagnostic, Estimator, StampDiagnostic, Verdict};
pub use params::{ClockParameters, FfClockEstimate, StatusFlags};
pub use stamp::Stamp;
