//! Round-trip stamps and the relative timebase the estimators compute in

use serde::{Deserialize, Serialize};

/// One bidirectional probe exchange.
///
/// `ta`/`tf` are raw host counter readings taken when the request left and the
/// reply arrived; `tb`/`te` are the server's receive and transmit times in
/// seconds. The record is never mutated once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stamp {
    /// Producer sequence id, strictly increasing
    pub id: u64,
    pub ta: u64,
    pub tb: f64,
    pub te: f64,
    pub tf: u64,
    /// Set by the network layer when it distrusts this exchange
    #[serde(default)]
    pub quality_warning: bool,
}

impl Stamp {
    pub fn new(id: u64, ta: u64, tb: f64, te: f64, tf: u64) -> Self {
        Self {
            id,
            ta,
            tb,
            te,
            tf,
            quality_warning: false,
        }
    }

    pub fn with_quality_warning(mut self, warning: bool) -> Self {
        self.quality_warning = warning;
        self
    }

    /// Round-trip time in counter ticks, floored at one tick.
    pub fn rtt(&self) -> u64 {
        self.tf.saturating_sub(self.ta).max(1)
    }

    /// False when the receive reading does not follow the send reading.
    pub fn is_causal(&self) -> bool {
        self.tf > self.ta
    }

    pub fn has_finite_times(&self) -> bool {
        self.tb.is_finite() && self.te.is_finite()
    }
}

/// Origin subtracted from every counter and server reading.
///
/// Absolute server times are around 1e9 seconds, which leaves an `f64` with
/// only ~0.2us of resolution; estimating relative to the first stamp keeps the
/// naive-offset arithmetic well conditioned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timebase {
    pub counter_origin: u64,
    pub time_origin: f64,
}

impl Timebase {
    pub fn new(counter_origin: u64, time_origin: f64) -> Self {
        Self {
            counter_origin,
            time_origin,
        }
    }

    pub fn from_stamp(stamp: &Stamp) -> Self {
        Self::new(stamp.ta, stamp.tb)
    }

    /// Counter reading relative to the origin, in ticks.
    pub fn counter(&self, raw: u64) -> f64 {
        if raw >= self.counter_origin {
            (raw - self.counter_origin) as f64
        } else {
            -((self.counter_origin - raw) as f64)
        }
    }

    /// Server time relative to the origin, in seconds.
    pub fn time(&self, raw: f64) -> f64 {
        raw - self.time_origin
    }

    /// Convert a relative `C` to the absolute one used against raw counters.
    pub fn absolute_c(&self, relative_c: f64, phat: f64) -> f64 {
        relative_c + self.time_origin - phat * self.counter_origin as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_floor() {
        let stamp = Stamp::new(1, 1_000, 10.0, 10.0, 21_000);
        assert_eq!(stamp.rtt(), 20_000);
        assert!(stamp.is_causal());

        let zero = Stamp::new(2, 5_000, 10.0, 10.0, 5_000);
        assert_eq!(zero.rtt(), 1);
        assert!(!zero.is_causal());

        let backwards = Stamp::new(3, 5_000, 10.0, 10.0, 4_000);
        assert_eq!(backwards.rtt(), 1);
        assert!(!backwards.is_causal());
    }

    #[test]
    fn test_non_finite_server_times() {
        let stamp = Stamp::new(1, 1_000, 10.0, 10.0, 21_000);
        assert!(stamp.has_finite_times());
        assert!(!Stamp::new(2, 1_000, f64::NAN, 10.0, 21_000).has_finite_times());
        assert!(!Stamp::new(3, 1_000, 10.0, f64::INFINITY, 21_000).has_finite_times());
    }

    #[test]
    fn test_stamp_json_defaults_warning() {
        let stamp: Stamp =
            serde_json::from_str(r#"{"id":7,"ta":10,"tb":1.5,"te":1.5001,"tf":30}"#).unwrap();
        assert_eq!(stamp.id, 7);
        assert!(!stamp.quality_warning);
    }

    #[test]
    fn test_timebase_relative_values() {
        let first = Stamp::new(0, 1_000_000, 1_700_000_000.25, 1_700_000_000.26, 1_020_000);
        let timebase = Timebase::from_stamp(&first);

        assert_eq!(timebase.counter(1_000_500), 500.0);
        assert_eq!(timebase.counter(999_000), -1_000.0);
        assert!((timebase.time(1_700_000_001.25) - 1.0).abs() < 1e-6);

        // relative C = 0 with phat 1e-6 maps the origin counter to the origin time
        let c = timebase.absolute_c(0.0, 1e-6);
        let at_origin = 1e-6 * 1_000_000.0 + c;
        assert!((at_origin - 1_700_000_000.25).abs() < 1e-6);
    }
}
