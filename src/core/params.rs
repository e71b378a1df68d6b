//! Published clock parameters and their kernel feed-forward representation

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Conditions in force when the parameters were published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    pub warmup: bool,
    pub phat_sanity: bool,
    pub plocal_sanity: bool,
    pub offset_sanity: bool,
    pub offset_quality: bool,
    pub gap: bool,
    pub level_shift: bool,
    pub quality_warning: bool,
}

impl StatusFlags {
    pub const WARMUP: u32 = 1 << 0;
    pub const PHAT_SANITY: u32 = 1 << 1;
    pub const PLOCAL_SANITY: u32 = 1 << 2;
    pub const OFFSET_SANITY: u32 = 1 << 3;
    pub const OFFSET_QUALITY: u32 = 1 << 4;
    pub const GAP: u32 = 1 << 5;
    pub const LEVEL_SHIFT: u32 = 1 << 6;
    pub const QUALITY_WARNING: u32 = 1 << 7;

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        for (set, bit) in [
            (self.warmup, Self::WARMUP),
            (self.phat_sanity, Self::PHAT_SANITY),
            (self.plocal_sanity, Self::PLOCAL_SANITY),
            (self.offset_sanity, Self::OFFSET_SANITY),
            (self.offset_quality, Self::OFFSET_QUALITY),
            (self.gap, Self::GAP),
            (self.level_shift, Self::LEVEL_SHIFT),
            (self.quality_warning, Self::QUALITY_WARNING),
        ] {
            if set {
                bits |= bit;
            }
        }
        bits
    }
}

/// The only state the engine exposes.
///
/// Defines `Ca(T) = phat * T + c - thetahat` for a raw counter reading `T`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockParameters {
    /// Long-term counter period, seconds per tick
    pub phat: f64,
    /// Absolute intercept, seconds
    pub c: f64,
    /// Offset estimate, seconds
    pub thetahat: f64,
    /// Local counter period, seconds per tick
    pub plocal: f64,
    /// Relative rate error bound of `phat`
    pub phat_err: f64,
    pub plocal_err: f64,
    /// Error bound of `thetahat`, seconds
    pub thetahat_err: f64,
    pub status: StatusFlags,
    /// Engine index of the stamp that produced this update
    pub last_changed: u64,
    /// Producer id of that stamp
    pub last_changed_id: u64,
    /// Raw counter reading (receive side) of that stamp
    pub last_changed_counter: u64,
    /// False while still in warmup
    pub valid: bool,
}

impl ClockParameters {
    /// Counter to time without the offset correction.
    pub fn uncorrected_time(&self, counter: u64) -> f64 {
        self.phat * counter as f64 + self.c
    }

    /// Absolute clock `Ca` at a raw counter reading.
    pub fn absolute_time(&self, counter: u64) -> f64 {
        self.uncorrected_time(counter) - self.thetahat
    }

    /// Difference clock: elapsed seconds between two counter readings,
    /// measured with the local period.
    pub fn interval(&self, from: u64, to: u64) -> f64 {
        if to >= from {
            (to - from) as f64 * self.plocal
        } else {
            -((from - to) as f64 * self.plocal)
        }
    }

    /// Seconds of counter time since these parameters last changed.
    pub fn age(&self, counter: u64) -> f64 {
        counter.saturating_sub(self.last_changed_counter) as f64 * self.phat
    }

    /// Staleness is a first-class error for consumers.
    pub fn check_fresh(&self, counter: u64, max_age: f64) -> Result<()> {
        let age = self.age(counter);
        if age > max_age {
            return Err(Error::stale(format!(
                "last update at stamp {} is {:.1}s old (limit {:.1}s)",
                self.last_changed, age, max_age
            )));
        }
        Ok(())
    }

    /// Fixed-point export for a kernel feed-forward clock.
    pub fn to_ffclock(&self) -> FfClockEstimate {
        let update_time = self.absolute_time(self.last_changed_counter);
        let seconds = update_time.floor();
        let frac = ((update_time - seconds) * TWO_POW_64) as u64;

        FfClockEstimate {
            update_time_sec: seconds as i64,
            update_time_frac: frac,
            update_ffcount: self.last_changed_counter,
            period: (self.phat * TWO_POW_64) as u64,
            errb_abs: (self.thetahat_err * 1e9).round() as u32,
            errb_rate: (self.phat_err * 1e9).round() as u32,
            status: self.status.bits(),
        }
    }
}

const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

/// Integer-only clock estimate: consumers evaluate it without floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FfClockEstimate {
    /// Time at `update_ffcount`: whole seconds
    pub update_time_sec: i64,
    /// Time at `update_ffcount`: fraction in units of 2^-64 s
    pub update_time_frac: u64,
    pub update_ffcount: u64,
    /// Counter period in units of 2^-64 s per tick
    pub period: u64,
    /// Absolute error bound, ns
    pub errb_abs: u32,
    /// Rate error bound, ppb
    pub errb_rate: u32,
    pub status: u32,
}

impl FfClockEstimate {
    /// Time at a counter reading at or after `update_ffcount`, as
    /// (seconds, 2^-64 fraction).
    pub fn time_at(&self, counter: u64) -> (i64, u64) {
        let delta = counter.saturating_sub(self.update_ffcount) as u128;
        let elapsed = delta * self.period as u128;
        let elapsed_sec = (elapsed >> 64) as i64;
        let elapsed_frac = elapsed as u64;

        let (frac, carry) = self.update_time_frac.overflowing_add(elapsed_frac);
        let seconds = self.update_time_sec + elapsed_sec + carry as i64;
        (seconds, frac)
    }
}
