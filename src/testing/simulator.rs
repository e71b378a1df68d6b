//! Deterministic synthetic stamp generator
//!
//! Models a host counter running at a fixed rate error against a perfect
//! reference server. Each exchange pays a minimum path delay plus independent
//! exponential queueing in each direction. The generator works in counter
//! ticks so that a stamp with no queueing always reports exactly the same RTT.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::core::stamp::Stamp;

/// Permanent change of the minimum path delay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathShift {
    /// First stamp number paying the new delay
    pub at: u64,
    /// Added round-trip delay, seconds (negative for a downward shift)
    pub delta: f64,
}

/// Silence inserted before a stamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GapEvent {
    pub at: u64,
    /// Extra seconds without exchanges
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Nominal counter frequency
    pub counter_hz: f64,
    /// Relative error of the true period against the nominal one
    pub rate_error: f64,
    pub poll_period: f64,
    /// Reference time of the first exchange, seconds
    pub start_time: f64,
    /// Counter reading at `start_time`
    pub counter_start: u64,
    /// Minimum round-trip network delay, seconds
    pub base_rtt: f64,
    /// Server turnaround between receive and transmit, seconds
    pub server_delay: f64,
    /// Share of the minimum delay spent on the outbound leg
    pub asymmetry: f64,
    /// Mean exponential queueing per leg, seconds
    pub queueing_mean: f64,
    /// Every n-th stamp sees no queueing at all
    pub floor_every: Option<u64>,
    pub seed: u64,
    pub level_shifts: Vec<PathShift>,
    pub gaps: Vec<GapEvent>,
    /// Stamp numbers whose reply is stamped with the send reading
    pub zero_rtt_at: Vec<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            counter_hz: 1e6,
            rate_error: 1e-5,
            poll_period: 1.0,
            start_time: 1_700_000_000.0,
            counter_start: 5_000_000_000,
            base_rtt: 20e-3,
            server_delay: 50e-6,
            asymmetry: 0.5,
            queueing_mean: 0.0,
            floor_every: None,
            seed: 1,
            level_shifts: Vec::new(),
            gaps: Vec::new(),
            zero_rtt_at: Vec::new(),
        }
    }
}

impl SimulatorConfig {
    /// Seconds per tick of the simulated counter.
    pub fn true_period(&self) -> f64 {
        (1.0 + self.rate_error) / self.counter_hz
    }
}

pub struct StampSimulator {
    config: SimulatorConfig,
    period: f64,
    rng: StdRng,
    sent: u64,
    /// True seconds since `start_time` at the next send
    elapsed: f64,
}

impl StampSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            period: config.true_period(),
            rng: StdRng::seed_from_u64(config.seed),
            sent: 0,
            elapsed: 0.0,
            config,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn true_period(&self) -> f64 {
        self.period
    }

    /// Stamps produced so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Reference time at a counter reading.
    pub fn reference_time(&self, counter: u64) -> f64 {
        let ticks = counter as i128 - self.config.counter_start as i128;
        self.config.start_time + ticks as f64 * self.period
    }

    pub fn next_stamp(&mut self) -> Stamp {
        let n = self.sent;
        self.elapsed += self
            .config
            .gaps
            .iter()
            .filter(|gap| gap.at == n)
            .map(|gap| gap.duration)
            .sum::<f64>();

        let send_ticks = (self.elapsed / self.period).floor() as u64;
        let ta = self.config.counter_start + send_ticks;
        let send = send_ticks as f64 * self.period;

        let min_rtt = self.config.base_rtt
            + self
                .config
                .level_shifts
                .iter()
                .filter(|shift| shift.at <= n)
                .map(|shift| shift.delta)
                .sum::<f64>();

        let floor = self.config.floor_every.map_or(false, |every| every > 0 && n % every == 0);
        let (queue_out, queue_back) = if floor || self.config.queueing_mean <= 0.0 {
            (0.0, 0.0)
        } else {
            (self.queueing(), self.queueing())
        };

        let outbound = min_rtt * self.config.asymmetry + queue_out;
        let inbound = min_rtt * (1.0 - self.config.asymmetry) + queue_back;
        let tb = self.config.start_time + send + outbound;
        let te = tb + self.config.server_delay;

        let rtt_ticks = ((outbound + self.config.server_delay + inbound) / self.period).round() as u64;
        let tf = if self.config.zero_rtt_at.contains(&n) {
            ta
        } else {
            ta + rtt_ticks
        };

        self.sent += 1;
        self.elapsed += self.config.poll_period;
        Stamp::new(n, ta, tb, te, tf)
    }

    fn queueing(&mut self) -> f64 {
        let u: f64 = self.rng.gen();
        -self.config.queueing_mean * (1.0 - u).ln()
    }
}

impl Iterator for StampSimulator {
    type Item = Stamp;

    fn next(&mut self) -> Option<Stamp> {
        Some(self.next_stamp())
    }
}
