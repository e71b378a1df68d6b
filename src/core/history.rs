//! Bounded stamp history with half-window rollover
//!
//! The first rollover is the warmup hand-off at `i == warmup_win`, which
//! discards nothing. After that a rollover fires every `history_win / 2`
//! stamps and discards everything older than the previous rollover point, so
//! at most `history_win + 1` stamps are ever retained.

#[cfg(test)]
use std::cell::Cell;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::window::RingBuffer;

/// Per-stamp state retained for later baseline selection.
///
/// Counter and server readings are relative to the engine timebase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub index: u64,
    pub id: u64,
    pub ta: f64,
    pub tb: f64,
    pub te: f64,
    pub tf: f64,
    pub rtt: u64,
    /// Baseline RTT in force when the stamp arrived
    pub rtt_hat: u64,
    pub anomalous: bool,
    pub quality_warning: bool,
}

impl HistoryRecord {
    /// RTT in excess of this record's own baseline, in ticks.
    pub fn rtt_excess(&self) -> u64 {
        self.rtt.saturating_sub(self.rtt_hat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloverKind {
    /// End of warmup
    Handoff,
    /// Half-window discard in MAIN
    Periodic,
}

/// Event handed forward to the stages that prepared replacement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollover {
    pub index: u64,
    pub kind: RolloverKind,
    /// Oldest index still retained after the rollover
    pub retained_from: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    records: RingBuffer<HistoryRecord>,
    warmup_win: u64,
    half: u64,
    last_rollover: Option<u64>,
    next_rollover: u64,
    rollovers: u64,
    /// Deepest read behind the newest record, tracked for tests only
    #[cfg(test)]
    #[serde(skip)]
    lookback: Cell<u64>,
}

impl History {
    pub fn new(history_win: u64, warmup_win: u64) -> Self {
        let half = (history_win / 2).max(1);
        Self {
            records: RingBuffer::new(history_win as usize + 1),
            warmup_win,
            half,
            last_rollover: None,
            next_rollover: warmup_win,
            rollovers: 0,
            #[cfg(test)]
            lookback: Cell::new(0),
        }
    }

    /// Append the newest record; returns the rollover it triggers, if any.
    pub fn push(&mut self, record: HistoryRecord) -> Option<Rollover> {
        let index = self.records.push(record);
        if index != self.next_rollover {
            return None;
        }

        let rollover = match self.last_rollover {
            None => Rollover {
                index,
                kind: RolloverKind::Handoff,
                retained_from: self.records.start(),
            },
            Some(previous) => {
                self.records.retain_from(previous);
                Rollover {
                    index,
                    kind: RolloverKind::Periodic,
                    retained_from: previous,
                }
            }
        };

        self.last_rollover = Some(index);
        self.next_rollover = index + self.half;
        self.rollovers += 1;

        info!(
            index,
            retained_from = rollover.retained_from,
            kind = ?rollover.kind,
            "History rollover"
        );
        Some(rollover)
    }

    pub fn get(&self, index: u64) -> Option<&HistoryRecord> {
        let record = self.records.get(index)?;
        #[cfg(test)]
        if let Some(newest) = self.records.next_index().checked_sub(1) {
            let distance = newest.saturating_sub(index);
            if distance > self.lookback.get() {
                self.lookback.set(distance);
            }
        }
        Some(record)
    }

    pub fn oldest(&self) -> Option<&HistoryRecord> {
        self.records.oldest()
    }

    pub fn newest(&self) -> Option<&HistoryRecord> {
        self.records.newest()
    }

    pub fn newest_mut(&mut self) -> Option<&mut HistoryRecord> {
        self.records.newest_mut()
    }

    pub fn start(&self) -> u64 {
        self.records.start()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn warmup_win(&self) -> u64 {
        self.warmup_win
    }

    pub fn next_rollover(&self) -> u64 {
        self.next_rollover
    }

    pub fn rollovers(&self) -> u64 {
        self.rollovers
    }

    /// Deepest look into the past any reader has made, in stamps.
    #[cfg(test)]
    pub fn max_lookback(&self) -> u64 {
        self.lookback.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u64) -> HistoryRecord {
        HistoryRecord {
            index,
            id: index,
            ta: index as f64,
            tb: index as f64,
            te: index as f64,
            tf: index as f64 + 1.0,
            rtt: 1,
            rtt_hat: 1,
            anomalous: false,
            quality_warning: false,
        }
    }

    #[test]
    fn test_rollover_schedule() {
        let mut history = History::new(20, 4);
        let mut rollovers = Vec::new();
        for i in 0..40 {
            if let Some(r) = history.push(record(i)) {
                rollovers.push(r);
            }
        }

        let indices: Vec<u64> = rollovers.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![4, 14, 24, 34]);
        assert_eq!(rollovers[0].kind, RolloverKind::Handoff);
        assert_eq!(rollovers[0].retained_from, 0);
        assert_eq!(rollovers[1].kind, RolloverKind::Periodic);
        assert_eq!(rollovers[1].retained_from, 4);
        assert_eq!(rollovers[2].retained_from, 14);
    }

    #[test]
    fn test_retention_is_bounded() {
        let mut history = History::new(20, 4);
        for i in 0..200 {
            history.push(record(i));
            assert!(history.len() <= 21);
        }
        // after the rollover at 194 everything from 184 on is kept
        assert_eq!(history.start(), 184);
        assert!(history.get(183).is_none());
        assert_eq!(history.get(184).map(|r| r.index), Some(184));
    }

    #[test]
    fn test_lookback_tracking() {
        let mut history = History::new(20, 4);
        for i in 0..10 {
            history.push(record(i));
        }
        assert_eq!(history.max_lookback(), 0);
        history.get(7);
        assert_eq!(history.max_lookback(), 2);

        // read tracking is not part of the persisted state
        let json = serde_json::to_string(&history).unwrap();
        assert!(!json.contains("lookback"));
        let restored: History = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.max_lookback(), 0);
        assert_eq!(restored.newest().map(|r| r.index), Some(9));
    }
}
