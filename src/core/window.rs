//! Fixed-capacity buffers shared by the pipeline stages
//!
//! Nothing here allocates after construction: the ring buffer owns `capacity`
//! slots and the sliding extremum never holds more than its window.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Ring buffer addressed by a monotonically increasing sequence index.
///
/// Slot `index % capacity` holds entry `index`; entries older than
/// `start` are logically discarded even if their slot was not overwritten yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    start: u64,
    end: u64,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            start: 0,
            end: 0,
        }
    }

    /// Restart numbering at `index`, dropping everything held.
    pub fn reset_at(&mut self, index: u64) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.start = index;
        self.end = index;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Index the next `push` will be stored under.
    pub fn next_index(&self) -> u64 {
        self.end
    }

    /// Oldest retained index.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Append an entry, evicting the oldest one when full. Returns its index.
    pub fn push(&mut self, value: T) -> u64 {
        let index = self.end;
        if self.len() == self.capacity() {
            self.start += 1;
        }
        let slot = self.slot(index);
        self.slots[slot] = Some(value);
        self.end += 1;
        index
    }

    pub fn get(&self, index: u64) -> Option<&T> {
        if index < self.start || index >= self.end {
            return None;
        }
        self.slots[self.slot(index)].as_ref()
    }

    pub fn get_mut(&mut self, index: u64) -> Option<&mut T> {
        if index < self.start || index >= self.end {
            return None;
        }
        let slot = self.slot(index);
        self.slots[slot].as_mut()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.get(self.start)
    }

    pub fn newest(&self) -> Option<&T> {
        self.end.checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn newest_mut(&mut self) -> Option<&mut T> {
        match self.end.checked_sub(1) {
            Some(i) => self.get_mut(i),
            None => None,
        }
    }

    /// Discard every entry older than `index`.
    pub fn retain_from(&mut self, index: u64) {
        let index = index.min(self.end);
        while self.start < index {
            let slot = self.slot(self.start);
            self.slots[slot] = None;
            self.start += 1;
        }
    }

    /// Entries from oldest to newest, with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> + '_ {
        (self.start..self.end).filter_map(move |i| self.get(i).map(|v| (i, v)))
    }

    /// Mutable access to retained entries with index `>= index`, in slot order.
    pub fn iter_mut_from(&mut self, index: u64) -> impl Iterator<Item = (u64, &mut T)> + '_ {
        let from = index.max(self.start);
        let end = self.end;
        let capacity = self.slots.len() as u64;
        let lo = end.saturating_sub(capacity);
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(move |(slot, value)| {
                // The only index in [end - capacity, end) that maps onto this slot
                let index = lo + (slot as u64 + capacity - lo % capacity) % capacity;
                if index >= from && index < end {
                    value.as_mut().map(|v| (index, v))
                } else {
                    None
                }
            })
    }

    fn slot(&self, index: u64) -> usize {
        (index % self.slots.len() as u64) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extremum {
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry<V> {
    pub index: u64,
    pub key: f64,
    pub value: V,
}

/// Sliding minimum or maximum over the trailing `window` indices.
///
/// Monotone deque: every entry is pushed and popped at most once, so the
/// amortized cost per push is O(1). `prefer_latest` decides which of two equal
/// keys survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingExtremum<V> {
    kind: Extremum,
    prefer_latest: bool,
    window: u64,
    entries: VecDeque<WindowEntry<V>>,
}

impl<V: Clone> SlidingExtremum<V> {
    pub fn new(kind: Extremum, window: u64, prefer_latest: bool) -> Self {
        let window = window.max(1);
        Self {
            kind,
            prefer_latest,
            window,
            entries: VecDeque::with_capacity(window as usize + 1),
        }
    }

    pub fn min(window: u64) -> Self {
        Self::new(Extremum::Min, window, true)
    }

    pub fn max(window: u64) -> Self {
        Self::new(Extremum::Max, window, true)
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// Change the window width; shrinking evicts relative to the newest entry.
    pub fn set_window(&mut self, window: u64) {
        self.window = window.max(1);
        if let Some(last) = self.entries.back().map(|e| e.index) {
            self.evict_before((last + 1).saturating_sub(self.window));
        }
    }

    pub fn push(&mut self, index: u64, key: f64, value: V) {
        while let Some(back) = self.entries.back() {
            if self.dominates(key, back.key) {
                self.entries.pop_back();
            } else {
                break;
            }
        }
        self.entries.push_back(WindowEntry { index, key, value });
        self.evict_before((index + 1).saturating_sub(self.window));
    }

    pub fn evict_before(&mut self, index: u64) {
        while let Some(front) = self.entries.front() {
            if front.index < index {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn front(&self) -> Option<&WindowEntry<V>> {
        self.entries.front()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Whether a new key makes an older one useless
    fn dominates(&self, new: f64, old: f64) -> bool {
        match (self.kind, self.prefer_latest) {
            (Extremum::Min, true) => new <= old,
            (Extremum::Min, false) => new < old,
            (Extremum::Max, true) => new >= old,
            (Extremum::Max, false) => new > old,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_eviction() {
        let mut ring = RingBuffer::new(4);
        for v in 0..6u32 {
            ring.push(v);
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.start(), 2);
        assert_eq!(ring.get(1), None);
        assert_eq!(ring.get(2), Some(&2));
        assert_eq!(ring.oldest(), Some(&2));
        assert_eq!(ring.newest(), Some(&5));
        assert_eq!(ring.get(6), None);
    }

    #[test]
    fn test_ring_buffer_retain_from() {
        let mut ring = RingBuffer::new(8);
        for v in 0..6u32 {
            ring.push(v * 10);
        }
        ring.retain_from(3);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.get(2), None);
        let collected: Vec<(u64, u32)> = ring.iter().map(|(i, v)| (i, *v)).collect();
        assert_eq!(collected, vec![(3, 30), (4, 40), (5, 50)]);

        // retaining beyond the end empties the buffer without moving numbering
        ring.retain_from(100);
        assert!(ring.is_empty());
        assert_eq!(ring.next_index(), 6);
    }

    #[test]
    fn test_ring_buffer_iter_mut_from() {
        let mut ring = RingBuffer::new(4);
        for v in 0..7u32 {
            ring.push(v);
        }
        // holds 3..=6
        for (_, value) in ring.iter_mut_from(5) {
            *value += 100;
        }
        let collected: Vec<u32> = ring.iter().map(|(_, v)| *v).collect();
        assert_eq!(collected, vec![3, 4, 105, 106]);

        let touched: Vec<u64> = ring.iter_mut_from(0).map(|(i, _)| i).collect();
        assert_eq!(touched.len(), 4);
        assert!(touched.iter().all(|i| (3..7).contains(i)));
    }

    #[test]
    fn test_sliding_min() {
        let mut min = SlidingExtremum::min(3);
        let keys = [5.0, 3.0, 4.0, 6.0, 7.0, 2.0];
        let mut fronts = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            min.push(i as u64, *key, i);
            fronts.push(min.front().map(|e| e.key).unwrap());
        }
        assert_eq!(fronts, vec![5.0, 3.0, 3.0, 3.0, 4.0, 2.0]);
    }

    #[test]
    fn test_sliding_tie_policy() {
        let mut latest = SlidingExtremum::new(Extremum::Min, 10, true);
        let mut earliest = SlidingExtremum::new(Extremum::Min, 10, false);
        for i in 0..4u64 {
            latest.push(i, 1.0, i);
            earliest.push(i, 1.0, i);
        }
        assert_eq!(latest.front().unwrap().index, 3);
        assert_eq!(earliest.front().unwrap().index, 0);
    }

    #[test]
    fn test_sliding_max_and_resize() {
        let mut max = SlidingExtremum::max(5);
        for (i, key) in [1.0, 9.0, 2.0, 3.0].iter().enumerate() {
            max.push(i as u64, *key, ());
        }
        assert_eq!(max.front().unwrap().key, 9.0);

        max.set_window(2);
        assert_eq!(max.front().unwrap().key, 3.0);
    }
}
