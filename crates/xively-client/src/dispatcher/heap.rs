//! Indexed min-heap of time events.
//!
//! Entries are ordered by target step, then by insertion sequence so events
//! due at the same step run first-in first-out. Steps are compared through
//! a wrapping difference, which keeps the order correct across one overflow
//! of the step counter as long as pending events span less than half the
//! `i64` range. Every entry's slot is tracked by id so an event can be
//! cancelled or moved in `O(log n)`.

use ahash::AHashMap;

/// Identifies one scheduled event for cancellation or restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeEventId(pub(crate) u64);

pub(crate) struct Entry<T> {
    pub step: i64,
    seq: u64,
    pub id: TimeEventId,
    pub value: T,
}

impl<T> Entry<T> {
    fn before(&self, other: &Entry<T>) -> bool {
        match self.step.wrapping_sub(other.step) {
            0 => self.seq < other.seq,
            diff => diff < 0,
        }
    }
}

pub(crate) struct TimeHeap<T> {
    entries: Vec<Entry<T>>,
    positions: AHashMap<TimeEventId, usize>,
    next_seq: u64,
}

impl<T> TimeHeap<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            positions: AHashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, id: TimeEventId) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn peek(&self) -> Option<&Entry<T>> {
        self.entries.first()
    }

    pub fn push(&mut self, step: i64, id: TimeEventId, value: T) {
        let seq = self.bump_seq();
        let index = self.entries.len();
        self.entries.push(Entry {
            step,
            seq,
            id,
            value,
        });
        self.positions.insert(id, index);
        self.sift_up(index);
    }

    pub fn pop(&mut self) -> Option<Entry<T>> {
        self.remove_at(0)
    }

    pub fn remove(&mut self, id: TimeEventId) -> Option<Entry<T>> {
        let index = *self.positions.get(&id)?;
        self.remove_at(index)
    }

    /// Move an event to a new step. It queues behind events already due at
    /// that step.
    pub fn reschedule(&mut self, id: TimeEventId, step: i64) -> bool {
        let Some(&index) = self.positions.get(&id) else {
            return false;
        };
        let seq = self.bump_seq();
        let entry = &mut self.entries[index];
        entry.step = step;
        entry.seq = seq;
        self.sift_down(index);
        self.sift_up(index);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    fn remove_at(&mut self, index: usize) -> Option<Entry<T>> {
        let last = self.entries.len().checked_sub(1)?;
        self.swap(index, last);
        let entry = self.entries.pop()?;
        self.positions.remove(&entry.id);
        if index < self.entries.len() {
            self.sift_down(index);
            self.sift_up(index);
        }
        Some(entry)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].id, a);
        self.positions.insert(self.entries[b].id, b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.entries[index].before(&self.entries[parent]) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.entries[left].before(&self.entries[smallest]) {
                smallest = left;
            }
            if right < len && self.entries[right].before(&self.entries[smallest]) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(heap: &mut TimeHeap<u32>) -> Vec<u32> {
        std::iter::from_fn(|| heap.pop().map(|e| e.value)).collect()
    }

    #[test]
    fn test_orders_by_step_then_insertion() {
        let mut heap = TimeHeap::new();
        heap.push(5, TimeEventId(0), 50);
        heap.push(1, TimeEventId(1), 10);
        heap.push(5, TimeEventId(2), 51);
        heap.push(3, TimeEventId(3), 30);
        heap.push(1, TimeEventId(4), 11);
        assert_eq!(drain(&mut heap), vec![10, 11, 30, 50, 51]);
    }

    #[test]
    fn test_remove_from_middle() {
        let mut heap = TimeHeap::new();
        for i in 0..10u64 {
            heap.push(i as i64, TimeEventId(i), i as u32);
        }
        assert_eq!(heap.remove(TimeEventId(4)).map(|e| e.value), Some(4));
        assert_eq!(heap.remove(TimeEventId(0)).map(|e| e.value), Some(0));
        assert!(heap.remove(TimeEventId(4)).is_none());
        assert_eq!(drain(&mut heap), vec![1, 2, 3, 5, 6, 7, 8, 9]);
        assert!(heap.positions.is_empty());
    }

    #[test]
    fn test_reschedule_moves_both_ways() {
        let mut heap = TimeHeap::new();
        heap.push(1, TimeEventId(1), 1);
        heap.push(2, TimeEventId(2), 2);
        heap.push(3, TimeEventId(3), 3);
        assert!(heap.reschedule(TimeEventId(1), 10));
        assert!(heap.reschedule(TimeEventId(3), 0));
        assert!(!heap.reschedule(TimeEventId(9), 0));
        assert_eq!(drain(&mut heap), vec![3, 2, 1]);
    }

    #[test]
    fn test_order_survives_overflow() {
        let mut heap = TimeHeap::new();
        heap.push(i64::MAX - 1, TimeEventId(1), 1);
        heap.push(i64::MAX.wrapping_add(2), TimeEventId(2), 2);
        heap.push(i64::MAX, TimeEventId(3), 3);
        assert_eq!(drain(&mut heap), vec![1, 3, 2]);
    }
}
