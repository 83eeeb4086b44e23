//! Fixed-capacity handle registry.
//!
//! Contexts, timed tasks and resource manager contexts are addressed from
//! the outside by small positive integers. A handle is the slot index plus
//! one, so zero and negative values are never valid.

use crate::state::{Result, State};

/// Slot table mapping integer handles to owned values.
#[derive(Debug)]
pub struct HandleRegistry<T> {
    slots: Vec<Option<T>>,
    capacity: usize,
    len: usize,
}

impl<T> HandleRegistry<T> {
    /// Create an empty registry that will hold at most `capacity` values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
            len: 0,
        }
    }

    /// Store `value` in the lowest free slot and return its handle.
    pub fn insert(&mut self, value: T) -> Result<i32> {
        self.insert_with(|_| value)
    }

    /// Like [`insert`](Self::insert) for values that need to know their own
    /// handle.
    pub fn insert_with(&mut self, make: impl FnOnce(i32) -> T) -> Result<i32> {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(State::NoMoreResourceAvailable),
        };
        let handle = index as i32 + 1;
        self.slots[index] = Some(make(handle));
        self.len += 1;
        Ok(handle)
    }

    fn index(handle: i32) -> Option<usize> {
        if handle <= 0 {
            return None;
        }
        Some(handle as usize - 1)
    }

    pub fn get(&self, handle: i32) -> Option<&T> {
        Self::index(handle).and_then(|i| self.slots.get(i)?.as_ref())
    }

    pub fn get_mut(&mut self, handle: i32) -> Option<&mut T> {
        Self::index(handle).and_then(|i| self.slots.get_mut(i)?.as_mut())
    }

    pub fn contains(&self, handle: i32) -> bool {
        self.get(handle).is_some()
    }

    /// Remove and return the value behind `handle`, freeing its slot.
    pub fn remove(&mut self, handle: i32) -> Option<T> {
        let value = Self::index(handle).and_then(|i| self.slots.get_mut(i)?.take());
        if value.is_some() {
            self.len -= 1;
        }
        value
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the live handles, in slot order.
    pub fn handles(&self) -> Vec<i32> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|value| (i as i32 + 1, value)))
    }
}
