//! Message id allocation.

use ahash::AHashSet;

use crate::state::{Result, State};

/// Hands out 16-bit message ids for QoS 1/2 publishes and subscriptions.
///
/// Ids count up from 1, wrap from `0xFFFF` back to 1 and skip any id still
/// waiting for its acknowledgment.
#[derive(Debug)]
pub struct PacketIdAllocator {
    next_id: u16,
    in_use: AHashSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_use: AHashSet::new(),
        }
    }

    /// Reserve the next free id.
    pub fn allocate(&mut self) -> Result<u16> {
        if self.in_use.len() >= usize::from(u16::MAX) {
            return Err(State::NoMoreResourceAvailable);
        }
        while self.in_use.contains(&self.next_id) {
            self.advance();
        }
        let id = self.next_id;
        self.in_use.insert(id);
        self.advance();
        Ok(id)
    }

    /// Return an id once its exchange has completed.
    pub fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn clear(&mut self) {
        self.in_use.clear();
        self.next_id = 1;
    }

    fn advance(&mut self) {
        self.next_id = match self.next_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };
    }
}
