//! Fixed-capacity client slot map.
//!
//! A slot's index doubles as its record position in the ledger, so an
//! index never moves while it is claimed.

use crate::error::{RecoveryError, RecoveryResult};

const WORD_BITS: u32 = u64::BITS;

/// In-use bitmap over `capacity` slots.
#[derive(Debug, Clone)]
pub struct SlotMap {
    words: Vec<u64>,
    capacity: u32,
    in_use: u32,
}

impl SlotMap {
    /// All slots free.
    pub fn new(capacity: u32) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(WORD_BITS) as usize],
            capacity,
            in_use: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Claims the lowest free slot.
    pub fn claim_lowest(&mut self) -> Option<u32> {
        let (w, word) = self
            .words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let idx = w as u32 * WORD_BITS + (!word).trailing_zeros();
        if idx >= self.capacity {
            return None;
        }
        self.set(idx);
        Some(idx)
    }

    /// Claims a specific slot.
    pub fn claim(&mut self, idx: u32) -> RecoveryResult<()> {
        if idx >= self.capacity {
            return Err(RecoveryError::SlotsExhausted { max: self.capacity });
        }
        if self.is_set(idx) {
            return Err(RecoveryError::SlotConflict {
                idx,
                reason: "already in use".to_string(),
            });
        }
        self.set(idx);
        Ok(())
    }

    /// Frees a claimed slot.
    pub fn release(&mut self, idx: u32) -> RecoveryResult<()> {
        if !self.is_set(idx) {
            return Err(RecoveryError::SlotConflict {
                idx,
                reason: "already free".to_string(),
            });
        }
        self.words[(idx / WORD_BITS) as usize] &= !(1u64 << (idx % WORD_BITS));
        self.in_use -= 1;
        Ok(())
    }

    /// Whether `idx` is claimed.
    pub fn is_set(&self, idx: u32) -> bool {
        idx < self.capacity && self.words[(idx / WORD_BITS) as usize] & (1u64 << (idx % WORD_BITS)) != 0
    }

    /// Claimed slots.
    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    /// Claimed indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.capacity).filter(move |&idx| self.is_set(idx))
    }

    fn set(&mut self, idx: u32) {
        self.words[(idx / WORD_BITS) as usize] |= 1u64 << (idx % WORD_BITS);
        self.in_use += 1;
    }
}
