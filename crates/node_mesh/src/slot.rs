//! Fixed-capacity key to dense-index mapping.
//!
//! [`SlotAllocator`] hands out indices in `0..capacity` for arbitrary external
//! keys and finds them again in O(1) through a secondary index. Freed indices
//! go on a free list and are reused, so a caller can keep a parallel `Vec`
//! indexed by slot without ever reallocating it.

use std::collections::HashMap;
use std::hash::Hash;

/// Errors returned by [`SlotAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    /// Every slot is in use.
    #[error("slot table is full")]
    Full,
    /// The key is not mapped to any slot.
    #[error("key not found in slot table")]
    NotFound,
}

/// Dense slot table with a free list and a key index.
#[derive(Debug)]
pub struct SlotAllocator<K> {
    slots: Vec<Option<K>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
}

impl<K> SlotAllocator<K>
where
    K: Copy + Eq + Hash,
{
    /// Creates a table with `capacity` slots. The capacity never changes.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            // Reversed so that the lowest index is handed out first.
            free: (0..capacity).rev().collect(),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Maps `key` to a free slot.
    ///
    /// Allocating a key that is already mapped returns its existing slot.
    pub fn allocate(&mut self, key: K) -> Result<usize, SlotError> {
        if let Some(&slot) = self.index.get(&key) {
            return Ok(slot);
        }
        let slot = self.free.pop().ok_or(SlotError::Full)?;
        self.slots[slot] = Some(key);
        self.index.insert(key, slot);
        Ok(slot)
    }

    /// Releases the slot of `key` and returns it.
    pub fn free(&mut self, key: K) -> Result<usize, SlotError> {
        let slot = self.index.remove(&key).ok_or(SlotError::NotFound)?;
        self.slots[slot] = None;
        self.free.push(slot);
        Ok(slot)
    }

    /// Returns the slot currently mapped to `key`.
    pub fn find(&self, key: K) -> Result<usize, SlotError> {
        self.index.get(&key).copied().ok_or(SlotError::NotFound)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Iterates over `(slot, key)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, K)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, key)| key.map(|k| (slot, k)))
    }
}
