//! A growable arena of records that hands out stable indices.
//!
//! Removed records leave a vacant slot behind, which is chained into a free
//! list and reused by the next insertion, so the arena only ever grows to the
//! largest number of records that were alive at the same time.

use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

enum Slot<T> {
    Occupied(T),
    Vacant { next: Option<usize> },
}

/// Storage for records of type `T`, addressed by `usize` indices.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    vacant: Option<usize>,
    len: usize,
}

impl<T> Arena<T> {
    /// Create a new, empty arena.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: None,
            len: 0,
        }
    }

    /// The number of records that are currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if there's no record stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value` and return the index it can be found at.
    pub fn insert(&mut self, value: T) -> usize {
        self.len += 1;

        match self.vacant {
            Some(idx) => {
                let next = match self.slots[idx] {
                    Slot::Vacant { next } => next,
                    Slot::Occupied(_) => unreachable!("vacant list points to occupied slot"),
                };
                self.vacant = next;
                self.slots[idx] = Slot::Occupied(value);
                idx
            }
            None => {
                self.slots.push(Slot::Occupied(value));
                self.slots.len() - 1
            }
        }
    }

    /// Remove the record at `idx` and return it.
    ///
    /// Returns `None` if there's no record at the given index.
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        match self.slots.get(idx)? {
            Slot::Occupied(_) => {}
            Slot::Vacant { .. } => return None,
        }

        let slot = core::mem::replace(&mut self.slots[idx], Slot::Vacant { next: self.vacant });
        self.vacant = Some(idx);
        self.len -= 1;

        match slot {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Return the record at `idx`, if there is one.
    pub fn get(&self, idx: usize) -> Option<&T> {
        match self.slots.get(idx)? {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Return the record at `idx` mutably, if there is one.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        match self.slots.get_mut(idx)? {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Iterate over every stored record together with its index.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Slot::Occupied(value) => Some((idx, value)),
                Slot::Vacant { .. } => None,
            })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<usize> for Arena<T> {
    type Output = T;

    fn index(&self, idx: usize) -> &T {
        match self.get(idx) {
            Some(value) => value,
            None => panic!("no record at arena index {}", idx),
        }
    }
}

impl<T> IndexMut<usize> for Arena<T> {
    fn index_mut(&mut self, idx: usize) -> &mut T {
        match self.get_mut(idx) {
            Some(value) => value,
            None => panic!("no record at arena index {}", idx),
        }
    }
}
