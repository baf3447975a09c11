//! Descriptor pools.
//!
//! Each channel keeps one [`Slab`] of transfer descriptors and one of
//! segments. A slab is a growable arena with a stack of free indices:
//! acquiring pops the stack, releasing pushes onto it, and only an empty
//! stack falls back to growing the arena. The free stack's capacity always
//! covers every entry, so [`Slab::release`] never allocates and may run from
//! the interrupt handler.
//!
//! Released entries keep their contents until they are handed out again, so
//! the status of a recently finished transfer can still be looked up.
use alloc::vec::Vec;
use core::fmt;

use crate::error::{DmaError, PoolKind};

/// A generation-checked reference to a slab entry.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

pub(crate) struct Slab<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    limit: Option<usize>,
    kind: PoolKind,
}

struct Entry<T> {
    generation: u32,
    in_use: bool,
    value: T,
}

/// Occupancy of one descriptor pool.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Entries ever allocated from the backing allocator.
    pub allocated: usize,
    /// Entries sitting on the free stack.
    pub available: usize,
}

// === impl Key ===

impl Key {
    #[cfg(test)]
    pub(crate) fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}v{})", self.index, self.generation)
    }
}

// === impl PoolStats ===

impl PoolStats {
    /// Entries currently handed out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.allocated - self.available
    }
}

// === impl Slab ===

impl<T> Slab<T> {
    pub(crate) const fn new(kind: PoolKind, limit: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            limit,
            kind,
        }
    }

    /// Hands out an entry initialized to `value`.
    ///
    /// Reuses a free entry when one exists. Otherwise grows the arena, which
    /// fails with [`DmaError::OutOfMemory`] if the backing allocation fails or
    /// the pool's cap is reached.
    pub(crate) fn acquire(&mut self, value: T) -> Result<Key, DmaError> {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.generation = entry.generation.wrapping_add(1);
            entry.in_use = true;
            entry.value = value;
            return Ok(Key {
                index,
                generation: entry.generation,
            });
        }

        let index = self.grow(value, true)?;
        Ok(Key {
            index,
            generation: 0,
        })
    }

    /// Grows the arena by up to `count` free entries built by `make`.
    ///
    /// Stops early if an allocation fails. Returns the number of entries
    /// added.
    pub(crate) fn preallocate(&mut self, count: usize, mut make: impl FnMut() -> T) -> usize {
        for added in 0..count {
            match self.grow(make(), false) {
                Ok(index) => self.free.push(index),
                Err(_) => return added,
            }
        }
        count
    }

    /// Returns an entry to the free stack.
    ///
    /// Releasing a stale key or an entry that is already free does nothing
    /// and returns `false`.
    pub(crate) fn release(&mut self, key: Key) -> bool {
        match self.entries.get_mut(key.index as usize) {
            Some(entry) if entry.in_use && entry.generation == key.generation => {
                entry.in_use = false;
                // capacity for every entry is reserved in `grow`
                debug_assert!(self.free.len() < self.free.capacity());
                self.free.push(key.index);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub(crate) fn get(&self, key: Key) -> Option<&T> {
        self.entries
            .get(key.index as usize)
            .filter(|entry| entry.in_use && entry.generation == key.generation)
            .map(|entry| &entry.value)
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.entries
            .get_mut(key.index as usize)
            .filter(|entry| entry.in_use && entry.generation == key.generation)
            .map(|entry| &mut entry.value)
    }

    /// Like [`get`](Self::get), but also finds an entry that has been
    /// released and not handed out again since.
    #[must_use]
    pub(crate) fn get_any(&self, key: Key) -> Option<&T> {
        self.entries
            .get(key.index as usize)
            .filter(|entry| entry.generation == key.generation)
            .map(|entry| &entry.value)
    }

    /// Iterates over every entry that has ever been handed out, including
    /// released ones that have not been reused yet.
    pub(crate) fn iter_all(&self) -> impl Iterator<Item = (Key, &T)> + '_ {
        self.entries.iter().enumerate().map(|(index, entry)| {
            let key = Key {
                index: index as u32,
                generation: entry.generation,
            };
            (key, &entry.value)
        })
    }

    /// Returns every in-use entry to the free stack.
    pub(crate) fn release_all(&mut self) {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.in_use {
                entry.in_use = false;
                self.free.push(index as u32);
            }
        }
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.entries.len(),
            available: self.free.len(),
        }
    }

    fn grow(&mut self, value: T, in_use: bool) -> Result<u32, DmaError> {
        let len = self.entries.len();
        let at_limit = self.limit.map_or(false, |limit| len >= limit);
        if at_limit || len >= u32::MAX as usize {
            return Err(DmaError::OutOfMemory(self.kind));
        }

        let kind = self.kind;
        let oom = move |_| DmaError::OutOfMemory(kind);
        self.entries.try_reserve(1).map_err(oom)?;
        // keep room on the free stack for every entry, including this one
        self.free
            .try_reserve((len + 1).saturating_sub(self.free.len()))
            .map_err(oom)?;

        self.entries.push(Entry {
            generation: 0,
            in_use,
            value,
        });
        Ok(len as u32)
    }
}
