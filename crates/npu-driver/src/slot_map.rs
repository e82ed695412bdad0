// SPDX-License-Identifier: AGPL-3.0-only

//! Expandable, reference-counted handle table
//!
//! Maps a 64-bit key (task id + subtask index) to a slot holding one
//! in-flight record. Slots are addressed by [`SlotId`], an index plus a
//! generation: a slot that is reclaimed bumps its generation, so ids held by
//! late readers stop resolving instead of aliasing the next occupant.
//!
//! Discipline:
//!
//! - `insert` hands the inserter one outstanding use.
//! - Every `use_by_key` / `use_by_index` must be balanced by `unuse`.
//! - `remove_by_index` only marks the slot; it is reclaimed once the last
//!   use is dropped with `free_if_unreferenced = true` (or immediately if no
//!   use is outstanding).

use crate::error::{NpuError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Generation-checked slot address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    /// Slot index inside the table
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    /// Generation the id was issued under
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into one word (wait-link tags store this)
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`SlotId::to_bits`]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Occupant<T> {
    key: u64,
    refs: u32,
    removed: bool,
    value: Arc<T>,
}

struct Entry<T> {
    generation: u32,
    occupant: Option<Occupant<T>>,
}

struct Inner<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    by_key: HashMap<u64, u32>,
}

impl<T> Inner<T> {
    fn occupant_mut(&mut self, id: SlotId) -> Option<&mut Occupant<T>> {
        let entry = self.entries.get_mut(id.index())?;
        if entry.generation != id.generation {
            return None;
        }
        entry.occupant.as_mut()
    }

    fn grow_to(&mut self, capacity: usize) {
        let old = self.entries.len();
        self.entries.extend((old..capacity).map(|_| Entry {
            generation: 0,
            occupant: None,
        }));
        // Lowest index is handed out first.
        #[allow(clippy::cast_possible_truncation)]
        self.free.extend((old..capacity).rev().map(|i| i as u32));
    }

    fn reclaim(&mut self, id: SlotId) {
        let entry = &mut self.entries[id.index()];
        if let Some(occ) = entry.occupant.take() {
            self.by_key.remove(&occ.key);
            entry.generation = entry.generation.wrapping_add(1);
            self.free.push(id.index);
            trace!("Slot {id} reclaimed (key {:#x})", occ.key);
        }
    }
}

/// Handle table shared by submitters, daemons and waiters
pub struct SlotMap<T> {
    inner: Mutex<Inner<T>>,
    max_capacity: usize,
    allow_expand: bool,
}

impl<T> std::fmt::Debug for SlotMap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SlotMap")
            .field("len", &inner.by_key.len())
            .field("capacity", &inner.entries.len())
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

impl<T> SlotMap<T> {
    /// Table with `initial` slots that may grow to `max_capacity`
    pub fn new(initial: usize, max_capacity: usize, allow_expand: bool) -> Self {
        let mut inner = Inner {
            entries: Vec::with_capacity(initial),
            free: Vec::with_capacity(initial),
            by_key: HashMap::with_capacity(initial),
        };
        inner.grow_to(initial);
        Self {
            inner: Mutex::new(inner),
            max_capacity: max_capacity.max(initial),
            allow_expand,
        }
    }

    /// Occupy a slot for `key`
    ///
    /// The caller owns one use of the returned slot. A full table is expanded
    /// in place when expansion is allowed.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if `key` is still present (including slots removed but
    /// not yet reclaimed); `OutOfResource` if the table is full and cannot grow.
    pub fn insert(&self, key: u64, value: T) -> Result<(SlotId, Arc<T>)> {
        let mut inner = self.inner.lock();
        if inner.by_key.contains_key(&key) {
            return Err(NpuError::AlreadyExists { key });
        }
        if inner.free.is_empty() {
            if !self.allow_expand {
                return Err(NpuError::out_of_resource("slot map"));
            }
            self.expand_locked(&mut inner)?;
        }
        let index = inner.free.pop().ok_or(NpuError::out_of_resource("slot map"))?;
        let value = Arc::new(value);
        let entry = &mut inner.entries[index as usize];
        entry.occupant = Some(Occupant {
            key,
            refs: 1,
            removed: false,
            value: Arc::clone(&value),
        });
        let id = SlotId {
            index,
            generation: entry.generation,
        };
        inner.by_key.insert(key, index);
        trace!("Slot {id} occupied by key {key:#x}");
        Ok((id, value))
    }

    /// Grow the table (doubling, capped at the maximum)
    ///
    /// # Errors
    ///
    /// `OutOfResource` if the table is already at its maximum.
    pub fn expand(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        self.expand_locked(&mut inner)
    }

    fn expand_locked(&self, inner: &mut Inner<T>) -> Result<usize> {
        let current = inner.entries.len();
        if current >= self.max_capacity {
            return Err(NpuError::out_of_resource("slot map"));
        }
        let next = (current.max(1) * 2).min(self.max_capacity);
        inner.grow_to(next);
        debug!("Slot map expanded {current} -> {next}");
        Ok(next)
    }

    /// Take a use of the live slot holding `key`
    pub fn use_by_key(&self, key: u64) -> Option<(SlotId, Arc<T>)> {
        let mut inner = self.inner.lock();
        let index = *inner.by_key.get(&key)?;
        let generation = inner.entries[index as usize].generation;
        let id = SlotId { index, generation };
        let occ = inner.occupant_mut(id)?;
        if occ.removed {
            return None;
        }
        occ.refs += 1;
        Some((id, Arc::clone(&occ.value)))
    }

    /// Take a use of slot `id` if it is still live
    pub fn use_by_index(&self, id: SlotId) -> Option<Arc<T>> {
        let mut inner = self.inner.lock();
        let occ = inner.occupant_mut(id)?;
        if occ.removed {
            return None;
        }
        occ.refs += 1;
        Some(Arc::clone(&occ.value))
    }

    /// Drop one use of slot `id`
    ///
    /// When this was the last use of a removed slot and
    /// `free_if_unreferenced` is set, the slot is reclaimed and its key
    /// becomes reusable. Stale ids are ignored.
    pub fn unuse(&self, id: SlotId, free_if_unreferenced: bool) {
        let mut inner = self.inner.lock();
        let Some(occ) = inner.occupant_mut(id) else {
            trace!("unuse on stale slot {id}");
            return;
        };
        debug_assert!(occ.refs > 0, "unbalanced unuse on slot {id}");
        occ.refs = occ.refs.saturating_sub(1);
        if occ.refs == 0 && occ.removed && free_if_unreferenced {
            inner.reclaim(id);
        }
    }

    /// Mark slot `id` for deletion
    ///
    /// New uses are refused from now on. Idempotent. If nobody holds a use
    /// the slot is reclaimed right away.
    pub fn remove_by_index(&self, id: SlotId) {
        let mut inner = self.inner.lock();
        let Some(occ) = inner.occupant_mut(id) else {
            return;
        };
        occ.removed = true;
        if occ.refs == 0 {
            inner.reclaim(id);
        }
    }

    /// Outstanding uses of slot `id` (0 for stale ids)
    pub fn refs(&self, id: SlotId) -> u32 {
        self.inner.lock().occupant_mut(id).map_or(0, |o| o.refs)
    }

    /// Snapshot of every live (not removed) slot
    #[allow(clippy::cast_possible_truncation)]
    pub fn live(&self) -> Vec<(SlotId, Arc<T>)> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                let occ = e.occupant.as_ref()?;
                (!occ.removed).then(|| {
                    (
                        SlotId {
                            index: i as u32,
                            generation: e.generation,
                        },
                        Arc::clone(&occ.value),
                    )
                })
            })
            .collect()
    }

    /// Occupied slots (removed-but-unreclaimed included)
    pub fn len(&self) -> usize {
        self.inner.lock().by_key.len()
    }

    /// True if no slot is occupied
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of slots
    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
