// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed handles and the slot arenas that issue them.
//!
//! Every object the layer creates lives in an [`Arena`] of its kind, and the
//! caller gets back a [`Handle<T>`]: the slot's index plus the slot's
//! *generation* at the time of creation. Deleting the object bumps the
//! generation, so the old handle stops matching even after the slot is reused
//! for something else. Every operation validates its handle before touching
//! the object:
//!
//! - an index the arena never issued yields [`Error::NullRef`];
//! - a generation mismatch yields [`Error::InstanceInvalid`].
//!
//! Handles are `Copy` and carry no ordering or arithmetic meaning. The type
//! parameter records what kind of object the handle names, so a semaphore
//! handle can't be passed where a mutex is expected.

use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

use crate::error::{Error, Result};

/// Names one live object of kind `T`.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation, _kind: PhantomData }
    }
}

// Written out by hand so they don't require anything of `T`.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = core::any::type_name::<T>();
        let kind = kind.rsplit("::").next().unwrap_or(kind);
        write!(f, "{}#{}.{}", kind, self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A slot arena for one object kind.
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    vacant: Vec<u32>,
    live: usize,
    limit: usize,
}

impl<T> Arena<T> {
    pub(crate) const fn new(limit: usize) -> Self {
        Self { slots: Vec::new(), vacant: Vec::new(), live: 0, limit }
    }

    /// Number of live objects.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Makes sure the next [`insert`](Self::insert) can't fail.
    ///
    /// Fails with `InstanceCreateFailure` once the arena holds `limit`
    /// objects, or `MemAllocFailure` if the slot table can't grow.
    pub(crate) fn reserve(&mut self) -> Result<()> {
        if self.live >= self.limit {
            return Err(Error::InstanceCreateFailure);
        }
        if self.vacant.is_empty() {
            // Reserve the vacancy entry now, so `remove` never has to
            // allocate.
            self.slots.try_reserve(1).map_err(|_| Error::MemAllocFailure)?;
            self.vacant
                .try_reserve(self.slots.len() + 1)
                .map_err(|_| Error::MemAllocFailure)?;
        }
        Ok(())
    }

    /// Stores `value` and returns its handle, failing as
    /// [`reserve`](Self::reserve) does.
    pub(crate) fn insert(&mut self, value: T) -> Result<Handle<T>> {
        self.reserve()?;
        let index = match self.vacant.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot { generation: 0, value: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.live += 1;
        Ok(Handle::new(index, slot.generation))
    }

    fn slot(&self, h: Handle<T>) -> Result<&Slot<T>> {
        let slot = self.slots.get(h.index as usize).ok_or(Error::NullRef)?;
        if slot.generation != h.generation || slot.value.is_none() {
            return Err(Error::InstanceInvalid);
        }
        Ok(slot)
    }

    pub(crate) fn get(&self, h: Handle<T>) -> Result<&T> {
        self.slot(h)?.value.as_ref().ok_or(Error::InstanceInvalid)
    }

    pub(crate) fn get_mut(&mut self, h: Handle<T>) -> Result<&mut T> {
        self.slot(h)?;
        self.slots[h.index as usize]
            .value
            .as_mut()
            .ok_or(Error::InstanceInvalid)
    }

    /// Removes the object, invalidating `h` and every copy of it.
    pub(crate) fn remove(&mut self, h: Handle<T>) -> Result<T> {
        self.slot(h)?;
        let slot = &mut self.slots[h.index as usize];
        let value = slot.value.take().ok_or(Error::InstanceInvalid)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(h.index);
        self.live -= 1;
        Ok(value)
    }

    /// Iterates over live objects and their handles.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| (Handle::new(i as u32, s.generation), v))
        })
    }

    /// Iterates mutably over live objects and their handles.
    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (Handle<T>, &mut T)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.value.as_mut().map(|v| (Handle::new(i as u32, generation), v))
        })
    }

    /// Finds the first live object matching `pred`.
    pub(crate) fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Handle<T>> {
        self.iter().find(|(_, v)| pred(v)).map(|(h, _)| h)
    }
}
