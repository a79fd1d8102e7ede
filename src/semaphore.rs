// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! A semaphore holds up to `max_count` permits. [`Os::semaphore_take`] removes
//! one, waiting if there are none; [`Os::semaphore_release`] puts one back.
//!
//! Waiters are served strictly in arrival order, whatever their priority, so
//! that a stream of high-priority takers can't starve everyone else out of a
//! counted resource. A release with waiters present hands its permit straight
//! to the oldest one instead of bumping the count, which keeps late arrivals
//! from taking a permit out from under a waiter that was just woken.

use core::fmt;

use crate::error::{Error, Result};
use crate::handle::{Arena, Handle};
use crate::list::{Order, WaitList};
use crate::os::{Object, Os, State, Turn};
use crate::port::{ContextId, Port};
use crate::time::Timeout;

/// A counting semaphore object.
pub struct Semaphore {
    name: &'static str,
    count: u32,
    max: u32,
    waiters: WaitList,
}

/// Handle to a [`Semaphore`].
pub type SemaphoreHandle = Handle<Semaphore>;

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("max", &self.max)
            .field("waiters", &self.waiters.pending())
            .finish()
    }
}

fn semaphore_waiters(s: &mut Semaphore) -> &mut WaitList {
    &mut s.waiters
}

impl Semaphore {
    /// Returns one permit: to the oldest waiter if there is one, otherwise to
    /// the count.
    fn give(&mut self, wake: &mut dyn FnMut(ContextId)) -> Result<()> {
        match self.waiters.grant_next(()) {
            Ok(ctx) => {
                wake(ctx);
                Ok(())
            }
            Err(()) if self.count < self.max => {
                self.count += 1;
                Ok(())
            }
            Err(()) => Err(Error::NotAvailable),
        }
    }
}

impl Object for Semaphore {
    fn arena(state: &mut State) -> &mut Arena<Self> {
        &mut state.semaphores
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn forget(&mut self, ctx: ContextId, wake: &mut dyn FnMut(ContextId)) {
        if let Some(()) = self.waiters.withdraw(ctx) {
            // If the count filled up meanwhile, the surplus permit is dropped.
            let _ = self.give(wake);
        }
    }

    fn close(&mut self, wake: &mut dyn FnMut(ContextId)) {
        self.waiters.drain(wake);
    }
}

/// # Semaphores
impl<P: Port> Os<P> {
    /// Creates a semaphore holding `initial` of at most `max` permits.
    pub fn semaphore_create(
        &self,
        name: &'static str,
        max: u32,
        initial: u32,
    ) -> Result<SemaphoreHandle> {
        if max == 0 || initial > max {
            return Err(Error::Param);
        }
        self.insert(Semaphore {
            name,
            count: initial,
            max,
            waiters: WaitList::new(Order::Fifo),
        })
    }

    /// Deletes a semaphore. Anyone waiting on it gets `InstanceInvalid`.
    pub fn semaphore_delete(&self, sem: SemaphoreHandle) -> Result<()> {
        self.remove(sem, |_| Ok(())).map(drop)
    }

    /// Takes a permit, waiting up to `timeout` for one to be released.
    pub fn semaphore_take(&self, sem: SemaphoreHandle, timeout: Timeout) -> Result<()> {
        self.block(sem, timeout, Error::Busy, (), semaphore_waiters, |s, turn, _| {
            match turn {
                Turn::Try(_) if s.count > 0 => {
                    s.count -= 1;
                    Ok(Some(()))
                }
                Turn::Try(_) => Ok(None),
                Turn::Granted(()) => Ok(Some(())),
            }
        })
    }

    /// Releases a permit. Fails with `NotAvailable` if the semaphore is
    /// already full.
    pub fn semaphore_release(&self, sem: SemaphoreHandle) -> Result<()> {
        self.modify(sem, |s, wake| s.give(wake))
    }

    /// Number of permits currently available.
    pub fn semaphore_count(&self, sem: SemaphoreHandle) -> Result<u32> {
        self.read(sem, |s| s.count)
    }

    /// Capacity the semaphore was created with.
    pub fn semaphore_max_count(&self, sem: SemaphoreHandle) -> Result<u32> {
        self.read(sem, |s| s.max)
    }

    /// The semaphore's name.
    pub fn semaphore_name(&self, sem: SemaphoreHandle) -> Result<&'static str> {
        self.read(sem, |s| s.name)
    }

    /// Finds a semaphore by name.
    pub fn semaphore_find(&self, name: &str) -> Result<SemaphoreHandle> {
        self.lookup(name)
    }
}
