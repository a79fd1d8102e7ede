// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recursive, owner-tracking mutexes.
//!
//! A mutex is owned by at most one context at a time. The owner can lock it
//! again without deadlocking; each lock bumps a depth counter, and ownership is
//! only given up when the matching number of unlocks has happened.
//!
//! # Implementation details
//!
//! Contenders wait on a priority-ordered list: the highest-priority waiter is
//! released first, and waiters of equal priority are released in the order
//! they arrived. Priority is sampled when a context starts waiting.
//!
//! Ownership is handed off directly. The final unlock makes the chosen waiter
//! the owner before waking it, so no third context can sneak in and take the
//! mutex while the waiter is being scheduled. This makes unlocking slightly
//! more expensive, but it's what makes the release order *fair* in the sense
//! above.
//!
//! This doesn't implement priority inheritance.

use core::fmt;

use crate::error::{Error, Result};
use crate::handle::{Arena, Handle};
use crate::list::{Order, WaitList};
use crate::os::{Object, Os, State, Turn};
use crate::port::{ContextId, Port};
use crate::time::Timeout;

/// A recursive mutex object.
pub struct Mutex {
    name: &'static str,
    owner: Option<ContextId>,
    depth: u32,
    waiters: WaitList,
}

/// Handle to a [`Mutex`].
pub type MutexHandle = Handle<Mutex>;

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("depth", &self.depth)
            .field("waiters", &self.waiters.pending())
            .finish()
    }
}

fn mutex_waiters(m: &mut Mutex) -> &mut WaitList {
    &mut m.waiters
}

impl Mutex {
    pub(crate) fn owner(&self) -> Option<ContextId> {
        self.owner
    }

    /// Passes ownership to the next waiter, or leaves the mutex free.
    fn hand_off(&mut self, wake: &mut dyn FnMut(ContextId)) {
        match self.waiters.grant_next(()) {
            Ok(next) => {
                self.owner = Some(next);
                self.depth = 1;
                wake(next);
            }
            Err(()) => {
                self.owner = None;
                self.depth = 0;
            }
        }
    }
}

impl Object for Mutex {
    fn arena(state: &mut State) -> &mut Arena<Self> {
        &mut state.mutexes
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn forget(&mut self, ctx: ContextId, wake: &mut dyn FnMut(ContextId)) {
        // A grant here would have made `ctx` the owner already, so there's
        // nothing to pass on beyond ownership itself.
        self.waiters.withdraw(ctx);
        if self.owner == Some(ctx) {
            self.hand_off(wake);
        }
    }

    fn close(&mut self, wake: &mut dyn FnMut(ContextId)) {
        self.waiters.drain(wake);
    }
}

/// # Mutexes
impl<P: Port> Os<P> {
    /// Creates an unlocked mutex.
    pub fn mutex_create(&self, name: &'static str) -> Result<MutexHandle> {
        self.insert(Mutex {
            name,
            owner: None,
            depth: 0,
            waiters: WaitList::new(Order::Priority),
        })
    }

    /// Deletes a mutex. Fails with `InstanceInUse` if anyone holds it.
    pub fn mutex_delete(&self, mutex: MutexHandle) -> Result<()> {
        self.remove(mutex, |m| {
            if m.owner.is_some() {
                Err(Error::InstanceInUse)
            } else {
                Ok(())
            }
        })
        .map(drop)
    }

    /// Locks the mutex, waiting up to `timeout` while another context owns it.
    ///
    /// If the caller already owns it, this just increments the lock depth.
    pub fn mutex_lock(&self, mutex: MutexHandle, timeout: Timeout) -> Result<()> {
        self.block(mutex, timeout, Error::Busy, (), mutex_waiters, |m, turn, _| {
            match turn {
                Turn::Try(me) => match m.owner {
                    None => {
                        m.owner = Some(me);
                        m.depth = 1;
                        Ok(Some(()))
                    }
                    Some(owner) if owner == me => {
                        m.depth = m.depth.checked_add(1).ok_or(Error::NotAvailable)?;
                        Ok(Some(()))
                    }
                    Some(_) => Ok(None),
                },
                // Handed off to us by the unlocker.
                Turn::Granted(()) => Ok(Some(())),
            }
        })
    }

    /// Undoes one lock. When the depth reaches zero, ownership passes to the
    /// highest-priority waiter, if any.
    ///
    /// Fails with `Permission` unless the caller owns the mutex.
    pub fn mutex_unlock(&self, mutex: MutexHandle) -> Result<()> {
        let me = self.port().current();
        self.modify(mutex, |m, wake| {
            if m.owner != Some(me) {
                return Err(Error::Permission);
            }
            m.depth -= 1;
            if m.depth == 0 {
                m.hand_off(wake);
            }
            Ok(())
        })
    }

    /// Locks the mutex, runs `action`, and unlocks it again. The unlock
    /// happens even if `action` panics.
    pub fn mutex_perform<R>(
        &self,
        mutex: MutexHandle,
        timeout: Timeout,
        action: impl FnOnce() -> R,
    ) -> Result<R> {
        self.mutex_lock(mutex, timeout)?;
        scopeguard::defer! {
            let _ = self.mutex_unlock(mutex);
        }
        Ok(action())
    }

    /// Reports the owning context, if the mutex is locked.
    pub fn mutex_owner(&self, mutex: MutexHandle) -> Result<Option<ContextId>> {
        self.read(mutex, Mutex::owner)
    }

    /// The mutex's name.
    pub fn mutex_name(&self, mutex: MutexHandle) -> Result<&'static str> {
        self.read(mutex, |m| m.name)
    }

    /// Finds a mutex by name.
    pub fn mutex_find(&self, name: &str) -> Result<MutexHandle> {
        self.lookup(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::vec::Vec;

    use crate::task::{Priority, TaskSpec, TaskState};
    use crate::testutil::{spawn_os, wait_until};

    #[test]
    fn test_recursive_lock() {
        let os = spawn_os();
        let m = os.mutex_create("rec").unwrap();
        let me = os.current_context();
        os.mutex_lock(m, Timeout::POLL).unwrap();
        os.mutex_lock(m, Timeout::POLL).unwrap();
        assert_eq!(os.mutex_owner(m), Ok(Some(me)));
        os.mutex_unlock(m).unwrap();
        assert_eq!(os.mutex_owner(m), Ok(Some(me)));
        os.mutex_unlock(m).unwrap();
        assert_eq!(os.mutex_owner(m), Ok(None));
        assert_eq!(os.mutex_unlock(m), Err(Error::Permission));
    }

    #[test]
    fn test_contention_poll_and_timeout() {
        let os = spawn_os();
        let m = os.mutex_create("").unwrap();
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        os.task_create(TaskSpec::new("holder"), move || {
            os.mutex_lock(m, Timeout::FOREVER).unwrap();
            tx.send(()).unwrap();
            let _ = done_rx.recv();
            os.mutex_unlock(m).unwrap();
        })
        .unwrap();
        rx.recv().unwrap();

        assert_eq!(os.mutex_lock(m, Timeout::POLL), Err(Error::Busy));
        assert_eq!(os.mutex_lock(m, Timeout::ticks(10)), Err(Error::Timeout));
        assert_eq!(os.mutex_unlock(m), Err(Error::Permission));
        assert_eq!(os.mutex_delete(m), Err(Error::InstanceInUse));

        done_tx.send(()).unwrap();
        os.mutex_lock(m, Timeout::FOREVER).unwrap();
        os.mutex_unlock(m).unwrap();
        os.mutex_delete(m).unwrap();
    }

    #[test]
    fn test_release_order_is_priority_then_arrival() {
        let os = spawn_os();
        let m = os.mutex_create("ordered").unwrap();
        os.mutex_lock(m, Timeout::POLL).unwrap();

        let (tx, rx) = mpsc::channel();
        for (name, priority) in [
            ("low", Priority::Low),
            ("high-1", Priority::High),
            ("normal", Priority::Normal),
            ("high-2", Priority::High),
        ] {
            let tx = tx.clone();
            let t = os
                .task_create(TaskSpec::new(name).priority(priority), move || {
                    os.mutex_lock(m, Timeout::FOREVER).unwrap();
                    tx.send(name).unwrap();
                    os.mutex_unlock(m).unwrap();
                })
                .unwrap();
            // Join the wait list one at a time so arrival order is known.
            wait_until(|| os.task_state(t) == Ok(TaskState::Blocked));
        }

        os.mutex_unlock(m).unwrap();
        let order: Vec<_> = (0..4).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, ["high-1", "high-2", "normal", "low"]);
    }

    #[test]
    fn test_exit_hands_mutex_to_waiter() {
        let os = spawn_os();
        let m = os.mutex_create("doomed").unwrap();
        let (tx, rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        os.task_create(TaskSpec::new("owner"), move || {
            os.mutex_lock(m, Timeout::POLL).unwrap();
            go_rx.recv().unwrap();
            // Drop ownership without unlocking, by exiting.
            os.exit_task();
        })
        .unwrap();
        wait_until(|| os.mutex_owner(m).unwrap().is_some());

        let waiter = os
            .task_create(TaskSpec::new("waiter"), move || {
                tx.send(os.mutex_lock(m, Timeout::FOREVER)).unwrap();
            })
            .unwrap();
        wait_until(|| os.task_state(waiter) == Ok(TaskState::Blocked));

        // Exiting releases the mutex to the waiter.
        go_tx.send(()).unwrap();
        assert_eq!(rx.recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_find_and_duplicate_names() {
        let os = spawn_os();
        let m = os.mutex_create("lock").unwrap();
        assert_eq!(os.mutex_create("lock"), Err(Error::InstanceDuplicate));
        assert_eq!(os.mutex_find("lock"), Ok(m));
        assert_eq!(os.mutex_name(m), Ok("lock"));
        // Unnamed objects don't collide.
        os.mutex_create("").unwrap();
        os.mutex_create("").unwrap();
    }

    #[test]
    fn test_priority_change_does_not_reorder_queued_waiter() {
        let os = spawn_os();
        let m = os.mutex_create("settled").unwrap();
        os.mutex_lock(m, Timeout::POLL).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut tasks = Vec::new();
        for (name, priority) in [("first", Priority::Normal), ("second", Priority::Low)] {
            let tx = tx.clone();
            let t = os
                .task_create(TaskSpec::new(name).priority(priority), move || {
                    os.mutex_lock(m, Timeout::FOREVER).unwrap();
                    tx.send(name).unwrap();
                    os.mutex_unlock(m).unwrap();
                })
                .unwrap();
            wait_until(|| os.task_state(t) == Ok(TaskState::Blocked));
            tasks.push(t);
        }

        // Takes effect on the next wait, not this one.
        os.task_set_priority(tasks[1], Priority::Realtime).unwrap();
        assert_eq!(os.task_priority(tasks[1]), Ok(Priority::Realtime));

        os.mutex_unlock(m).unwrap();
        let order: Vec<_> = (0..2).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, ["first", "second"]);
    }

    #[test]
    fn test_perform_unlocks_after_action() {
        let os = spawn_os();
        let m = os.mutex_create("scoped").unwrap();
        let me = os.current_context();

        let seen = os.mutex_perform(m, Timeout::POLL, || os.mutex_owner(m)).unwrap();
        assert_eq!(seen, Ok(Some(me)));
        assert_eq!(os.mutex_owner(m), Ok(None));

        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            os.mutex_perform(m, Timeout::POLL, || panic!("inside"))
        }));
        assert!(r.is_err());
        assert_eq!(os.mutex_owner(m), Ok(None));
    }

    #[test]
    fn test_perform_reports_contention() {
        let os = spawn_os();
        let m = os.mutex_create("taken").unwrap();
        let (tx, rx) = mpsc::channel();
        let (_hold_tx, hold_rx) = mpsc::channel::<()>();
        os.task_create(TaskSpec::new("holder"), move || {
            os.mutex_lock(m, Timeout::FOREVER).unwrap();
            tx.send(()).unwrap();
            let _ = hold_rx.recv();
        })
        .unwrap();
        rx.recv().unwrap();

        let mut ran = false;
        assert_eq!(os.mutex_perform(m, Timeout::POLL, || ran = true), Err(Error::Busy));
        assert!(!ran);
    }
}
