// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reader-writer locks.
//!
//! A reader-writer lock admits, at any one time, any number of contexts with
//! *shared* access, or a single context with *exclusive* access, but not
//! both.
//!
//! Access is granted fairly, in the order it was asked for:
//!
//! - While the lock is shared and nobody is waiting, further shared claims
//!   succeed at once. An exclusive claim has to wait.
//!
//! - Once anyone is waiting, every new claim, shared or exclusive, queues
//!   behind them. Writers can't be starved by a stream of readers.
//!
//! - When the lock comes free, the front of the queue is admitted: either one
//!   exclusive claim, or every consecutive shared claim at the front.
//!
//! A context that already holds shared access may take it again at once,
//! queue or no queue; otherwise it would wait behind a writer that is itself
//! waiting for it. Each shared lock needs its own unlock. Exclusive access
//! isn't recursive. Asking for any access while holding exclusive access, or
//! for exclusive access while holding shared access, fails with
//! `NotAvailable` instead of deadlocking.
//!
//! Like mutexes, access is handed over directly: the waiter is counted as a
//! holder before it's woken.

use core::fmt;

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::handle::{Arena, Handle};
use crate::list::{Order, WaitList};
use crate::os::{Object, Os, State, Turn};
use crate::port::{ContextId, Port};
use crate::time::Timeout;

/// Kind of access a claim asks for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Access {
    Shared,
    Exclusive,
}

#[derive(Copy, Clone, Debug)]
struct Claimant {
    ctx: ContextId,
    access: Access,
}

/// A reader-writer lock object.
pub struct RwLock {
    name: &'static str,
    /// One entry per shared lock held, so a context may appear more than once.
    readers: Vec<ContextId>,
    writer: Option<ContextId>,
    waiters: WaitList<Claimant>,
}

/// Handle to a [`RwLock`].
pub type RwLockHandle = Handle<RwLock>;

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("name", &self.name)
            .field("readers", &self.readers.len())
            .field("writer", &self.writer)
            .field("waiters", &self.waiters.pending())
            .finish()
    }
}

fn rwlock_waiters(r: &mut RwLock) -> &mut WaitList<Claimant> {
    &mut r.waiters
}

impl RwLock {
    fn is_held(&self) -> bool {
        self.writer.is_some() || !self.readers.is_empty()
    }

    pub(crate) fn is_held_by(&self, ctx: ContextId) -> bool {
        self.writer == Some(ctx) || self.readers.contains(&ctx)
    }

    /// Grants the front of the queue whatever it can now have.
    fn admit(&mut self, wake: &mut dyn FnMut(ContextId)) {
        if self.writer.is_some() {
            return;
        }
        let readers = &mut self.readers;
        let writer = &mut self.writer;
        let mut stopped = false;
        self.waiters.grant_each(
            |c| {
                if stopped {
                    return None;
                }
                match c.access {
                    Access::Shared => {
                        // Room was reserved when the claim queued.
                        readers.push(c.ctx);
                        Some(())
                    }
                    Access::Exclusive => {
                        stopped = true;
                        if readers.is_empty() {
                            *writer = Some(c.ctx);
                            Some(())
                        } else {
                            None
                        }
                    }
                }
            },
            wake,
        );
    }

    /// Tries to take `access` for `me` without waiting.
    fn try_take(&mut self, me: ContextId, access: Access) -> Result<Option<()>> {
        if self.writer == Some(me) {
            return Err(Error::NotAvailable);
        }
        let queue_empty = self.waiters.pending() == 0;
        match access {
            Access::Shared => {
                // Enough for us and every shared claim queued ahead of us.
                self.readers
                    .try_reserve(self.waiters.pending() + 1)
                    .map_err(|_| Error::MemAllocFailure)?;
                let again = self.readers.contains(&me);
                if self.writer.is_none() && (again || queue_empty) {
                    self.readers.push(me);
                    Ok(Some(()))
                } else {
                    Ok(None)
                }
            }
            Access::Exclusive => {
                if self.readers.contains(&me) {
                    return Err(Error::NotAvailable);
                }
                if !self.is_held() && queue_empty {
                    self.writer = Some(me);
                    Ok(Some(()))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl Object for RwLock {
    fn arena(state: &mut State) -> &mut Arena<Self> {
        &mut state.rwlocks
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn forget(&mut self, ctx: ContextId, wake: &mut dyn FnMut(ContextId)) {
        // Grants were recorded as holdings, so dropping those covers them.
        self.waiters.withdraw(ctx);
        self.readers.retain(|&r| r != ctx);
        if self.writer == Some(ctx) {
            self.writer = None;
        }
        self.admit(wake);
    }

    fn close(&mut self, wake: &mut dyn FnMut(ContextId)) {
        self.waiters.drain(wake);
    }
}

/// # Reader-writer locks
impl<P: Port> Os<P> {
    /// Creates an unlocked reader-writer lock.
    pub fn rwlock_create(&self, name: &'static str) -> Result<RwLockHandle> {
        self.insert(RwLock {
            name,
            readers: Vec::new(),
            writer: None,
            waiters: WaitList::new(Order::Fifo),
        })
    }

    /// Deletes a lock. Fails with `InstanceInUse` if anyone holds it.
    pub fn rwlock_delete(&self, lock: RwLockHandle) -> Result<()> {
        self.remove(lock, |r| {
            if r.is_held() {
                Err(Error::InstanceInUse)
            } else {
                Ok(())
            }
        })
        .map(drop)
    }

    /// Takes shared access, waiting up to `timeout` behind a writer or
    /// anyone already queued.
    pub fn rwlock_lock_shared(&self, lock: RwLockHandle, timeout: Timeout) -> Result<()> {
        self.lock_rwlock(lock, Access::Shared, timeout)
    }

    /// Takes exclusive access, waiting up to `timeout` for every other
    /// holder to let go.
    pub fn rwlock_lock_exclusive(&self, lock: RwLockHandle, timeout: Timeout) -> Result<()> {
        self.lock_rwlock(lock, Access::Exclusive, timeout)
    }

    fn lock_rwlock(&self, lock: RwLockHandle, access: Access, timeout: Timeout) -> Result<()> {
        let me = self.port().current();
        let claim = Claimant { ctx: me, access };
        self.block(lock, timeout, Error::Busy, claim, rwlock_waiters, |r, turn, _| {
            match turn {
                Turn::Try(me) => r.try_take(me, access),
                Turn::Granted(()) => Ok(Some(())),
            }
        })
    }

    /// Gives up the caller's exclusive access, or one of its shared locks,
    /// and admits whoever is next.
    ///
    /// Fails with `Permission` if the caller holds neither.
    pub fn rwlock_unlock(&self, lock: RwLockHandle) -> Result<()> {
        let me = self.port().current();
        self.modify(lock, |r, wake| {
            if r.writer == Some(me) {
                r.writer = None;
            } else if let Some(i) = r.readers.iter().position(|&c| c == me) {
                r.readers.swap_remove(i);
            } else {
                return Err(Error::Permission);
            }
            r.admit(wake);
            Ok(())
        })
    }

    /// Number of shared locks currently held.
    pub fn rwlock_readers(&self, lock: RwLockHandle) -> Result<u32> {
        self.read(lock, |r| r.readers.len() as u32)
    }

    /// Reports the context with exclusive access, if any.
    pub fn rwlock_writer(&self, lock: RwLockHandle) -> Result<Option<ContextId>> {
        self.read(lock, |r| r.writer)
    }

    /// The lock's name.
    pub fn rwlock_name(&self, lock: RwLockHandle) -> Result<&'static str> {
        self.read(lock, |r| r.name)
    }

    /// Finds a lock by name.
    pub fn rwlock_find(&self, name: &str) -> Result<RwLockHandle> {
        self.lookup(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::vec;

    use crate::task::{TaskSpec, TaskState};
    use crate::testutil::{spawn_os, wait_until};

    #[test]
    fn test_readers_share_writer_excludes() {
        let os = spawn_os();
        let l = os.rwlock_create("data").unwrap();
        let me = os.current_context();

        os.rwlock_lock_shared(l, Timeout::POLL).unwrap();
        // Holding shared access, we may take it again, but not upgrade.
        os.rwlock_lock_shared(l, Timeout::POLL).unwrap();
        assert_eq!(os.rwlock_readers(l), Ok(2));
        assert_eq!(os.rwlock_lock_exclusive(l, Timeout::POLL), Err(Error::NotAvailable));
        assert_eq!(os.rwlock_delete(l), Err(Error::InstanceInUse));

        os.rwlock_unlock(l).unwrap();
        os.rwlock_unlock(l).unwrap();
        assert_eq!(os.rwlock_unlock(l), Err(Error::Permission));

        os.rwlock_lock_exclusive(l, Timeout::POLL).unwrap();
        assert_eq!(os.rwlock_writer(l), Ok(Some(me)));
        assert_eq!(os.rwlock_lock_exclusive(l, Timeout::POLL), Err(Error::NotAvailable));
        assert_eq!(os.rwlock_lock_shared(l, Timeout::POLL), Err(Error::NotAvailable));
        os.rwlock_unlock(l).unwrap();
        assert_eq!(os.rwlock_writer(l), Ok(None));
        os.rwlock_delete(l).unwrap();
    }

    #[test]
    fn test_queued_writer_holds_back_new_readers() {
        let os = spawn_os();
        let l = os.rwlock_create("fair").unwrap();
        os.rwlock_lock_shared(l, Timeout::POLL).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut gates = vec![];
        for (name, exclusive) in [("writer", true), ("reader-1", false), ("reader-2", false)] {
            let tx = tx.clone();
            let (go_tx, go_rx) = mpsc::channel::<()>();
            let t = os
                .task_create(TaskSpec::new(name), move || {
                    if exclusive {
                        os.rwlock_lock_exclusive(l, Timeout::FOREVER).unwrap();
                    } else {
                        os.rwlock_lock_shared(l, Timeout::FOREVER).unwrap();
                    }
                    tx.send(name).unwrap();
                    let _ = go_rx.recv();
                    os.rwlock_unlock(l).unwrap();
                })
                .unwrap();
            wait_until(|| os.task_state(t) == Ok(TaskState::Blocked));
            gates.push(go_tx);
        }

        // A writer is queued, so a fresh reader may not cut in.
        let (late_tx, late_rx) = mpsc::channel();
        std::thread::spawn(move || {
            late_tx.send(os.rwlock_lock_shared(l, Timeout::POLL)).unwrap();
        });
        assert_eq!(late_rx.recv().unwrap(), Err(Error::Busy));

        os.rwlock_unlock(l).unwrap();
        assert_eq!(rx.recv().unwrap(), "writer");
        assert_eq!(os.rwlock_readers(l), Ok(0));

        gates[0].send(()).unwrap();
        let mut both = [rx.recv().unwrap(), rx.recv().unwrap()];
        both.sort_unstable();
        assert_eq!(both, ["reader-1", "reader-2"]);
        assert_eq!(os.rwlock_readers(l), Ok(2));
        assert_eq!(os.rwlock_writer(l), Ok(None));
    }

    #[test]
    fn test_deleted_writer_lets_readers_in() {
        let os = spawn_os();
        let l = os.rwlock_create("orphan").unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let (_hold_tx, hold_rx) = mpsc::channel::<()>();
        let writer = os
            .task_create(TaskSpec::new("writer"), move || {
                os.rwlock_lock_exclusive(l, Timeout::FOREVER).unwrap();
                tx.send(()).unwrap();
                let _ = hold_rx.recv();
            })
            .unwrap();
        rx.recv().unwrap();
        assert_eq!(os.rwlock_lock_shared(l, Timeout::POLL), Err(Error::Busy));

        os.task_delete(writer).unwrap();
        assert_eq!(os.rwlock_writer(l), Ok(None));
        os.rwlock_lock_shared(l, Timeout::POLL).unwrap();
        os.rwlock_unlock(l).unwrap();
    }

    #[test]
    fn test_find_and_name() {
        let os = spawn_os();
        let l = os.rwlock_create("table").unwrap();
        assert_eq!(os.rwlock_create("table"), Err(Error::InstanceDuplicate));
        assert_eq!(os.rwlock_find("table"), Ok(l));
        assert_eq!(os.rwlock_name(l), Ok("table"));
    }
}
