// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event flag groups.
//!
//! An event holds a 32-bit set of flags. [`Os::event_put`] ORs flags in;
//! waiters block until the flags they care about are set, either any of them
//! ([`EventWait::Any`]) or all ([`EventWait::All`]).
//!
//! [`Os::event_wait_and_clear`] consumes the flags that satisfied it, in the
//! same critical section that satisfies it. Waiters are evaluated in arrival
//! order on every put, so when two clearing waiters want the same flag, the
//! first one gets it and the second keeps waiting.

use core::fmt;

use crate::error::{Error, Result};
use crate::handle::{Arena, Handle};
use crate::list::{Order, WaitList};
use crate::os::{Object, Os, State, Turn};
use crate::port::{ContextId, Port};
use crate::time::Timeout;

/// How a waiter's mask is matched against the flags.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventWait {
    /// Satisfied when any masked flag is set.
    Any,
    /// Satisfied when every masked flag is set.
    All,
}

impl EventWait {
    fn satisfied(self, flags: u32, mask: u32) -> bool {
        match self {
            EventWait::Any => flags & mask != 0,
            EventWait::All => flags & mask == mask,
        }
    }
}

/// What a waiter is waiting for.
#[derive(Copy, Clone)]
struct Want {
    mask: u32,
    mode: EventWait,
    clear: bool,
}

/// What a waiter was handed: the flags it saw, and the flags it took.
#[derive(Copy, Clone)]
struct Seen {
    flags: u32,
    cleared: u32,
}

/// An event flag group object.
pub struct Event {
    name: &'static str,
    flags: u32,
    waiters: WaitList<Want, Seen>,
}

/// Handle to an [`Event`].
pub type EventHandle = Handle<Event>;

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("flags", &format_args!("{:#x}", self.flags))
            .finish()
    }
}

fn event_waiters(e: &mut Event) -> &mut WaitList<Want, Seen> {
    &mut e.waiters
}

/// Checks `want` against `flags`, clearing what it consumes.
fn satisfy(flags: &mut u32, want: &Want) -> Option<Seen> {
    if !want.mode.satisfied(*flags, want.mask) {
        return None;
    }
    let seen = *flags & want.mask;
    let cleared = if want.clear { seen } else { 0 };
    *flags &= !cleared;
    Some(Seen { flags: seen, cleared })
}

impl Event {
    /// Offers the current flags to every pending waiter, in order.
    fn evaluate(&mut self, wake: &mut dyn FnMut(ContextId)) {
        let flags = &mut self.flags;
        self.waiters.grant_each(|want| satisfy(flags, want), wake);
    }
}

impl Object for Event {
    fn arena(state: &mut State) -> &mut Arena<Self> {
        &mut state.events
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn forget(&mut self, ctx: ContextId, wake: &mut dyn FnMut(ContextId)) {
        let restored = self.waiters.withdraw(ctx).map_or(0, |seen| seen.cleared);
        if restored != 0 {
            // Flags consumed on behalf of a waiter that never saw them.
            self.flags |= restored;
            self.evaluate(wake);
        }
    }

    fn close(&mut self, wake: &mut dyn FnMut(ContextId)) {
        self.waiters.drain(wake);
    }
}

/// # Event flags
impl<P: Port> Os<P> {
    /// Creates an event with no flags set.
    pub fn event_create(&self, name: &'static str) -> Result<EventHandle> {
        self.insert(Event {
            name,
            flags: 0,
            waiters: WaitList::new(Order::Fifo),
        })
    }

    /// Deletes an event. Anyone waiting on it gets `InstanceInvalid`.
    pub fn event_delete(&self, event: EventHandle) -> Result<()> {
        self.remove(event, |_| Ok(())).map(drop)
    }

    /// Sets `flags`, waking every waiter that is now satisfied.
    pub fn event_put(&self, event: EventHandle, flags: u32) -> Result<()> {
        self.modify(event, |e, wake| {
            e.flags |= flags;
            e.evaluate(wake);
            Ok(())
        })
    }

    /// Waits up to `timeout` for the flags in `mask` to be set, per `mode`.
    /// Returns the masked flags at the moment the wait was satisfied.
    pub fn event_wait(
        &self,
        event: EventHandle,
        mask: u32,
        mode: EventWait,
        timeout: Timeout,
    ) -> Result<u32> {
        self.wait_event(event, Want { mask, mode, clear: false }, timeout)
    }

    /// Like [`event_wait`](Self::event_wait), but also clears the masked
    /// flags that satisfied the wait, before anyone else can see them.
    pub fn event_wait_and_clear(
        &self,
        event: EventHandle,
        mask: u32,
        mode: EventWait,
        timeout: Timeout,
    ) -> Result<u32> {
        self.wait_event(event, Want { mask, mode, clear: true }, timeout)
    }

    fn wait_event(&self, event: EventHandle, want: Want, timeout: Timeout) -> Result<u32> {
        if want.mask == 0 {
            return Err(Error::Param);
        }
        self.block(event, timeout, Error::Busy, want, event_waiters, |e, turn, _| {
            match turn {
                Turn::Try(_) => Ok(satisfy(&mut e.flags, &want).map(|s| s.flags)),
                Turn::Granted(seen) => Ok(Some(seen.flags)),
            }
        })
    }

    /// Clears `flags` and returns the flags as they were before.
    pub fn event_clear(&self, event: EventHandle, flags: u32) -> Result<u32> {
        self.modify(event, |e, _| {
            let previous = e.flags;
            e.flags &= !flags;
            Ok(previous)
        })
    }

    /// Reads the flags.
    pub fn event_state(&self, event: EventHandle) -> Result<u32> {
        self.read(event, |e| e.flags)
    }

    /// The event's name.
    pub fn event_name(&self, event: EventHandle) -> Result<&'static str> {
        self.read(event, |e| e.name)
    }

    /// Finds an event by name.
    pub fn event_find(&self, name: &str) -> Result<EventHandle> {
        self.lookup(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::task::{TaskSpec, TaskState};
    use crate::testutil::{spawn_os, wait_until};

    #[test]
    fn test_any_and_all_without_blocking() {
        let os = spawn_os();
        let e = os.event_create("flags").unwrap();
        os.event_put(e, 0b0101).unwrap();
        assert_eq!(os.event_wait(e, 0b0110, EventWait::Any, Timeout::POLL), Ok(0b0100));
        assert_eq!(
            os.event_wait(e, 0b0110, EventWait::All, Timeout::POLL),
            Err(Error::Busy),
        );
        assert_eq!(os.event_wait(e, 0b0101, EventWait::All, Timeout::POLL), Ok(0b0101));
        // Plain waits don't consume anything.
        assert_eq!(os.event_state(e), Ok(0b0101));
    }

    #[test]
    fn test_wait_and_clear_takes_only_satisfying_bits() {
        let os = spawn_os();
        let e = os.event_create("").unwrap();
        os.event_put(e, 0b1011).unwrap();
        assert_eq!(
            os.event_wait_and_clear(e, 0b0011, EventWait::Any, Timeout::POLL),
            Ok(0b0011),
        );
        assert_eq!(os.event_state(e), Ok(0b1000));
    }

    #[test]
    fn test_zero_mask_and_timeout() {
        let os = spawn_os();
        let e = os.event_create("").unwrap();
        assert_eq!(os.event_wait(e, 0, EventWait::Any, Timeout::FOREVER), Err(Error::Param));
        assert_eq!(
            os.event_wait(e, 1, EventWait::Any, Timeout::ticks(5)),
            Err(Error::Timeout),
        );
    }

    #[test]
    fn test_clear_returns_previous() {
        let os = spawn_os();
        let e = os.event_create("").unwrap();
        os.event_put(e, 0xF0).unwrap();
        assert_eq!(os.event_clear(e, 0x30), Ok(0xF0));
        assert_eq!(os.event_state(e), Ok(0xC0));
    }

    #[test]
    fn test_put_wakes_waiter_with_masked_flags() {
        let os = spawn_os();
        let e = os.event_create("wake").unwrap();
        let (tx, rx) = mpsc::channel();
        let t = os
            .task_create(TaskSpec::new("waiter"), move || {
                tx.send(os.event_wait(e, 0b11, EventWait::All, Timeout::FOREVER))
                    .unwrap();
            })
            .unwrap();
        wait_until(|| os.task_state(t) == Ok(TaskState::Blocked));
        os.event_put(e, 0b01).unwrap();
        os.event_put(e, 0b110).unwrap();
        assert_eq!(rx.recv().unwrap(), Ok(0b11));
    }

    #[test]
    fn test_competing_clearers_get_one_each() {
        let os = spawn_os();
        let e = os.event_create("race").unwrap();
        let (tx, rx) = mpsc::channel();
        for name in ["first", "second"] {
            let tx = tx.clone();
            let t = os
                .task_create(TaskSpec::new(name), move || {
                    let got = os.event_wait_and_clear(e, 1, EventWait::Any, Timeout::FOREVER);
                    tx.send((name, got)).unwrap();
                })
                .unwrap();
            wait_until(|| os.task_state(t) == Ok(TaskState::Blocked));
        }

        os.event_put(e, 1).unwrap();
        assert_eq!(rx.recv().unwrap(), ("first", Ok(1)));
        assert_eq!(os.event_state(e), Ok(0));
        assert!(rx.try_recv().is_err());

        os.event_put(e, 1).unwrap();
        assert_eq!(rx.recv().unwrap(), ("second", Ok(1)));
    }

    #[test]
    fn test_disjoint_clearers_split_one_put() {
        let os = spawn_os();
        let e = os.event_create("split").unwrap();
        let (tx, rx) = mpsc::channel();
        for (name, mask) in [("low", 0x0F), ("high", 0xF0)] {
            let tx = tx.clone();
            let t = os
                .task_create(TaskSpec::new(name), move || {
                    let got = os.event_wait_and_clear(e, mask, EventWait::Any, Timeout::FOREVER);
                    tx.send((name, got)).unwrap();
                })
                .unwrap();
            wait_until(|| os.task_state(t) == Ok(TaskState::Blocked));
        }

        os.event_put(e, 0x33).unwrap();
        let mut seen = [rx.recv().unwrap(), rx.recv().unwrap()];
        seen.sort_by_key(|(name, _)| *name);
        assert_eq!(seen, [("high", Ok(0x30)), ("low", Ok(0x03))]);
        assert_eq!(os.event_state(e), Ok(0));
    }

    #[test]
    fn test_deleted_clearer_gives_flags_back() {
        let os = spawn_os();
        let e = os.event_create("restore").unwrap();
        let t = os
            .task_create(TaskSpec::new("clearer"), move || {
                let _ = os.event_wait_and_clear(e, 0b1, EventWait::Any, Timeout::FOREVER);
            })
            .unwrap();
        wait_until(|| os.task_state(t) == Ok(TaskState::Blocked));

        // The put is consumed on the clearer's behalf while it's held back.
        os.task_suspend(t).unwrap();
        os.event_put(e, 0b11).unwrap();
        assert_eq!(os.event_state(e), Ok(0b10));

        os.task_delete(t).unwrap();
        assert_eq!(os.event_state(e), Ok(0b11));
    }
}
