// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A port that runs on a hosted OS, using one thread per context.
//!
//! This is useful for simulation and testing. It implements every
//! [`Port`] capability with `std` facilities:
//!
//! - Contexts are threads. Threads that weren't started through
//!   [`Port::spawn`] (like `main`, or a test harness thread) get a
//!   [`ContextId`] the first time they ask for one.
//! - Park tokens are flags under one `Mutex`, with a `Condvar` to sleep on.
//! - The tick source is either wall-clock milliseconds since the port was
//!   created, or a manual counter moved by [`HostPort::advance`]. The manual
//!   clock makes timer behavior exactly reproducible.
//!
//! Threads can't be stopped from outside, so suspension and termination are
//! cooperative: a suspended context stops the next time it parks (or right
//! away, if it suspended itself), and a terminated context unwinds out of its
//! next `park` or `yield_now`. Code that never blocks or yields is never
//! interrupted.

use std::boxed::Box;
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Fault, Result};
use crate::port::{ContextId, Launch, Port};
use crate::task::Priority;
use crate::time::TickTime;

/// Threads need more stack than a small target task; this is the floor.
const MIN_THREAD_STACK: usize = 256 * 1024;

static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

std::thread_local! {
    static CURRENT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Unwind payload used to end a thread from inside `park` or `exit`.
struct Ended;

/// A [`Port`] backed by host threads.
#[derive(Debug)]
pub struct HostPort {
    inner: Mutex<Inner>,
    changed: Condvar,
    epoch: Instant,
    manual: bool,
}

#[derive(Debug, Default)]
struct Inner {
    ticks: u64,
    contexts: HashMap<ContextId, Slot>,
    lock_depth: u32,
}

#[derive(Debug, Default)]
struct Slot {
    token: bool,
    suspended: bool,
    terminated: bool,
    priority: Option<Priority>,
}

impl HostPort {
    /// Creates a port whose ticks are wall-clock milliseconds.
    pub fn new() -> Self {
        Self::with_clock(false)
    }

    /// Creates a port whose tick counter only moves when
    /// [`advance`](Self::advance) is called.
    pub fn with_manual_clock() -> Self {
        Self::with_clock(true)
    }

    fn with_clock(manual: bool) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
            epoch: Instant::now(),
            manual,
        }
    }

    /// Moves the manual clock forward by `ticks`, releasing any context whose
    /// park deadline has been reached.
    ///
    /// Has no effect on a wall-clock port.
    pub fn advance(&self, ticks: u64) {
        if self.manual {
            self.lock().ticks += ticks;
            self.changed.notify_all();
        }
    }

    /// Reports the priority last assigned to `ctx`, if any.
    pub fn priority_of(&self, ctx: ContextId) -> Option<Priority> {
        self.lock().contexts.get(&ctx).and_then(|s| s.priority)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_locked(&self, inner: &Inner) -> TickTime {
        if self.manual {
            TickTime::from_ticks(inner.ticks)
        } else {
            TickTime::from_ticks(self.epoch.elapsed().as_millis() as u64)
        }
    }

    /// Blocks on the condvar until something changes, or until `deadline` on
    /// a wall-clock port.
    fn sleep<'a>(
        &self,
        inner: MutexGuard<'a, Inner>,
        deadline: Option<TickTime>,
    ) -> MutexGuard<'a, Inner> {
        match deadline {
            Some(d) if !self.manual => {
                let now = self.now_locked(&inner);
                let ms = d.saturating_ticks_since(now).max(1);
                self.changed
                    .wait_timeout(inner, Duration::from_millis(ms))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            _ => self
                .changed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new()
    }
}

fn current_context() -> ContextId {
    CURRENT.with(|c| match c.get() {
        Some(id) => id,
        None => {
            let id = ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
            c.set(Some(id));
            id
        }
    })
}

impl Port for HostPort {
    fn now(&self) -> TickTime {
        if self.manual {
            TickTime::from_ticks(self.lock().ticks)
        } else {
            TickTime::from_ticks(self.epoch.elapsed().as_millis() as u64)
        }
    }

    fn current(&self) -> ContextId {
        current_context()
    }

    fn spawn(&self, launch: Launch) -> Result<ContextId> {
        let id = ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
        self.lock().contexts.insert(id, Slot {
            priority: Some(launch.priority),
            ..Slot::default()
        });

        let main = launch.main;
        let spawned = thread::Builder::new()
            .name(launch.name.into())
            .stack_size(launch.stack_len.max(MIN_THREAD_STACK))
            .spawn(move || {
                CURRENT.with(|c| c.set(Some(id)));
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(main)) {
                    if !payload.is::<Ended>() {
                        panic::resume_unwind(payload);
                    }
                }
            });

        match spawned {
            Ok(_) => Ok(id),
            Err(e) => {
                log::warn!("host port: spawn of {} failed: {}", launch.name, e);
                self.lock().contexts.remove(&id);
                Err(Error::InstanceCreateFailure)
            }
        }
    }

    fn park(&self, deadline: Option<TickTime>) {
        let me = current_context();
        let mut inner = self.lock();
        loop {
            let now = self.now_locked(&inner);
            let slot = inner.contexts.entry(me).or_default();
            if slot.terminated {
                drop(inner);
                panic::resume_unwind(Box::new(Ended));
            }
            if !slot.suspended {
                if slot.token {
                    slot.token = false;
                    return;
                }
                if deadline.is_some_and(|d| now >= d) {
                    return;
                }
            }
            let wait_until = if slot.suspended { None } else { deadline };
            inner = self.sleep(inner, wait_until);
        }
    }

    fn unpark(&self, ctx: ContextId) {
        self.lock().contexts.entry(ctx).or_default().token = true;
        self.changed.notify_all();
    }

    fn yield_now(&self) {
        let me = current_context();
        let terminated = self.lock().contexts.get(&me).is_some_and(|s| s.terminated);
        if terminated {
            panic::resume_unwind(Box::new(Ended));
        }
        thread::yield_now();
    }

    fn set_priority(&self, ctx: ContextId, priority: Priority) -> Result<()> {
        self.lock().contexts.entry(ctx).or_default().priority = Some(priority);
        Ok(())
    }

    fn suspend(&self, ctx: ContextId) -> Result<()> {
        let mut inner = self.lock();
        inner.contexts.entry(ctx).or_default().suspended = true;
        if ctx != current_context() {
            return Ok(());
        }
        // Suspending ourselves: stay here until someone resumes us.
        loop {
            let slot = inner.contexts.entry(ctx).or_default();
            if slot.terminated {
                drop(inner);
                panic::resume_unwind(Box::new(Ended));
            }
            if !slot.suspended {
                return Ok(());
            }
            inner = self.sleep(inner, None);
        }
    }

    fn resume(&self, ctx: ContextId) -> Result<()> {
        self.lock().contexts.entry(ctx).or_default().suspended = false;
        self.changed.notify_all();
        Ok(())
    }

    fn terminate(&self, ctx: ContextId) -> Result<()> {
        self.lock().contexts.entry(ctx).or_default().terminated = true;
        self.changed.notify_all();
        Ok(())
    }

    fn exit(&self) -> ! {
        panic::resume_unwind(Box::new(Ended))
    }

    fn lock_scheduler(&self) -> u32 {
        let mut inner = self.lock();
        let previous = inner.lock_depth;
        inner.lock_depth += 1;
        previous
    }

    fn restore_scheduler(&self, previous: u32) {
        self.lock().lock_depth = previous;
    }

    fn fault(&self, fault: Fault) -> ! {
        panic!("kernel fault: {}", fault)
    }
}
