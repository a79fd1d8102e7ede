// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel-services object and the machinery every primitive shares.
//!
//! An [`Os`] owns the registry of every live object, bound to one [`Port`].
//! The per-primitive operations are spread across the primitive modules as
//! `impl<P: Port> Os<P>` blocks; this module holds the parts they all lean on:
//!
//! - the critical section around the registry,
//! - handle validation, creation, lookup by name, and deletion,
//! - the blocking protocol, and
//! - system-wide services: ticks, delays, the scheduler lock, fault handling.
//!
//! # The blocking protocol
//!
//! Every operation that can suspend its caller goes through `Os::block`:
//!
//! 1. Under the critical section, try the operation. If it can complete, it
//!    does, and that's the end of it.
//! 2. Otherwise, unless the caller asked to poll, join the object's wait list
//!    and leave the critical section.
//! 3. Park. On every wakeup, re-enter the critical section and check, in this
//!    order: was a grant left for us (success); is the object gone
//!    (`InstanceInvalid`); has the deadline passed (withdraw and `Timeout`).
//!    If none of these, park again.
//!
//! Nothing ever parks while holding the critical section.
//!
//! # Cancellation
//!
//! A waiter never cancels itself except by timing out. If its context is torn
//! down while parked (its task was deleted), a guard withdraws its wait record
//! and passes along anything it had been granted but not yet claimed.
//!
//! Deleting a task bars its context before the port is asked to stop it, and
//! a barred context can't start a new acquisition. Backends that stop a
//! context lazily can't leak ownership to it that way.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::vec::Vec;

use scopeguard::ScopeGuard;

use crate::config::Config;
use crate::error::{Error, Fault, Result};
use crate::event::Event;
use crate::handle::{Arena, Handle};
use crate::list::{Claim, WaitList};
use crate::mem::MemPool;
use crate::mutex::Mutex;
use crate::port::{ContextId, Port};
use crate::queue::Queue;
use crate::rwlock::RwLock;
use crate::semaphore::Semaphore;
use crate::task::{Priority, Task};
use crate::time::{TickTime, Timeout};
use crate::timer::{Timer, TimerHandle};

/// Overall condition of an [`Os`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OsState {
    /// Scheduling normally.
    Running,
    /// The scheduler is suspended (see [`Os::suspend_scheduler`]).
    Locked,
    /// A fault was raised; nothing further can be trusted.
    Faulted,
}

/// Proof that the scheduler was suspended, holding the state to restore.
///
/// Hand it back, unmodified, to [`Os::resume_scheduler`].
#[must_use = "the scheduler stays suspended until this token is returned"]
#[derive(Debug)]
pub struct SchedulerToken {
    previous: u32,
}

/// The registry, one arena per object kind.
pub(crate) struct State {
    pub(crate) pools: Arena<MemPool>,
    pub(crate) tasks: Arena<Task>,
    pub(crate) mutexes: Arena<Mutex>,
    pub(crate) rwlocks: Arena<RwLock>,
    pub(crate) semaphores: Arena<Semaphore>,
    pub(crate) events: Arena<Event>,
    pub(crate) queues: Arena<Queue>,
    pub(crate) timers: Arena<Timer>,
    pub(crate) timer_service: Option<ContextId>,
    /// The timer whose callback the service is running right now.
    pub(crate) timer_firing: Option<TimerHandle>,
    /// Contexts waiting for `timer_firing` to clear.
    pub(crate) timer_watchers: Vec<ContextId>,
    /// Contexts whose tasks were deleted but may not have stopped yet. They
    /// can't acquire anything.
    condemned: Vec<ContextId>,
}

impl State {
    const fn new(limit: usize) -> Self {
        Self {
            pools: Arena::new(limit),
            tasks: Arena::new(limit),
            mutexes: Arena::new(limit),
            rwlocks: Arena::new(limit),
            semaphores: Arena::new(limit),
            events: Arena::new(limit),
            queues: Arena::new(limit),
            timers: Arena::new(limit),
            timer_service: None,
            timer_firing: None,
            timer_watchers: Vec::new(),
            condemned: Vec::new(),
        }
    }

    /// Bars `ctx` from acquiring anything from now on.
    pub(crate) fn condemn(&mut self, ctx: ContextId) -> Result<()> {
        if !self.is_condemned(ctx) {
            self.condemned.try_reserve(1).map_err(|_| Error::MemAllocFailure)?;
            self.condemned.push(ctx);
        }
        Ok(())
    }

    pub(crate) fn is_condemned(&self, ctx: ContextId) -> bool {
        self.condemned.contains(&ctx)
    }

    /// Lifts the bar on `ctx`, once its old task has really stopped or the
    /// id has been given to a new one.
    pub(crate) fn pardon(&mut self, ctx: ContextId) {
        self.condemned.retain(|&c| c != ctx);
    }

    /// The priority `ctx` waits at: its task's, or `Normal` for contexts that
    /// weren't created as tasks.
    pub(crate) fn priority_of(&self, ctx: ContextId) -> Priority {
        self.tasks
            .iter()
            .find(|(_, t)| t.context() == Some(ctx))
            .map_or(Priority::Normal, |(_, t)| t.priority())
    }

    pub(crate) fn set_blocked(&mut self, ctx: ContextId, blocked: bool) {
        if let Some((_, t)) =
            self.tasks.iter_mut().find(|(_, t)| t.context() == Some(ctx))
        {
            t.set_blocked(blocked);
        }
    }

    /// Scrubs `ctx` from every object: wait records, unclaimed grants, and
    /// lock ownership. Returns the number of locks it held.
    pub(crate) fn forget_context(
        &mut self,
        ctx: ContextId,
        wake: &mut dyn FnMut(ContextId),
    ) -> usize {
        let owned = self
            .mutexes
            .iter()
            .filter(|(_, m)| m.owner() == Some(ctx))
            .count()
            + self.rwlocks.iter().filter(|(_, r)| r.is_held_by(ctx)).count();
        for (_, o) in self.pools.iter_mut() {
            o.forget(ctx, wake);
        }
        for (_, o) in self.mutexes.iter_mut() {
            o.forget(ctx, wake);
        }
        for (_, o) in self.rwlocks.iter_mut() {
            o.forget(ctx, wake);
        }
        for (_, o) in self.semaphores.iter_mut() {
            o.forget(ctx, wake);
        }
        for (_, o) in self.events.iter_mut() {
            o.forget(ctx, wake);
        }
        for (_, o) in self.queues.iter_mut() {
            o.forget(ctx, wake);
        }
        owned
    }
}

/// Implemented by every kind of object the registry holds.
pub(crate) trait Object: Sized {
    /// The arena objects of this kind live in.
    fn arena(state: &mut State) -> &mut Arena<Self>;

    /// Diagnostic name, as given at creation.
    fn name(&self) -> &'static str;

    /// Drops `ctx` from this object's wait lists, passing on anything it had
    /// been granted, and releases anything it holds here.
    fn forget(&mut self, _ctx: ContextId, _wake: &mut dyn FnMut(ContextId)) {}

    /// Called just before the object is deleted; wakes its waiters so they
    /// can notice.
    fn close(&mut self, _wake: &mut dyn FnMut(ContextId)) {}
}

/// What a blocking operation's step function is being asked to do.
pub(crate) enum Turn<G> {
    /// First attempt, on behalf of this context. Complete the operation if
    /// possible, or return `None` to wait.
    Try(ContextId),
    /// The waiter was handed this grant; finish the operation with it.
    Granted(G),
}

/// Kernel services over a backend [`Port`].
///
/// An `Os` can be built in a `const` context, so the usual arrangement on a
/// target is a `static`:
///
/// ```ignore
/// static OS: Os<MyPort> = Os::new(MyPort::new(), Config::new());
/// ```
///
/// Operations that start new contexts ([`Os::task_create`] and
/// [`Os::start_timer_service`]) need `&'static self`, because those contexts
/// refer back to the `Os`. On a host, `Box::leak` gives you that.
pub struct Os<P: Port> {
    port: P,
    config: Config,
    state: critical_section::Mutex<RefCell<State>>,
    lock_depth: AtomicU32,
    faulted: AtomicBool,
}

impl<P: Port> core::fmt::Debug for Os<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Os")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<P: Port> Os<P> {
    /// Creates an `Os` with an empty registry.
    pub const fn new(port: P, config: Config) -> Self {
        Self {
            port,
            state: critical_section::Mutex::new(RefCell::new(State::new(
                config.max_objects,
            ))),
            config,
            lock_depth: AtomicU32::new(0),
            faulted: AtomicBool::new(false),
        }
    }

    /// The backend this `Os` runs on.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// The configuration this `Os` was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn with_state<R>(&self, body: impl FnOnce(&mut State) -> R) -> R {
        critical_section::with(|cs| body(&mut self.state.borrow_ref_mut(cs)))
    }

    pub(crate) fn waker(&self) -> impl FnMut(ContextId) + '_ {
        move |ctx| self.port.unpark(ctx)
    }

    /// Registers a new object, enforcing unique non-empty names per kind.
    pub(crate) fn insert<T: Object>(&self, value: T) -> Result<Handle<T>> {
        self.insert_with(value.name(), || Ok(value))
    }

    /// Like [`insert`](Self::insert), but only calls `build` once the name
    /// and the kind's limit have been checked, in the same critical section.
    /// Creation that consumes a caller's buffer goes through here, so a
    /// refused create leaves the buffer untouched.
    pub(crate) fn insert_with<T: Object>(
        &self,
        name: &'static str,
        build: impl FnOnce() -> Result<T>,
    ) -> Result<Handle<T>> {
        let h = self.with_state(|s| {
            let arena = T::arena(s);
            if !name.is_empty() && arena.find(|o| o.name() == name).is_some() {
                return Err(Error::InstanceDuplicate);
            }
            arena.reserve()?;
            arena.insert(build()?)
        })?;
        log::debug!("created {:?} {:?}", h, name);
        Ok(h)
    }

    /// Runs `body` on a validated object.
    pub(crate) fn read<T: Object, R>(
        &self,
        h: Handle<T>,
        body: impl FnOnce(&T) -> R,
    ) -> Result<R> {
        self.with_state(|s| T::arena(s).get(h).map(body))
    }

    /// Runs `body` on a validated object, with a way to wake contexts.
    pub(crate) fn modify<T: Object, R>(
        &self,
        h: Handle<T>,
        body: impl FnOnce(&mut T, &mut dyn FnMut(ContextId)) -> Result<R>,
    ) -> Result<R> {
        self.with_state(|s| body(T::arena(s).get_mut(h)?, &mut self.waker()))
    }

    /// Finds a live object by name.
    pub(crate) fn lookup<T: Object>(&self, name: &str) -> Result<Handle<T>> {
        self.with_state(|s| T::arena(s).find(|o| o.name() == name))
            .ok_or(Error::InstanceNotFound)
    }

    /// Deletes an object once `check` approves, waking its waiters. The object
    /// is handed back so that its storage is released outside the critical
    /// section.
    pub(crate) fn remove<T: Object>(
        &self,
        h: Handle<T>,
        check: impl FnOnce(&T) -> Result<()>,
    ) -> Result<T> {
        let obj = self.with_state(|s| {
            let arena = T::arena(s);
            let obj = arena.get_mut(h)?;
            check(obj)?;
            obj.close(&mut self.waker());
            arena.remove(h)
        })?;
        log::debug!("deleted {:?}", h);
        Ok(obj)
    }

    /// Runs a potentially-blocking operation; see the module docs.
    ///
    /// `would_block` is returned when `timeout` is a poll and `step` can't
    /// complete right away. `list` picks which of the object's wait lists to
    /// join, and `want` is this waiter's condition in that list.
    pub(crate) fn block<T, W, G, R>(
        &self,
        h: Handle<T>,
        timeout: Timeout,
        would_block: Error,
        want: W,
        list: fn(&mut T) -> &mut WaitList<W, G>,
        mut step: impl FnMut(&mut T, Turn<G>, &mut dyn FnMut(ContextId)) -> Result<Option<R>>,
    ) -> Result<R>
    where
        T: Object,
    {
        let me = self.port.current();
        let deadline = timeout.deadline_from(self.port.now());

        let done = self.with_state(|s| {
            if s.is_condemned(me) {
                return Err(Error::InstanceInvalid);
            }
            let priority = s.priority_of(me);
            let obj = T::arena(s).get_mut(h)?;
            if let Some(r) = step(obj, Turn::Try(me), &mut self.waker())? {
                return Ok(Some(r));
            }
            if timeout.is_poll() {
                return Err(would_block);
            }
            list(obj).insert(me, priority, want)?;
            s.set_blocked(me, true);
            Ok(None)
        })?;
        if let Some(r) = done {
            return Ok(r);
        }

        // Runs only if we unwind out of `park`.
        let guard = scopeguard::guard((), |()| {
            self.with_state(|s| {
                if let Ok(obj) = T::arena(s).get_mut(h) {
                    obj.forget(me, &mut self.waker());
                }
                s.set_blocked(me, false);
            });
        });

        loop {
            self.port.park(deadline);

            let outcome = self.with_state(|s| {
                let outcome = match T::arena(s).get_mut(h) {
                    Err(_) => Some(Err(Error::InstanceInvalid)),
                    Ok(obj) => match list(obj).claim(me) {
                        Claim::Granted(g) => Some(
                            step(obj, Turn::Granted(g), &mut self.waker())
                                .and_then(|r| r.ok_or(Error::Unknown)),
                        ),
                        Claim::Missing => Some(Err(Error::InstanceInvalid)),
                        Claim::Pending if self.expired(deadline) => {
                            list(obj).withdraw(me);
                            Some(Err(Error::Timeout))
                        }
                        Claim::Pending => None,
                    },
                };
                if outcome.is_some() {
                    s.set_blocked(me, false);
                }
                outcome
            });

            if let Some(result) = outcome {
                ScopeGuard::into_inner(guard);
                return result;
            }
        }
    }

    fn expired(&self, deadline: Option<TickTime>) -> bool {
        deadline.is_some_and(|d| self.port.now() >= d)
    }

    /// Returns the tick counter.
    pub fn tick_count(&self) -> TickTime {
        self.port.now()
    }

    /// Identifies the calling context.
    pub fn current_context(&self) -> ContextId {
        self.port.current()
    }

    /// Blocks the caller for `ticks` ticks. `delay(0)` just yields.
    pub fn delay(&self, ticks: u32) {
        if ticks == 0 {
            self.port.yield_now();
        } else {
            self.sleep_until(self.port.now() + u64::from(ticks));
        }
    }

    /// Blocks the caller until the tick counter reaches `until`.
    ///
    /// This is the drift-free way to run something periodically: advance
    /// `until` by the period each time around. Fails with `Param` if `until`
    /// has already passed.
    pub fn delay_until(&self, until: TickTime) -> Result<()> {
        if until < self.port.now() {
            return Err(Error::Param);
        }
        self.sleep_until(until);
        Ok(())
    }

    fn sleep_until(&self, until: TickTime) {
        let me = self.port.current();
        self.with_state(|s| s.set_blocked(me, true));
        let _unblock = scopeguard::guard((), |()| {
            self.with_state(|s| s.set_blocked(me, false));
        });
        // Unpark tokens meant for other purposes may cut this short; keep
        // going until the time has really come.
        while self.port.now() < until {
            self.port.park(Some(until));
        }
    }

    /// Offers the processor to other ready tasks.
    pub fn yield_now(&self) {
        self.port.yield_now();
    }

    /// Suspends task switching until the returned token is passed to
    /// [`resume_scheduler`](Self::resume_scheduler). Calls nest; restore in
    /// reverse order.
    pub fn suspend_scheduler(&self) -> SchedulerToken {
        let previous = self.port.lock_scheduler();
        self.lock_depth.store(previous + 1, Ordering::Release);
        SchedulerToken { previous }
    }

    /// Restores the scheduler state captured by `token`.
    pub fn resume_scheduler(&self, token: SchedulerToken) {
        self.port.restore_scheduler(token.previous);
        self.lock_depth.store(token.previous, Ordering::Release);
    }

    /// Reports whether the system is running, locked, or faulted.
    pub fn state(&self) -> OsState {
        if self.faulted.load(Ordering::Acquire) {
            OsState::Faulted
        } else if self.lock_depth.load(Ordering::Acquire) > 0 {
            OsState::Locked
        } else {
            OsState::Running
        }
    }

    /// Escalates an unrecoverable condition. The system is marked faulted and
    /// the port stops it; this does not return.
    pub fn fault(&self, fault: Fault) -> ! {
        self.faulted.store(true, Ordering::Release);
        log::error!("fault: {}", fault);
        self.port.fault(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    use crate::testutil::{manual_os, spawn_os};

    #[test]
    fn test_scheduler_tokens_nest() {
        let os = spawn_os();
        assert_eq!(os.state(), OsState::Running);
        let outer = os.suspend_scheduler();
        let inner = os.suspend_scheduler();
        assert_eq!(os.state(), OsState::Locked);
        os.resume_scheduler(inner);
        assert_eq!(os.state(), OsState::Locked);
        os.resume_scheduler(outer);
        assert_eq!(os.state(), OsState::Running);
    }

    #[test]
    fn test_delay_waits_at_least_that_long() {
        let os = spawn_os();
        let start = os.tick_count();
        os.delay(15);
        assert!(os.tick_count() >= start + 15);
        // Zero is a yield, and returns.
        os.delay(0);
    }

    #[test]
    fn test_delay_until_rejects_the_past() {
        let os = manual_os();
        os.port().advance(100);
        assert_eq!(os.delay_until(TickTime::from_ticks(50)), Err(Error::Param));
        // Now is not the past.
        assert_eq!(os.delay_until(os.tick_count()), Ok(()));
    }

    #[test]
    fn test_fault_marks_system_faulted() {
        let os = spawn_os();
        let caught = panic::catch_unwind(AssertUnwindSafe(|| os.fault(Fault::CorruptFreeList)));
        assert!(caught.is_err());
        assert_eq!(os.state(), OsState::Faulted);
    }

    #[test]
    fn test_stale_and_unissued_handles() {
        let os = spawn_os();
        let other = spawn_os();
        let s = os.semaphore_create("", 1, 1).unwrap();
        os.semaphore_delete(s).unwrap();
        assert_eq!(os.semaphore_count(s), Err(Error::InstanceInvalid));
        // Slot 0 of the other Os was never issued.
        assert_eq!(other.semaphore_count(s), Err(Error::NullRef));
    }

    #[test]
    fn test_object_limit() {
        let os: &'static Os<crate::HostPort> = std::boxed::Box::leak(std::boxed::Box::new(
            Os::new(crate::HostPort::new(), Config::new().max_objects(2)),
        ));
        os.event_create("a").unwrap();
        os.event_create("b").unwrap();
        assert_eq!(os.event_create("c"), Err(Error::InstanceCreateFailure));
        // Limits are per kind.
        os.mutex_create("c").unwrap();
    }

    #[test]
    fn test_suspended_scheduler_still_hands_off() {
        use std::sync::mpsc;

        use crate::task::{TaskSpec, TaskState};
        use crate::testutil::wait_until;

        let os = spawn_os();
        let sem = os.semaphore_create("gate", 1, 0).unwrap();
        let (tx, rx) = mpsc::channel();
        let t = os
            .task_create(TaskSpec::new("taker"), move || {
                tx.send(os.semaphore_take(sem, Timeout::FOREVER)).unwrap();
            })
            .unwrap();
        wait_until(|| os.task_state(t) == Ok(TaskState::Blocked));

        let token = os.suspend_scheduler();
        assert_eq!(os.state(), OsState::Locked);
        os.semaphore_release(sem).unwrap();
        // The permit went to the waiter, not back to the count.
        assert_eq!(os.semaphore_count(sem), Ok(0));
        os.resume_scheduler(token);

        assert_eq!(os.state(), OsState::Running);
        assert_eq!(rx.recv().unwrap(), Ok(()));
    }
}
