// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software timers, and the service task that fires them.
//!
//! A timer runs a callback once ([`TimerMode::OneShot`]) or every period
//! ([`TimerMode::Periodic`]) after it's started. Callbacks all run in one
//! dedicated task, started with [`Os::start_timer_service`], so they must not
//! block: a callback that waits holds up every other timer.
//!
//! Periodic timers are drift-free. Each deadline is the previous deadline
//! plus the period, not the time the callback happened to run plus the
//! period, so a timer started at tick `s` with period `p` is due at `s + kp`
//! for every `k`, however late the service gets to each one.
//!
//! # States
//!
//! ```text
//!  create -> Idle --start--> Active --(one-shot fires)--> Expired
//!             ^                |  \
//!             `-----stop-------'   `--(periodic fires)--> Active
//! ```
//!
//! `stop` returns any timer to `Idle`, and `start` may be called in any
//! state to (re)arm it. Deleting a timer invalidates its handle.
//!
//! Once `stop` or `delete` returns, the callback isn't running and won't run
//! again until the timer is restarted. If the service is partway through the
//! callback, the caller waits for it to finish. A callback may stop or delete
//! its own timer; that returns at once.

use core::fmt;

use alloc::boxed::Box;

use crate::error::{Error, Result};
use crate::handle::{Arena, Handle};
use crate::os::{Object, Os, State};
use crate::port::{ContextId, Port};
use crate::task::{TaskHandle, TaskSpec};
use crate::time::TickTime;

/// Name of the timer-service task.
pub const TIMER_SERVICE_NAME: &str = "timer-service";

/// Whether a timer fires once or repeatedly.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerMode {
    /// Fires once per start.
    OneShot,
    /// Fires every period until stopped.
    Periodic,
}

/// Lifecycle state of a timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerState {
    /// Created or stopped; not counting.
    Idle,
    /// Counting toward its next deadline.
    Active,
    /// A one-shot timer that has fired.
    Expired,
    /// Being deleted.
    Deleted,
    /// A periodic timer whose next deadline is past the end of time.
    Error,
}

type Callback = Box<dyn FnMut() + Send + 'static>;

/// A software timer object.
pub struct Timer {
    name: &'static str,
    mode: TimerMode,
    state: TimerState,
    period: u32,
    deadline: TickTime,
    /// Absent while the service is running it.
    callback: Option<Callback>,
}

/// Handle to a [`Timer`].
pub type TimerHandle = Handle<Timer>;

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("period", &self.period)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Object for Timer {
    fn arena(state: &mut State) -> &mut Arena<Self> {
        &mut state.timers
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn close(&mut self, _wake: &mut dyn FnMut(ContextId)) {
        self.state = TimerState::Deleted;
    }
}

/// What the service should do next.
enum Next {
    Fire(TimerHandle, Callback),
    Sleep(Option<TickTime>),
}

/// Picks the most overdue timer that's due at `now` and advances it, or else
/// reports the nearest deadline.
fn next_due(timers: &mut Arena<Timer>, now: TickTime) -> Next {
    let due = timers
        .iter()
        .filter(|(_, t)| t.state == TimerState::Active && t.callback.is_some())
        .min_by_key(|(_, t)| t.deadline)
        .map(|(h, t)| (h, t.deadline));

    match due {
        Some((h, deadline)) if deadline <= now => {
            let Ok(t) = timers.get_mut(h) else {
                return Next::Sleep(None);
            };
            match t.mode {
                TimerMode::OneShot => t.state = TimerState::Expired,
                TimerMode::Periodic => match t.deadline.checked_add(u64::from(t.period)) {
                    Some(next) => t.deadline = next,
                    None => {
                        log::warn!("timer {:?} ran out of ticks", t.name);
                        t.state = TimerState::Error;
                    }
                },
            }
            match t.callback.take() {
                Some(cb) => Next::Fire(h, cb),
                None => Next::Sleep(None),
            }
        }
        Some((_, deadline)) => Next::Sleep(Some(deadline)),
        None => Next::Sleep(None),
    }
}

/// # Timers
impl<P: Port> Os<P> {
    /// Creates an idle timer that will run `callback` each time it fires.
    pub fn timer_create(
        &self,
        name: &'static str,
        mode: TimerMode,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerHandle> {
        self.insert(Timer {
            name,
            mode,
            state: TimerState::Idle,
            period: 0,
            deadline: TickTime::ZERO,
            callback: Some(Box::new(callback)),
        })
    }

    /// Arms the timer to fire `period` ticks from now (and, if periodic, every
    /// `period` ticks after that). Restarting an active timer re-arms it.
    pub fn timer_start(&self, timer: TimerHandle, period: u32) -> Result<()> {
        if period == 0 {
            return Err(Error::Param);
        }
        let now = self.tick_count();
        self.modify(timer, |t, _| {
            t.deadline = now.checked_add(u64::from(period)).ok_or(Error::Param)?;
            t.period = period;
            t.state = TimerState::Active;
            Ok(())
        })?;
        self.nudge_timer_service();
        Ok(())
    }

    /// Disarms the timer, waiting out a callback already underway.
    pub fn timer_stop(&self, timer: TimerHandle) -> Result<()> {
        self.modify(timer, |t, _| {
            t.state = TimerState::Idle;
            Ok(())
        })?;
        self.nudge_timer_service();
        self.wait_out_callback(timer);
        Ok(())
    }

    /// Deletes the timer. It won't fire again, even if it was due, and a
    /// callback already underway has finished by the time this returns.
    pub fn timer_delete(&self, timer: TimerHandle) -> Result<()> {
        self.remove(timer, |_| Ok(()))?;
        self.nudge_timer_service();
        self.wait_out_callback(timer);
        Ok(())
    }

    /// Reports the timer's state.
    pub fn timer_state(&self, timer: TimerHandle) -> Result<TimerState> {
        self.read(timer, |t| t.state)
    }

    /// The timer's name.
    pub fn timer_name(&self, timer: TimerHandle) -> Result<&'static str> {
        self.read(timer, |t| t.name)
    }

    /// Finds a timer by name.
    pub fn timer_find(&self, name: &str) -> Result<TimerHandle> {
        self.lookup(name)
    }

    /// Starts the task that runs timer callbacks, at the priority and stack
    /// size given in the [`Config`][crate::Config]. Timers count while it's
    /// absent, but nothing fires.
    ///
    /// Fails with `InstanceDuplicate` if it's already running.
    pub fn start_timer_service(&'static self) -> Result<TaskHandle> {
        let spec = TaskSpec::new(TIMER_SERVICE_NAME)
            .priority(self.config().timer_service_priority)
            .stack_size(self.config().timer_service_stack);
        let h = self.task_create(spec, move || self.run_timer_service())?;
        log::info!("timer service started");
        Ok(h)
    }

    fn nudge_timer_service(&self) {
        if let Some(ctx) = self.with_state(|s| s.timer_service) {
            self.port().unpark(ctx);
        }
    }

    /// Returns once `timer`'s callback isn't running. The service itself
    /// never waits, since it's the one running it.
    fn wait_out_callback(&self, timer: TimerHandle) {
        let me = self.port().current();
        loop {
            let listed = self.with_state(|s| {
                if s.timer_service == Some(me) || s.timer_firing != Some(timer) {
                    return None;
                }
                if s.timer_watchers.contains(&me) {
                    return Some(true);
                }
                let room = s.timer_watchers.try_reserve(1).is_ok();
                if room {
                    s.timer_watchers.push(me);
                }
                Some(room)
            });
            match listed {
                None => return,
                Some(true) => self.port().park(None),
                // Nowhere to leave our name, so poll.
                Some(false) => self.port().yield_now(),
            }
        }
    }

    /// Ends a firing: puts the callback back, unless the timer was deleted
    /// meanwhile, and releases anyone waiting on it.
    fn finish_firing(&self, h: TimerHandle, callback: Callback) {
        let (orphan, watchers) = self.with_state(|s| {
            s.timer_firing = None;
            let orphan = match s.timers.get_mut(h) {
                Ok(t) => {
                    t.callback = Some(callback);
                    None
                }
                Err(_) => Some(callback),
            };
            (orphan, core::mem::take(&mut s.timer_watchers))
        });
        drop(orphan);
        for ctx in watchers {
            self.port().unpark(ctx);
        }
    }

    fn run_timer_service(&self) -> ! {
        let me = self.port().current();
        self.with_state(|s| s.timer_service = Some(me));
        loop {
            let now = self.tick_count();
            let next = self.with_state(|s| {
                let next = next_due(&mut s.timers, now);
                if let Next::Fire(h, _) = next {
                    s.timer_firing = Some(h);
                }
                next
            });
            match next {
                Next::Fire(h, callback) => {
                    let mut firing =
                        scopeguard::guard(callback, |callback| self.finish_firing(h, callback));
                    let run: &mut Callback = &mut firing;
                    run();
                }
                Next::Sleep(deadline) => self.port().park(deadline),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::testutil::{manual_os, wait_until};

    const QUIET: Duration = Duration::from_millis(50);

    #[test]
    fn test_periodic_fires_without_drift() {
        let os = manual_os();
        os.start_timer_service().unwrap();
        let (tx, rx) = mpsc::channel();
        let t = os
            .timer_create("tick", TimerMode::Periodic, move || {
                let _ = tx.send(os.tick_count().ticks());
            })
            .unwrap();
        os.timer_start(t, 10).unwrap();
        assert_eq!(os.timer_state(t), Ok(TimerState::Active));

        os.port().advance(10);
        assert_eq!(rx.recv().unwrap(), 10);
        // Late by 5: the next deadline is still 20.
        os.port().advance(15);
        assert_eq!(rx.recv().unwrap(), 25);
        os.port().advance(5);
        let third = rx.recv().unwrap();
        assert_eq!(third, 30);
        assert_eq!(os.timer_state(t), Ok(TimerState::Active));

        os.timer_stop(t).unwrap();
        assert_eq!(os.timer_state(t), Ok(TimerState::Idle));
        os.port().advance(100);
        assert!(rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn test_one_shot_expires() {
        let os = manual_os();
        os.start_timer_service().unwrap();
        let (tx, rx) = mpsc::channel();
        let t = os
            .timer_create("once", TimerMode::OneShot, move || {
                let _ = tx.send(());
            })
            .unwrap();
        assert_eq!(os.timer_state(t), Ok(TimerState::Idle));
        os.timer_start(t, 5).unwrap();
        os.port().advance(5);
        rx.recv().unwrap();
        wait_until(|| os.timer_state(t) == Ok(TimerState::Expired));
        os.port().advance(50);
        assert!(rx.recv_timeout(QUIET).is_err());

        // Restartable.
        os.timer_start(t, 5).unwrap();
        os.port().advance(5);
        rx.recv().unwrap();
    }

    #[test]
    fn test_deleted_timer_never_fires() {
        let os = manual_os();
        os.start_timer_service().unwrap();
        let (tx, rx) = mpsc::channel();
        let t = os
            .timer_create("gone", TimerMode::OneShot, move || {
                let _ = tx.send(());
            })
            .unwrap();
        os.timer_start(t, 5).unwrap();
        os.timer_delete(t).unwrap();
        os.port().advance(10);
        // The callback (and its sender) were dropped with the timer.
        assert_eq!(
            rx.recv_timeout(QUIET),
            Err(mpsc::RecvTimeoutError::Disconnected),
        );
        assert_eq!(os.timer_state(t), Err(Error::InstanceInvalid));
    }

    #[test]
    fn test_params_and_lookup() {
        let os = manual_os();
        let t = os.timer_create("named", TimerMode::OneShot, || {}).unwrap();
        assert_eq!(os.timer_start(t, 0), Err(Error::Param));
        assert_eq!(os.timer_name(t), Ok("named"));
        assert_eq!(os.timer_find("named"), Ok(t));
    }

    #[test]
    fn test_service_starts_once() {
        let os = manual_os();
        let h = os.start_timer_service().unwrap();
        assert_eq!(os.start_timer_service(), Err(Error::InstanceDuplicate));
        assert_eq!(os.task_priority(h), Ok(os.config().timer_service_priority));
        assert_eq!(os.task_find(TIMER_SERVICE_NAME), Ok(h));
    }

    #[test]
    fn test_periodic_overflow_is_error() {
        let mut timers = Arena::new(4);
        let h = timers
            .insert(Timer {
                name: "end",
                mode: TimerMode::Periodic,
                state: TimerState::Active,
                period: 10,
                deadline: TickTime::from_ticks(u64::MAX - 5),
                callback: Some(Box::new(|| {})),
            })
            .unwrap();
        let now = TickTime::from_ticks(u64::MAX);
        assert!(matches!(next_due(&mut timers, now), Next::Fire(fired, _) if fired == h));
        assert_eq!(timers.get(h).unwrap().state, TimerState::Error);
    }

    #[test]
    fn test_delete_waits_for_running_callback() {
        let os = manual_os();
        os.start_timer_service().unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let t = os
            .timer_create("slow", TimerMode::OneShot, move || {
                let _ = started_tx.send(());
                let _ = go_rx.recv();
            })
            .unwrap();
        os.timer_start(t, 1).unwrap();
        os.port().advance(1);
        started_rx.recv().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            done_tx.send(os.timer_delete(t)).unwrap();
        });
        assert!(done_rx.recv_timeout(QUIET).is_err());

        go_tx.send(()).unwrap();
        assert_eq!(done_rx.recv().unwrap(), Ok(()));
        assert_eq!(os.timer_state(t), Err(Error::InstanceInvalid));
    }

    #[test]
    fn test_callback_can_stop_its_own_timer() {
        let os = manual_os();
        os.start_timer_service().unwrap();
        let (tx, rx) = mpsc::channel();
        let me = std::sync::Arc::new(std::sync::OnceLock::new());
        let handle = me.clone();
        let t = os
            .timer_create("self-stop", TimerMode::Periodic, move || {
                if let Some(&h) = handle.get() {
                    let _ = tx.send(os.timer_stop(h));
                }
            })
            .unwrap();
        me.set(t).unwrap();
        os.timer_start(t, 2).unwrap();
        os.port().advance(2);
        assert_eq!(rx.recv().unwrap(), Ok(()));
        wait_until(|| os.timer_state(t) == Ok(TimerState::Idle));
        os.port().advance(10);
        assert!(rx.recv_timeout(QUIET).is_err());
    }
}
