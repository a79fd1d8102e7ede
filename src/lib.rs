// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A portable RTOS abstraction layer.
//!
//! This provides the usual kit of an embedded kernel (tasks, mutexes,
//! reader-writer locks, semaphores, event flags, message queues, fixed-block
//! memory pools, and software timers) behind one API, on top of whatever
//! kernel actually does the scheduling.
//!
//! # Design principles
//!
//! 1. Be portable. Nothing here talks to a particular kernel. Everything the
//!    layer needs from one is collected in the [`Port`] trait: a tick source,
//!    a way to start contexts, park/unpark, and a few scheduling controls.
//!    Porting to a new kernel means implementing that trait, and nothing else.
//!
//! 2. Be predictable. Every blocking operation takes a [`Timeout`], and every
//!    wait list has a documented release order: mutexes release by priority,
//!    everything else in arrival order. When a resource is released to a
//!    waiter, it's handed over directly, so nobody can take it out from under
//!    the waiter before it runs.
//!
//! 3. Fail loudly, but only when it matters. Ordinary failures come back as
//!    one of a closed set of [`Error`] codes with fixed numeric values.
//!    Conditions that mean the kernel's own bookkeeping can no longer be
//!    trusted (a stack overflow, a corrupted free list) are [`Fault`]s instead,
//!    and stop the system.
//!
//! # About the API
//!
//! All services hang off an [`Os`], which owns the registry of live objects
//! and is bound to one port:
//!
//! ```
//! use osal::{Config, HostPort, Os, Timeout};
//!
//! let os = Os::new(HostPort::new(), Config::new());
//! let sem = os.semaphore_create("ready", 1, 0)?;
//! os.semaphore_release(sem)?;
//! os.semaphore_take(sem, Timeout::POLL)?;
//! # Ok::<(), osal::Error>(())
//! ```
//!
//! Objects are named by typed [`Handle`]s. A handle is only good while its
//! object lives: once the object is deleted, every copy of the handle is
//! rejected with [`Error::InstanceInvalid`], even if the slot gets reused.
//!
//! Operations are grouped by object kind, named `<kind>_<operation>`:
//! `mutex_lock`, `queue_send`, `task_suspend`, and so on. Each kind's module
//! documents its semantics:
//!
//! - [`mem`]: storage for objects, and fixed-block memory pools;
//! - [`mutex`], [`rwlock`], [`semaphore`], [`event`]: synchronization;
//! - [`queue`]: message passing;
//! - [`task`]: tasks and their lifecycle;
//! - [`timer`]: software timers.
//!
//! # Features
//!
//! - `std` (default): the [`HostPort`], which runs each task as a thread, and
//!   the host implementation of `critical-section`.
//! - `systick`: a SysTick-based tick source for Cortex-M ports, in
//!   [`port::systick`].

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(
    elided_lifetimes_in_paths,
    explicit_outlives_requirements,
    missing_debug_implementations,
    missing_docs,
    semicolon_in_expressions_from_macros,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_qualifications,
)]

extern crate alloc;

/// Internal assert macro that doesn't stringify its expression or generate any
/// fancy messages. This means failures must be diagnosed by file:line only, so,
/// don't use this more than once on the same line. In exchange, this makes
/// asserts significantly smaller in terms of text size.
macro_rules! cheap_assert {
    ($x:expr) => {
        if !$x { panic!(); };
    }
}
pub(crate) use cheap_assert;

pub mod config;
pub mod error;
pub mod event;
pub mod handle;
mod list;
pub mod mem;
pub mod mutex;
pub mod os;
pub mod port;
pub mod queue;
pub mod rwlock;
pub mod semaphore;
pub mod task;
pub mod time;
pub mod timer;

pub use config::Config;
pub use error::{Error, Fault, Result};
pub use event::{EventHandle, EventWait};
pub use handle::Handle;
pub use mem::{Block, MemPoolHandle, MemSpace, Storage, Zone};
pub use mutex::MutexHandle;
pub use os::{Os, OsState, SchedulerToken};
pub use port::{ContextId, Launch, Port};
pub use queue::QueueHandle;
pub use rwlock::RwLockHandle;
pub use semaphore::SemaphoreHandle;
pub use task::{Priority, TaskHandle, TaskSpec, TaskState};
pub use time::{TickTime, Timeout};
pub use timer::{TimerHandle, TimerMode, TimerState};

#[cfg(feature = "std")]
pub use port::host::HostPort;

#[cfg(test)]
pub(crate) mod testutil {
    use std::boxed::Box;
    use std::time::{Duration, Instant};
    use std::vec;

    use crate::{Config, HostPort, Os};

    /// An `Os` on a wall-clock host port, leaked so tasks can borrow it.
    pub(crate) fn spawn_os() -> &'static Os<HostPort> {
        Box::leak(Box::new(Os::new(HostPort::new(), Config::new())))
    }

    /// An `Os` whose clock only moves when the test says so.
    pub(crate) fn manual_os() -> &'static Os<HostPort> {
        Box::leak(Box::new(Os::new(HostPort::with_manual_clock(), Config::new())))
    }

    pub(crate) fn leak_buffer(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    /// Polls `cond` until it holds, giving up after a few seconds.
    pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) {
        let give_up = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < give_up, "condition never became true");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
