// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capability interface a backend kernel provides.
//!
//! Nothing in the primitive modules talks to a kernel directly. Instead, an
//! [`Os`][crate::Os] is parameterized by a [`Port`], which supplies:
//!
//! - a tick source ([`Port::now`]),
//! - the identity of the calling context ([`Port::current`]),
//! - a way to start new contexts ([`Port::spawn`]),
//! - a block/unblock pair ([`Port::park`] / [`Port::unpark`]),
//! - scheduling controls (priority, suspend/resume, termination, scheduler
//!   lock), and
//! - an escape hatch for unrecoverable faults ([`Port::fault`]).
//!
//! The remaining capability, critical sections, comes from the
//! `critical-section` crate rather than from this trait, so the port registers
//! an implementation there. On Cortex-M that's `cortex-m`'s
//! `critical-section-single-core`; the `std` feature selects the
//! `critical-section` crate's host implementation.
//!
//! # Park tokens
//!
//! `park`/`unpark` use *token* semantics, like `std::thread::park`: each
//! context has a single wake token. `unpark` sets it; `park` consumes it,
//! returning immediately if it was already set. This is what lets a primitive
//! register a waiter under a critical section, leave the critical section, and
//! only then park, without losing a wakeup that lands in between.
//!
//! `park` is also allowed to return spuriously. Callers always re-check their
//! condition afterward.

use alloc::boxed::Box;
use core::fmt;

use crate::error::{Fault, Result};
use crate::task::Priority;
use crate::time::TickTime;

#[cfg(feature = "std")]
pub mod host;
#[cfg(all(feature = "systick", target_arch = "arm", target_os = "none"))]
pub mod systick;

/// Identifies one execution context in the backend.
///
/// Contexts created through [`Os::task_create`][crate::Os::task_create] have
/// one, but so does any other code the backend runs (an init thread, or a test
/// harness thread on a host). The layer uses these to record mutex owners and
/// waiters.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextId(pub u32);

/// Everything a port needs to start a new execution context.
pub struct Launch {
    /// Diagnostic name of the task.
    pub name: &'static str,
    /// Initial priority.
    pub priority: Priority,
    /// Base of the stack region reserved for this context.
    ///
    /// The region stays owned by the layer until the task is deleted. Ports
    /// that can't place a context on caller-provided memory (such as the host
    /// port) only use `stack_len` as a size hint.
    pub stack: *mut u8,
    /// Size of the stack region in bytes.
    pub stack_len: usize,
    /// The code to run. Returning from it ends the context.
    pub main: Box<dyn FnOnce() + Send + 'static>,
}

impl fmt::Debug for Launch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launch")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("stack", &self.stack)
            .field("stack_len", &self.stack_len)
            .finish_non_exhaustive()
    }
}

/// Backend kernel capabilities.
///
/// Implementations must be usable from every context at once, hence `Sync`.
/// None of these methods are called while the layer holds its critical
/// section, except `now`, `current`, and `unpark`, which must therefore not
/// block.
pub trait Port: Sync {
    /// Reads the tick counter.
    fn now(&self) -> TickTime;

    /// Identifies the calling context.
    fn current(&self) -> ContextId;

    /// Starts a new context running `launch.main`.
    fn spawn(&self, launch: Launch) -> Result<ContextId>;

    /// Blocks the calling context until its wake token is set, or until
    /// `deadline` passes if one is given. Consumes the token. May return
    /// spuriously.
    fn park(&self, deadline: Option<TickTime>);

    /// Sets `ctx`'s wake token, releasing it from `park`.
    fn unpark(&self, ctx: ContextId);

    /// Offers the processor to other ready contexts.
    fn yield_now(&self);

    /// Changes the scheduling priority of `ctx`.
    fn set_priority(&self, ctx: ContextId, priority: Priority) -> Result<()>;

    /// Removes `ctx` from scheduling until [`Port::resume`]. Suspending the
    /// calling context doesn't return until it's resumed.
    fn suspend(&self, ctx: ContextId) -> Result<()>;

    /// Makes a suspended `ctx` schedulable again.
    fn resume(&self, ctx: ContextId) -> Result<()>;

    /// Ends a context other than the caller. Its stack is not touched again.
    fn terminate(&self, ctx: ContextId) -> Result<()>;

    /// Ends the calling context.
    fn exit(&self) -> !;

    /// Stops preemptive task switching and returns the previous lock state.
    fn lock_scheduler(&self) -> u32;

    /// Restores a lock state returned by [`Port::lock_scheduler`].
    fn restore_scheduler(&self, previous: u32);

    /// Stops the system after an unrecoverable fault.
    fn fault(&self, fault: Fault) -> !;
}
