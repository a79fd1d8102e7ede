// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks: named, prioritized execution contexts with a stack of their own.
//!
//! A task is created from a [`TaskSpec`] and an entry closure. The layer
//! reserves the stack (from the allocator, or from a buffer the caller
//! supplies), records the task, and asks the port to start a context running
//! the closure. The backend scheduler decides when it actually runs.
//!
//! # States
//!
//! ```text
//!   Inactive --> Ready <--> Running <--> Blocked
//!                  \            |
//!                   `------> Terminated        (any) --> Error
//! ```
//!
//! The layer doesn't observe every switch the scheduler makes, so
//! [`Os::task_state`] reports what it can know:
//!
//! - `Running` for the calling task;
//! - `Blocked` while the task waits in a primitive, sleeps, or is suspended;
//! - `Terminated` once its closure has returned or it has called
//!   [`Os::exit_task`];
//! - `Error` after the port reported a stack overflow;
//! - `Ready` otherwise.
//!
//! # Ending a task
//!
//! However a task ends (returning, exiting, or being deleted) it stops
//! waiting on anything, anything it had been handed but not yet taken is
//! passed on, and every mutex it held is released to the next waiter.

use core::fmt;

use alloc::boxed::Box;

use crate::error::{Error, Fault, Result};
use crate::handle::{Arena, Handle};
use crate::mem::{Region, Storage};
use crate::os::{Object, Os, State};
use crate::port::{ContextId, Launch, Port};

/// Scheduling priority, lowest first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    /// Runs only when nothing else can.
    Idle,
    /// Background work.
    Base,
    /// Below normal.
    Low,
    /// The default.
    Normal,
    /// Above normal.
    High,
    /// System services.
    Privilege,
    /// Hard deadlines.
    Realtime,
}

/// Lifecycle state of a task, as reported by [`Os::task_state`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Recorded, but its context hasn't been started.
    Inactive,
    /// Able to run.
    Ready,
    /// This is the calling task.
    Running,
    /// Waiting, sleeping, or suspended.
    Blocked,
    /// Finished.
    Terminated,
    /// Stopped by a stack overflow.
    Error,
}

/// Stack size used when a [`TaskSpec`] doesn't set one.
pub const DEFAULT_STACK_SIZE: usize = 4096;

/// Everything about a task except its code.
///
/// ```
/// use osal::{Priority, TaskSpec};
///
/// let spec = TaskSpec::new("blinky")
///     .priority(Priority::High)
///     .stack_size(1024);
/// ```
#[derive(Debug)]
pub struct TaskSpec {
    name: &'static str,
    priority: Priority,
    stack_size: usize,
    storage: Storage,
}

impl TaskSpec {
    /// A `Normal`-priority task with an allocated stack of
    /// [`DEFAULT_STACK_SIZE`] bytes.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            priority: Priority::Normal,
            stack_size: DEFAULT_STACK_SIZE,
            storage: Storage::Pool,
        }
    }

    /// Sets the starting priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the stack size in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Places the stack in `buf`, using all of it. Delete such a task with
    /// [`Os::task_delete_static`] to get the buffer back.
    pub fn static_stack(mut self, buf: &'static mut [u8]) -> Self {
        self.stack_size = buf.len().saturating_sub(8);
        self.storage = Storage::External(buf);
        self
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Life {
    Inactive,
    Started,
    Terminated,
    Faulted,
}

/// A task record.
pub struct Task {
    name: &'static str,
    priority: Priority,
    ctx: Option<ContextId>,
    life: Life,
    blocked: bool,
    suspended: bool,
    stack: Region,
}

/// Handle to a [`Task`].
pub type TaskHandle = Handle<Task>;

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("ctx", &self.ctx)
            .field("life", &self.life)
            .finish()
    }
}

impl Task {
    pub(crate) fn context(&self) -> Option<ContextId> {
        self.ctx
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    fn is_live(&self) -> bool {
        matches!(self.life, Life::Inactive | Life::Started)
    }

    fn state(&self, current: ContextId) -> TaskState {
        match self.life {
            Life::Inactive => TaskState::Inactive,
            Life::Terminated => TaskState::Terminated,
            Life::Faulted => TaskState::Error,
            Life::Started if self.blocked || self.suspended => TaskState::Blocked,
            Life::Started if self.ctx == Some(current) => TaskState::Running,
            Life::Started => TaskState::Ready,
        }
    }
}

impl Object for Task {
    fn arena(state: &mut State) -> &mut Arena<Self> {
        &mut state.tasks
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Scrubs a finished context from every object, complaining if it still held
/// locks.
fn release_context(
    s: &mut State,
    ctx: ContextId,
    name: &str,
    wake: &mut dyn FnMut(ContextId),
) {
    let owned = s.forget_context(ctx, wake);
    if owned > 0 {
        log::warn!("task {:?} ended holding {} lock(s); released", name, owned);
    }
}

/// Binds the task record to its context, the first time either the new
/// context or the spawner learns the id. Returns false if the task is gone.
fn attach(s: &mut State, task: TaskHandle, ctx: ContextId) -> bool {
    let Ok(t) = s.tasks.get_mut(task) else {
        return false;
    };
    if t.ctx.is_none() {
        t.ctx = Some(ctx);
        t.life = Life::Started;
        // A recycled id may still be barred on behalf of its last owner.
        s.pardon(ctx);
    }
    true
}

/// # Tasks
impl<P: Port> Os<P> {
    /// Creates a task and starts it running `main`.
    ///
    /// Fails with `Param` for a zero stack size, `MemAllocFailure` if the
    /// stack can't be allocated, and `InstanceCreateFailure` if the port
    /// can't start the context. Nothing is left behind on failure.
    pub fn task_create(
        &'static self,
        spec: TaskSpec,
        main: impl FnOnce() + Send + 'static,
    ) -> Result<TaskHandle> {
        if spec.stack_size == 0 {
            return Err(Error::Param);
        }
        let mut stack_at = (core::ptr::null_mut(), 0);
        let h = self.insert_with(spec.name, || {
            let stack = Region::acquire(spec.storage, spec.stack_size)?;
            stack_at = (stack.base().as_ptr(), stack.len());
            Ok(Task {
                name: spec.name,
                priority: spec.priority,
                ctx: None,
                life: Life::Inactive,
                blocked: false,
                suspended: false,
                stack,
            })
        })?;
        let (stack_base, stack_len) = stack_at;

        let os = self;
        let launch = Launch {
            name: spec.name,
            priority: spec.priority,
            stack: stack_base,
            stack_len,
            main: Box::new(move || {
                // The context may run before spawn has returned its id.
                let me = os.port().current();
                if !os.with_state(|s| attach(s, h, me)) {
                    // Deleted before it got going.
                    return;
                }
                let _finish = scopeguard::guard((), move |()| os.finish_task(me));
                main();
            }),
        };

        match self.port().spawn(launch) {
            Ok(ctx) => {
                self.with_state(|s| attach(s, h, ctx));
                log::debug!("task {:?} started as {:?}", spec.name, ctx);
                Ok(h)
            }
            Err(e) => {
                log::warn!("task {:?} could not be started: {}", spec.name, e);
                self.with_state(|s| s.tasks.remove(h).map(drop)).ok();
                Err(Error::InstanceCreateFailure)
            }
        }
    }

    /// Marks the task running on `ctx` finished and releases what it held.
    fn finish_task(&self, ctx: ContextId) {
        self.with_state(|s| {
            let name = match s.tasks.iter_mut().find(|(_, t)| t.ctx == Some(ctx)) {
                Some((_, t)) => {
                    if t.life != Life::Faulted {
                        t.life = Life::Terminated;
                    }
                    t.name
                }
                None => "",
            };
            release_context(s, ctx, name, &mut self.waker());
            s.pardon(ctx);
        });
    }

    /// Ends the calling task. Mutexes it holds are released, as if it had
    /// returned from its closure.
    pub fn exit_task(&self) -> ! {
        self.finish_task(self.port().current());
        self.port().exit()
    }

    fn delete_task(&self, task: TaskHandle, external: bool) -> Result<Task> {
        let me = self.port().current();
        // Cut the task off first, so it can't pick anything up between
        // being stopped and being scrubbed.
        let victim = self.with_state(|s| {
            let t = s.tasks.get(task)?;
            if t.ctx == Some(me) {
                return Err(Error::Permission);
            }
            if t.stack.is_external() != external {
                return Err(Error::Param);
            }
            let victim = t.ctx.filter(|_| t.is_live());
            if let Some(ctx) = victim {
                s.condemn(ctx)?;
            }
            Ok(victim)
        })?;
        if let Some(ctx) = victim {
            if let Err(e) = self.port().terminate(ctx) {
                log::warn!("task {:?}: port failed to terminate {:?}: {}", task, ctx, e);
            }
        }

        let t = self.with_state(|s| {
            let (ctx, name) = s.tasks.get(task).map(|t| (t.ctx, t.name))?;
            if let Some(ctx) = ctx {
                release_context(s, ctx, name, &mut self.waker());
            }
            s.tasks.remove(task)
        })?;
        log::debug!("deleted task {:?}", t.name);
        Ok(t)
    }

    /// Deletes another task and frees its stack.
    ///
    /// A task can't delete itself this way (`Permission`); it should call
    /// [`exit_task`](Self::exit_task) instead.
    pub fn task_delete(&self, task: TaskHandle) -> Result<()> {
        self.delete_task(task, false).map(drop)
    }

    /// Deletes a task whose stack was supplied with
    /// [`TaskSpec::static_stack`], returning the buffer.
    pub fn task_delete_static(&self, task: TaskHandle) -> Result<&'static mut [u8]> {
        let t = self.delete_task(task, true)?;
        t.stack.into_external().map_err(|_| Error::Param)
    }

    /// Reports a task's state.
    pub fn task_state(&self, task: TaskHandle) -> Result<TaskState> {
        let current = self.port().current();
        self.read(task, |t| t.state(current))
    }

    /// Stops a task from being scheduled until [`task_resume`]. A task may
    /// suspend itself, in which case this returns once it's resumed.
    ///
    /// Fails with `NotAvailable` if the task has finished.
    ///
    /// [`task_resume`]: Self::task_resume
    pub fn task_suspend(&self, task: TaskHandle) -> Result<()> {
        let ctx = self.with_state(|s| {
            let t = s.tasks.get_mut(task)?;
            match (t.ctx, t.life) {
                (Some(ctx), Life::Started) => {
                    t.suspended = true;
                    Ok(ctx)
                }
                _ => Err(Error::NotAvailable),
            }
        })?;
        self.port().suspend(ctx).inspect_err(|_| {
            self.with_state(|s| {
                if let Ok(t) = s.tasks.get_mut(task) {
                    t.suspended = false;
                }
            });
        })
    }

    /// Lets a suspended task be scheduled again. Fails with `NotAvailable` if
    /// it isn't suspended.
    pub fn task_resume(&self, task: TaskHandle) -> Result<()> {
        let ctx = self.with_state(|s| {
            let t = s.tasks.get_mut(task)?;
            match t.ctx {
                Some(ctx) if t.suspended => {
                    t.suspended = false;
                    Ok(ctx)
                }
                _ => Err(Error::NotAvailable),
            }
        })?;
        self.port().resume(ctx)
    }

    /// Changes a task's priority. Waits already in progress keep their place.
    pub fn task_set_priority(&self, task: TaskHandle, priority: Priority) -> Result<()> {
        let ctx = self.modify(task, |t, _| {
            t.priority = priority;
            Ok(t.ctx)
        })?;
        match ctx {
            Some(ctx) => self.port().set_priority(ctx, priority),
            None => Ok(()),
        }
    }

    /// Reads a task's priority.
    pub fn task_priority(&self, task: TaskHandle) -> Result<Priority> {
        self.read(task, Task::priority)
    }

    /// The calling task. Fails with `InstanceNotFound` from a context that
    /// wasn't created as a task.
    pub fn current_task(&self) -> Result<TaskHandle> {
        let me = self.port().current();
        self.with_state(|s| s.tasks.find(|t| t.ctx == Some(me)))
            .ok_or(Error::InstanceNotFound)
    }

    /// Number of tasks that haven't finished.
    pub fn task_count(&self) -> usize {
        self.with_state(|s| s.tasks.iter().filter(|(_, t)| t.is_live()).count())
    }

    /// The task's stack size in bytes.
    pub fn task_stack_size(&self, task: TaskHandle) -> Result<usize> {
        self.read(task, |t| t.stack.len())
    }

    /// The task's name.
    pub fn task_name(&self, task: TaskHandle) -> Result<&'static str> {
        self.read(task, |t| t.name)
    }

    /// Finds a task by name.
    pub fn task_find(&self, name: &str) -> Result<TaskHandle> {
        self.lookup(name)
    }

    /// Called by a port that has caught `ctx` overrunning its stack. Marks the
    /// task `Error` and faults the system.
    pub fn stack_overflow(&self, ctx: ContextId) -> ! {
        let name = self.with_state(|s| {
            s.tasks
                .iter_mut()
                .find(|(_, t)| t.ctx == Some(ctx))
                .map(|(_, t)| {
                    t.life = Life::Faulted;
                    t.name
                })
        });
        log::error!("stack overflow in task {:?} ({:?})", name.unwrap_or("?"), ctx);
        self.fault(Fault::StackOverflow)
    }
}
