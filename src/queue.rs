// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded message queues.
//!
//! A queue is a ring of `capacity` slots, each `message_size` bytes. Messages
//! are copied in by [`Os::queue_send`] and copied out by
//! [`Os::queue_receive`], so neither side's buffer is referenced after the
//! call returns. Messages come out in the order they went in.
//!
//! Senders block while the queue is full and receivers while it's empty, each
//! on their own arrival-ordered list.
//!
//! # Reservations
//!
//! When a receive frees a slot and a sender is waiting, the slot is reserved
//! for that sender before it's woken; likewise a send reserves its message for
//! the oldest waiting receiver. Reserved slots and messages are invisible to
//! everyone else, so a context that shows up in between can't take them.
//!
//! [`Os::queue_clear`] discards every message, including those reserved for
//! receivers that haven't run yet. Those receivers go back to waiting; clear
//! never completes a receive.

use core::fmt;

use crate::error::{Error, Result};
use crate::handle::{Arena, Handle};
use crate::list::{Order, WaitList};
use crate::mem::{Region, Storage};
use crate::os::{Object, Os, State, Turn};
use crate::port::{ContextId, Port};
use crate::time::Timeout;

/// A message queue object.
pub struct Queue {
    name: &'static str,
    message_size: usize,
    capacity: u32,
    /// Slot holding the oldest message.
    head: u32,
    /// Messages stored, reserved or not.
    len: u32,
    /// Free slots promised to woken senders.
    slot_reserved: u32,
    /// Stored messages promised to woken receivers.
    msg_reserved: u32,
    senders: WaitList,
    receivers: WaitList,
    region: Region,
}

/// Handle to a [`Queue`].
pub type QueueHandle = Handle<Queue>;

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("message_size", &self.message_size)
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish()
    }
}

fn queue_senders(q: &mut Queue) -> &mut WaitList {
    &mut q.senders
}

fn queue_receivers(q: &mut Queue) -> &mut WaitList {
    &mut q.receivers
}

impl Queue {
    fn storage(&mut self) -> &mut [u8] {
        let len = self.message_size * self.capacity as usize;
        // Safety: the region is at least len bytes and belongs to this queue;
        // &mut self keeps this the only view.
        unsafe { core::slice::from_raw_parts_mut(self.region.base().as_ptr(), len) }
    }

    fn slot(&mut self, i: u32) -> &mut [u8] {
        let size = self.message_size;
        let start = i as usize * size;
        &mut self.storage()[start..start + size]
    }

    fn free_slots(&self) -> u32 {
        self.capacity - self.len
    }

    fn push(&mut self, message: &[u8]) {
        crate::cheap_assert!(self.len < self.capacity);
        let tail = (self.head + self.len) % self.capacity;
        self.slot(tail).copy_from_slice(message);
        self.len += 1;
    }

    fn pop(&mut self, buffer: &mut [u8]) {
        crate::cheap_assert!(self.len > 0);
        let size = self.message_size;
        let head = self.head;
        buffer[..size].copy_from_slice(self.slot(head));
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
    }

    /// Promises unclaimed free slots to waiting senders.
    fn offer_space(&mut self, wake: &mut dyn FnMut(ContextId)) {
        while self.free_slots() > self.slot_reserved {
            match self.senders.grant_next(()) {
                Ok(ctx) => {
                    self.slot_reserved += 1;
                    wake(ctx);
                }
                Err(()) => break,
            }
        }
    }

    /// Promises unclaimed messages to waiting receivers.
    fn offer_messages(&mut self, wake: &mut dyn FnMut(ContextId)) {
        while self.len > self.msg_reserved {
            match self.receivers.grant_next(()) {
                Ok(ctx) => {
                    self.msg_reserved += 1;
                    wake(ctx);
                }
                Err(()) => break,
            }
        }
    }

    fn check_delete(&self, external: bool) -> Result<()> {
        if self.region.is_external() == external {
            Ok(())
        } else {
            Err(Error::Param)
        }
    }
}

impl Object for Queue {
    fn arena(state: &mut State) -> &mut Arena<Self> {
        &mut state.queues
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn forget(&mut self, ctx: ContextId, wake: &mut dyn FnMut(ContextId)) {
        if self.senders.withdraw(ctx).is_some() {
            self.slot_reserved -= 1;
        }
        if self.receivers.withdraw(ctx).is_some() {
            self.msg_reserved -= 1;
        }
        self.offer_space(wake);
        self.offer_messages(wake);
    }

    fn close(&mut self, wake: &mut dyn FnMut(ContextId)) {
        self.senders.drain(wake);
        self.receivers.drain(wake);
    }
}

/// # Message queues
impl<P: Port> Os<P> {
    /// Creates a queue of `capacity` messages of `message_size` bytes each.
    ///
    /// With [`Storage::External`], the buffer must hold
    /// `message_size * capacity` bytes after aligning to 8. If creation
    /// fails, the buffer hasn't been written.
    pub fn queue_create(
        &self,
        name: &'static str,
        message_size: usize,
        capacity: u32,
        storage: Storage,
    ) -> Result<QueueHandle> {
        if message_size == 0 || capacity == 0 {
            return Err(Error::Param);
        }
        let len = message_size
            .checked_mul(capacity as usize)
            .ok_or(Error::Param)?;
        self.insert_with(name, || {
            Ok(Queue {
                name,
                message_size,
                capacity,
                head: 0,
                len: 0,
                slot_reserved: 0,
                msg_reserved: 0,
                senders: WaitList::new(Order::Fifo),
                receivers: WaitList::new(Order::Fifo),
                region: Region::acquire(storage, len)?,
            })
        })
    }

    /// Deletes a queue created with [`Storage::Pool`]. Blocked senders and
    /// receivers get `InstanceInvalid`.
    pub fn queue_delete(&self, queue: QueueHandle) -> Result<()> {
        self.remove(queue, |q| q.check_delete(false)).map(drop)
    }

    /// Deletes a queue created with [`Storage::External`], returning the
    /// buffer.
    pub fn queue_delete_static(&self, queue: QueueHandle) -> Result<&'static mut [u8]> {
        let q = self.remove(queue, |q| q.check_delete(true))?;
        q.region.into_external().map_err(|_| Error::Param)
    }

    /// Copies `message` into the queue, waiting up to `timeout` for room.
    ///
    /// `message` must be exactly the queue's message size.
    pub fn queue_send(&self, queue: QueueHandle, message: &[u8], timeout: Timeout) -> Result<()> {
        self.block(queue, timeout, Error::Busy, (), queue_senders, |q, turn, wake| {
            if message.len() != q.message_size {
                return Err(Error::Param);
            }
            match turn {
                Turn::Try(_) if q.free_slots() > q.slot_reserved => {}
                Turn::Try(_) => return Ok(None),
                Turn::Granted(()) => q.slot_reserved -= 1,
            }
            q.push(message);
            q.offer_messages(wake);
            Ok(Some(()))
        })
    }

    /// Copies the oldest message into `buffer`, waiting up to `timeout` for
    /// one to arrive.
    ///
    /// `buffer` must be at least the queue's message size; only that many
    /// bytes are written.
    pub fn queue_receive(
        &self,
        queue: QueueHandle,
        buffer: &mut [u8],
        timeout: Timeout,
    ) -> Result<()> {
        self.block(queue, timeout, Error::Busy, (), queue_receivers, |q, turn, wake| {
            if buffer.len() < q.message_size {
                return Err(Error::Param);
            }
            match turn {
                Turn::Try(_) if q.len > q.msg_reserved => {}
                Turn::Try(_) => return Ok(None),
                Turn::Granted(()) => q.msg_reserved -= 1,
            }
            q.pop(buffer);
            q.offer_space(wake);
            Ok(Some(()))
        })
    }

    /// Discards every message. Blocked receivers stay blocked; blocked
    /// senders are given the freed space.
    pub fn queue_clear(&self, queue: QueueHandle) -> Result<()> {
        self.modify(queue, |q, wake| {
            q.head = 0;
            q.len = 0;
            q.receivers.revoke_all();
            q.msg_reserved = 0;
            q.offer_space(wake);
            Ok(())
        })
    }

    /// Number of messages in the queue.
    pub fn queue_count(&self, queue: QueueHandle) -> Result<u32> {
        self.read(queue, |q| q.len)
    }

    /// Maximum number of messages.
    pub fn queue_capacity(&self, queue: QueueHandle) -> Result<u32> {
        self.read(queue, |q| q.capacity)
    }

    /// Size of each message in bytes.
    pub fn queue_message_size(&self, queue: QueueHandle) -> Result<usize> {
        self.read(queue, |q| q.message_size)
    }

    /// The queue's name.
    pub fn queue_name(&self, queue: QueueHandle) -> Result<&'static str> {
        self.read(queue, |q| q.name)
    }

    /// Finds a queue by name.
    pub fn queue_find(&self, name: &str) -> Result<QueueHandle> {
        self.lookup(name)
    }
}
