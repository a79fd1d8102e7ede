// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The closed error taxonomy shared by every primitive.
//!
//! Every fallible operation in this crate returns [`Result<T>`], where the
//! error side is one of the [`Error`] codes below. Success is simply `Ok`;
//! there is no separate "OK" code.
//!
//! The numeric values returned by [`Error::code`] are fixed. Older firmware
//! used a different assignment for some of the same names (allocation failure
//! was 16 there, for instance); those values are *not* accepted by
//! [`Error::from_code`], so that a mismatched peer shows up as
//! [`Error::Unknown`] instead of being silently misread.
//!
//! Conditions that leave kernel state unusable are not errors at all: they are
//! [`Fault`]s, and they escalate through [`Os::fault`][crate::Os::fault]
//! instead of being returned.

/// Shorthand for a `Result` carrying this crate's [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

/// Status codes returned by failing operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, thiserror::Error)]
#[repr(i32)]
pub enum Error {
    /// An argument was out of range or inconsistent.
    #[error("invalid parameter")]
    Param = 1,
    /// The operation could not complete without blocking, and the caller
    /// asked not to block.
    #[error("resource busy")]
    Busy = 2,
    /// The caller blocked, and the timeout elapsed first.
    #[error("timed out")]
    Timeout = 3,
    /// A task ran out of stack.
    #[error("stack overflow")]
    StackOverflow = 4,
    /// The caller is not allowed to do that, e.g. unlocking a mutex it
    /// doesn't own.
    #[error("permission denied")]
    Permission = 5,
    /// A handle that was never issued.
    #[error("null reference")]
    NullRef = 6,
    /// No storage was available to satisfy an allocation.
    #[error("memory allocation failure")]
    MemAllocFailure = 7,
    /// The backend kernel reported a failure it could not classify.
    #[error("low-level failure")]
    LowLevelFailure = 8,
    /// An object could not be created.
    #[error("instance creation failure")]
    InstanceCreateFailure = 9,
    /// No live object matched a lookup.
    #[error("instance not found")]
    InstanceNotFound = 10,
    /// An object with the same identity already exists.
    #[error("duplicate instance")]
    InstanceDuplicate = 11,
    /// The object is still in use and cannot be deleted.
    #[error("instance in use")]
    InstanceInUse = 12,
    /// The handle refers to an object that has been deleted.
    #[error("invalid instance")]
    InstanceInvalid = 13,
    /// The backend doesn't support the operation.
    #[error("not supported")]
    NotSupport = 14,
    /// The operation doesn't apply to the object in its current state.
    #[error("not available")]
    NotAvailable = 15,
    /// Anything else.
    #[error("unknown error")]
    Unknown = 255,
}

impl Error {
    /// Returns the stable numeric code for this error.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Decodes a numeric status code. `0` (success) and any unassigned value
    /// decode as [`Error::Unknown`].
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Param,
            2 => Self::Busy,
            3 => Self::Timeout,
            4 => Self::StackOverflow,
            5 => Self::Permission,
            6 => Self::NullRef,
            7 => Self::MemAllocFailure,
            8 => Self::LowLevelFailure,
            9 => Self::InstanceCreateFailure,
            10 => Self::InstanceNotFound,
            11 => Self::InstanceDuplicate,
            12 => Self::InstanceInUse,
            13 => Self::InstanceInvalid,
            14 => Self::NotSupport,
            15 => Self::NotAvailable,
            _ => Self::Unknown,
        }
    }
}

/// Conditions after which the kernel cannot safely keep scheduling.
///
/// These are never returned to callers; see [`Os::fault`][crate::Os::fault].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum Fault {
    /// A backend detected a task overrunning its stack.
    #[error("task stack overflow")]
    StackOverflow,
    /// A pool's free list links outside the pool.
    #[error("corrupted free list")]
    CorruptFreeList,
    /// A block was returned to a pool that did not issue it.
    #[error("block returned to the wrong pool")]
    ForeignBlock,
}
