// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ticks, instants, and timeouts.
//!
//! The layer measures all time in kernel *ticks*, whatever the backend makes
//! those be. Two types cover it:
//!
//! `TickTime` represents a specific point in time, measured as a number of
//! ticks since the port started. It's a 64-bit count, which means it won't
//! overflow in the life of any real device, so deadline arithmetic can mostly
//! ignore wrapping. The port's tick source produces these; see
//! [`Port::now`][crate::port::Port::now].
//!
//! `Timeout` is what every potentially-blocking operation accepts. It's a
//! 32-bit tick count with two reserved meanings: [`Timeout::POLL`] (zero)
//! means "try once, never block", and [`Timeout::FOREVER`] (`u32::MAX`) means
//! "block until it happens."

use core::ops::Add;

/// Represents a moment in time by the value of the system tick counter.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct TickTime(u64);

impl TickTime {
    /// The moment the port started.
    pub const ZERO: Self = Self(0);

    /// Constructs a `TickTime` describing a certain number of ticks since the
    /// port started.
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Number of ticks since the port started.
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Adds some ticks to `self`, checking for overflow.
    pub const fn checked_add(self, ticks: u64) -> Option<Self> {
        match self.0.checked_add(ticks) {
            Some(t) => Some(Self(t)),
            None => None,
        }
    }

    /// Ticks from `earlier` to `self`, or zero if `earlier` is actually later.
    pub const fn saturating_ticks_since(self, earlier: TickTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Adds ticks with normal `+` overflow behavior (checked in debug builds).
impl Add<u64> for TickTime {
    type Output = Self;
    fn add(self, ticks: u64) -> Self {
        Self(self.0 + ticks)
    }
}

impl From<TickTime> for u64 {
    fn from(t: TickTime) -> Self {
        t.0
    }
}

/// How long a blocking operation may wait, in ticks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Timeout(u32);

impl Timeout {
    /// Don't block at all.
    pub const POLL: Self = Self(0);
    /// Block until the operation can complete.
    pub const FOREVER: Self = Self(u32::MAX);

    /// Waits up to `ticks`. `ticks(0)` is `POLL` and `ticks(u32::MAX)` is
    /// `FOREVER`.
    pub const fn ticks(ticks: u32) -> Self {
        Self(ticks)
    }

    /// The raw tick count.
    pub const fn as_ticks(self) -> u32 {
        self.0
    }

    /// Checks whether this is the non-blocking timeout.
    pub const fn is_poll(self) -> bool {
        self.0 == 0
    }

    /// Checks whether this timeout never expires.
    pub const fn is_forever(self) -> bool {
        self.0 == u32::MAX
    }

    /// Computes the deadline this timeout implies for a wait starting at
    /// `now`, or `None` if it never expires.
    pub fn deadline_from(self, now: TickTime) -> Option<TickTime> {
        if self.is_forever() {
            None
        } else {
            Some(now + u64::from(self.0))
        }
    }
}

impl From<u32> for Timeout {
    fn from(ticks: u32) -> Self {
        Self(ticks)
    }
}
