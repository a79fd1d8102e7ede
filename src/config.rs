// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time tunables for an [`Os`][crate::Os].
//!
//! A `Config` is a plain value so it can be built in a `const` context:
//!
//! ```
//! use osal::{Config, Priority};
//!
//! const CONFIG: Config = Config::new()
//!     .tick_hz(1_000)
//!     .max_objects(16)
//!     .timer_service_priority(Priority::High);
//! ```

use crate::task::Priority;

/// Tunables for one [`Os`][crate::Os] instance.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Tick frequency of the port's tick source.
    pub tick_hz: u32,
    /// Maximum number of live objects of each kind.
    pub max_objects: usize,
    /// Priority of the timer-service task.
    pub timer_service_priority: Priority,
    /// Stack size of the timer-service task, in bytes.
    pub timer_service_stack: usize,
}

impl Config {
    /// Defaults: 1 kHz ticks, 32 objects per kind, and a 2 KiB timer service
    /// at `Priority::High`.
    pub const fn new() -> Self {
        Self {
            tick_hz: 1_000,
            max_objects: 32,
            timer_service_priority: Priority::High,
            timer_service_stack: 2048,
        }
    }

    /// Sets the tick frequency.
    pub const fn tick_hz(mut self, hz: u32) -> Self {
        self.tick_hz = hz;
        self
    }

    /// Sets the per-kind object limit.
    pub const fn max_objects(mut self, n: usize) -> Self {
        self.max_objects = n;
        self
    }

    /// Sets the timer-service priority.
    pub const fn timer_service_priority(mut self, p: Priority) -> Self {
        self.timer_service_priority = p;
        self
    }

    /// Sets the timer-service stack size.
    pub const fn timer_service_stack(mut self, bytes: usize) -> Self {
        self.timer_service_stack = bytes;
        self
    }

    /// Converts milliseconds to ticks at this configuration's tick rate,
    /// rounding up so that a nonzero interval never becomes a poll.
    pub const fn ticks_from_millis(&self, ms: u32) -> u32 {
        let t = (ms as u64 * self.tick_hz as u64 + 999) / 1000;
        if t > u32::MAX as u64 { u32::MAX } else { t as u32 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_up() {
        let c = Config::new().tick_hz(100);
        assert_eq!(c.ticks_from_millis(0), 0);
        assert_eq!(c.ticks_from_millis(1), 1);
        assert_eq!(c.ticks_from_millis(10), 1);
        assert_eq!(c.ticks_from_millis(25), 3);
        assert_eq!(Config::new().ticks_from_millis(250), 250);
    }

    #[test]
    fn test_saturates() {
        let c = Config::new().tick_hz(u32::MAX);
        assert_eq!(c.ticks_from_millis(u32::MAX), u32::MAX);
    }
}
