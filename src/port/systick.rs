// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tick source for Cortex-M ports, using the SysTick Timer.
//!
//! **Note:** this module is only available with the `systick` feature, on
//! bare-metal ARM targets.
//!
//! The SysTick exception maintains a 64-bit count of ticks since
//! [`initialize_sys_tick`] was called. A port's [`Port::now`] can simply
//! return [`now()`].
//!
//! [`Port::now`]: crate::port::Port::now

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::{syst::SystClkSource, SYST};
use cortex_m_rt::exception;

use crate::time::TickTime;

/// Bottom 32 bits of the tick counter. Updated by ISR.
static TICK: AtomicU32 = AtomicU32::new(0);
/// Top 32 bits of the tick counter. Updated by ISR.
static EPOCH: AtomicU32 = AtomicU32::new(0);

/// Sets up SysTick to fire at `tick_hz`, assuming a CPU core clock of
/// `clock_hz`. This should agree with the `tick_hz` in the
/// [`Config`][crate::Config] the port's `Os` is built with.
pub fn initialize_sys_tick(syst: &mut SYST, clock_hz: u32, tick_hz: u32) {
    let cycles_per_tick = clock_hz / tick_hz;
    syst.set_reload(cycles_per_tick - 1);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_interrupt();
    syst.enable_counter();
}

/// Retrieves the current value of the tick counter.
pub fn now() -> TickTime {
    // This loop will only repeat if e != e2, which means we raced the
    // systick ISR. Since that ISR only occurs once per tick, this loop
    // should repeat at most twice.
    loop {
        let e = EPOCH.load(Ordering::SeqCst);
        let t = TICK.load(Ordering::SeqCst);
        let e2 = EPOCH.load(Ordering::SeqCst);
        if e == e2 {
            break TickTime::from_ticks(((e as u64) << 32) | (t as u64));
        }
    }
}

#[doc(hidden)]
#[exception]
fn SysTick() {
    // Only this ISR writes the counters, so a plain load/store pair is enough
    // even on cores without atomic read-modify-write.
    let t = TICK.load(Ordering::Relaxed).wrapping_add(1);
    TICK.store(t, Ordering::SeqCst);
    if t == 0 {
        let e = EPOCH.load(Ordering::Relaxed).wrapping_add(1);
        EPOCH.store(e, Ordering::SeqCst);
    }
}
