/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Time source used for bounded register polling.

use {cfg_if::cfg_if, core::time::Duration, snafu::Snafu};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Upper bound on waiting for a TLB sync to drain.
pub const TLB_SYNC_TIMEOUT: Duration = Duration::from_micros(1_000_000);

/// Time interfaces.
pub mod interface {
    use super::*;

    /// Monotonic clock.
    pub trait TimeSource: Send + Sync {
        /// Time elapsed since an arbitrary fixed point.
        fn uptime(&self) -> Duration;
    }
}

/// Polled condition did not become true in time.
#[derive(Debug, Snafu)]
#[snafu(display("poll timed out after {timeout:?}"))]
pub struct PollTimeout {
    pub timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

/// Busy-poll `op` until `cond` accepts its value or `timeout` elapses.
///
/// Never sleeps, so it is usable with IRQs masked. The value is sampled one last time
/// after the deadline so a slow clock cannot cause a spurious timeout.
pub fn read_poll_timeout_atomic<T>(
    timer: &dyn interface::TimeSource,
    mut op: impl FnMut() -> T,
    mut cond: impl FnMut(&T) -> bool,
    timeout: Duration,
) -> Result<T, PollTimeout> {
    let start = timer.uptime();

    loop {
        let val = op();
        if cond(&val) {
            return Ok(val);
        }

        if timer.uptime().saturating_sub(start) > timeout {
            let val = op();
            return if cond(&val) {
                Ok(val)
            } else {
                Err(PollTimeout { timeout })
            };
        }

        core::hint::spin_loop();
    }
}

cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        use aarch64_cpu::registers::{Readable, CNTFRQ_EL0, CNTPCT_EL0};

        /// ARMv8 generic timer.
        pub struct GenericTimer;

        impl interface::TimeSource for GenericTimer {
            fn uptime(&self) -> Duration {
                let frequency = CNTFRQ_EL0.get();
                if frequency == 0 {
                    return Duration::ZERO;
                }
                let ticks = CNTPCT_EL0.get();
                let secs = ticks / frequency;
                let sub_second_ticks = ticks % frequency;
                let nanos = sub_second_ticks * 1_000_000_000 / frequency;
                Duration::new(secs, nanos as u32)
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
