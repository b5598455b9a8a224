/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Memory barriers ordering register writes against each other and against
//! page table updates made by the CPU.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        use aarch64_cpu::asm::barrier;

        /// Full system barrier: all prior memory and register accesses complete.
        #[inline(always)]
        pub fn mb() {
            barrier::dsb(barrier::SY);
        }

        /// Store barrier: prior writes (page table updates) are visible to the walker.
        #[inline(always)]
        pub fn wmb() {
            barrier::dsb(barrier::ST);
        }
    } else {
        use core::sync::atomic::{fence, Ordering};

        #[inline(always)]
        pub fn mb() {
            fence(Ordering::SeqCst);
        }

        #[inline(always)]
        pub fn wmb() {
            fence(Ordering::Release);
        }
    }
}
