/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Secure monitor calls issued on behalf of an instance.

use snafu::Snafu;

/// Secure monitor returned a failure.
#[derive(Debug, Snafu)]
#[snafu(display("secure monitor call failed (error {code})"))]
pub struct ScmError {
    pub code: i32,
}

/// Secure monitor interfaces.
pub mod interface {
    use super::ScmError;

    /// Calls into the secure world that touch SMMU state owned by it.
    pub trait SecureMonitor: Send + Sync {
        /// Restore the secure configuration of instance `sec_id`. Issued once, before the
        /// first context of the instance is programmed.
        fn restore_sec_cfg(&self, sec_id: u32, context: usize) -> Result<(), ScmError>;

        /// Switch context bank `context` of instance `sec_id` to page table format `format`.
        fn set_pt_format(&self, sec_id: u32, context: usize, format: u32) -> Result<(), ScmError>;
    }
}
