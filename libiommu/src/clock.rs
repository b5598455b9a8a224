/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Interface and core clock pair of an SMMU instance.
//!
//! Every register access happens between [`Clocks::enable`] and the drop of the returned
//! [`ClockGuard`], so enable and disable calls always pair up.

use {alloc::sync::Arc, snafu::Snafu};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Clock provider error.
#[derive(Debug, Snafu)]
#[snafu(display("clock {name} failed to enable (error {code})"))]
pub struct ClockError {
    pub name: &'static str,
    pub code: i32,
}

/// Clock interfaces.
pub mod interface {
    use super::*;

    /// A gateable clock.
    pub trait Clock: Send + Sync {
        fn name(&self) -> &'static str;
        fn enable(&self) -> Result<(), ClockError>;
        fn disable(&self);
    }
}

/// The two clocks gating register access.
pub struct Clocks {
    iface: Arc<dyn interface::Clock>,
    core: Arc<dyn interface::Clock>,
}

/// Both clocks held on; dropping it gates them again.
#[must_use = "clocks are disabled as soon as the guard is dropped"]
pub struct ClockGuard<'a> {
    clocks: &'a Clocks,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl Clocks {
    pub fn new(iface: Arc<dyn interface::Clock>, core: Arc<dyn interface::Clock>) -> Self {
        Self { iface, core }
    }

    /// Enable the interface clock, then the core clock.
    pub fn enable(&self) -> Result<ClockGuard<'_>, ClockError> {
        self.iface.enable()?;
        if let Err(e) = self.core.enable() {
            self.iface.disable();
            return Err(e);
        }
        Ok(ClockGuard { clocks: self })
    }
}

impl Drop for ClockGuard<'_> {
    fn drop(&mut self) {
        self.clocks.core.disable();
        self.clocks.iface.disable();
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
