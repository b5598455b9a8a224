/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Driver for Qualcomm MSM SMMU context banks.
//!
//! Programs translation contexts to walk a domain's page tables, keeps their TLBs
//! coherent with page table updates, and services fault interrupts. Page table layout,
//! clocks and secure monitor calls are reached through the `interface` traits of the
//! respective modules.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::upper_case_acronyms)]

extern crate alloc;

pub mod barrier;
pub mod clock;
pub mod context;
pub mod domain;
pub mod driver;
pub mod error;
pub mod fault;
pub mod format;
pub mod instance;
pub mod mmio_deref_wrapper;
pub mod pgtable;
pub mod registry;
pub mod regs;
pub mod secure;
pub mod sync;
pub mod time;
pub mod tlb;

#[cfg(test)]
mod testing;

pub use {
    domain::{Domain, DomainId, DomainType},
    driver::{interface::IommuOps, Capability, SmmuDriver},
    error::{IommuError, Result},
    format::{Asid, TableFormat},
    instance::{ContextDescriptor, IommuInstance, InstanceDescriptor, Model},
    registry::{DeviceId, PhandleArgs, Registry},
};
