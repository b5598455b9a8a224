/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

use {
    crate::{clock::ClockError, pgtable::PageTableError},
    snafu::Snafu,
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Driver error variants.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum IommuError {
    #[snafu(display("no such device"))]
    NoDevice,
    #[snafu(display("invalid argument: {what}"))]
    InvalidArgument { what: &'static str },
    #[snafu(display("{what} is busy"))]
    Busy { what: &'static str },
    #[snafu(display("page table allocation failed"))]
    OutOfMemory,
    #[snafu(display("{err}"))]
    ClockEnable { err: ClockError },
    #[snafu(display("secure call {call} failed (error {code})"))]
    SecureCall { call: &'static str, code: i32 },
    #[snafu(display("context bank {context} left unusable: {reason}"))]
    Unrecoverable {
        context: usize,
        reason: &'static str,
    },
    #[snafu(display("TLB sync timed out on context bank {context}"))]
    TlbSyncTimeout { context: usize },
    #[snafu(display("context bank {context} is not attached to this domain"))]
    NotAttached { context: usize },
    #[snafu(display("page table: {err}"))]
    PageTable { err: PageTableError },
}

/// Driver result.
pub type Result<T> = core::result::Result<T, IommuError>;

// Kernel errno values, returned negated at the driver boundary.
const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ETIMEDOUT: i32 = 110;

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl IommuError {
    /// Negative errno for the kernel IOMMU core.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::NoDevice => -ENODEV,
            Self::InvalidArgument { .. } | Self::NotAttached { .. } => -EINVAL,
            Self::Busy { .. } => -EBUSY,
            Self::OutOfMemory => -ENOMEM,
            Self::ClockEnable { err } if err.code < 0 => err.code,
            Self::SecureCall { code, .. } if *code < 0 => *code,
            Self::ClockEnable { .. } | Self::SecureCall { .. } | Self::Unrecoverable { .. } => -EIO,
            Self::TlbSyncTimeout { .. } => -ETIMEDOUT,
            Self::PageTable { err } => match err {
                PageTableError::NoMemory => -ENOMEM,
                PageTableError::Invalid | PageTableError::Exists => -EINVAL,
            },
        }
    }
}

impl From<ClockError> for IommuError {
    fn from(err: ClockError) -> Self {
        Self::ClockEnable { err }
    }
}

impl From<PageTableError> for IommuError {
    fn from(err: PageTableError) -> Self {
        match err {
            PageTableError::NoMemory => Self::OutOfMemory,
            err => Self::PageTable { err },
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
