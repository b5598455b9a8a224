/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Translation table formats and the register encodings that depend on them.

use {
    crate::regs::{TCR2, TTBCR},
    bit_field::BitField,
    core::fmt,
    tock_registers::{
        interfaces::{ReadWriteable, Readable},
        registers::InMemoryRegister,
    },
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Page table format a context bank walks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableFormat {
    /// ARMv7 long-descriptor format, 32-bit input addresses.
    Format32,
    /// AArch64 4K-granule format, 48-bit input addresses.
    Format64,
}

/// Address space identifier. Tags TLB entries of one context.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Asid(u8);

/// TTBR bit position of the ASID field.
const TTBR_ASID_SHIFT: usize = 48;
const TTBR_ASID_BITS: usize = 8;

/// Translation granule of TLB invalidation by address.
pub const TLBI_GRANULE_SHIFT: u32 = 12;

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl Asid {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Each context bank owns the ASID equal to its index.
    pub fn for_context(index: usize) -> Option<Self> {
        u8::try_from(index).ok().map(Self)
    }
}

impl fmt::Display for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for TableFormat {
    fn default() -> Self {
        if cfg!(feature = "format64") {
            Self::Format64
        } else {
            Self::Format32
        }
    }
}

impl TableFormat {
    /// Input address size handed to the page table walker.
    pub const fn ias(self) -> u32 {
        match self {
            Self::Format32 => 32,
            Self::Format64 => 48,
        }
    }

    /// Output address size handed to the page table walker.
    pub const fn oas(self) -> u32 {
        match self {
            Self::Format32 => 40,
            Self::Format64 => 48,
        }
    }

    /// Whether the secure world must be told to switch the context to this format.
    pub const fn needs_secure_switch(self) -> bool {
        matches!(self, Self::Format64)
    }

    /// Argument of the secure set-page-table-format call.
    pub const fn secure_format_id(self) -> u32 {
        match self {
            Self::Format32 => 0,
            Self::Format64 => 1,
        }
    }

    /// TTBCR value: low half of the walker TCR, plus EAE for the 32-bit format.
    pub fn ttbcr(self, tcr: u64) -> u32 {
        let reg = InMemoryRegister::<u32, TTBCR::Register>::new(tcr as u32);
        if self == Self::Format32 {
            reg.modify(TTBCR::EAE::SET);
        }
        reg.get()
    }

    /// TCR2 value: high half of the walker TCR with upstream sign extension,
    /// plus 16-bit ASIDs for the 64-bit format.
    pub fn tcr2(self, tcr: u64) -> u32 {
        let reg = InMemoryRegister::<u32, TCR2::Register>::new((tcr >> 32) as u32);
        reg.modify(TCR2::SEP::Upstream);
        if self == Self::Format64 {
            reg.modify(TCR2::AS::SET);
        }
        reg.get()
    }

    /// Table base with the ASID placed in bits [55:48].
    pub fn ttbr_with_asid(self, ttbr: u64, asid: Asid) -> u64 {
        let mut value = ttbr;
        value.set_bits(
            TTBR_ASID_SHIFT..TTBR_ASID_SHIFT + TTBR_ASID_BITS,
            u64::from(asid.get()),
        );
        value
    }

    /// Operand for TLBIVA/TLBIVAL.
    pub fn tlbi_va(self, iova: u64, asid: Asid) -> u64 {
        match self {
            Self::Format32 => (iova & !((1 << TLBI_GRANULE_SHIFT) - 1)) | u64::from(asid.get()),
            Self::Format64 => (iova >> TLBI_GRANULE_SHIFT) | (u64::from(asid.get()) << 48),
        }
    }

    /// Operand advance between consecutive granules of an invalidation range.
    pub fn tlbi_step(self, granule: usize) -> u64 {
        match self {
            Self::Format32 => granule as u64,
            Self::Format64 => (granule as u64) >> TLBI_GRANULE_SHIFT,
        }
    }
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format32 => write!(f, "32-bit LPAE"),
            Self::Format64 => write!(f, "64-bit AArch64"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
