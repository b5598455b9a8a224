/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! SMMU register layout.
//!
//! Three windows are described here: the global space (GR0 fault syndrome and the GR1
//! per-bank attribute arrays), the context bank space at `cb_base + index * 0x1000`, and
//! the optional Qualcomm local window holding the secure interrupt routing register.

use {
    crate::mmio_deref_wrapper::MMIODerefWrapper,
    static_assertions::const_assert_eq,
    tock_registers::{
        interfaces::{Readable, Writeable},
        register_bitfields, register_structs,
        registers::{ReadOnly, ReadWrite, WriteOnly},
    },
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Distance between two consecutive context banks.
pub const CONTEXT_BANK_STRIDE: usize = 0x1000;
/// Size of the GR0 + GR1 global register window.
pub const GLOBAL_WINDOW_SIZE: usize = 0x2000;
/// Upper bound on context banks per instance (GR1 array length).
pub const MAX_CONTEXT_BANKS: usize = 256;

register_bitfields! {
    u32,

    /// Context bank system control.
    pub SCTLR [
        /// Translation enable.
        M OFFSET(0) NUMBITS(1) [],
        /// TEX remap enable.
        TRE OFFSET(1) NUMBITS(1) [],
        /// Access flag enable.
        AFE OFFSET(2) NUMBITS(1) [],
        /// Access flag fault disable.
        AFFD OFFSET(3) NUMBITS(1) [],
        /// Big-endian translation table walks.
        E OFFSET(4) NUMBITS(1) [],
        /// Context fault report enable.
        CFRE OFFSET(5) NUMBITS(1) [],
        /// Context fault interrupt enable.
        CFIE OFFSET(6) NUMBITS(1) [],
        /// Context fault configuration.
        CFCFG OFFSET(7) NUMBITS(1) [
            Terminate = 0,
            Stall = 1
        ],
        /// Hit under previous context fault.
        HUPCF OFFSET(8) NUMBITS(1) [],
        /// ASID private namespace enable.
        ASIDPNE OFFSET(12) NUMBITS(1) []
    ],

    /// Translation table base control, low half of the walker TCR.
    pub TTBCR [
        T0SZ OFFSET(0) NUMBITS(6) [],
        /// Extended address enable, selects the long-descriptor walker in 32-bit mode.
        EAE OFFSET(31) NUMBITS(1) []
    ],

    /// Extended translation control, high half of the walker TCR.
    pub TCR2 [
        PASIZE OFFSET(0) NUMBITS(3) [],
        /// 16-bit ASID.
        AS OFFSET(4) NUMBITS(1) [],
        /// Sign extension position.
        SEP OFFSET(15) NUMBITS(3) [
            Upstream = 0b111
        ]
    ],

    pub TLBSTATUS [
        /// A TLB sync is still in progress.
        SACTIVE OFFSET(0) NUMBITS(1) []
    ],

    pub FSYNR0 [
        PLVL OFFSET(0) NUMBITS(2) [],
        /// Faulting access was a write.
        WNR OFFSET(4) NUMBITS(1) [],
        PNU OFFSET(5) NUMBITS(1) [],
        IND OFFSET(6) NUMBITS(1) [],
        NSATTR OFFSET(8) NUMBITS(1) [],
        PTWF OFFSET(10) NUMBITS(1) []
    ]
}

register_structs! {
    /// Global address space 0 and 1.
    #[allow(non_snake_case)]
    pub GlobalRegisterBlock {
        (0x0000 => pub CR0: ReadWrite<u32>),
        (0x0004 => __reserved_1),
        (0x0040 => pub GFAR: ReadWrite<u64>),
        (0x0048 => pub GFSR: ReadWrite<u32>),
        (0x004c => pub GFSRRESTORE: ReadWrite<u32>),
        (0x0050 => pub GFSYNR0: ReadWrite<u32>),
        (0x0054 => pub GFSYNR1: ReadWrite<u32>),
        (0x0058 => pub GFSYNR2: ReadWrite<u32>),
        (0x005c => __reserved_2),
        (0x1000 => pub CBAR: [ReadWrite<u32>; MAX_CONTEXT_BANKS]),
        (0x1400 => pub CBFRSYNRA: [ReadWrite<u32>; MAX_CONTEXT_BANKS]),
        (0x1800 => __reserved_3),
        (0x2000 => @END),
    }
}

register_structs! {
    /// One translation context bank.
    #[allow(non_snake_case)]
    pub ContextBankRegisterBlock {
        (0x000 => pub SCTLR: ReadWrite<u32, SCTLR::Register>),
        (0x004 => pub ACTLR: ReadWrite<u32>),
        (0x008 => pub RESUME: WriteOnly<u32>),
        (0x00c => __reserved_1),
        (0x010 => pub TCR2: ReadWrite<u32, TCR2::Register>),
        (0x014 => __reserved_2),
        (0x020 => pub TTBR0: ReadWrite<u64>),
        (0x028 => pub TTBR1: ReadWrite<u64>),
        (0x030 => pub TTBCR: ReadWrite<u32, TTBCR::Register>),
        (0x034 => pub CONTEXTIDR: ReadWrite<u32>),
        // PRRR in the short-descriptor format
        (0x038 => pub MAIR0: ReadWrite<u32>),
        // NMRR in the short-descriptor format
        (0x03c => pub MAIR1: ReadWrite<u32>),
        (0x040 => __reserved_3),
        (0x050 => pub PAR: ReadWrite<u64>),
        (0x058 => pub FSR: ReadWrite<u32>),
        (0x05c => pub FSRRESTORE: ReadWrite<u32>),
        (0x060 => pub FAR: ReadWrite<u64>),
        (0x068 => pub FSYNR0: ReadWrite<u32, FSYNR0::Register>),
        (0x06c => pub FSYNR1: ReadWrite<u32>),
        (0x070 => __reserved_4),
        (0x600 => pub TLBIVA: WriteOnly<u64>),
        (0x608 => pub TLBIVAA: WriteOnly<u64>),
        (0x610 => pub TLBIASID: WriteOnly<u32>),
        (0x614 => __reserved_5),
        (0x618 => pub TLBIALL: WriteOnly<u32>),
        (0x61c => __reserved_6),
        (0x620 => pub TLBIVAL: WriteOnly<u64>),
        (0x628 => pub TLBIVAAL: WriteOnly<u64>),
        (0x630 => __reserved_7),
        (0x7f0 => pub TLBSYNC: WriteOnly<u32>),
        (0x7f4 => pub TLBSTATUS: ReadOnly<u32, TLBSTATUS::Register>),
        (0x7f8 => __reserved_8),
        (0x1000 => @END),
    }
}

register_structs! {
    /// Qualcomm local configuration window.
    #[allow(non_snake_case)]
    pub LocalRegisterBlock {
        (0x0000 => __reserved_1),
        (0x2000 => pub INTR_SEL_NS: WriteOnly<u32>), // all ones routes every line to non-secure
        (0x2004 => @END),
    }
}

const_assert_eq!(
    core::mem::size_of::<ContextBankRegisterBlock>(),
    CONTEXT_BANK_STRIDE
);
const_assert_eq!(
    core::mem::size_of::<GlobalRegisterBlock>(),
    GLOBAL_WINDOW_SIZE
);

/// Context bank registers addressable by name, used by dumps and diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContextRegister {
    Sctlr,
    Actlr,
    Tcr2,
    Ttbr0,
    Ttbr1,
    Ttbcr,
    ContextIdr,
    Mair0,
    Mair1,
    Par,
    Fsr,
    Far,
    Fsynr0,
    Fsynr1,
    TlbStatus,
}

/// Mapped register windows of one SMMU instance.
#[derive(Debug)]
pub struct Registers {
    global: MMIODerefWrapper<GlobalRegisterBlock>,
    cb_base: usize,
    cb_count: usize,
    local: Option<MMIODerefWrapper<LocalRegisterBlock>>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl ContextRegister {
    /// Every readable context register, in dump order.
    pub const ALL: [ContextRegister; 15] = [
        Self::Far,
        Self::Par,
        Self::Fsr,
        Self::Fsynr0,
        Self::Fsynr1,
        Self::Ttbr0,
        Self::Ttbr1,
        Self::Sctlr,
        Self::Actlr,
        Self::Ttbcr,
        Self::Tcr2,
        Self::ContextIdr,
        Self::Mair0,
        Self::Mair1,
        Self::TlbStatus,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Sctlr => "SCTLR",
            Self::Actlr => "ACTLR",
            Self::Tcr2 => "TCR2",
            Self::Ttbr0 => "TTBR0",
            Self::Ttbr1 => "TTBR1",
            Self::Ttbcr => "TTBCR",
            Self::ContextIdr => "CONTEXTIDR",
            Self::Mair0 => "MAIR0",
            Self::Mair1 => "MAIR1",
            Self::Par => "PAR",
            Self::Fsr => "FSR",
            Self::Far => "FAR",
            Self::Fsynr0 => "FSYNR0",
            Self::Fsynr1 => "FSYNR1",
            Self::TlbStatus => "TLBSTATUS",
        }
    }

    /// Byte offset inside the context bank.
    pub const fn offset(self) -> usize {
        match self {
            Self::Sctlr => 0x000,
            Self::Actlr => 0x004,
            Self::Tcr2 => 0x010,
            Self::Ttbr0 => 0x020,
            Self::Ttbr1 => 0x028,
            Self::Ttbcr => 0x030,
            Self::ContextIdr => 0x034,
            Self::Mair0 => 0x038,
            Self::Mair1 => 0x03c,
            Self::Par => 0x050,
            Self::Fsr => 0x058,
            Self::Far => 0x060,
            Self::Fsynr0 => 0x068,
            Self::Fsynr1 => 0x06c,
            Self::TlbStatus => 0x7f4,
        }
    }

    pub const fn is_64bit(self) -> bool {
        matches!(self, Self::Ttbr0 | Self::Ttbr1 | Self::Par | Self::Far)
    }
}

impl ContextBankRegisterBlock {
    /// Read any named register, widened to 64 bits.
    pub fn read(&self, reg: ContextRegister) -> u64 {
        match reg {
            ContextRegister::Sctlr => self.SCTLR.get().into(),
            ContextRegister::Actlr => self.ACTLR.get().into(),
            ContextRegister::Tcr2 => self.TCR2.get().into(),
            ContextRegister::Ttbr0 => self.TTBR0.get(),
            ContextRegister::Ttbr1 => self.TTBR1.get(),
            ContextRegister::Ttbcr => self.TTBCR.get().into(),
            ContextRegister::ContextIdr => self.CONTEXTIDR.get().into(),
            ContextRegister::Mair0 => self.MAIR0.get().into(),
            ContextRegister::Mair1 => self.MAIR1.get().into(),
            ContextRegister::Par => self.PAR.get(),
            ContextRegister::Fsr => self.FSR.get().into(),
            ContextRegister::Far => self.FAR.get(),
            ContextRegister::Fsynr0 => self.FSYNR0.get().into(),
            ContextRegister::Fsynr1 => self.FSYNR1.get().into(),
            ContextRegister::TlbStatus => self.TLBSTATUS.get().into(),
        }
    }

    /// Write any named register. 32-bit registers take the low half of `value`,
    /// read-only registers ignore the write.
    pub fn write(&self, reg: ContextRegister, value: u64) {
        let low = value as u32;
        match reg {
            ContextRegister::Sctlr => self.SCTLR.set(low),
            ContextRegister::Actlr => self.ACTLR.set(low),
            ContextRegister::Tcr2 => self.TCR2.set(low),
            ContextRegister::Ttbr0 => self.TTBR0.set(value),
            ContextRegister::Ttbr1 => self.TTBR1.set(value),
            ContextRegister::Ttbcr => self.TTBCR.set(low),
            ContextRegister::ContextIdr => self.CONTEXTIDR.set(low),
            ContextRegister::Mair0 => self.MAIR0.set(low),
            ContextRegister::Mair1 => self.MAIR1.set(low),
            ContextRegister::Par => self.PAR.set(value),
            ContextRegister::Fsr => self.FSR.set(low),
            ContextRegister::Far => self.FAR.set(value),
            ContextRegister::Fsynr0 => self.FSYNR0.set(low),
            ContextRegister::Fsynr1 => self.FSYNR1.set(low),
            ContextRegister::TlbStatus => {}
        }
    }
}

impl Registers {
    /// Describe the register windows of an instance.
    ///
    /// # Safety
    ///
    /// - `base` must map the global window, `cb_base` must map `cb_count` context banks,
    ///   and `local_base` (if any) must map the local window. All mappings must outlive
    ///   the returned value.
    pub const unsafe fn new(
        base: usize,
        cb_base: usize,
        cb_count: usize,
        local_base: Option<usize>,
    ) -> Self {
        Self {
            global: MMIODerefWrapper::new(base),
            cb_base,
            cb_count,
            local: match local_base {
                Some(addr) => Some(MMIODerefWrapper::new(addr)),
                None => None,
            },
        }
    }

    pub fn global(&self) -> &GlobalRegisterBlock {
        &self.global
    }

    /// Context bank `index`. Indices are validated when the instance is built.
    pub fn context(&self, index: usize) -> MMIODerefWrapper<ContextBankRegisterBlock> {
        debug_assert!(index < self.cb_count);
        unsafe { MMIODerefWrapper::new(self.cb_base + index * CONTEXT_BANK_STRIDE) }
    }

    pub fn local(&self) -> Option<&LocalRegisterBlock> {
        self.local.as_deref()
    }

    pub fn base_addr(&self) -> usize {
        self.global.base_addr()
    }

    pub fn cb_base(&self) -> usize {
        self.cb_base
    }

    /// Number of context banks in the mapped window.
    pub fn cb_count(&self) -> usize {
        self.cb_count
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
