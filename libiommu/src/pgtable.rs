/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Seam to the generic page table walker.
//!
//! The walker owns the table memory and its layout. The driver only hands it a
//! [`PageTableConfig`] to fill in, forwards map/unmap requests, and receives TLB
//! maintenance callbacks through [`interface::FlushOps`].

use {
    crate::format::TableFormat,
    alloc::{boxed::Box, string::String, sync::Arc},
    bitflags::bitflags,
    snafu::Snafu,
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

pub const SZ_4K: usize = 0x1000;
pub const SZ_64K: usize = 0x1_0000;
pub const SZ_2M: usize = 0x20_0000;
pub const SZ_32M: usize = 0x200_0000;
pub const SZ_1G: usize = 0x4000_0000;

/// Page and block sizes the hardware walker supports.
pub const PGSIZE_BITMAP: usize = SZ_4K | SZ_64K | SZ_2M | SZ_32M | SZ_1G;

bitflags! {
    /// Access permissions and attributes of a mapping.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CACHE = 1 << 2;
        const NOEXEC = 1 << 3;
        const MMIO = 1 << 4;
        const PRIV = 1 << 5;
    }
}

/// Walker configuration. Sizes are filled in by the driver, table bases and
/// attributes by the walker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageTableConfig {
    pub pgsize_bitmap: usize,
    pub ias: u32,
    pub oas: u32,
    /// Table walks snoop CPU caches.
    pub coherent_walk: bool,
    /// Device doing DMA on the tables, for cache maintenance.
    pub iommu_dev: String,
    pub tcr: u64,
    pub ttbr: [u64; 2],
    pub mair: [u32; 2],
}

/// Page table walker errors.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum PageTableError {
    #[snafu(display("out of table memory"))]
    NoMemory,
    #[snafu(display("invalid size or alignment"))]
    Invalid,
    #[snafu(display("range already mapped"))]
    Exists,
}

/// Page table interfaces.
pub mod interface {
    use super::*;

    /// TLB maintenance callbacks the walker issues while changing tables.
    pub trait FlushOps: Send + Sync {
        /// Invalidate every entry of the owning domain.
        fn tlb_flush_all(&self);
        /// Queue invalidation of `size` bytes at `iova`, one `granule` at a time.
        fn tlb_add_flush(&self, iova: u64, size: usize, granule: usize, leaf: bool);
        /// Wait for queued invalidations to complete.
        fn tlb_sync(&self);
    }

    /// One set of page tables.
    pub trait PageTableOps: Send {
        fn map(&mut self, iova: u64, paddr: u64, size: usize, prot: Prot)
            -> Result<(), PageTableError>;
        /// Returns the number of bytes unmapped.
        fn unmap(&mut self, iova: u64, size: usize) -> usize;
        /// Returns 0 when `iova` is not mapped.
        fn iova_to_phys(&self, iova: u64) -> u64;
    }

    /// Builds and destroys page tables.
    pub trait PageTableAllocator: Send + Sync {
        /// Create tables for `format`. Fills in `cfg.tcr`, `cfg.ttbr` and `cfg.mair`.
        fn alloc(
            &self,
            format: TableFormat,
            cfg: &mut PageTableConfig,
            tlb: Arc<dyn FlushOps>,
        ) -> Option<Box<dyn PageTableOps>>;

        fn free(&self, ops: Box<dyn PageTableOps>) {
            drop(ops);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl PageTableConfig {
    /// Configuration for a context of the given format.
    pub fn for_format(format: TableFormat, iommu_dev: &str) -> Self {
        Self {
            pgsize_bitmap: PGSIZE_BITMAP,
            ias: format.ias(),
            oas: format.oas(),
            coherent_walk: true,
            iommu_dev: iommu_dev.into(),
            ..Default::default()
        }
    }
}
