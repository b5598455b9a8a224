/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Global and per-context fault interrupt handling.

use {
    crate::{
        context::ContextBank,
        domain::{Domain, DomainId},
        instance::IommuInstance,
        regs::{ContextRegister, FSYNR0},
        sync::{interface::Mutex, IRQSafeSpinLock},
        time::interface::TimeSource,
    },
    alloc::sync::Arc,
    bitflags::bitflags,
    core::{fmt, time::Duration},
    log::{error, warn},
    tock_registers::interfaces::{Readable, Writeable},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

bitflags! {
    /// Context bank fault status (FSR).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FaultStatus: u32 {
        /// Translation fault.
        const TF = 1 << 1;
        /// Access flag fault.
        const AFF = 1 << 2;
        /// Permission fault.
        const PF = 1 << 3;
        /// External fault.
        const EF = 1 << 4;
        /// TLB match conflict.
        const TLBMCF = 1 << 5;
        /// TLB lock fault.
        const TLBLKF = 1 << 6;
        /// Multiple hit fault.
        const MHF = 1 << 7;
        /// Stalled.
        const SS = 1 << 30;
        /// Another fault arrived while this one was pending.
        const MULTI = 1 << 31;
    }
}

bitflags! {
    /// Global fault status (GFSR).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct GlobalFaultStatus: u32 {
        /// Invalid context fault.
        const ICF = 1 << 0;
        /// Unidentified stream fault.
        const USF = 1 << 1;
        /// Stream match conflict fault.
        const SMCF = 1 << 2;
        /// Unimplemented context bank fault.
        const UCBF = 1 << 3;
        /// Unimplemented context interrupt fault.
        const UCIF = 1 << 4;
        /// Configuration access fault.
        const CAF = 1 << 5;
        /// External fault.
        const EF = 1 << 6;
        /// Permission fault.
        const PF = 1 << 7;
        /// Stage 2 summary.
        const SS = 1 << 30;
        const MULTI = 1 << 31;
    }
}

bitflags! {
    /// Access kind passed to fault reporters.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        const WRITE = 1 << 0;
    }
}

/// Interrupt handler result.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not ours.
    None,
    Handled,
}

/// What the fault reporter did with a context fault.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    Handled,
    /// Nobody registered interest; the fault gets dumped.
    NoHandler,
    /// The client will resolve the fault and clear FSR itself.
    Busy,
}

/// Fault interfaces.
pub mod interface {
    use super::*;

    /// Delivers context faults to whoever owns the domain.
    pub trait FaultReporter: Send + Sync {
        fn report_fault(
            &self,
            domain: &Domain,
            context: &ContextBank,
            iova: u64,
            flags: FaultFlags,
        ) -> FaultOutcome;
    }
}

/// Reporter for systems without fault clients.
#[derive(Default)]
pub struct NoFaultReporter;

/// Token bucket limiting fault dumps to `burst` per `interval`.
pub struct RateLimit {
    interval: Duration,
    burst: u32,
    state: IRQSafeSpinLock<RateLimitState>,
}

/// Snapshot of a context bank's diagnostic registers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextRegisterDump {
    pub far: u64,
    pub par: u64,
    pub fsr: u32,
    pub fsynr0: u32,
    pub fsynr1: u32,
    pub ttbr0: u64,
    pub ttbr1: u64,
    pub sctlr: u32,
    pub actlr: u32,
    pub mair0: u32,
    pub mair1: u32,
    /// Global per-bank registers, unreadable on secure instances.
    pub cbar: Option<u32>,
    pub cbfrsynra: Option<u32>,
}

/// Snapshot of the global fault registers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GlobalRegisterDump {
    pub gfar: u64,
    pub gfsr: u32,
    pub gfsynr0: u32,
    pub gfsynr1: u32,
    pub gfsynr2: u32,
}

//--------------------------------------------------------------------------------------------------
// Private Definitions
//--------------------------------------------------------------------------------------------------

struct RateLimitState {
    begin: Option<Duration>,
    printed: u32,
    missed: u32,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl interface::FaultReporter for NoFaultReporter {
    fn report_fault(&self, _: &Domain, _: &ContextBank, _: u64, _: FaultFlags) -> FaultOutcome {
        FaultOutcome::NoHandler
    }
}

impl RateLimit {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_BURST: u32 = 10;

    pub const fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst,
            state: IRQSafeSpinLock::new(RateLimitState {
                begin: None,
                printed: 0,
                missed: 0,
            }),
        }
    }

    /// Whether another message may go out now.
    pub fn allow(&self, timer: &dyn TimeSource) -> bool {
        let now = timer.uptime();
        self.state.lock(|s| {
            let begin = *s.begin.get_or_insert(now);
            if now.saturating_sub(begin) > self.interval {
                if s.missed > 0 {
                    warn!("{} fault dumps suppressed", s.missed);
                }
                s.begin = Some(now);
                s.printed = 0;
                s.missed = 0;
            }
            if s.printed < self.burst {
                s.printed += 1;
                true
            } else {
                s.missed += 1;
                false
            }
        })
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL, Self::DEFAULT_BURST)
    }
}

impl ContextRegisterDump {
    /// Read the diagnostic registers of bank `index`. Clocks must be on.
    pub fn capture(instance: &IommuInstance, index: usize) -> Self {
        let cb = instance.registers().context(index);
        let global = (!instance.is_secure()).then(|| instance.registers().global());

        Self {
            far: cb.read(ContextRegister::Far),
            par: cb.read(ContextRegister::Par),
            fsr: cb.FSR.get(),
            fsynr0: cb.FSYNR0.get(),
            fsynr1: cb.FSYNR1.get(),
            ttbr0: cb.TTBR0.get(),
            ttbr1: cb.TTBR1.get(),
            sctlr: cb.SCTLR.get(),
            actlr: cb.ACTLR.get(),
            mair0: cb.MAIR0.get(),
            mair1: cb.MAIR1.get(),
            cbar: global.map(|g| g.CBAR[index].get()),
            cbfrsynra: global.map(|g| g.CBFRSYNRA[index].get()),
        }
    }
}

impl GlobalRegisterDump {
    pub fn capture(instance: &IommuInstance) -> Self {
        let g = instance.registers().global();
        Self {
            gfar: g.GFAR.get(),
            gfsr: g.GFSR.get(),
            gfsynr0: g.GFSYNR0.get(),
            gfsynr1: g.GFSYNR1.get(),
            gfsynr2: g.GFSYNR2.get(),
        }
    }
}

/// Handle the global fault interrupt of `instance`.
pub(crate) fn handle_global_fault(instance: &IommuInstance) -> IrqReturn {
    instance.with_global_lock(|| {
        if instance.is_secure() {
            error!("non-secure interrupt from secure {}", instance.name());
            return IrqReturn::Handled;
        }

        let Ok(_clocks) = instance.enable_clocks() else {
            return IrqReturn::None;
        };

        let dump = GlobalRegisterDump::capture(instance);
        if dump.gfsr == 0 {
            return IrqReturn::None;
        }

        error!("unexpected {} global fault", instance.name());
        error!("{}", dump);
        instance.registers().global().GFSR.set(dump.gfsr);
        IrqReturn::Handled
    })
}

/// Handle a context fault interrupt of bank `ctx`.
pub(crate) fn handle_context_fault(
    instance: &IommuInstance,
    ctx: &ContextBank,
    lookup: impl FnOnce(DomainId) -> Option<Arc<Domain>>,
    reporter: &dyn interface::FaultReporter,
    ratelimit: &RateLimit,
) -> IrqReturn {
    ctx.with_fault_lock(|| {
        let Ok(_clocks) = instance.enable_clocks() else {
            return IrqReturn::None;
        };

        let cb = instance.registers().context(ctx.index());
        let fsr = cb.FSR.get();
        if fsr == 0 {
            return IrqReturn::None;
        }

        let outcome = match ctx.attached_domain().and_then(lookup) {
            Some(domain) => {
                let iova = cb.FAR.get();
                let flags = if cb.FSYNR0.is_set(FSYNR0::WNR) {
                    FaultFlags::WRITE
                } else {
                    FaultFlags::empty()
                };
                reporter.report_fault(&domain, ctx, iova, flags)
            }
            None => {
                error!("fault on {} without a domain", ctx.name());
                FaultOutcome::NoHandler
            }
        };

        if outcome == FaultOutcome::NoHandler && ratelimit.allow(instance.timer()) {
            error!("unexpected IOMMU page fault");
            error!("name = {}", instance.name());
            error!("context = {} ({})", ctx.name(), ctx.index());
            error!("{}", ContextRegisterDump::capture(instance, ctx.index()));
        }

        if outcome != FaultOutcome::Busy {
            cb.FSR.set(fsr);
        }
        IrqReturn::Handled
    })
}

/// Handle a fault interrupt of a bank owned by the secure world. Fault details are not
/// readable from here, so this only reports faults arriving while the instance is idle.
pub(crate) fn handle_secure_context_fault(instance: &IommuInstance) -> IrqReturn {
    instance.with_global_lock(|| {
        if instance.attached_contexts() == 0 {
            error!("unexpected IOMMU page fault from secure context bank");
            error!("name = {}", instance.name());
            error!("power is off, fault information unavailable");
        }
        IrqReturn::Handled
    })
}

impl fmt::Display for FaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_flags(f, self.bits(), self.iter_names().map(|(name, _)| name))
    }
}

impl fmt::Display for GlobalFaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_flags(f, self.bits(), self.iter_names().map(|(name, _)| name))
    }
}

impl fmt::Display for ContextRegisterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FAR    = {:016x}", self.far)?;
        writeln!(f, "PAR    = {:016x}", self.par)?;
        writeln!(f, "FSR    = {}", FaultStatus::from_bits_retain(self.fsr))?;
        writeln!(f, "FSYNR0 = {:08x}    FSYNR1 = {:08x}", self.fsynr0, self.fsynr1)?;
        writeln!(f, "TTBR0  = {:016x}", self.ttbr0)?;
        writeln!(f, "TTBR1  = {:016x}", self.ttbr1)?;
        writeln!(f, "SCTLR  = {:08x}    ACTLR  = {:08x}", self.sctlr, self.actlr)?;
        writeln!(
            f,
            "CBAR   = {}    CBFRSYNRA = {}",
            Unknown(self.cbar),
            Unknown(self.cbfrsynra)
        )?;
        write!(f, "MAIR0  = {:08x}    MAIR1  = {:08x}", self.mair0, self.mair1)?;
        if self.cbar.is_none() {
            write!(f, "\nNOTE: global registers unreadable on a secure instance")?;
        }
        Ok(())
    }
}

impl fmt::Display for GlobalRegisterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GFAR    = {:016x}", self.gfar)?;
        writeln!(f, "GFSR    = {}", GlobalFaultStatus::from_bits_retain(self.gfsr))?;
        writeln!(f, "GFSYNR0 = {:08x}", self.gfsynr0)?;
        writeln!(f, "GFSYNR1 = {:08x}", self.gfsynr1)?;
        write!(f, "GFSYNR2 = {:08x}", self.gfsynr2)
    }
}

//--------------------------------------------------------------------------------------------------
// Private Code
//--------------------------------------------------------------------------------------------------

fn write_flags<'a>(
    f: &mut fmt::Formatter<'_>,
    bits: u32,
    names: impl Iterator<Item = &'a str>,
) -> fmt::Result {
    write!(f, "{:08x} [", bits)?;
    for name in names {
        write!(f, "{} ", name)?;
    }
    write!(f, "]")
}

struct Unknown(Option<u32>);

impl fmt::Display for Unknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{:08x}", v),
            None => write!(f, "????????"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
