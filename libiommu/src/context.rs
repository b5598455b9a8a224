/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Context banks and their programming state machine.
//!
//! A bank moves between two states: *reset*, where every translation register is zero and
//! translation is off, and *programmed*, where it walks the owning domain's tables tagged
//! with its ASID. [`reset`] and [`program`] are the only transitions and both leave the
//! bank in a fully defined state.

use {
    crate::{
        barrier,
        domain::DomainId,
        error::{IommuError, Result},
        format::Asid,
        instance::{ContextDescriptor, IommuInstance},
        pgtable::PageTableConfig,
        regs::{ContextBankRegisterBlock, SCTLR},
        secure::interface::SecureMonitor,
        sync::{interface::Mutex, IRQSafeSpinLock, SleepLock},
    },
    alloc::string::String,
    log::{debug, error},
    tock_registers::interfaces::Writeable,
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Attachment bookkeeping of a context bank.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextState {
    pub asid: Option<Asid>,
    /// Number of masters sharing the attachment.
    pub attach_count: u32,
    pub attached_domain: Option<DomainId>,
    /// A TLB sync timed out; the bank is skipped until reprogrammed.
    pub wedged: bool,
}

/// One translation context of an instance.
pub struct ContextBank {
    index: usize,
    name: String,
    secure: bool,
    needs_secure_map: bool,
    state: IRQSafeSpinLock<ContextState>,
    fault_lock: SleepLock<()>,
}

/// Outcome of claiming a context for a domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Claim {
    /// First attacher; the bank must be programmed.
    First,
    /// Already attached to the same domain.
    Joined(u32),
}

/// Outcome of releasing a claim.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Release {
    /// Last attacher gone; the bank must be torn down.
    Last,
    Remaining(u32),
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl ContextBank {
    pub(crate) fn new(desc: &ContextDescriptor) -> Self {
        Self {
            index: desc.index,
            name: desc.name.clone(),
            secure: desc.secure,
            needs_secure_map: desc.needs_secure_map,
            state: IRQSafeSpinLock::new(ContextState::default()),
            fault_lock: SleepLock::new(()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn needs_secure_map(&self) -> bool {
        self.needs_secure_map
    }

    /// Snapshot of the attachment bookkeeping.
    pub fn state(&self) -> ContextState {
        self.state.lock(|s| *s)
    }

    pub fn asid(&self) -> Option<Asid> {
        self.state().asid
    }

    pub fn attached_domain(&self) -> Option<DomainId> {
        self.state().attached_domain
    }

    pub fn attach_count(&self) -> u32 {
        self.state().attach_count
    }

    /// Claim the bank for `domain`. A bank serves a single domain at a time.
    pub(crate) fn claim(&self, domain: DomainId) -> Result<Claim> {
        self.state.lock(|s| {
            if s.attach_count == 0 {
                s.attach_count = 1;
                s.attached_domain = Some(domain);
                return Ok(Claim::First);
            }
            if s.attached_domain == Some(domain) {
                s.attach_count += 1;
                return Ok(Claim::Joined(s.attach_count));
            }
            Err(IommuError::Busy {
                what: "context bank",
            })
        })
    }

    /// Undo a [`Claim::First`] after a failed attach.
    pub(crate) fn abandon_claim(&self) {
        self.state.lock(|s| *s = ContextState::default());
    }

    pub(crate) fn finish_attach(&self, asid: Asid) {
        self.state.lock(|s| {
            s.asid = Some(asid);
            s.wedged = false;
        });
    }

    /// Drop one attachment of `domain`.
    pub(crate) fn release(&self, domain: DomainId) -> Result<Release> {
        self.state.lock(|s| {
            if s.attach_count == 0 || s.attached_domain != Some(domain) {
                return Err(IommuError::NotAttached {
                    context: self.index,
                });
            }
            s.attach_count -= 1;
            if s.attach_count > 0 {
                Ok(Release::Remaining(s.attach_count))
            } else {
                Ok(Release::Last)
            }
        })
    }

    /// Undo a [`Release::Last`] when the bank could not be torn down.
    pub(crate) fn abandon_release(&self) {
        self.state.lock(|s| s.attach_count += 1);
    }

    pub(crate) fn finish_detach(&self) {
        self.state.lock(|s| *s = ContextState::default());
    }

    /// Returns whether the bank was already wedged.
    pub(crate) fn mark_wedged(&self) -> bool {
        self.state.lock(|s| core::mem::replace(&mut s.wedged, true))
    }

    pub(crate) fn with_fault_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.fault_lock.lock(|_| f())
    }
}

/// Return bank `index` to the reset state: translation off, every register zeroed.
/// ACTLR survives on models that keep implementation-defined settings there.
pub(crate) fn reset(instance: &IommuInstance, index: usize) {
    let cb = instance.registers().context(index);

    if !instance.model().preserves_actlr() {
        cb.ACTLR.set(0);
    }
    cb.FAR.set(0);
    cb.FSRRESTORE.set(0);
    cb.MAIR1.set(0);
    cb.PAR.set(0);
    cb.MAIR0.set(0);
    cb.SCTLR.set(0);
    cb.TCR2.set(0);
    cb.TTBCR.set(0);
    cb.TTBR0.set(0);
    cb.TTBR1.set(0);

    barrier::mb();
}

/// Program bank `ctx` to walk the tables described by `cfg` and enable translation.
///
/// On failure the bank is left in the reset state.
pub(crate) fn program(
    instance: &IommuInstance,
    ctx: &ContextBank,
    cfg: &PageTableConfig,
    scm: &dyn SecureMonitor,
) -> Result<Asid> {
    let index = ctx.index();
    let format = instance.format();
    let asid = Asid::for_context(index).ok_or(IommuError::InvalidArgument {
        what: "context bank index",
    })?;

    reset(instance, index);

    if format.needs_secure_switch() {
        match instance.sec_id() {
            Some(sec_id) => {
                if let Err(e) = scm.set_pt_format(sec_id, index, format.secure_format_id()) {
                    error!(
                        "{}: switching {} to {} tables failed: {}",
                        instance.name(),
                        ctx.name(),
                        format,
                        e
                    );
                    reset(instance, index);
                    return Err(IommuError::Unrecoverable {
                        context: index,
                        reason: "secure page table format switch failed",
                    });
                }
            }
            None => debug!("{}: no secure engine, format switch skipped", instance.name()),
        }
    }

    let cb = instance.registers().context(index);

    cb.TTBCR.set(format.ttbcr(cfg.tcr));
    cb.TCR2.set(format.tcr2(cfg.tcr));
    cb.TTBR0.set(format.ttbr_with_asid(cfg.ttbr[0], asid));
    cb.TTBR1.set(format.ttbr_with_asid(cfg.ttbr[1], asid));
    cb.MAIR0.set(cfg.mair[0]);
    cb.MAIR1.set(cfg.mair[1]);

    // Table bases must land before translation is switched on.
    barrier::mb();

    enable(&cb);

    barrier::mb();

    debug!(
        "{}: programmed {} with ASID {}",
        instance.name(),
        ctx.name(),
        asid
    );

    Ok(asid)
}

/// Turn translation on with fault reporting and interrupts, faults terminate.
fn enable(cb: &ContextBankRegisterBlock) {
    cb.SCTLR.write(
        SCTLR::CFIE::SET
            + SCTLR::CFRE::SET
            + SCTLR::AFE::SET
            + SCTLR::TRE::SET
            + SCTLR::ASIDPNE::SET
            + SCTLR::HUPCF::SET
            + SCTLR::CFCFG::Terminate
            + SCTLR::M::SET,
    );
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
