/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! TLB maintenance for context banks and whole domains.

use {
    crate::{
        barrier,
        context::ContextBank,
        domain::AttachedContext,
        error::{IommuError, Result},
        format::Asid,
        instance::IommuInstance,
        pgtable::interface::FlushOps,
        regs::TLBSTATUS,
        sync::{interface::Mutex, IRQSafeSpinLock},
        time::{read_poll_timeout_atomic, TLB_SYNC_TIMEOUT},
    },
    alloc::{sync::Arc, vec::Vec},
    log::{error, trace},
    tock_registers::interfaces::{Readable, Writeable},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// TLB maintenance callbacks of one domain, fanned out to every attached bank.
pub struct DomainTlb {
    attached: Arc<IRQSafeSpinLock<Vec<AttachedContext>>>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

/// Wait for outstanding invalidations on `ctx` to complete.
///
/// A bank whose sync never drains is marked wedged and reported once.
pub(crate) fn sync(instance: &IommuInstance, ctx: &ContextBank) -> Result<()> {
    let cb = instance.registers().context(ctx.index());

    cb.TLBSYNC.set(0);
    read_poll_timeout_atomic(
        instance.timer(),
        || cb.TLBSTATUS.is_set(TLBSTATUS::SACTIVE),
        |active| !*active,
        TLB_SYNC_TIMEOUT,
    )
    .map(|_| ())
    .map_err(|e| {
        if !ctx.mark_wedged() {
            error!(
                "{}: TLB sync on {} did not complete: {}",
                instance.name(),
                ctx.name(),
                e
            );
        }
        IommuError::TlbSyncTimeout {
            context: ctx.index(),
        }
    })
}

/// Invalidate every entry tagged with `asid` on `ctx` and wait for completion.
pub(crate) fn invalidate_asid(
    instance: &IommuInstance,
    ctx: &ContextBank,
    asid: Asid,
) -> Result<()> {
    let cb = instance.registers().context(ctx.index());

    barrier::wmb();
    cb.TLBIASID.set(asid.get().into());
    sync(instance, ctx)
}

/// Queue invalidation of `size` bytes at `iova`, one write per `granule`. No sync.
pub(crate) fn invalidate_range(
    instance: &IommuInstance,
    ctx: &ContextBank,
    asid: Asid,
    iova: u64,
    size: usize,
    granule: usize,
    leaf: bool,
) {
    if granule == 0 {
        return;
    }
    let cb = instance.registers().context(ctx.index());
    let format = instance.format();
    let reg = if leaf { &cb.TLBIVAL } else { &cb.TLBIVA };
    let step = format.tlbi_step(granule);
    let mut operand = format.tlbi_va(iova, asid);

    barrier::wmb();
    for _ in 0..size.div_ceil(granule) {
        reg.set(operand);
        operand = operand.wrapping_add(step);
    }
    trace!(
        "{}: invalidated {:#x}+{:#x} on {}",
        instance.name(),
        iova,
        size,
        ctx.name()
    );
}

impl DomainTlb {
    pub(crate) fn new(attached: Arc<IRQSafeSpinLock<Vec<AttachedContext>>>) -> Self {
        Self { attached }
    }

    /// Run `op` on every attached bank this side may touch. Secure banks and wedged
    /// banks are skipped; a clock failure skips that bank and is reported once.
    fn for_each_bank(
        &self,
        what: &str,
        mut op: impl FnMut(&IommuInstance, &ContextBank, Asid) -> Result<()>,
    ) {
        self.attached.lock(|attached| {
            let mut clock_failure = None;

            for entry in attached.iter() {
                let ctx = &entry.context;
                if ctx.is_secure() {
                    continue;
                }
                let state = ctx.state();
                if state.wedged {
                    trace!("{}: skipping wedged {}", what, ctx.name());
                    continue;
                }
                let Some(asid) = state.asid else {
                    continue;
                };
                let _clocks = match entry.instance.enable_clocks() {
                    Ok(guard) => guard,
                    Err(e) => {
                        clock_failure.get_or_insert(e);
                        continue;
                    }
                };
                if let Err(e) = op(&entry.instance, ctx, asid) {
                    error!("{} on {}: {}", what, ctx.name(), e);
                }
            }

            if let Some(e) = clock_failure {
                error!("{}: skipped banks: {}", what, e);
            }
        });
    }
}

impl FlushOps for DomainTlb {
    fn tlb_flush_all(&self) {
        self.for_each_bank("TLB flush", |instance, ctx, asid| {
            invalidate_asid(instance, ctx, asid)
        });
    }

    fn tlb_add_flush(&self, iova: u64, size: usize, granule: usize, leaf: bool) {
        self.for_each_bank("TLB invalidate", |instance, ctx, asid| {
            invalidate_range(instance, ctx, asid, iova, size, granule, leaf);
            Ok(())
        });
    }

    fn tlb_sync(&self) {
        self.for_each_bank("TLB sync", |instance, ctx, _| sync(instance, ctx));
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            format::TableFormat,
            instance::ContextDescriptor,
            testing::{Fixture, TLBIASID, TLBIVA, TLBIVAL, TLBSTATUS_OFFSET},
        },
        core::time::Duration,
    };

    fn attach(fx: &Fixture, index: usize) -> AttachedContext {
        let ctx = fx.instance.context(index).unwrap().clone();
        ctx.claim(1).unwrap();
        ctx.finish_attach(Asid::for_context(index).unwrap());
        AttachedContext {
            instance: fx.instance.clone(),
            context: ctx,
        }
    }

    #[test]
    fn range_invalidation_writes_one_operand_per_granule() {
        let fx = Fixture::builder()
            .format(TableFormat::Format64)
            .context("ctx2", 2)
            .build();
        let ctx = fx.instance.context(2).unwrap().clone();

        invalidate_range(&fx.instance, &ctx, Asid::new(2), 0x10_0000, 0x3000, 0x1000, true);

        // Only the last write is visible in plain memory.
        assert_eq!(fx.ctx_raw64(2, TLBIVAL), (0x102) | (2 << 48));
        assert_eq!(fx.ctx_raw64(2, TLBIVA), 0);
    }

    #[test]
    fn non_leaf_uses_tlbiva_in_32bit_format() {
        let fx = Fixture::builder()
            .format(TableFormat::Format32)
            .context("ctx1", 1)
            .build();
        let ctx = fx.instance.context(1).unwrap().clone();

        invalidate_range(&fx.instance, &ctx, Asid::new(1), 0x4000_0000, 0x2000, 0x1000, false);

        assert_eq!(fx.ctx_raw64(1, TLBIVA), 0x4000_1001);
        assert_eq!(fx.ctx_raw64(1, TLBIVAL), 0);
    }

    #[test]
    fn asid_invalidation_completes_when_sync_drains() {
        let fx = Fixture::builder().context("ctx0", 0).context("ctx4", 4).build();
        let ctx = fx.instance.context(4).unwrap().clone();

        invalidate_asid(&fx.instance, &ctx, Asid::new(4)).unwrap();

        assert_eq!(fx.ctx_raw32(4, TLBIASID), 4);
        assert_eq!(fx.ctx_raw32(0, TLBIASID), 0);
        assert!(!ctx.state().wedged);
    }

    #[test]
    fn stuck_sync_times_out_and_wedges_bank() {
        let fx = Fixture::builder()
            .timer_step(Duration::from_millis(50))
            .context("ctx0", 0)
            .build();
        let ctx = fx.instance.context(0).unwrap().clone();
        fx.ctx_raw_write32(0, TLBSTATUS_OFFSET, 1);

        let start = fx.timer.now();
        let err = sync(&fx.instance, &ctx).unwrap_err();
        let elapsed = fx.timer.now() - start;

        assert!(matches!(err, IommuError::TlbSyncTimeout { context: 0 }));
        assert!(ctx.state().wedged);
        assert!(elapsed >= TLB_SYNC_TIMEOUT);
        assert!(elapsed <= TLB_SYNC_TIMEOUT + Duration::from_millis(200));
    }

    #[test]
    fn domain_flush_skips_secure_and_wedged_banks() {
        let fx = Fixture::builder()
            .context("ctx0", 0)
            .secure_context("ctx1", 1)
            .context("ctx2", 2)
            .build();
        let list = alloc::vec![attach(&fx, 0), attach(&fx, 1), attach(&fx, 2)];
        fx.instance.context(2).unwrap().mark_wedged();
        let tlb = DomainTlb::new(Arc::new(IRQSafeSpinLock::new(list)));

        tlb.tlb_flush_all();

        // ASID 0 leaves no trace in memory; the clock count shows only bank 0 was touched.
        assert_eq!(fx.ctx_raw32(1, TLBIASID), 0);
        assert_eq!(fx.ctx_raw32(2, TLBIASID), 0);
        assert_eq!(fx.core_clock.enable_count(), 1);
    }

    #[test]
    fn domain_flush_reaches_every_live_bank() {
        let fx = Fixture::builder().context("ctx5", 5).context("ctx6", 6).build();
        let list = alloc::vec![attach(&fx, 5), attach(&fx, 6)];
        let tlb = DomainTlb::new(Arc::new(IRQSafeSpinLock::new(list)));

        tlb.tlb_flush_all();

        assert_eq!(fx.ctx_raw32(5, TLBIASID), 5);
        assert_eq!(fx.ctx_raw32(6, TLBIASID), 6);
        assert_eq!(fx.iface_clock.enabled(), 0);
    }

    #[test]
    fn clock_failure_skips_bank_without_panicking() {
        let fx = Fixture::builder().context("ctx5", 5).build();
        let list = alloc::vec![attach(&fx, 5)];
        let tlb = DomainTlb::new(Arc::new(IRQSafeSpinLock::new(list)));
        fx.core_clock.set_failing(true);

        tlb.tlb_add_flush(0x1000, 0x1000, 0x1000, true);
        tlb.tlb_sync();

        assert_eq!(fx.ctx_raw64(5, TLBIVAL), 0);
    }

    #[test]
    fn unattached_bank_is_ignored() {
        let fx = Fixture::builder().context("ctx3", 3).build();
        let ctx = Arc::new(ContextBank::new(&ContextDescriptor::new("ctx3", 3)));
        let list = alloc::vec![AttachedContext {
            instance: fx.instance.clone(),
            context: ctx,
        }];
        let tlb = DomainTlb::new(Arc::new(IRQSafeSpinLock::new(list)));
        tlb.tlb_flush_all();
        assert_eq!(fx.ctx_raw32(3, TLBIASID), 0);
    }
}
