/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Translation domains: one address space shared by every context bank attached to it.
//!
//! Lock order is `setup`, then `tables`, then `attached`, then a bank's own state.
//! `setup` serializes attach and detach and may block; the other two are spinning locks.
//! The walker calls back into [`DomainTlb`] with `tables` held, which is why the attached
//! set lives behind its own lock.

use {
    crate::{
        context::{self, Claim, ContextBank, Release},
        error::{IommuError, Result},
        format::{Asid, TableFormat},
        instance::IommuInstance,
        pgtable::{
            interface::{FlushOps, PageTableAllocator, PageTableOps},
            PageTableConfig, Prot,
        },
        secure::interface::SecureMonitor,
        sync::{interface::Mutex, IRQSafeSpinLock, SleepLock},
        tlb::{self, DomainTlb},
    },
    alloc::{boxed::Box, string::String, sync::Arc, vec::Vec},
    core::fmt,
    log::{debug, error, info, warn},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

pub type DomainId = u32;

/// Domain flavours the IOMMU core asks for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DomainType {
    Blocked,
    Identity,
    Unmanaged,
    Dma,
}

/// Addressable IOVA window of a domain.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    pub aperture_start: u64,
    pub aperture_end: u64,
    pub force_aperture: bool,
}

/// A context bank attached to a domain, with the instance it lives in.
#[derive(Clone)]
pub struct AttachedContext {
    pub instance: Arc<IommuInstance>,
    pub context: Arc<ContextBank>,
}

/// A translation domain.
pub struct Domain {
    id: DomainId,
    kind: DomainType,
    setup: SleepLock<DomainSetup>,
    tables: IRQSafeSpinLock<Tables>,
    attached: Arc<IRQSafeSpinLock<Vec<AttachedContext>>>,
    tlb: Arc<DomainTlb>,
}

//--------------------------------------------------------------------------------------------------
// Private Definitions
//--------------------------------------------------------------------------------------------------

#[derive(Default)]
struct DomainSetup {
    asid: Option<Asid>,
    geometry: Option<Geometry>,
    pgsize_bitmap: usize,
}

struct PageTables {
    ops: Box<dyn PageTableOps>,
    cfg: PageTableConfig,
    format: TableFormat,
}

#[derive(Default)]
struct Tables {
    pgtable: Option<PageTables>,
    client_name: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl DomainType {
    pub const fn is_supported(self) -> bool {
        matches!(self, Self::Unmanaged | Self::Dma)
    }
}

impl AttachedContext {
    fn is(&self, ctx: &Arc<ContextBank>) -> bool {
        Arc::ptr_eq(&self.context, ctx)
    }
}

impl Domain {
    pub(crate) fn new(id: DomainId, kind: DomainType) -> Self {
        let attached = Arc::new(IRQSafeSpinLock::new(Vec::new()));
        Self {
            id,
            kind,
            setup: SleepLock::new(DomainSetup::default()),
            tables: IRQSafeSpinLock::new(Tables::default()),
            tlb: Arc::new(DomainTlb::new(attached.clone())),
            attached,
        }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn kind(&self) -> DomainType {
        self.kind
    }

    /// ASID of the first bank attached, stable until the last one detaches.
    pub fn asid(&self) -> Option<Asid> {
        self.setup.lock(|s| s.asid)
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.setup.lock(|s| s.geometry)
    }

    /// Supported page sizes, known once page tables exist.
    pub fn pgsize_bitmap(&self) -> usize {
        self.setup.lock(|s| s.pgsize_bitmap)
    }

    /// Name of the first device attached.
    pub fn client_name(&self) -> Option<String> {
        self.tables.lock(|t| t.client_name.clone())
    }

    pub fn has_page_tables(&self) -> bool {
        self.tables.lock(|t| t.pgtable.is_some())
    }

    /// Banks currently attached.
    pub fn contexts(&self) -> Vec<Arc<ContextBank>> {
        self.attached
            .lock(|list| list.iter().map(|a| a.context.clone()).collect())
    }

    pub fn is_attached(&self, ctx: &Arc<ContextBank>) -> bool {
        self.attached.lock(|list| list.iter().any(|a| a.is(ctx)))
    }

    /// Attach bank `ctx` of `instance`. Joining a bank already attached here only
    /// counts the extra master.
    pub(crate) fn attach(
        &self,
        instance: &Arc<IommuInstance>,
        ctx: &Arc<ContextBank>,
        client: &str,
        scm: &dyn SecureMonitor,
        allocator: &dyn PageTableAllocator,
    ) -> Result<()> {
        self.setup.lock(|setup| {
            match ctx.claim(self.id) {
                Ok(Claim::First) => {}
                Ok(Claim::Joined(count)) => {
                    debug!(
                        "{}: {} joins domain {} ({} masters)",
                        instance.name(),
                        ctx.name(),
                        self.id,
                        count
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "{}: {} is attached to domain {:?}",
                        instance.name(),
                        ctx.name(),
                        ctx.attached_domain()
                    );
                    return Err(e);
                }
            }

            match self.attach_first(setup, instance, ctx, scm, allocator) {
                Ok(asid) => {
                    self.tables.lock(|t| {
                        t.client_name.get_or_insert_with(|| client.into());
                    });
                    ctx.finish_attach(asid);
                    self.attached.lock(|list| {
                        list.push(AttachedContext {
                            instance: instance.clone(),
                            context: ctx.clone(),
                        })
                    });
                    setup.asid.get_or_insert(asid);
                    info!(
                        "{}: attached {} {} context to domain {}",
                        instance.name(),
                        ctx.name(),
                        if ctx.needs_secure_map() { "secure" } else { "unsecured" },
                        self.id
                    );
                    Ok(())
                }
                Err(e) => {
                    ctx.abandon_claim();
                    error!("{}: attaching {} failed: {}", instance.name(), ctx.name(), e);
                    Err(e)
                }
            }
        })
    }

    /// Drop one master's attachment of `ctx`. The last one tears the bank down.
    pub(crate) fn detach(
        &self,
        instance: &Arc<IommuInstance>,
        ctx: &Arc<ContextBank>,
    ) -> Result<()> {
        self.setup.lock(|setup| {
            match ctx.release(self.id)? {
                Release::Remaining(count) => {
                    debug!("{}: {} still has {} masters", instance.name(), ctx.name(), count);
                    return Ok(());
                }
                Release::Last => {}
            }

            // A bank that cannot be reset stays attached.
            if let Err(e) = Self::teardown(instance, ctx) {
                ctx.abandon_release();
                error!("{}: detaching {} failed: {}", instance.name(), ctx.name(), e);
                return Err(e);
            }

            ctx.finish_detach();
            let empty = self.attached.lock(|list| {
                list.retain(|a| !a.is(ctx));
                list.is_empty()
            });
            instance.release_attach_slot();
            if empty {
                setup.asid = None;
            }

            info!("{}: detached {} from domain {}", instance.name(), ctx.name(), self.id);
            Ok(())
        })
    }

    pub(crate) fn map(&self, iova: u64, paddr: u64, size: usize, prot: Prot) -> Result<()> {
        self.tables.lock(|t| match t.pgtable.as_mut() {
            Some(pt) => pt.ops.map(iova, paddr, size, prot).map_err(IommuError::from),
            None => {
                error!("no page tables for client {}", ClientName(&t.client_name));
                Err(IommuError::NoDevice)
            }
        })
    }

    /// Returns the number of bytes unmapped.
    pub(crate) fn unmap(&self, iova: u64, size: usize) -> Result<usize> {
        self.tables.lock(|t| match t.pgtable.as_mut() {
            Some(pt) => Ok(pt.ops.unmap(iova, size)),
            None => {
                error!("no page tables for client {}", ClientName(&t.client_name));
                Err(IommuError::NoDevice)
            }
        })
    }

    pub(crate) fn iova_to_phys(&self, iova: u64) -> u64 {
        self.tables
            .lock(|t| t.pgtable.as_ref().map_or(0, |pt| pt.ops.iova_to_phys(iova)))
    }

    pub(crate) fn iotlb_sync(&self) {
        if self.has_page_tables() {
            self.tlb.tlb_sync();
        }
    }

    pub(crate) fn flush_iotlb_all(&self) {
        if self.has_page_tables() {
            self.tlb.tlb_flush_all();
        }
    }

    /// Hand the page tables back for freeing. Fails while banks are attached.
    pub(crate) fn release_page_tables(&self) -> Result<Option<Box<dyn PageTableOps>>> {
        self.setup.lock(|_| {
            if self.attached.lock(|list| !list.is_empty()) {
                return Err(IommuError::Busy { what: "domain" });
            }
            Ok(self.tables.lock(|t| t.pgtable.take().map(|pt| pt.ops)))
        })
    }

    //----------------------------------------------------------------------------------------------
    // Attach internals
    //----------------------------------------------------------------------------------------------

    fn attach_first(
        &self,
        setup: &mut DomainSetup,
        instance: &Arc<IommuInstance>,
        ctx: &Arc<ContextBank>,
        scm: &dyn SecureMonitor,
        allocator: &dyn PageTableAllocator,
    ) -> Result<Asid> {
        let _clocks = instance.enable_clocks()?;

        instance.claim_attach_slot(scm, ctx)?;

        let installed = self.install(setup, instance, ctx, scm, allocator);
        if installed.is_err() {
            instance.release_attach_slot();
        }
        installed
    }

    fn install(
        &self,
        setup: &mut DomainSetup,
        instance: &IommuInstance,
        ctx: &ContextBank,
        scm: &dyn SecureMonitor,
        allocator: &dyn PageTableAllocator,
    ) -> Result<Asid> {
        let cfg = self.ensure_page_tables(setup, instance, ctx, allocator)?;

        if ctx.is_secure() {
            // Programmed by the secure world; only the ASID is tracked here.
            return Asid::for_context(ctx.index()).ok_or(IommuError::InvalidArgument {
                what: "context bank index",
            });
        }

        let asid = context::program(instance, ctx, &cfg, scm)?;

        if instance.model().invalidates_on_attach() {
            if let Err(e) = tlb::invalidate_asid(instance, ctx, asid) {
                context::reset(instance, ctx.index());
                return Err(e);
            }
        }

        Ok(asid)
    }

    /// Page tables are created by the first attach and shared by later ones.
    fn ensure_page_tables(
        &self,
        setup: &mut DomainSetup,
        instance: &IommuInstance,
        ctx: &ContextBank,
        allocator: &dyn PageTableAllocator,
    ) -> Result<PageTableConfig> {
        let format = instance.format();

        let existing = self
            .tables
            .lock(|t| t.pgtable.as_ref().map(|pt| (pt.format, pt.cfg.clone())));
        if let Some((existing, cfg)) = existing {
            if existing != format {
                return Err(IommuError::InvalidArgument {
                    what: "page table format of domain",
                });
            }
            return Ok(cfg);
        }

        let mut cfg = PageTableConfig::for_format(format, ctx.name());
        let tlb: Arc<dyn FlushOps> = self.tlb.clone();
        let ops = allocator.alloc(format, &mut cfg, tlb).ok_or_else(|| {
            error!("{}: failed to allocate page tables for {}", instance.name(), ctx.name());
            IommuError::OutOfMemory
        })?;

        setup.geometry = Some(Geometry {
            aperture_start: 0,
            aperture_end: (1u64 << cfg.ias) - 1,
            force_aperture: true,
        });
        setup.pgsize_bitmap = cfg.pgsize_bitmap;

        self.tables.lock(|t| {
            t.pgtable = Some(PageTables {
                ops,
                cfg: cfg.clone(),
                format,
            })
        });
        Ok(cfg)
    }

    /// Return a non-secure bank to reset, invalidating first on models that want it.
    fn teardown(instance: &IommuInstance, ctx: &ContextBank) -> Result<()> {
        if ctx.is_secure() {
            return Ok(());
        }

        let _clocks = instance.enable_clocks()?;

        let state = ctx.state();
        if instance.model().invalidates_on_detach() && !state.wedged {
            if let Some(asid) = state.asid {
                if let Err(e) = tlb::invalidate_asid(instance, ctx, asid) {
                    warn!("{}: {}", instance.name(), e);
                }
            }
        }

        context::reset(instance, ctx.index());
        Ok(())
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

struct ClientName<'a>(&'a Option<String>);

impl fmt::Display for ClientName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "<none>"),
        }
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
            regs::ContextRegister,
            testing::{FakePageTables, FakeScm, Fixture},
        },
    };

    #[test]
    fn unattached_domain_has_no_tables() {
        let domain = Domain::new(1, DomainType::Unmanaged);
        assert!(matches!(
            domain.map(0x1000, 0x8000_0000, 0x1000, Prot::READ),
            Err(IommuError::NoDevice)
        ));
        assert!(matches!(domain.unmap(0x1000, 0x1000), Err(IommuError::NoDevice)));
        assert_eq!(domain.iova_to_phys(0x1000), 0);
        assert_eq!(domain.asid(), None);
        domain.iotlb_sync();
        domain.flush_iotlb_all();
    }

    #[test]
    fn first_attach_sets_geometry_and_client() {
        let fx = Fixture::builder().context("ctx1", 1).build();
        let ctx = fx.instance.context(1).unwrap().clone();
        let domain = Domain::new(7, DomainType::Dma);

        domain
            .attach(&fx.instance, &ctx, "camera", &FakeScm::default(), &FakePageTables::default())
            .unwrap();

        assert_eq!(domain.client_name().as_deref(), Some("camera"));
        assert_eq!(domain.asid(), Some(Asid::new(1)));
        let geometry = domain.geometry().unwrap();
        assert_eq!(geometry.aperture_end, (1u64 << fx.instance.format().ias()) - 1);
        assert!(geometry.force_aperture);
        assert_eq!(domain.pgsize_bitmap(), crate::pgtable::PGSIZE_BITMAP);
        assert_eq!(ctx.attached_domain(), Some(7));
    }

    #[test]
    fn allocation_failure_rolls_back() {
        let fx = Fixture::builder().sec_id(4).context("ctx1", 1).build();
        let ctx = fx.instance.context(1).unwrap().clone();
        let domain = Domain::new(7, DomainType::Unmanaged);
        let pgtables = FakePageTables::default();
        pgtables.set_failing(true);

        let err = domain
            .attach(&fx.instance, &ctx, "camera", &FakeScm::default(), &pgtables)
            .unwrap_err();

        assert!(matches!(err, IommuError::OutOfMemory));
        assert_eq!(ctx.state(), Default::default());
        assert_eq!(fx.instance.attached_contexts(), 0);
        assert!(domain.contexts().is_empty());
        assert_eq!(fx.iface_clock.enabled(), 0);
    }

    #[test]
    fn rejected_attach_leaves_client_unset() {
        let fx = Fixture::builder().context("ctx1", 1).build();
        let ctx = fx.instance.context(1).unwrap().clone();
        let scm = FakeScm::default();
        let pgtables = FakePageTables::default();
        let owner = Domain::new(1, DomainType::Unmanaged);
        let other = Domain::new(2, DomainType::Unmanaged);
        owner.attach(&fx.instance, &ctx, "dev1", &scm, &pgtables).unwrap();

        assert!(matches!(
            other.attach(&fx.instance, &ctx, "dev1", &scm, &pgtables),
            Err(IommuError::Busy { .. })
        ));
        assert_eq!(other.client_name(), None);

        let fx = Fixture::builder().context("ctx1", 1).build();
        let ctx = fx.instance.context(1).unwrap().clone();
        pgtables.set_failing(true);
        assert!(other.attach(&fx.instance, &ctx, "dev2", &scm, &pgtables).is_err());
        assert_eq!(other.client_name(), None);
    }

    #[test]
    fn clock_failure_keeps_bank_attached_on_last_detach() {
        let fx = Fixture::builder().context("ctx1", 1).build();
        let ctx = fx.instance.context(1).unwrap().clone();
        let domain = Domain::new(3, DomainType::Unmanaged);
        domain
            .attach(&fx.instance, &ctx, "gpu", &FakeScm::default(), &FakePageTables::default())
            .unwrap();
        let sctlr = fx.ctx_read(1, ContextRegister::Sctlr);
        let ttbr0 = fx.ctx_read(1, ContextRegister::Ttbr0);

        fx.core_clock.set_failing(true);
        assert!(matches!(
            domain.detach(&fx.instance, &ctx),
            Err(IommuError::ClockEnable { .. })
        ));

        assert_eq!(ctx.attach_count(), 1);
        assert_eq!(ctx.attached_domain(), Some(3));
        assert_eq!(ctx.asid(), Some(Asid::new(1)));
        assert!(domain.is_attached(&ctx));
        assert_eq!(domain.asid(), Some(Asid::new(1)));
        assert_eq!(fx.instance.attached_contexts(), 1);
        assert_eq!(fx.ctx_read(1, ContextRegister::Sctlr), sctlr);
        assert_eq!(fx.ctx_read(1, ContextRegister::Ttbr0), ttbr0);
        assert!(matches!(
            domain.release_page_tables(),
            Err(IommuError::Busy { .. })
        ));

        fx.core_clock.set_failing(false);
        domain.detach(&fx.instance, &ctx).unwrap();
        assert_eq!(fx.ctx_read(1, ContextRegister::Sctlr), 0);
        assert_eq!(fx.instance.attached_contexts(), 0);
        assert!(domain.release_page_tables().unwrap().is_some());
    }

    #[test]
    fn release_refused_while_attached() {
        let fx = Fixture::builder().context("ctx1", 1).build();
        let ctx = fx.instance.context(1).unwrap().clone();
        let domain = Domain::new(2, DomainType::Unmanaged);
        domain
            .attach(&fx.instance, &ctx, "gpu", &FakeScm::default(), &FakePageTables::default())
            .unwrap();

        assert!(matches!(
            domain.release_page_tables(),
            Err(IommuError::Busy { .. })
        ));
        domain.detach(&fx.instance, &ctx).unwrap();
        assert!(domain.release_page_tables().unwrap().is_some());
        assert!(!domain.has_page_tables());
    }
}
