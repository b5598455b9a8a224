/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Entry points the IOMMU core calls into.

use {
    crate::{
        domain::{Domain, DomainId, DomainType},
        error::{IommuError, Result},
        fault::{self, interface::FaultReporter, IrqReturn, RateLimit},
        instance::IommuInstance,
        pgtable::{interface::PageTableAllocator, Prot, PGSIZE_BITMAP},
        registry::{interface::MasterLookup, DeviceId, Master, PhandleArgs, Registry},
        secure::interface::SecureMonitor,
        sync::{interface::Mutex, SleepLock},
    },
    alloc::{
        collections::BTreeMap,
        sync::{Arc, Weak},
    },
    core::sync::atomic::{AtomicU32, Ordering},
    log::{debug, warn},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Optional features the IOMMU core may ask about.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Capability {
    CacheCoherency,
    NoExec,
    InterruptRemapping,
}

/// Driver interfaces.
pub mod interface {
    use super::*;

    /// Operations of an IOMMU driver.
    pub trait IommuOps {
        /// Returns `None` for unsupported domain types.
        fn domain_alloc(&self, kind: DomainType) -> Option<Arc<Domain>>;
        /// Fails with `Busy` while contexts are still attached.
        fn domain_free(&self, domain: Arc<Domain>) -> Result<()>;
        fn attach_dev(&self, domain: &Domain, device: DeviceId) -> Result<()>;
        fn detach_dev(&self, domain: &Domain, device: DeviceId) -> Result<()>;
        fn map(&self, domain: &Domain, iova: u64, paddr: u64, size: usize, prot: Prot)
            -> Result<()>;
        /// Returns the number of bytes unmapped.
        fn unmap(&self, domain: &Domain, iova: u64, size: usize) -> Result<usize>;
        fn iotlb_sync(&self, domain: &Domain);
        fn flush_iotlb_all(&self, domain: &Domain);
        /// Returns 0 for unmapped addresses.
        fn iova_to_phys(&self, domain: &Domain, iova: u64) -> u64;
        fn of_xlate(&self, device: DeviceId, device_name: &str, spec: PhandleArgs<'_>)
            -> Result<()>;
        fn capable(&self, cap: Capability) -> bool;
        fn pgsize_bitmap(&self) -> usize;
    }
}

/// The SMMU driver: domains, instances and the collaborators they call out to.
pub struct SmmuDriver {
    registry: Arc<Registry>,
    scm: Arc<dyn SecureMonitor>,
    pgtables: Arc<dyn PageTableAllocator>,
    reporter: Arc<dyn FaultReporter>,
    domains: SleepLock<BTreeMap<DomainId, Weak<Domain>>>,
    next_domain_id: AtomicU32,
    fault_dumps: RateLimit,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl SmmuDriver {
    pub fn new(
        registry: Arc<Registry>,
        scm: Arc<dyn SecureMonitor>,
        pgtables: Arc<dyn PageTableAllocator>,
        reporter: Arc<dyn FaultReporter>,
    ) -> Self {
        Self {
            registry,
            scm,
            pgtables,
            reporter,
            domains: SleepLock::new(BTreeMap::new()),
            next_domain_id: AtomicU32::new(1),
            fault_dumps: RateLimit::default(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// A live domain by id.
    pub fn domain(&self, id: DomainId) -> Option<Arc<Domain>> {
        self.domains
            .lock(|domains| domains.get(&id).and_then(Weak::upgrade))
    }

    /// Global fault interrupt of `instance`.
    pub fn handle_global_fault(&self, instance: &IommuInstance) -> IrqReturn {
        fault::handle_global_fault(instance)
    }

    /// Context fault interrupt of bank `index` of `instance`.
    pub fn handle_context_fault(&self, instance: &IommuInstance, index: usize) -> IrqReturn {
        let Some(ctx) = instance.context(index) else {
            warn!("{}: fault on unknown context bank {}", instance.name(), index);
            return IrqReturn::None;
        };
        if instance.is_secure() {
            return fault::handle_secure_context_fault(instance);
        }
        fault::handle_context_fault(
            instance,
            ctx,
            |id| self.domain(id),
            self.reporter.as_ref(),
            &self.fault_dumps,
        )
    }

    fn master(&self, device: DeviceId) -> Result<Master> {
        self.registry.find_master(device).ok_or_else(|| {
            debug!("device {:?} has no iommu binding", device);
            IommuError::NoDevice
        })
    }
}

impl interface::IommuOps for SmmuDriver {
    fn domain_alloc(&self, kind: DomainType) -> Option<Arc<Domain>> {
        if !kind.is_supported() {
            debug!("{:?} domains are not supported", kind);
            return None;
        }
        let id = self.next_domain_id.fetch_add(1, Ordering::Relaxed);
        let domain = Arc::new(Domain::new(id, kind));
        self.domains.lock(|domains| {
            domains.retain(|_, d| d.strong_count() > 0);
            domains.insert(id, Arc::downgrade(&domain));
        });
        debug!("allocated {:?} domain {}", kind, id);
        Some(domain)
    }

    fn domain_free(&self, domain: Arc<Domain>) -> Result<()> {
        if let Some(ops) = domain.release_page_tables()? {
            self.pgtables.free(ops);
        }
        self.domains.lock(|domains| domains.remove(&domain.id()));
        debug!("freed domain {}", domain.id());
        Ok(())
    }

    fn attach_dev(&self, domain: &Domain, device: DeviceId) -> Result<()> {
        let master = self.master(device)?;
        domain.attach(
            &master.instance,
            &master.context,
            &master.name,
            self.scm.as_ref(),
            self.pgtables.as_ref(),
        )
    }

    fn detach_dev(&self, domain: &Domain, device: DeviceId) -> Result<()> {
        let master = self.master(device)?;
        domain.detach(&master.instance, &master.context)
    }

    fn map(&self, domain: &Domain, iova: u64, paddr: u64, size: usize, prot: Prot) -> Result<()> {
        domain.map(iova, paddr, size, prot)
    }

    fn unmap(&self, domain: &Domain, iova: u64, size: usize) -> Result<usize> {
        domain.unmap(iova, size)
    }

    fn iotlb_sync(&self, domain: &Domain) {
        domain.iotlb_sync();
    }

    fn flush_iotlb_all(&self, domain: &Domain) {
        domain.flush_iotlb_all();
    }

    fn iova_to_phys(&self, domain: &Domain, iova: u64) -> u64 {
        domain.iova_to_phys(iova)
    }

    fn of_xlate(&self, device: DeviceId, device_name: &str, spec: PhandleArgs<'_>) -> Result<()> {
        self.registry.of_xlate(device, device_name, spec)
    }

    fn capable(&self, cap: Capability) -> bool {
        matches!(cap, Capability::CacheCoherency | Capability::NoExec)
    }

    fn pgsize_bitmap(&self) -> usize {
        PGSIZE_BITMAP
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
