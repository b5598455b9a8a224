/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Test doubles: register windows backed by plain memory, and scripted collaborators.

use {
    crate::{
        clock::{interface::Clock, ClockError, Clocks},
        context::ContextBank,
        domain::{Domain, DomainId},
        fault::{interface::FaultReporter, FaultFlags, FaultOutcome},
        format::TableFormat,
        instance::{ContextDescriptor, IommuInstance, InstanceDescriptor, Model},
        pgtable::{
            interface::{FlushOps, PageTableAllocator, PageTableOps},
            PageTableConfig, PageTableError, Prot, SZ_4K,
        },
        regs::{ContextRegister, CONTEXT_BANK_STRIDE, GLOBAL_WINDOW_SIZE},
        secure::{interface::SecureMonitor, ScmError},
        time::interface::TimeSource,
    },
    core::{
        ptr,
        sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering},
        time::Duration,
    },
    std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
        vec::Vec,
    },
};

pub const GFSR_OFFSET: usize = 0x48;
pub const FSR_OFFSET: usize = 0x58;
pub const TLBIVA: usize = 0x600;
pub const TLBIASID: usize = 0x610;
pub const TLBIVAL: usize = 0x620;
pub const TLBSTATUS_OFFSET: usize = 0x7f4;

const CB_OFFSET: usize = 0x8000;
const LOCAL_WINDOW_SIZE: usize = 0x2008;

//--------------------------------------------------------------------------------------------------
// Memory-backed register windows
//--------------------------------------------------------------------------------------------------

/// Plain memory standing in for an instance's register windows.
pub struct FakeMmio {
    _mem: Vec<u64>,
    base: usize,
    _local: Vec<u64>,
    local_base: usize,
}

impl FakeMmio {
    fn new(size: usize) -> Self {
        let mut mem = vec![0u64; size.div_ceil(8)];
        let mut local = vec![0u64; LOCAL_WINDOW_SIZE.div_ceil(8)];
        let base = mem.as_mut_ptr() as usize;
        let local_base = local.as_mut_ptr() as usize;
        Self {
            _mem: mem,
            base,
            _local: local,
            local_base,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn read32(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    pub fn write32(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    pub fn read64(&self, offset: usize) -> u64 {
        unsafe { ptr::read_volatile((self.base + offset) as *const u64) }
    }

    pub fn local_read32(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile((self.local_base + offset) as *const u32) }
    }
}

//--------------------------------------------------------------------------------------------------
// Collaborators
//--------------------------------------------------------------------------------------------------

pub struct FakeClock {
    name: &'static str,
    failing: AtomicBool,
    enabled: AtomicI32,
    enables: AtomicU32,
}

impl FakeClock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            failing: AtomicBool::new(false),
            enabled: AtomicI32::new(0),
            enables: AtomicU32::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Current enable depth.
    pub fn enabled(&self) -> i32 {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Successful enables so far.
    pub fn enable_count(&self) -> u32 {
        self.enables.load(Ordering::SeqCst)
    }
}

impl Clock for FakeClock {
    fn name(&self) -> &'static str {
        self.name
    }

    fn enable(&self) -> Result<(), ClockError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClockError {
                name: self.name,
                code: -5,
            });
        }
        self.enabled.fetch_add(1, Ordering::SeqCst);
        self.enables.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeScm {
    restores: Mutex<Vec<(u32, usize)>>,
    formats: Mutex<Vec<(u32, usize, u32)>>,
    restore_error: AtomicI32,
    format_error: AtomicI32,
}

impl FakeScm {
    pub fn restores(&self) -> Vec<(u32, usize)> {
        self.restores.lock().unwrap().clone()
    }

    pub fn formats(&self) -> Vec<(u32, usize, u32)> {
        self.formats.lock().unwrap().clone()
    }

    pub fn fail_restore(&self, code: i32) {
        self.restore_error.store(code, Ordering::SeqCst);
    }

    pub fn fail_format(&self, code: i32) {
        self.format_error.store(code, Ordering::SeqCst);
    }
}

impl SecureMonitor for FakeScm {
    fn restore_sec_cfg(&self, sec_id: u32, context: usize) -> Result<(), ScmError> {
        match self.restore_error.load(Ordering::SeqCst) {
            0 => {
                self.restores.lock().unwrap().push((sec_id, context));
                Ok(())
            }
            code => Err(ScmError { code }),
        }
    }

    fn set_pt_format(&self, sec_id: u32, context: usize, format: u32) -> Result<(), ScmError> {
        match self.format_error.load(Ordering::SeqCst) {
            0 => {
                self.formats.lock().unwrap().push((sec_id, context, format));
                Ok(())
            }
            code => Err(ScmError { code }),
        }
    }
}

/// Clock that moves forward by `step` every time it is read.
pub struct FakeTimer {
    now_ns: AtomicU64,
    step_ns: u64,
}

impl FakeTimer {
    pub fn new(step: Duration) -> Self {
        Self {
            now_ns: AtomicU64::new(0),
            step_ns: step.as_nanos() as u64,
        }
    }

    /// Current time, without advancing.
    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.now_ns.load(Ordering::SeqCst))
    }

    pub fn advance(&self, by: Duration) {
        self.now_ns.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for FakeTimer {
    fn uptime(&self) -> Duration {
        let now = self.now_ns.fetch_add(self.step_ns, Ordering::SeqCst) + self.step_ns;
        Duration::from_nanos(now)
    }
}

/// Flat page table: one entry per mapping, exact-match unmap.
pub struct FakeOps {
    entries: BTreeMap<u64, (u64, usize)>,
    tlb: Arc<dyn FlushOps>,
}

impl PageTableOps for FakeOps {
    fn map(
        &mut self,
        iova: u64,
        paddr: u64,
        size: usize,
        _prot: Prot,
    ) -> Result<(), PageTableError> {
        if size == 0 || iova % SZ_4K as u64 != 0 || paddr % SZ_4K as u64 != 0 {
            return Err(PageTableError::Invalid);
        }
        let end = iova + size as u64;
        let overlaps = self
            .entries
            .iter()
            .any(|(&start, &(_, len))| start < end && iova < start + len as u64);
        if overlaps {
            return Err(PageTableError::Exists);
        }
        self.entries.insert(iova, (paddr, size));
        Ok(())
    }

    fn unmap(&mut self, iova: u64, size: usize) -> usize {
        match self.entries.get(&iova) {
            Some(&(_, len)) if len == size => {
                self.entries.remove(&iova);
                self.tlb.tlb_add_flush(iova, size, SZ_4K, true);
                self.tlb.tlb_sync();
                size
            }
            _ => 0,
        }
    }

    fn iova_to_phys(&self, iova: u64) -> u64 {
        self.entries
            .range(..=iova)
            .next_back()
            .filter(|(start, (_, len))| iova < **start + *len as u64)
            .map_or(0, |(start, (paddr, _))| paddr + (iova - start))
    }
}

/// Walker stand-in handing out [`FakeOps`].
#[derive(Default)]
pub struct FakePageTables {
    failing: AtomicBool,
    allocs: AtomicU32,
    frees: AtomicU32,
}

pub const FAKE_TTBR0: u64 = 0x8_8000_0000;
pub const FAKE_TCR: u64 = 0x0000_0001_0000_3520;
pub const FAKE_MAIR: [u32; 2] = [0xff44_0400, 0x0000_00ff];

impl FakePageTables {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn allocs(&self) -> u32 {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> u32 {
        self.frees.load(Ordering::SeqCst)
    }
}

impl PageTableAllocator for FakePageTables {
    fn alloc(
        &self,
        _format: TableFormat,
        cfg: &mut PageTableConfig,
        tlb: Arc<dyn FlushOps>,
    ) -> Option<Box<dyn PageTableOps>> {
        if self.failing.load(Ordering::SeqCst) {
            return None;
        }
        self.allocs.fetch_add(1, Ordering::SeqCst);
        cfg.tcr = FAKE_TCR;
        cfg.ttbr = [FAKE_TTBR0, 0];
        cfg.mair = FAKE_MAIR;
        Some(Box::new(FakeOps {
            entries: BTreeMap::new(),
            tlb,
        }))
    }

    fn free(&self, ops: Box<dyn PageTableOps>) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        drop(ops);
    }
}

/// Records faults and zeroes FSR at `fsr_addr` when called, so tests can tell whether
/// the handler wrote it back afterwards.
pub struct FakeReporter {
    outcome: FaultOutcome,
    fsr_addr: usize,
    reports: Mutex<Vec<(DomainId, u64, FaultFlags)>>,
}

impl FakeReporter {
    pub fn new(outcome: FaultOutcome, fsr_addr: usize) -> Self {
        Self {
            outcome,
            fsr_addr,
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn reports(&self) -> Vec<(DomainId, u64, FaultFlags)> {
        self.reports.lock().unwrap().clone()
    }
}

impl FaultReporter for FakeReporter {
    fn report_fault(
        &self,
        domain: &Domain,
        _context: &ContextBank,
        iova: u64,
        flags: FaultFlags,
    ) -> FaultOutcome {
        self.reports.lock().unwrap().push((domain.id(), iova, flags));
        if self.fsr_addr != 0 {
            unsafe { ptr::write_volatile(self.fsr_addr as *mut u32, 0) };
        }
        self.outcome
    }
}

//--------------------------------------------------------------------------------------------------
// Fixture
//--------------------------------------------------------------------------------------------------

/// An instance wired to memory-backed registers and fake clocks.
pub struct Fixture {
    pub instance: Arc<IommuInstance>,
    pub iface_clock: Arc<FakeClock>,
    pub core_clock: Arc<FakeClock>,
    pub timer: Arc<FakeTimer>,
    pub mmio: FakeMmio,
}

pub struct FixtureBuilder {
    desc: InstanceDescriptor,
    local_window: bool,
    timer_step: Duration,
}

impl Fixture {
    pub fn builder() -> FixtureBuilder {
        let mut desc = InstanceDescriptor::new("smmu", 0);
        desc.model = Model::QsmmuV2;
        desc.format = TableFormat::Format32;
        desc.cb_offset = CB_OFFSET;
        FixtureBuilder {
            desc,
            local_window: false,
            timer_step: Duration::from_micros(1),
        }
    }

    pub fn ctx_addr(&self, index: usize, offset: usize) -> usize {
        self.mmio.base() + CB_OFFSET + index * CONTEXT_BANK_STRIDE + offset
    }

    pub fn ctx_read(&self, index: usize, reg: ContextRegister) -> u64 {
        self.instance.registers().context(index).read(reg)
    }

    pub fn ctx_write(&self, index: usize, reg: ContextRegister, value: u64) {
        self.instance.registers().context(index).write(reg, value)
    }

    pub fn ctx_raw32(&self, index: usize, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.ctx_addr(index, offset) as *const u32) }
    }

    pub fn ctx_raw64(&self, index: usize, offset: usize) -> u64 {
        unsafe { ptr::read_volatile(self.ctx_addr(index, offset) as *const u64) }
    }

    pub fn ctx_raw_write32(&self, index: usize, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.ctx_addr(index, offset) as *mut u32, value) }
    }
}

impl FixtureBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.desc.name = name.into();
        self
    }

    pub fn model(mut self, model: Model) -> Self {
        self.desc.model = model;
        self
    }

    pub fn format(mut self, format: TableFormat) -> Self {
        self.desc.format = format;
        self
    }

    pub fn sec_id(mut self, sec_id: u32) -> Self {
        self.desc.sec_id = Some(sec_id);
        self
    }

    pub fn local_window(mut self) -> Self {
        self.local_window = true;
        self
    }

    pub fn timer_step(mut self, step: Duration) -> Self {
        self.timer_step = step;
        self
    }

    pub fn context(mut self, name: &str, index: usize) -> Self {
        self.desc.contexts.push(ContextDescriptor::new(name, index));
        self
    }

    pub fn secure_context(mut self, name: &str, index: usize) -> Self {
        self.desc
            .contexts
            .push(ContextDescriptor::new(name, index).secure());
        self
    }

    pub fn build(mut self) -> Fixture {
        let banks = self
            .desc
            .contexts
            .iter()
            .map(|c| c.index + 1)
            .max()
            .unwrap_or(1);
        let mmio =
            FakeMmio::new((CB_OFFSET + banks * CONTEXT_BANK_STRIDE).max(GLOBAL_WINDOW_SIZE));
        self.desc.base = mmio.base;
        self.desc.cb_size = banks * CONTEXT_BANK_STRIDE;
        if self.local_window {
            self.desc.local_base = Some(mmio.local_base);
        }

        let iface_clock = Arc::new(FakeClock::new("iface"));
        let core_clock = Arc::new(FakeClock::new("core"));
        let timer = Arc::new(FakeTimer::new(self.timer_step));
        let instance = unsafe {
            IommuInstance::new(
                self.desc,
                Clocks::new(iface_clock.clone(), core_clock.clone()),
                timer.clone(),
            )
        }
        .unwrap();

        Fixture {
            instance,
            iface_clock,
            core_clock,
            timer,
            mmio,
        }
    }
}
