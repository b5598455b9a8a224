/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! One physical SMMU: its register windows, clocks and context banks.

use {
    crate::{
        barrier,
        clock::{ClockGuard, Clocks},
        context::ContextBank,
        error::{IommuError, Result},
        format::TableFormat,
        regs::{Registers, CONTEXT_BANK_STRIDE, MAX_CONTEXT_BANKS},
        secure::interface::SecureMonitor,
        sync::{interface::Mutex, SleepLock},
        time::interface::TimeSource,
    },
    alloc::{string::String, sync::Arc, vec::Vec},
    core::fmt,
    log::{error, info},
    tock_registers::interfaces::Writeable,
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Offset of the context bank space from the instance base when none is given.
pub const DEFAULT_CB_OFFSET: usize = 0x8000;

/// SMMU hardware model.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Model {
    QsmmuV2,
    Mmu500,
}

/// Static description of a context bank, as found in the device tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextDescriptor {
    pub name: String,
    pub index: usize,
    /// Owned by the secure world; its control registers are never written here.
    pub secure: bool,
    pub needs_secure_map: bool,
}

/// Static description of an SMMU instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub name: String,
    pub model: Model,
    pub format: TableFormat,
    /// Security engine identifier, `None` when the instance has no secure side.
    pub sec_id: Option<u32>,
    pub base: usize,
    pub cb_offset: usize,
    /// Size of the mapped context bank window, in bytes.
    pub cb_size: usize,
    pub local_base: Option<usize>,
    pub contexts: Vec<ContextDescriptor>,
}

/// A probed SMMU instance.
pub struct IommuInstance {
    name: String,
    model: Model,
    format: TableFormat,
    sec_id: Option<u32>,
    regs: Registers,
    clocks: Clocks,
    timer: Arc<dyn TimeSource>,
    contexts: Vec<Arc<ContextBank>>,
    /// Number of attached context banks.
    attach_count: SleepLock<u32>,
    /// Serializes global fault handling.
    glb_lock: SleepLock<()>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl Default for Model {
    fn default() -> Self {
        if cfg!(feature = "mmu500") {
            Self::Mmu500
        } else {
            Self::QsmmuV2
        }
    }
}

impl Model {
    /// MMU-500 keeps implementation-defined ACTLR bits across a context reset.
    pub const fn preserves_actlr(self) -> bool {
        matches!(self, Self::Mmu500)
    }

    pub const fn invalidates_on_attach(self) -> bool {
        matches!(self, Self::QsmmuV2)
    }

    pub const fn invalidates_on_detach(self) -> bool {
        matches!(self, Self::Mmu500)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QsmmuV2 => write!(f, "QSMMUv2"),
            Self::Mmu500 => write!(f, "MMU-500"),
        }
    }
}

impl ContextDescriptor {
    pub fn new(name: &str, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
            secure: false,
            needs_secure_map: false,
        }
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }
}

impl InstanceDescriptor {
    /// Instance with default model, format and context bank offset.
    pub fn new(name: &str, base: usize) -> Self {
        Self {
            name: name.into(),
            model: Model::default(),
            format: TableFormat::default(),
            sec_id: None,
            base,
            cb_offset: DEFAULT_CB_OFFSET,
            cb_size: MAX_CONTEXT_BANKS * CONTEXT_BANK_STRIDE,
            local_base: None,
            contexts: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: ContextDescriptor) -> Self {
        self.contexts.push(context);
        self
    }

    /// Number of whole context banks inside the mapped window.
    pub fn cb_count(&self) -> usize {
        (self.cb_size / CONTEXT_BANK_STRIDE).min(MAX_CONTEXT_BANKS)
    }

    /// Check context indices are in range, inside the mapped window and unique.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(IommuError::InvalidArgument {
                what: "instance name",
            });
        }
        for (i, ctx) in self.contexts.iter().enumerate() {
            if ctx.index >= MAX_CONTEXT_BANKS {
                return Err(IommuError::InvalidArgument {
                    what: "context bank index",
                });
            }
            if ctx.index >= self.cb_count() {
                return Err(IommuError::InvalidArgument {
                    what: "context bank outside mapped window",
                });
            }
            if self.contexts[..i].iter().any(|c| c.index == ctx.index) {
                return Err(IommuError::InvalidArgument {
                    what: "duplicate context bank index",
                });
            }
        }
        Ok(())
    }
}

impl IommuInstance {
    /// Build an instance from its description.
    ///
    /// # Safety
    ///
    /// - `desc.base`, `desc.base + desc.cb_offset` (for `desc.cb_size` bytes) and
    ///   `desc.local_base` must map the instance's register windows for as long as the
    ///   instance lives.
    pub unsafe fn new(
        desc: InstanceDescriptor,
        clocks: Clocks,
        timer: Arc<dyn TimeSource>,
    ) -> Result<Arc<Self>> {
        desc.validate()?;

        let contexts = desc
            .contexts
            .iter()
            .map(|c| Arc::new(ContextBank::new(c)))
            .collect();

        info!(
            "{}: {} SMMU at {:#x}, {} format, {} context banks",
            desc.name,
            desc.model,
            desc.base,
            desc.format,
            desc.contexts.len()
        );

        let regs = Registers::new(
            desc.base,
            desc.base + desc.cb_offset,
            desc.cb_count(),
            desc.local_base,
        );

        Ok(Arc::new(Self {
            regs,
            name: desc.name,
            model: desc.model,
            format: desc.format,
            sec_id: desc.sec_id,
            clocks,
            timer,
            contexts,
            attach_count: SleepLock::new(0),
            glb_lock: SleepLock::new(()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn format(&self) -> TableFormat {
        self.format
    }

    pub fn sec_id(&self) -> Option<u32> {
        self.sec_id
    }

    /// The instance has a security engine and its global registers belong to it.
    pub fn is_secure(&self) -> bool {
        self.sec_id.is_some()
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn timer(&self) -> &dyn TimeSource {
        self.timer.as_ref()
    }

    pub fn contexts(&self) -> &[Arc<ContextBank>] {
        &self.contexts
    }

    /// Context bank by hardware index.
    pub fn context(&self, index: usize) -> Option<&Arc<ContextBank>> {
        self.contexts.iter().find(|c| c.index() == index)
    }

    /// Number of context banks currently attached.
    pub fn attached_contexts(&self) -> u32 {
        self.attach_count.lock(|count| *count)
    }

    pub fn enable_clocks(&self) -> Result<ClockGuard<'_>> {
        self.clocks.enable().map_err(|err| {
            error!("{}: {}", self.name, err);
            IommuError::from(err)
        })
    }

    /// Account for a newly attached context. The first one restores the secure
    /// configuration of the instance.
    pub(crate) fn claim_attach_slot(
        &self,
        scm: &dyn SecureMonitor,
        ctx: &ContextBank,
    ) -> Result<()> {
        self.attach_count.lock(|count| {
            if *count == 0 {
                self.restore_secure_config(scm, ctx)?;
            }
            *count += 1;
            Ok(())
        })
    }

    pub(crate) fn release_attach_slot(&self) {
        self.attach_count.lock(|count| *count = count.saturating_sub(1));
    }

    pub(crate) fn with_global_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.glb_lock.lock(|_| f())
    }

    /// Route interrupts to the non-secure side and have the secure world restore
    /// its view of the instance.
    fn restore_secure_config(&self, scm: &dyn SecureMonitor, ctx: &ContextBank) -> Result<()> {
        let Some(sec_id) = self.sec_id else {
            return Ok(());
        };

        if let Some(local) = self.regs.local() {
            local.INTR_SEL_NS.set(u32::MAX);
            barrier::mb();
        }

        scm.restore_sec_cfg(sec_id, ctx.index()).map_err(|e| {
            error!(
                "{}: secure configuration restore for {} failed: {}",
                self.name,
                ctx.name(),
                e
            );
            IommuError::SecureCall {
                call: "restore_sec_cfg",
                code: e.code,
            }
        })?;

        info!("{}: secure configuration restored", self.name);
        Ok(())
    }
}

impl fmt::Debug for IommuInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IommuInstance")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("format", &self.format)
            .field("sec_id", &self.sec_id)
            .field("regs", &self.regs)
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
