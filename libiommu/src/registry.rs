/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Probed instances and the masters bound to their context banks.

use {
    crate::{
        context::ContextBank,
        error::{IommuError, Result},
        instance::IommuInstance,
        sync::{interface::Mutex, SleepLock},
    },
    alloc::{string::String, sync::Arc, vec::Vec},
    log::{debug, info, warn},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Opaque handle of a client device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u64);

/// A client device bound to one context bank.
#[derive(Clone)]
pub struct Master {
    pub device: DeviceId,
    pub name: String,
    pub instance: Arc<IommuInstance>,
    pub context: Arc<ContextBank>,
}

/// Firmware reference from a client to an IOMMU: the instance name and cell arguments.
#[derive(Copy, Clone, Debug)]
pub struct PhandleArgs<'a> {
    pub iommu: &'a str,
    pub args: &'a [u32],
}

/// Registry interfaces.
pub mod interface {
    use super::*;

    /// Resolves a client device to its context bank.
    pub trait MasterLookup: Send + Sync {
        fn find_master(&self, device: DeviceId) -> Option<Master>;
    }
}

/// All instances and client bindings known to the driver.
#[derive(Default)]
pub struct Registry {
    instances: SleepLock<Vec<Arc<IommuInstance>>>,
    masters: SleepLock<Vec<Master>>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a probed instance visible to clients.
    pub fn add_instance(&self, instance: Arc<IommuInstance>) -> Result<()> {
        self.instances.lock(|instances| {
            if instances.iter().any(|i| i.name() == instance.name()) {
                return Err(IommuError::Busy {
                    what: "instance name",
                });
            }
            info!("{}: registered", instance.name());
            instances.push(instance);
            Ok(())
        })
    }

    /// Remove an instance and the masters bound to it. Refused while banks are attached.
    pub fn remove_instance(&self, name: &str) -> Result<Arc<IommuInstance>> {
        let instance = self.instances.lock(|instances| {
            let pos = instances
                .iter()
                .position(|i| i.name() == name)
                .ok_or(IommuError::NoDevice)?;
            if instances[pos].attached_contexts() > 0 {
                return Err(IommuError::Busy { what: "instance" });
            }
            Ok(instances.remove(pos))
        })?;

        self.masters
            .lock(|masters| masters.retain(|m| !Arc::ptr_eq(&m.instance, &instance)));
        info!("{}: removed", name);
        Ok(instance)
    }

    pub fn instance(&self, name: &str) -> Option<Arc<IommuInstance>> {
        self.instances
            .lock(|instances| instances.iter().find(|i| i.name() == name).cloned())
    }

    pub fn instances(&self) -> Vec<Arc<IommuInstance>> {
        self.instances.lock(|instances| instances.clone())
    }

    /// Bind `device` to the context bank named by `spec`: `args[0]` is the bank index,
    /// an optional second cell is accepted and ignored.
    pub fn of_xlate(
        &self,
        device: DeviceId,
        device_name: &str,
        spec: PhandleArgs<'_>,
    ) -> Result<()> {
        if spec.args.len() > 2 {
            return Err(IommuError::InvalidArgument {
                what: "too many iommu cells",
            });
        }
        let index = *spec.args.first().ok_or(IommuError::InvalidArgument {
            what: "missing context bank cell",
        })? as usize;

        let instance = self.instance(spec.iommu).ok_or_else(|| {
            debug!("{}: iommu {} not found", device_name, spec.iommu);
            IommuError::NoDevice
        })?;
        let context = instance.context(index).cloned().ok_or_else(|| {
            debug!("{}: {} has no context bank {}", device_name, spec.iommu, index);
            IommuError::NoDevice
        })?;

        self.masters.lock(|masters| {
            if let Some(existing) = masters.iter().find(|m| m.device == device) {
                if Arc::ptr_eq(&existing.context, &context) {
                    return Ok(());
                }
                warn!(
                    "{}: already bound to {}, refusing {}",
                    device_name,
                    existing.context.name(),
                    context.name()
                );
                return Err(IommuError::Busy { what: "master" });
            }
            debug!("{}: bound to {} of {}", device_name, context.name(), instance.name());
            masters.push(Master {
                device,
                name: device_name.into(),
                instance: instance.clone(),
                context,
            });
            Ok(())
        })
    }

    /// Forget the binding of `device`.
    pub fn unbind(&self, device: DeviceId) -> Option<Master> {
        self.masters.lock(|masters| {
            let pos = masters.iter().position(|m| m.device == device)?;
            Some(masters.remove(pos))
        })
    }
}

impl interface::MasterLookup for Registry {
    fn find_master(&self, device: DeviceId) -> Option<Master> {
        self.masters
            .lock(|masters| masters.iter().find(|m| m.device == device).cloned())
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::{interface::MasterLookup, *},
        crate::{
            domain::{Domain, DomainType},
            testing::{FakePageTables, FakeScm, Fixture},
        },
    };

    fn registry_with(fx: &Fixture) -> Registry {
        let registry = Registry::new();
        registry.add_instance(fx.instance.clone()).unwrap();
        registry
    }

    #[test]
    fn xlate_binds_master_to_bank() {
        let fx = Fixture::builder().name("apps").context("ctx3", 3).build();
        let registry = registry_with(&fx);

        registry
            .of_xlate(DeviceId(1), "venus", PhandleArgs { iommu: "apps", args: &[3] })
            .unwrap();

        let master = registry.find_master(DeviceId(1)).unwrap();
        assert_eq!(master.context.index(), 3);
        assert_eq!(master.name, "venus");
        assert!(registry.find_master(DeviceId(2)).is_none());
    }

    #[test]
    fn xlate_rejects_bad_references() {
        let fx = Fixture::builder().name("apps").context("ctx3", 3).build();
        let registry = registry_with(&fx);

        let too_many = PhandleArgs { iommu: "apps", args: &[3, 0, 1] };
        assert!(matches!(
            registry.of_xlate(DeviceId(1), "dev", too_many),
            Err(IommuError::InvalidArgument { .. })
        ));
        let unknown_bank = PhandleArgs { iommu: "apps", args: &[4] };
        assert!(matches!(
            registry.of_xlate(DeviceId(1), "dev", unknown_bank),
            Err(IommuError::NoDevice)
        ));
        let unknown_instance = PhandleArgs { iommu: "gpu", args: &[3] };
        assert!(matches!(
            registry.of_xlate(DeviceId(1), "dev", unknown_instance),
            Err(IommuError::NoDevice)
        ));
        let two_cells = PhandleArgs { iommu: "apps", args: &[3, 7] };
        assert!(registry.of_xlate(DeviceId(1), "dev", two_cells).is_ok());
    }

    #[test]
    fn duplicate_instance_and_removal() {
        let fx = Fixture::builder().name("apps").context("ctx0", 0).build();
        let registry = registry_with(&fx);
        assert!(registry.add_instance(fx.instance.clone()).is_err());

        registry
            .of_xlate(DeviceId(9), "dev", PhandleArgs { iommu: "apps", args: &[0] })
            .unwrap();
        registry.remove_instance("apps").unwrap();
        assert!(registry.instance("apps").is_none());
        assert!(registry.find_master(DeviceId(9)).is_none());
        assert!(matches!(registry.remove_instance("apps"), Err(IommuError::NoDevice)));
    }

    #[test]
    fn removal_refused_while_banks_attached() {
        let fx = Fixture::builder().name("apps").context("ctx0", 0).build();
        let registry = registry_with(&fx);
        registry
            .of_xlate(DeviceId(9), "dev", PhandleArgs { iommu: "apps", args: &[0] })
            .unwrap();
        let ctx = fx.instance.context(0).unwrap().clone();
        let domain = Domain::new(1, DomainType::Unmanaged);
        domain
            .attach(&fx.instance, &ctx, "dev", &FakeScm::default(), &FakePageTables::default())
            .unwrap();

        assert!(matches!(
            registry.remove_instance("apps"),
            Err(IommuError::Busy { .. })
        ));
        assert!(registry.instance("apps").is_some());
        assert!(registry.find_master(DeviceId(9)).is_some());

        domain.detach(&fx.instance, &ctx).unwrap();
        assert!(registry.remove_instance("apps").is_ok());
    }
}
