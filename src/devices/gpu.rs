//! PCI GPU device with a single memory BAR fronting a byte buffer.
//!
//! The device goes through `Uninitialized -> Active -> Removed`. Realization
//! registers the BAR with the [`MmioManager`]; uninit removes it again. Devices
//! configured without a region (see [`GpuConfig::bare`]) go through the same
//! lifecycle but never claim address space.

use std::sync::{Arc, Mutex};

use crate::devices::{
    AccessEvent, DeviceHandle, MmioDispatcher, MmioManager, RegionDescriptor, lock_device,
};
use crate::err::MmioError;
use crate::regs::AccessWidth;

pub const TYPE_PCI_GPU_DEVICE: &str = "gpu";
pub const PCI_VENDOR_ID_QEMU: u16 = 0x1234;
pub const GPU_DEVICE_ID: u16 = 0x1337;
pub const PCI_CLASS_OTHERS: u16 = 0x00ff;

/// Default size of the GPU memory BAR: 1 MiB.
pub const GPU_REGION_SIZE: u64 = 0x100000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciIdentity {
    pub type_name: &'static str,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_id: u16,
}

impl Default for PciIdentity {
    fn default() -> Self {
        Self {
            type_name: TYPE_PCI_GPU_DEVICE,
            vendor_id: PCI_VENDOR_ID_QEMU,
            device_id: GPU_DEVICE_ID,
            class_id: PCI_CLASS_OTHERS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuConfig {
    pub identity: PciIdentity,
    pub bar_index: u8,
    /// Size of the memory BAR, `None` for a device without one.
    pub region_size: Option<u64>,
}

impl GpuConfig {
    pub fn bare() -> Self {
        Self {
            region_size: None,
            ..Self::default()
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            identity: PciIdentity::default(),
            bar_index: 0,
            region_size: Some(GPU_REGION_SIZE),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Active,
    Removed,
}

pub struct GpuDevice {
    handle: DeviceHandle,
    config: GpuConfig,
    state: DeviceState,
    dispatcher: Option<Arc<Mutex<MmioDispatcher>>>,
    region: Option<RegionDescriptor>,
}

impl GpuDevice {
    pub fn new(handle: DeviceHandle, config: GpuConfig) -> Result<Self, MmioError> {
        let dispatcher = match config.region_size {
            Some(size) => Some(Arc::new(Mutex::new(MmioDispatcher::with_size(size)?))),
            None => None,
        };

        log::info!(
            "GPU instance init: device {} ({:04x}:{:04x})",
            handle.id(),
            config.identity.vendor_id,
            config.identity.device_id
        );

        Ok(Self {
            handle,
            config,
            state: DeviceState::Uninitialized,
            dispatcher,
            region: None,
        })
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn identity(&self) -> &PciIdentity {
        &self.config.identity
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn region(&self) -> Option<&RegionDescriptor> {
        self.region.as_ref()
    }

    pub fn has_memory(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// See [`MmioDispatcher::set_access_handler`]; calling back into this device
    /// from the handler deadlocks.
    pub fn set_access_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&AccessEvent) + Send + 'static,
    {
        if let Some(dispatcher) = &self.dispatcher {
            lock_device(dispatcher).set_access_handler(handler);
        }
    }

    /// Realizes the device onto `bus`. On failure the device stays uninitialized.
    pub fn on_realize(&mut self, bus: &mut MmioManager) -> Result<(), MmioError> {
        if self.state != DeviceState::Uninitialized {
            return Err(MmioError::RegistrationConflict {
                device: self.handle.id(),
                bar: self.config.bar_index,
            });
        }

        log::info!("GPU realize: device {}", self.handle.id());

        if let Some(dispatcher) = &self.dispatcher {
            let size = lock_device(dispatcher).region_size();
            let descriptor =
                bus.register_region(self.handle, self.config.bar_index, size, dispatcher.clone())?;
            self.region = Some(descriptor);
        }

        self.state = DeviceState::Active;
        Ok(())
    }

    pub fn on_uninit(&mut self, bus: &mut MmioManager) -> Result<(), MmioError> {
        self.ensure_active()?;

        log::info!("GPU un-init: device {}", self.handle.id());

        if let Some(region) = self.region.take() {
            bus.unregister_region(region.device, region.bar_index)?;
        }
        self.state = DeviceState::Removed;
        Ok(())
    }

    pub fn on_read(&self, offset: u64, width: usize) -> Result<u64, MmioError> {
        let width = AccessWidth::try_from(width)?;
        let dispatcher = self.active_dispatcher(offset)?;
        lock_device(dispatcher).read_at(offset, width)
    }

    pub fn on_write(&self, offset: u64, width: usize, value: u64) -> Result<(), MmioError> {
        let width = AccessWidth::try_from(width)?;
        let dispatcher = self.active_dispatcher(offset)?;
        lock_device(dispatcher).write_at(offset, width, value)
    }

    fn ensure_active(&self) -> Result<(), MmioError> {
        match self.state {
            DeviceState::Active => Ok(()),
            _ => Err(MmioError::NotActive {
                device: self.handle.id(),
            }),
        }
    }

    fn active_dispatcher(&self, offset: u64) -> Result<&Mutex<MmioDispatcher>, MmioError> {
        self.ensure_active()?;
        self.dispatcher
            .as_deref()
            .ok_or(MmioError::UnmappedAccess(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realized(bus: &mut MmioManager, config: GpuConfig) -> GpuDevice {
        let handle = bus.allocate_handle().unwrap();
        let mut gpu = GpuDevice::new(handle, config).unwrap();
        gpu.on_realize(bus).unwrap();
        gpu
    }

    #[test]
    fn test_identity_defaults() {
        let identity = PciIdentity::default();
        assert_eq!(identity.type_name, "gpu");
        assert_eq!(identity.vendor_id, 0x1234);
        assert_eq!(identity.device_id, 0x1337);
        assert_eq!(identity.class_id, 0x00ff);
    }

    #[test]
    fn test_access_before_realize_fails() {
        let mut bus = MmioManager::default();
        let handle = bus.allocate_handle().unwrap();
        let gpu = GpuDevice::new(handle, GpuConfig::default()).unwrap();

        assert_eq!(gpu.state(), DeviceState::Uninitialized);
        let not_active = MmioError::NotActive {
            device: handle.id(),
        };
        assert_eq!(gpu.on_read(0x10, 1), Err(not_active.clone()));
        assert_eq!(gpu.on_write(0x10, 1, 0xFF), Err(not_active));
        assert_eq!(bus.regions().count(), 0);
    }

    #[test]
    fn test_realize_registers_bar0() {
        let mut bus = MmioManager::default();
        let gpu = realized(&mut bus, GpuConfig::default());

        assert_eq!(gpu.state(), DeviceState::Active);
        let region = *gpu.region().unwrap();
        assert_eq!(region.bar_index, 0);
        assert_eq!(region.size, GPU_REGION_SIZE);
        assert_eq!(bus.region(gpu.handle(), 0), Some(region));

        gpu.on_write(0x10, 1, 0xFF).unwrap();
        assert_eq!(gpu.on_read(0x10, 1).unwrap(), 7);
        assert_eq!(bus.handle_read(region.base + 0x10, 1).unwrap(), 7);
    }

    #[test]
    fn test_device_and_bus_share_registers() {
        let mut bus = MmioManager::default();
        let gpu = realized(&mut bus, GpuConfig::default());
        let base = gpu.region().unwrap().base;

        bus.handle_write(base + 0x200, 4, 0x1F).unwrap();
        assert_eq!(gpu.on_read(0x200, 4).unwrap(), 0x1F);
    }

    #[test]
    fn test_width_is_validated() {
        let mut bus = MmioManager::default();
        let gpu = realized(&mut bus, GpuConfig::default());
        assert_eq!(
            gpu.on_read(0, 3),
            Err(MmioError::InvalidSize { size: 3 })
        );
        assert_eq!(
            gpu.on_write(0, 16, 1),
            Err(MmioError::InvalidSize { size: 16 })
        );
    }

    #[test]
    fn test_uninit_releases_region() {
        let mut bus = MmioManager::default();
        let mut gpu = realized(&mut bus, GpuConfig::default());
        let base = gpu.region().unwrap().base;

        gpu.on_uninit(&mut bus).unwrap();
        assert_eq!(gpu.state(), DeviceState::Removed);
        assert!(gpu.region().is_none());
        assert_eq!(bus.regions().count(), 0);
        assert!(bus.handle_read(base, 1).is_err());
        assert!(matches!(
            gpu.on_read(0, 1),
            Err(MmioError::NotActive { .. })
        ));

        // No way back from Removed.
        assert!(gpu.on_realize(&mut bus).is_err());
        assert!(gpu.on_uninit(&mut bus).is_err());
    }

    #[test]
    fn test_failed_realize_stays_uninitialized() {
        let mut bus = MmioManager::default();
        let handle = bus.allocate_handle().unwrap();
        let mut first = GpuDevice::new(handle, GpuConfig::default()).unwrap();
        let mut second = GpuDevice::new(handle, GpuConfig::default()).unwrap();

        first.on_realize(&mut bus).unwrap();
        let err = second.on_realize(&mut bus).unwrap_err();
        assert_eq!(
            err,
            MmioError::RegistrationConflict {
                device: handle.id(),
                bar: 0
            }
        );
        assert_eq!(second.state(), DeviceState::Uninitialized);
        assert_eq!(bus.region(handle, 0).as_ref(), first.region());
    }

    #[test]
    fn test_bare_device() {
        let mut bus = MmioManager::default();
        let mut gpu = realized(&mut bus, GpuConfig::bare());

        assert!(!gpu.has_memory());
        assert_eq!(gpu.state(), DeviceState::Active);
        assert!(gpu.region().is_none());
        assert_eq!(bus.regions().count(), 0);
        assert_eq!(gpu.on_read(0x10, 1), Err(MmioError::UnmappedAccess(0x10)));

        gpu.on_uninit(&mut bus).unwrap();
        assert_eq!(gpu.state(), DeviceState::Removed);
    }

    #[test]
    fn test_invalid_region_size_rejected_at_construction() {
        let mut bus = MmioManager::default();
        let handle = bus.allocate_handle().unwrap();
        let config = GpuConfig {
            region_size: Some(0),
            ..GpuConfig::default()
        };
        assert!(GpuDevice::new(handle, config).is_err());
    }

    #[test]
    fn test_device_and_bus_access_from_threads() {
        let mut bus = MmioManager::default();
        let gpu = realized(&mut bus, GpuConfig::default());
        let base = gpu.region().unwrap().base;

        std::thread::scope(|scope| {
            let gpu = &gpu;
            let bus = &mut bus;
            scope.spawn(move || {
                for offset in 0..0x100 {
                    gpu.on_write(offset, 1, offset).unwrap();
                }
            });
            scope.spawn(move || {
                for offset in 0x100..0x200 {
                    bus.handle_write(base + offset, 8, offset).unwrap();
                }
            });
        });

        for offset in 0..0x100 {
            assert_eq!(gpu.on_read(offset, 1).unwrap(), offset & 7);
        }
        for offset in 0x100..0x200 {
            assert_eq!(bus.handle_read(base + offset, 8).unwrap(), offset & 63);
        }
    }
}
