use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::err::MmioError;
use crate::regs::{AccessWidth, BaseAddressRegister};

/// Start of the guest physical window BARs are placed in.
pub const MMIO_WINDOW_BASE: u64 = 0x1000_0000;
/// Size of the BAR window; everything stays below 4 GiB so 32-bit BARs suffice.
pub const MMIO_WINDOW_SIZE: u64 = 0x1000_0000;
/// Smallest memory BAR size PCI allows.
pub const MIN_REGION_SIZE: u64 = 16;
/// Regions must end below this so they fit a 32-bit memory BAR.
pub const BAR32_LIMIT: u64 = 1 << 32;

pub trait MmioDevice: Send {
    fn read(&mut self, offset: u64, width: AccessWidth) -> Result<u64, MmioError>;
    fn write(&mut self, offset: u64, width: AccessWidth, value: u64) -> Result<(), MmioError>;
    fn reset(&mut self);
    fn get_size(&self) -> u64;
}

/// A device as the bus holds it. The device instance keeps its own clone.
pub type SharedDevice = Arc<Mutex<dyn MmioDevice>>;

pub(crate) fn lock_device<T: ?Sized>(device: &Mutex<T>) -> MutexGuard<'_, T> {
    // Accesses are single byte stores, so a poisoned device is still consistent.
    device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(u32);

impl DeviceHandle {
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// Placement of one BAR on the bus. Fixed once registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub device: DeviceHandle,
    pub bar_index: u8,
    pub base: u64,
    pub size: u64,
}

impl RegionDescriptor {
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Value of the BAR as the device advertises it in configuration space.
    pub fn bar_register(&self) -> BaseAddressRegister {
        // Registration rejects regions ending above BAR32_LIMIT.
        BaseAddressRegister::memory32(self.base as u32)
    }
}

struct MmioRegion {
    descriptor: RegionDescriptor,
    device: SharedDevice,
}

/// Host side address-space router.
///
/// Owns every registered region, hands out device handles and BAR placements,
/// and forwards trapped accesses to the device whose region contains them.
pub struct MmioManager {
    regions: BTreeMap<u64, MmioRegion>, // Sorted by base address
    bars: BTreeMap<(DeviceHandle, u8), u64>,
    next_base: u64,
    next_handle: u32,
}

impl Default for MmioManager {
    fn default() -> Self {
        Self {
            regions: BTreeMap::new(),
            bars: BTreeMap::new(),
            next_base: MMIO_WINDOW_BASE,
            next_handle: 1,
        }
    }
}

impl MmioManager {
    pub fn allocate_handle(&mut self) -> Result<DeviceHandle, MmioError> {
        let id = self.next_handle;
        self.next_handle = id.checked_add(1).ok_or(MmioError::HandlesExhausted)?;
        Ok(DeviceHandle(id))
    }

    /// Registers `dispatcher` for BAR `bar_index` of `device`, placing it at the
    /// next naturally aligned address in the MMIO window.
    pub fn register_region(
        &mut self,
        device: DeviceHandle,
        bar_index: u8,
        region_size: u64,
        dispatcher: SharedDevice,
    ) -> Result<RegionDescriptor, MmioError> {
        self.check_bar_free(device, bar_index)?;
        let base = self.allocate(region_size)?;
        let descriptor = self.register_region_at(device, bar_index, base, region_size, dispatcher)?;
        self.next_base = descriptor.end();
        Ok(descriptor)
    }

    /// Registers a region at a fixed base address.
    pub fn register_region_at(
        &mut self,
        device: DeviceHandle,
        bar_index: u8,
        base: u64,
        region_size: u64,
        dispatcher: SharedDevice,
    ) -> Result<RegionDescriptor, MmioError> {
        self.check_bar_free(device, bar_index)?;
        check_region_size(region_size)?;
        if base
            .checked_add(region_size)
            .is_none_or(|end| end > BAR32_LIMIT)
        {
            return Err(MmioError::AddressSpaceExhausted { size: region_size });
        }

        let buffer = lock_device(&dispatcher).get_size();
        if buffer != region_size {
            return Err(MmioError::RegionSizeMismatch {
                size: region_size,
                buffer,
            });
        }

        // Check for overlaps
        if let Some(existing) = self.find_overlap(base, region_size) {
            return Err(MmioError::overlapping_region(
                existing,
                (base, base + region_size),
            ));
        }

        let descriptor = RegionDescriptor {
            device,
            bar_index,
            base,
            size: region_size,
        };
        self.regions.insert(
            base,
            MmioRegion {
                descriptor,
                device: dispatcher,
            },
        );
        self.bars.insert((device, bar_index), base);

        log::info!(
            "Registered BAR{bar_index} of device {} at [{base:#x}, {:#x})",
            device.id(),
            descriptor.end()
        );
        Ok(descriptor)
    }

    pub fn unregister_region(
        &mut self,
        device: DeviceHandle,
        bar_index: u8,
    ) -> Result<RegionDescriptor, MmioError> {
        let base = self
            .bars
            .remove(&(device, bar_index))
            .ok_or(MmioError::RegionNotFound {
                device: device.id(),
                bar: bar_index,
            })?;
        let region = self
            .regions
            .remove(&base)
            .ok_or(MmioError::UnmappedAccess(base))?;

        log::info!(
            "Unregistered BAR{bar_index} of device {} at {base:#x}",
            device.id()
        );
        Ok(region.descriptor)
    }

    pub fn region(&self, device: DeviceHandle, bar_index: u8) -> Option<RegionDescriptor> {
        let base = self.bars.get(&(device, bar_index))?;
        self.regions.get(base).map(|region| region.descriptor)
    }

    pub fn regions(&self) -> impl Iterator<Item = &RegionDescriptor> {
        self.regions.values().map(|region| &region.descriptor)
    }

    pub fn handle_write(&mut self, addr: u64, size: usize, value: u64) -> Result<(), MmioError> {
        log::debug!("Write {value:#x} to {addr:#0x} of size {size}");
        let width = AccessWidth::try_from(size)?;
        let region = self.find_region(addr)?;
        let offset = addr - region.descriptor.base;
        lock_device(&region.device).write(offset, width, value)
    }

    pub fn handle_read(&mut self, addr: u64, size: usize) -> Result<u64, MmioError> {
        log::debug!("Read from {addr:#0x} of size {size}");
        let width = AccessWidth::try_from(size)?;
        let region = self.find_region(addr)?;
        let offset = addr - region.descriptor.base;
        lock_device(&region.device).read(offset, width)
    }

    /// Read as the guest sees it: a faulting access completes with all ones.
    pub fn bus_read(&mut self, addr: u64, size: usize) -> u64 {
        self.handle_read(addr, size).unwrap_or_else(|err| {
            log::warn!("Failed read at {addr:#x}: {err}");
            AccessWidth::try_from(size).map_or(u64::MAX, AccessWidth::all_ones)
        })
    }

    /// Write as the guest sees it: a faulting access is dropped.
    pub fn bus_write(&mut self, addr: u64, size: usize, value: u64) {
        if let Err(err) = self.handle_write(addr, size, value) {
            log::warn!("Dropped write of {value:#x} at {addr:#x}: {err}");
        }
    }

    pub fn reset_all(&mut self) {
        for region in self.regions.values() {
            lock_device(&region.device).reset();
        }
    }

    fn check_bar_free(&self, device: DeviceHandle, bar_index: u8) -> Result<(), MmioError> {
        if self.bars.contains_key(&(device, bar_index)) {
            return Err(MmioError::RegistrationConflict {
                device: device.id(),
                bar: bar_index,
            });
        }
        Ok(())
    }

    /// First naturally aligned base at or after `next_base` that is free.
    fn allocate(&self, size: u64) -> Result<u64, MmioError> {
        check_region_size(size)?;
        let window_end = MMIO_WINDOW_BASE + MMIO_WINDOW_SIZE;
        let exhausted = MmioError::AddressSpaceExhausted { size };

        let mut base = self
            .next_base
            .checked_next_multiple_of(size)
            .ok_or(exhausted.clone())?;
        loop {
            if base.checked_add(size).is_none_or(|end| end > window_end) {
                return Err(exhausted);
            }
            match self.find_overlap(base, size) {
                // Skip past whatever is in the way; the base only ever grows.
                Some((_, existing_end)) => {
                    base = existing_end
                        .checked_next_multiple_of(size)
                        .ok_or(exhausted.clone())?;
                }
                None => return Ok(base),
            }
        }
    }

    fn find_region(&self, addr: u64) -> Result<&MmioRegion, MmioError> {
        // Find the region that could contain this address
        let (_, region) = self
            .regions
            .range(..=addr)
            .next_back()
            .ok_or(MmioError::UnmappedAccess(addr))?;

        if region.descriptor.contains(addr) {
            Ok(region)
        } else {
            Err(MmioError::UnmappedAccess(addr))
        }
    }

    /// find a overlapping region if it exists, O(log n)
    fn find_overlap(&self, base: u64, size: u64) -> Option<(u64, u64)> {
        let new_end = base + size;

        if let Some((_, region)) = self.regions.range(base..).next() {
            if region.descriptor.base < new_end {
                return Some((region.descriptor.base, region.descriptor.end()));
            }
        }

        if let Some((_, region)) = self.regions.range(..base).next_back() {
            if region.descriptor.end() > base {
                return Some((region.descriptor.base, region.descriptor.end()));
            }
        }

        None
    }
}

fn check_region_size(size: u64) -> Result<(), MmioError> {
    if size < MIN_REGION_SIZE || !size.is_power_of_two() {
        return Err(MmioError::InvalidRegionSize { size });
    }
    Ok(())
}
