//! MMIO dispatcher for a device backed by a byte buffer.
//!
//! Every trapped load or store that lands in the device's region ends up here as an
//! `(offset, width[, value])` triple relative to the region base. The dispatcher
//! checks the offset against its [`DeviceBuffer`], applies the width mask and
//! touches exactly one byte. Each access is reported as an [`AccessEvent`] to the
//! log and to an optional access handler.

use crate::devices::MmioDevice;
use crate::err::MmioError;
use crate::mems::DeviceBuffer;
use crate::regs::AccessWidth;

/// Record of one completed access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessEvent {
    Read {
        offset: u64,
        width: AccessWidth,
        value: u64,
    },
    Write {
        offset: u64,
        width: AccessWidth,
        value: u64,
        masked: u64,
    },
}

pub struct MmioDispatcher {
    registers: DeviceBuffer,
    access_handler: Option<Box<dyn FnMut(&AccessEvent) + Send>>,
}

impl MmioDispatcher {
    pub fn new(registers: DeviceBuffer) -> Self {
        Self {
            registers,
            access_handler: None,
        }
    }

    pub fn with_size(size: u64) -> Result<Self, MmioError> {
        let size = usize::try_from(size).map_err(|_| MmioError::InvalidRegionSize { size })?;
        Ok(Self::new(DeviceBuffer::new(size)?))
    }

    /// Installs a handler called after every completed access.
    ///
    /// The handler runs while the device lock is held, so it must not access the
    /// same device again.
    pub fn set_access_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&AccessEvent) + Send + 'static,
    {
        self.access_handler = Some(Box::new(handler));
    }

    pub fn region_size(&self) -> u64 {
        self.registers.len() as u64
    }

    pub fn read_at(&mut self, offset: u64, width: AccessWidth) -> Result<u64, MmioError> {
        let byte = self.registers.read_byte(offset)?;
        let value = u64::from(byte) & width.mask();
        self.emit(AccessEvent::Read {
            offset,
            width,
            value,
        });
        Ok(value)
    }

    pub fn write_at(&mut self, offset: u64, width: AccessWidth, value: u64) -> Result<(), MmioError> {
        let masked = value & width.mask();
        // The mask never exceeds 63, so the committed value always fits the byte.
        self.registers.write_byte(offset, masked as u8)?;
        self.emit(AccessEvent::Write {
            offset,
            width,
            value,
            masked,
        });
        Ok(())
    }

    fn emit(&mut self, event: AccessEvent) {
        log::trace!("{event:x?}");
        if let Some(ref mut handler) = self.access_handler {
            handler(&event);
        }
    }
}

impl MmioDevice for MmioDispatcher {
    fn read(&mut self, offset: u64, width: AccessWidth) -> Result<u64, MmioError> {
        self.read_at(offset, width)
    }

    fn write(&mut self, offset: u64, width: AccessWidth, value: u64) -> Result<(), MmioError> {
        self.write_at(offset, width, value)
    }

    fn reset(&mut self) {
        self.registers.reset();
    }

    fn get_size(&self) -> u64 {
        self.region_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const REGION_SIZE: u64 = 0x100000;

    fn dispatcher() -> MmioDispatcher {
        MmioDispatcher::with_size(REGION_SIZE).unwrap()
    }

    #[test]
    fn test_write_then_read_applies_mask() {
        let mut gpu = dispatcher();

        gpu.write_at(0x10, AccessWidth::Byte, 0xFF).unwrap();
        assert_eq!(gpu.read_at(0x10, AccessWidth::Byte).unwrap(), 7);

        gpu.write_at(0x20, AccessWidth::Word, 0xDEAD_BEEF).unwrap();
        assert_eq!(gpu.read_at(0x20, AccessWidth::Word).unwrap(), 0xEF & 31);

        gpu.write_at(0x30, AccessWidth::DoubleWord, 0x7F).unwrap();
        assert_eq!(gpu.read_at(0x30, AccessWidth::DoubleWord).unwrap(), 0x3F);
    }

    #[test]
    fn test_round_trip_every_width() {
        let mut gpu = dispatcher();
        let offsets = [0, 1, 0x7FF, 0x8000, REGION_SIZE - 1];
        for width in AccessWidth::ALL {
            for (i, &offset) in offsets.iter().enumerate() {
                let value = 0x0123_4567_89AB_CDEF_u64.rotate_left(i as u32 * 8);
                gpu.write_at(offset, width, value).unwrap();
                let read = gpu.read_at(offset, width).unwrap();
                assert_eq!(read, value & width.mask());
                assert_eq!(gpu.read_at(offset, width).unwrap(), read);
            }
        }
    }

    #[test]
    fn test_in_bounds_reads_never_fault() {
        let mut gpu = dispatcher();
        for width in AccessWidth::ALL {
            for offset in [0, 0x1234, REGION_SIZE - 8, REGION_SIZE - 1] {
                assert!(gpu.read_at(offset, width).is_ok());
            }
        }
    }

    #[test]
    fn test_last_byte_and_one_past_end() {
        let mut gpu = dispatcher();
        gpu.write_at(0xFFFFF, AccessWidth::Byte, 0x42).unwrap();
        assert_eq!(gpu.read_at(0xFFFFF, AccessWidth::Byte).unwrap(), 0x42 & 7);

        let err = gpu.write_at(0x100000, AccessWidth::Byte, 0x42).unwrap_err();
        assert_eq!(
            err,
            MmioError::OutOfBounds {
                offset: 0x100000,
                size: REGION_SIZE
            }
        );
    }

    #[test]
    fn test_out_of_bounds_leaves_buffer_untouched() {
        let mut gpu = dispatcher();
        gpu.write_at(REGION_SIZE - 1, AccessWidth::Byte, 5).unwrap();

        for offset in [REGION_SIZE, REGION_SIZE + 1, u64::MAX] {
            assert!(gpu.read_at(offset, AccessWidth::Word).is_err());
            assert!(gpu.write_at(offset, AccessWidth::Word, 0xFF).is_err());
        }
        assert_eq!(gpu.read_at(REGION_SIZE - 1, AccessWidth::Byte).unwrap(), 5);
        assert_eq!(gpu.read_at(0, AccessWidth::Byte).unwrap(), 0);
    }

    #[test]
    fn test_access_handler_sees_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();

        let mut gpu = dispatcher();
        gpu.set_access_handler(move |event| {
            events_clone.lock().unwrap().push(*event);
        });

        gpu.write_at(0x10, AccessWidth::Byte, 0xFF).unwrap();
        gpu.read_at(0x10, AccessWidth::Byte).unwrap();
        let _ = gpu.read_at(REGION_SIZE, AccessWidth::Byte);

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                AccessEvent::Write {
                    offset: 0x10,
                    width: AccessWidth::Byte,
                    value: 0xFF,
                    masked: 7,
                },
                AccessEvent::Read {
                    offset: 0x10,
                    width: AccessWidth::Byte,
                    value: 7,
                },
            ]
        );
    }

    #[test]
    fn test_reset_clears_registers() {
        let mut gpu = dispatcher();
        gpu.write_at(0x40, AccessWidth::Halfword, 0xA).unwrap();
        MmioDevice::reset(&mut gpu);
        assert_eq!(gpu.read_at(0x40, AccessWidth::Halfword).unwrap(), 0);
        assert_eq!(gpu.get_size(), REGION_SIZE);
    }
}
