use crate::err::MemoryError;

/// Device-internal storage backing an MMIO region.
///
/// The length is fixed at construction. Every access is bounds checked against it,
/// so an offset the bus should never have sent is reported instead of reaching
/// adjacent memory.
#[derive(Debug)]
pub struct DeviceBuffer {
    memory: Box<[u8]>,
}

impl DeviceBuffer {
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::invalid_size(size));
        }
        Ok(DeviceBuffer {
            memory: vec![0; size].into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    fn index(&self, offset: u64) -> Result<usize, MemoryError> {
        usize::try_from(offset)
            .ok()
            .filter(|&index| index < self.memory.len())
            .ok_or_else(|| MemoryError::out_of_bounds(offset, self.memory.len()))
    }

    pub fn read_byte(&self, offset: u64) -> Result<u8, MemoryError> {
        let index = self.index(offset)?;
        Ok(self.memory[index])
    }

    pub fn write_byte(&mut self, offset: u64, value: u8) -> Result<(), MemoryError> {
        let index = self.index(offset)?;
        self.memory[index] = value;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.memory.fill(0);
    }
}
