use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimppleError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("MMIO error: {0}")]
    MMIO(#[from] MmioError),

    #[error("General error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Errors raised by the device register file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out of bounds access at offset 0x{offset:x} (buffer length: 0x{len:x})")]
    OutOfBounds { offset: u64, len: usize },

    #[error("Invalid size: {size} bytes is invalid for this operation")]
    InvalidSize { size: usize },
}

impl MemoryError {
    pub fn out_of_bounds(offset: u64, len: usize) -> Self {
        Self::OutOfBounds { offset, len }
    }

    pub fn invalid_size(size: usize) -> Self {
        Self::InvalidSize { size }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MmioError {
    #[error("Unmapped memory access at address 0x{0:016x}")]
    UnmappedAccess(u64),

    #[error("Out of bounds access at offset 0x{offset:x} in region of size 0x{size:x}")]
    OutOfBounds { offset: u64, size: u64 },

    #[error("Invalid access size: {size} bytes (must be 1, 2, 4, or 8)")]
    InvalidSize { size: usize },

    #[error("Device {device} is not active")]
    NotActive { device: u32 },

    #[error("Device {device} already has a region registered at BAR {bar}")]
    RegistrationConflict { device: u32, bar: u8 },

    #[error("Device {device} has no region registered at BAR {bar}")]
    RegionNotFound { device: u32, bar: u8 },

    #[error("Invalid region size 0x{size:x}: must be a power of two of at least 16 bytes")]
    InvalidRegionSize { size: u64 },

    #[error("Region size 0x{size:x} does not match the device buffer of 0x{buffer:x} bytes")]
    RegionSizeMismatch { size: u64, buffer: u64 },

    #[error("No device handles left")]
    HandlesExhausted,

    #[error("MMIO window exhausted: cannot place a region of 0x{size:x} bytes")]
    AddressSpaceExhausted { size: u64 },

    #[error(
        "Overlapping MMIO region: new region [0x{new_start:016x}, 0x{new_end:016x}) overlaps with existing region [0x{existing_start:016x}, 0x{existing_end:016x})"
    )]
    OverlappingRegion {
        existing_start: u64,
        existing_end: u64,
        new_start: u64,
        new_end: u64,
    },
}

impl MmioError {
    pub fn overlapping_region(existing: (u64, u64), new: (u64, u64)) -> Self {
        Self::OverlappingRegion {
            existing_start: existing.0,
            existing_end: existing.1,
            new_start: new.0,
            new_end: new.1,
        }
    }
}

// The register file only knows its own length; the dispatcher re-labels its faults
// with the region size so the bus sees one error type.
impl From<MemoryError> for MmioError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfBounds { offset, len } => MmioError::OutOfBounds {
                offset,
                size: len as u64,
            },
            MemoryError::InvalidSize { size } => MmioError::InvalidSize { size },
        }
    }
}
