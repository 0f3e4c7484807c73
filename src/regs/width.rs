use crate::err::MmioError;

/// Byte width of a single load or store routed to a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessWidth {
    Byte = 1,
    Halfword = 2,
    Word = 4,
    DoubleWord = 8,
}

impl AccessWidth {
    pub const ALL: [AccessWidth; 4] = [
        AccessWidth::Byte,
        AccessWidth::Halfword,
        AccessWidth::Word,
        AccessWidth::DoubleWord,
    ];

    pub const fn bytes(self) -> usize {
        self as usize
    }

    pub const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// Mask applied to every value crossing the dispatcher: `width * 8 - 1`.
    ///
    /// This is the bit count minus one (7, 15, 31, 63), not an all-ones mask of
    /// the access width. Guests and tests observe exactly this value.
    pub const fn mask(self) -> u64 {
        self.bits() as u64 - 1
    }

    /// All-ones value of this width, returned for a failed bus read.
    pub const fn all_ones(self) -> u64 {
        match self {
            AccessWidth::DoubleWord => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }
}

impl TryFrom<usize> for AccessWidth {
    type Error = MmioError;

    fn try_from(size: usize) -> Result<Self, Self::Error> {
        match size {
            1 => Ok(AccessWidth::Byte),
            2 => Ok(AccessWidth::Halfword),
            4 => Ok(AccessWidth::Word),
            8 => Ok(AccessWidth::DoubleWord),
            _ => Err(MmioError::InvalidSize { size }),
        }
    }
}
