/// BAR - PCI Base Address Register (memory space layout)
use bitfield::bitfield;

bitfield! {
    /// 32-bit memory BAR as advertised in configuration space.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BaseAddressRegister(u32);

    /// Bit [0] - Space indicator, 0 for memory space
    pub io_space, set_io_space: 0;

    /// Bits [2:1] - Locatable type, 0b00 for anywhere in 32-bit space
    pub mem_type, set_mem_type: 2, 1;

    /// Bit [3] - Prefetchable
    pub prefetchable, set_prefetchable: 3;

    /// Bits [31:4] - Base address, 16-byte granular
    pub address, set_address: 31, 4;
}

impl BaseAddressRegister {
    pub const MEM_TYPE_32: u32 = 0b00;

    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Non-prefetchable 32-bit memory BAR at `base`.
    pub fn memory32(base: u32) -> Self {
        let mut bar = Self::new();
        bar.set_io_space(false);
        bar.set_mem_type(Self::MEM_TYPE_32);
        bar.set_prefetchable(false);
        bar.set_address(base >> 4);
        bar
    }

    pub fn base_address(&self) -> u32 {
        self.address() << 4
    }
}
