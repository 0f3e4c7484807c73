pub mod dispatch;
pub mod gpu;
pub mod mmio;

pub use dispatch::*;
pub use gpu::*;
pub use mmio::*;
