pub mod bar;
pub mod width;

pub use bar::*;
pub use width::*;
