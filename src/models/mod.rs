pub mod enums;
pub mod input;
pub mod record;

pub use enums::*;
pub use input::*;
pub use record::*;
