mod array;
mod map;

pub use array::*;
pub use map::*;
