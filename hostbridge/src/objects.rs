mod script_array;
mod script_map;
mod value_buffer;

pub use script_array::*;
pub use script_map::*;
pub use value_buffer::*;
