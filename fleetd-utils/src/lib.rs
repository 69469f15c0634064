pub mod fs;
pub mod net;
pub mod probe;
pub mod process;
