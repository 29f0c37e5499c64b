mod session_persistence_file;
mod session_persistence_memory;

pub use session_persistence_file::*;
pub use session_persistence_memory::*;
