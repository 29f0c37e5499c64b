//! Process-wide `tracing` setup. Verified by hand with `bin/logger_demo.rs`.

mod logger;
pub use logger::*;

pub use tracing::{debug, error, info, trace, warn};
