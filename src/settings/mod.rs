//! Settings come from `settings/dev.toml` (debug) or `settings/release.toml`
//! (release), overridable through `TETHER__*` variables.
//! See `bin/settings_demo.rs` for a binary that prints what gets loaded.

mod cli;
pub use clap::Parser;
pub use cli::*;

mod settings;
pub use settings::*;
