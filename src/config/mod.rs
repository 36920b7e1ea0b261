//! # Configuration Module
//!
//! Compile-time layout constants live in [`constants`]; the runtime knobs the
//! tile store reads (but never owns) live in [`TileConfig`].
//!
//! ## Module Organization
//!
//! - [`constants`]: numeric configuration values with dependency documentation
//! - `settings`: the process-wide [`TileConfig`] object

pub mod constants;
mod settings;

pub use constants::*;
pub use settings::TileConfig;
