//! Configuration constants for the cache engine.
//!
//! Import constants from here rather than defining them locally; values
//! that depend on each other are documented together in [`constants`].

mod constants;

pub use constants::*;
