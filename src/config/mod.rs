//! Configuration management module
//!
//! TOML-based configuration plus environment overrides for the recognised
//! option set.

mod config;

pub use config::*;

