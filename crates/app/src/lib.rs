#![deny(unsafe_code)]

/// Terminal presentation layer for the generation session.
pub mod host;
/// Settings persistence and layering.
pub mod settings;
