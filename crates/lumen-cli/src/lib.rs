//! Lumen CLI library - shared functionality for the binary and its tests.

pub mod bench;
pub mod demo;
