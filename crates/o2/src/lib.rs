#![forbid(unsafe_code)]
//! o2 public API facade.
//!
//! Re-exports the volume engine from `o2-core`. Downstream tools (the CLI,
//! test harnesses) depend on this crate rather than on the layer crates.

pub use o2_core::*;
