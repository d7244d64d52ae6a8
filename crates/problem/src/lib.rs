//! Problem description shared by the rocktune crates.

pub mod arch;
pub mod config;
pub mod insn;
pub mod metadata;

pub use arch::*;
pub use config::*;
pub use insn::*;
pub use metadata::*;
