//! rocktune: tuning spaces, perf-config strings and best-config tables for
//! GPU GEMM and convolution kernels.
//!
//! The member crates do the work; this crate only re-exports them under one
//! roof for hosts that want a single dependency.

pub use rocktune_autotune as autotune;
pub use rocktune_driver as driver;
pub use rocktune_problem as problem;
