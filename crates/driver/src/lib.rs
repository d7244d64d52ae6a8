//! Host-facing layer over the rocktune tuning core.

pub mod api;
#[cfg(feature = "cli")]
pub mod cli;
pub mod cost;
pub mod session;

pub use api::*;
#[cfg(feature = "cli")]
pub use cli::*;
pub use cost::*;
pub use session::*;
