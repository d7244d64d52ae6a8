//! Tuning spaces, perf-config strings and best-config tables.
//!
//! A [`TuningParamSet`] enumerates candidate kernel configurations for one
//! problem; each candidate is a [`ParamEntry`] with a canonical string form
//! (see [`codec`]). Timed results go into a [`TuningTable`] keyed by
//! [`ProblemSignature`], from which later compilations pick the best known
//! config.

pub mod codec;
pub mod param;
pub mod space;
pub mod splitk;
pub mod table;
pub mod tuner;

pub use codec::*;
pub use param::*;
pub use space::*;
pub use splitk::*;
pub use table::*;
pub use tuner::*;
