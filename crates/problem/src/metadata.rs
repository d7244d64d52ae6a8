//! Host-visible kernel argument metadata.
//!
//! The host runtime reads these to prepare buffers before launch: prefill
//! arguments must be initialised to a value, aux buffers must be allocated
//! and initialised alongside the user arguments.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitValue {
    Int(i64),
    Float(f64),
}

impl Default for InitValue {
    fn default() -> Self {
        InitValue::Int(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefillArg {
    pub arg_index: usize,
    pub init_value: InitValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxBuffer {
    pub size_bytes: usize,
    pub init_value: InitValue,
}
