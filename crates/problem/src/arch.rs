//! Target hardware description.

use crate::config::DataType;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes of LDS a single workgroup may allocate.
pub const MAX_LDS_BYTES_PER_WORKGROUP: u32 = 64 * 1024;

/// Hardware generations that matter for kernel tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchFamily {
    /// Vega and older, no matrix instructions.
    Gcn,
    /// MI100 (gfx908).
    Cdna1,
    /// MI200 (gfx90a).
    Cdna2,
    /// MI300 (gfx94x).
    Cdna3,
    /// RX 6000 (gfx103x).
    Rdna2,
    /// RX 7000 (gfx110x).
    Rdna3,
}

impl ArchFamily {
    fn from_gfx(name: &str) -> Option<Self> {
        let family = match name {
            n if n.starts_with("gfx110") => ArchFamily::Rdna3,
            n if n.starts_with("gfx103") => ArchFamily::Rdna2,
            n if n.starts_with("gfx94") => ArchFamily::Cdna3,
            "gfx90a" => ArchFamily::Cdna2,
            "gfx908" => ArchFamily::Cdna1,
            n if n.starts_with("gfx90") || n.starts_with("gfx80") => ArchFamily::Gcn,
            _ => return None,
        };
        Some(family)
    }
}

/// A resolved GPU target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Arch {
    pub name: String,
    pub family: ArchFamily,
    pub wave_size: u32,
    pub num_cu: u32,
    pub lds_bytes: u32,
}

impl Arch {
    /// Parse a `gfxNNNN` name, ignoring any `:feature+` suffix.
    pub fn from_gfx(name: &str) -> Result<Self> {
        let chip = name.split(':').next().unwrap_or(name).trim();
        let Some(family) = ArchFamily::from_gfx(chip) else {
            bail!("unsupported target architecture '{}'", name);
        };

        let wave_size = match family {
            ArchFamily::Rdna2 | ArchFamily::Rdna3 => 32,
            _ => 64,
        };
        let num_cu = match chip {
            "gfx906" => 60,
            "gfx908" => 120,
            "gfx90a" => 104,
            "gfx942" => 304,
            "gfx1030" => 80,
            "gfx1100" => 96,
            "gfx1101" => 60,
            "gfx1102" => 32,
            _ => 64,
        };

        Ok(Self {
            name: chip.to_string(),
            family,
            wave_size,
            num_cu,
            lds_bytes: MAX_LDS_BYTES_PER_WORKGROUP,
        })
    }

    pub fn with_num_cu(mut self, num_cu: u32) -> Self {
        self.num_cu = num_cu;
        self
    }

    pub fn has_wmma(&self) -> bool {
        self.family == ArchFamily::Rdna3
    }

    pub fn has_mfma(&self) -> bool {
        matches!(
            self.family,
            ArchFamily::Cdna1 | ArchFamily::Cdna2 | ArchFamily::Cdna3
        )
    }

    /// Whether a matrix-instruction path exists for this input element type.
    pub fn supports_accel(&self, dtype: DataType) -> bool {
        if self.has_wmma() {
            return matches!(dtype, DataType::F16 | DataType::BF16 | DataType::I8);
        }
        if self.has_mfma() {
            return matches!(
                dtype,
                DataType::F32 | DataType::F16 | DataType::BF16 | DataType::I8
            );
        }
        false
    }

    /// Global atomic add on the output type, which split-K relies on.
    pub fn supports_atomic_add(&self, dtype: DataType) -> bool {
        match dtype {
            DataType::F32 => true,
            DataType::F16 => matches!(
                self.family,
                ArchFamily::Cdna2 | ArchFamily::Cdna3 | ArchFamily::Rdna3
            ),
            _ => false,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
