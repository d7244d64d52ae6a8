//! A single point in the tuning space.

use rocktune_problem::arch::Arch;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Prefix of every perf config string this crate writes.
pub const PERF_CONFIG_VERSION: &str = "v2";

/// Most threads a tuned kernel may launch per workgroup.
pub const MAX_THREADS_PER_BLOCK: u32 = 256;

const ACCEL_FIELDS: usize = 9;
const NON_ACCEL_FIELDS: usize = 6;

/// Knobs for kernels built on matrix instructions (WMMA/MFMA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccelParams {
    pub m_per_block: u32,
    pub n_per_block: u32,
    /// K tile per block, in units of `k_pack` elements.
    pub k_per_block: u32,
    pub m_per_wave: u32,
    pub n_per_wave: u32,
    pub k_pack: u32,
    pub split_k_factor: u32,
    pub force_unroll: bool,
    pub b_copy_more: bool,
}

/// Knobs for the scalar fallback kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NonAccelParams {
    pub block_size: u32,
    pub m_per_block: u32,
    pub n_per_block: u32,
    pub k_per_block: u32,
    pub m_per_thread: u32,
    pub n_per_thread: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamEntry {
    Accel(AccelParams),
    NonAccel(NonAccelParams),
}

impl ParamEntry {
    pub fn is_accel(&self) -> bool {
        matches!(self, ParamEntry::Accel(_))
    }

    pub fn m_per_block(&self) -> u32 {
        match self {
            ParamEntry::Accel(p) => p.m_per_block,
            ParamEntry::NonAccel(p) => p.m_per_block,
        }
    }

    pub fn n_per_block(&self) -> u32 {
        match self {
            ParamEntry::Accel(p) => p.n_per_block,
            ParamEntry::NonAccel(p) => p.n_per_block,
        }
    }

    pub fn k_per_block(&self) -> u32 {
        match self {
            ParamEntry::Accel(p) => p.k_per_block,
            ParamEntry::NonAccel(p) => p.k_per_block,
        }
    }

    pub fn k_pack(&self) -> u32 {
        match self {
            ParamEntry::Accel(p) => p.k_pack,
            ParamEntry::NonAccel(_) => 1,
        }
    }

    pub fn split_k_factor(&self) -> u32 {
        match self {
            ParamEntry::Accel(p) => p.split_k_factor,
            ParamEntry::NonAccel(_) => 1,
        }
    }

    /// K elements one block consumes per main-loop iteration.
    pub fn k_elements_per_block(&self) -> u64 {
        self.k_per_block() as u64 * self.k_pack() as u64
    }

    /// Checks that only depend on the knobs and the target, not on the
    /// problem size.
    pub fn check_structure(&self, arch: &Arch, elem_bytes: usize) -> Result<(), &'static str> {
        let (m_per_block, n_per_block, threads) = match self {
            ParamEntry::Accel(p) => {
                if p.m_per_wave == 0 || p.n_per_wave == 0 {
                    return Err("wave tile must be non-empty");
                }
                if p.m_per_block % p.m_per_wave != 0 || p.n_per_block % p.n_per_wave != 0 {
                    return Err("wave tile must divide the block tile");
                }
                let waves = (p.m_per_block / p.m_per_wave) as u64
                    * (p.n_per_block / p.n_per_wave) as u64;
                (p.m_per_block, p.n_per_block, waves * arch.wave_size as u64)
            }
            ParamEntry::NonAccel(p) => {
                if p.m_per_thread == 0 || p.n_per_thread == 0 {
                    return Err("thread tile must be non-empty");
                }
                if p.m_per_block % p.m_per_thread != 0 || p.n_per_block % p.n_per_thread != 0 {
                    return Err("thread tile must divide the block tile");
                }
                let threads = (p.m_per_block / p.m_per_thread) as u64
                    * (p.n_per_block / p.n_per_thread) as u64;
                if threads != p.block_size as u64 {
                    return Err("thread tiles must cover the block exactly");
                }
                (p.m_per_block, p.n_per_block, threads)
            }
        };

        if threads == 0 || threads > MAX_THREADS_PER_BLOCK as u64 {
            return Err("workgroup exceeds the thread limit");
        }
        let lds = (m_per_block as u64 + n_per_block as u64)
            .saturating_mul(self.k_elements_per_block())
            .saturating_mul(elem_bytes as u64);
        if lds > arch.lds_bytes as u64 {
            return Err("block tiles do not fit in LDS");
        }
        Ok(())
    }
}

impl From<AccelParams> for ParamEntry {
    fn from(params: AccelParams) -> Self {
        ParamEntry::Accel(params)
    }
}

impl From<NonAccelParams> for ParamEntry {
    fn from(params: NonAccelParams) -> Self {
        ParamEntry::NonAccel(params)
    }
}

impl fmt::Display for ParamEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamEntry::Accel(p) => write!(
                f,
                "{}:{},{},{},{},{},{},{},{},{}",
                PERF_CONFIG_VERSION,
                p.m_per_block,
                p.n_per_block,
                p.k_per_block,
                p.m_per_wave,
                p.n_per_wave,
                p.k_pack,
                p.split_k_factor,
                p.force_unroll as u8,
                p.b_copy_more as u8
            ),
            ParamEntry::NonAccel(p) => write!(
                f,
                "{}:{},{},{},{},{},{}",
                PERF_CONFIG_VERSION,
                p.block_size,
                p.m_per_block,
                p.n_per_block,
                p.k_per_block,
                p.m_per_thread,
                p.n_per_thread
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("perf config is empty")]
    Empty,
    #[error("perf config '{0}' has no version prefix")]
    MissingVersion(String),
    #[error("unsupported perf config version '{0}'")]
    Version(String),
    #[error("expected 9 (accel) or 6 (non-accel) fields, found {0}")]
    FieldCount(usize),
    #[error("field {index} ('{value}') is not an unsigned integer")]
    Field { index: usize, value: String },
    #[error("field {index} must be 0 or 1, found {value}")]
    Flag { index: usize, value: u32 },
    #[error("field {index} must be positive")]
    Zero { index: usize },
}

impl FromStr for ParamEntry {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        let Some((version, body)) = s.split_once(':') else {
            return Err(ParseError::MissingVersion(s.to_string()));
        };
        if version != PERF_CONFIG_VERSION {
            return Err(ParseError::Version(version.to_string()));
        }

        let fields = body
            .split(',')
            .enumerate()
            .map(|(index, value)| parse_field(index, value))
            .collect::<Result<Vec<u32>, _>>()?;

        match fields.len() {
            ACCEL_FIELDS => {
                positive(&fields[..7])?;
                Ok(ParamEntry::Accel(AccelParams {
                    m_per_block: fields[0],
                    n_per_block: fields[1],
                    k_per_block: fields[2],
                    m_per_wave: fields[3],
                    n_per_wave: fields[4],
                    k_pack: fields[5],
                    split_k_factor: fields[6],
                    force_unroll: flag(7, fields[7])?,
                    b_copy_more: flag(8, fields[8])?,
                }))
            }
            NON_ACCEL_FIELDS => {
                positive(&fields)?;
                Ok(ParamEntry::NonAccel(NonAccelParams {
                    block_size: fields[0],
                    m_per_block: fields[1],
                    n_per_block: fields[2],
                    k_per_block: fields[3],
                    m_per_thread: fields[4],
                    n_per_thread: fields[5],
                }))
            }
            count => Err(ParseError::FieldCount(count)),
        }
    }
}

fn parse_field(index: usize, value: &str) -> Result<u32, ParseError> {
    // u32::from_str would also take a leading '+'.
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::Field {
            index,
            value: value.to_string(),
        });
    }
    value.parse().map_err(|_| ParseError::Field {
        index,
        value: value.to_string(),
    })
}

fn positive(fields: &[u32]) -> Result<(), ParseError> {
    match fields.iter().position(|&v| v == 0) {
        Some(index) => Err(ParseError::Zero { index }),
        None => Ok(()),
    }
}

fn flag(index: usize, value: u32) -> Result<bool, ParseError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(ParseError::Flag { index, value }),
    }
}
