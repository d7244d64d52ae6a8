//! Tuning space enumeration.
//!
//! A [`TuningParamSet`] is the raw tuning range for one problem at one
//! strategy level: every candidate that survives the structural filters,
//! in a stable order. Candidates whose K tiling cannot feed the selected
//! matrix instruction stay in the range and count towards
//! [`TuningParamSet::len`], but [`TuningParamSet::get`] reports them as absent.

use crate::param::{AccelParams, NonAccelParams, ParamEntry};
use crate::splitk::split_k_factors;
use anyhow::{bail, Context, Result};
use rocktune_problem::config::ProblemContext;
use rocktune_problem::insn::AccelInsn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Search breadth. Wider levels cost more tuning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TuningLevel {
    /// Small curated set; never split-K.
    Quick,
    /// Broad grid over tile shapes, K tiling and split-K.
    #[default]
    Full,
    /// Full plus wider tiles and the low-level instruction knobs.
    Exhaustive,
}

impl TuningLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TuningLevel::Quick => "quick",
            TuningLevel::Full => "full",
            TuningLevel::Exhaustive => "exhaustive",
        }
    }
}

impl fmt::Display for TuningLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TuningLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "quick" => TuningLevel::Quick,
            "full" => TuningLevel::Full,
            "exhaustive" => TuningLevel::Exhaustive,
            other => bail!("unknown tuning level '{}'", other),
        })
    }
}

/// One slot of the tuning range.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub entry: ParamEntry,
    /// `k_per_block * k_pack` covers the selected instruction's input length.
    pub coherent: bool,
}

struct AccelGrid {
    block: &'static [u32],
    k_per_block: &'static [u32],
    wave: &'static [u32],
    k_pack: &'static [u32],
    force_unroll: &'static [bool],
    b_copy_more: &'static [bool],
}

const FULL_ACCEL: AccelGrid = AccelGrid {
    block: &[32, 64, 128, 256],
    k_per_block: &[2, 4, 8, 16],
    wave: &[16, 32, 64],
    k_pack: &[1, 4, 8],
    force_unroll: &[true],
    b_copy_more: &[true],
};

const EXHAUSTIVE_ACCEL: AccelGrid = AccelGrid {
    block: &[16, 32, 64, 128, 256],
    k_per_block: &[1, 2, 4, 8, 16, 32],
    wave: &[16, 32, 64, 128],
    k_pack: &[1, 2, 4, 8, 16],
    force_unroll: &[true, false],
    b_copy_more: &[true, false],
};

/// m_per_block, n_per_block, k_per_block, m_per_wave, n_per_wave, k_pack
const QUICK_ACCEL: &[[u32; 6]] = &[
    [256, 128, 2, 128, 64, 8],
    [128, 128, 4, 64, 64, 8],
    [128, 128, 8, 64, 64, 4],
    [128, 64, 4, 64, 32, 8],
    [64, 128, 4, 32, 64, 8],
    [64, 64, 8, 32, 32, 4],
    [64, 64, 4, 32, 32, 8],
    [64, 32, 8, 32, 16, 4],
    [32, 64, 8, 16, 32, 4],
    [32, 32, 8, 16, 16, 4],
    [32, 32, 16, 16, 16, 1],
];

struct NonAccelGrid {
    block_size: &'static [u32],
    block: &'static [u32],
    k_per_block: &'static [u32],
    thread: &'static [u32],
}

const FULL_NON_ACCEL: NonAccelGrid = NonAccelGrid {
    block_size: &[64, 128, 256],
    block: &[32, 64, 128],
    k_per_block: &[4, 8, 16],
    thread: &[2, 4],
};

const EXHAUSTIVE_NON_ACCEL: NonAccelGrid = NonAccelGrid {
    block_size: &[64, 128, 256],
    block: &[16, 32, 64, 128],
    k_per_block: &[4, 8, 16, 32],
    thread: &[2, 4, 8],
};

/// block_size, m_per_block, n_per_block, k_per_block, m_per_thread, n_per_thread
const QUICK_NON_ACCEL: &[[u32; 6]] = &[
    [256, 64, 64, 16, 4, 4],
    [256, 64, 64, 8, 4, 4],
    [128, 64, 32, 8, 4, 4],
    [128, 32, 64, 8, 4, 4],
    [64, 32, 32, 8, 4, 4],
];

/// Ordered, filtered tuning range for one problem and level.
#[derive(Debug, Clone)]
pub struct TuningParamSet {
    level: TuningLevel,
    problem: ProblemContext,
    range: Vec<Candidate>,
}

impl TuningParamSet {
    pub fn new(problem: &ProblemContext, level: TuningLevel) -> Result<Self> {
        problem
            .validate()
            .context("cannot build a tuning space for this problem")?;

        let entries = if problem.uses_accel() {
            accel_entries(problem, level)
        } else {
            non_accel_entries(problem, level)
        };

        let range: Vec<Candidate> = entries
            .into_iter()
            .filter(|entry| fits_problem(problem, entry))
            .map(|entry| Candidate {
                coherent: is_coherent(problem, &entry),
                entry,
            })
            .collect();

        let coherent = range.iter().filter(|c| c.coherent).count();
        info!(
            level = %level,
            arch = %problem.arch,
            accel = problem.uses_accel(),
            candidates = range.len(),
            coherent,
            "built tuning space"
        );

        Ok(Self {
            level,
            problem: problem.clone(),
            range,
        })
    }

    pub fn level(&self) -> TuningLevel {
        self.level
    }

    pub fn problem(&self) -> &ProblemContext {
        &self.problem
    }

    /// Size of the raw range, including incoherent slots.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Entry at `index`, or `None` when the index is past the end or the
    /// slot fails the K coherence rule.
    pub fn get(&self, index: usize) -> Option<&ParamEntry> {
        self.range
            .get(index)
            .filter(|candidate| candidate.coherent)
            .map(|candidate| &candidate.entry)
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.range
    }

    /// Entries `get` would return, in range order.
    pub fn iter_valid(&self) -> impl Iterator<Item = &ParamEntry> + '_ {
        self.range
            .iter()
            .filter(|candidate| candidate.coherent)
            .map(|candidate| &candidate.entry)
    }

    pub fn num_valid(&self) -> usize {
        self.iter_valid().count()
    }
}

fn accel_entries(problem: &ProblemContext, level: TuningLevel) -> Vec<ParamEntry> {
    let split_factors = split_k_factors(problem, level);
    let grid = match level {
        TuningLevel::Quick => {
            return QUICK_ACCEL
                .iter()
                .map(|&[mpb, npb, kpb, mpw, npw, kpack]| {
                    ParamEntry::Accel(AccelParams {
                        m_per_block: mpb,
                        n_per_block: npb,
                        k_per_block: kpb,
                        m_per_wave: mpw,
                        n_per_wave: npw,
                        k_pack: kpack,
                        split_k_factor: 1,
                        force_unroll: true,
                        b_copy_more: true,
                    })
                })
                .collect();
        }
        TuningLevel::Full => &FULL_ACCEL,
        TuningLevel::Exhaustive => &EXHAUSTIVE_ACCEL,
    };

    let mut entries = Vec::new();
    for &m_per_block in grid.block {
        for &n_per_block in grid.block {
            for &k_per_block in grid.k_per_block {
                for &m_per_wave in grid.wave {
                    for &n_per_wave in grid.wave {
                        for &k_pack in grid.k_pack {
                            for &split_k_factor in split_factors {
                                for &force_unroll in grid.force_unroll {
                                    for &b_copy_more in grid.b_copy_more {
                                        entries.push(ParamEntry::Accel(AccelParams {
                                            m_per_block,
                                            n_per_block,
                                            k_per_block,
                                            m_per_wave,
                                            n_per_wave,
                                            k_pack,
                                            split_k_factor,
                                            force_unroll,
                                            b_copy_more,
                                        }));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    entries
}

fn non_accel_entries(problem: &ProblemContext, level: TuningLevel) -> Vec<ParamEntry> {
    debug!(
        a = %problem.a_type,
        b = %problem.b_type,
        arch = %problem.arch,
        "no matrix instruction path, enumerating scalar kernels"
    );
    let grid = match level {
        TuningLevel::Quick => {
            return QUICK_NON_ACCEL
                .iter()
                .map(|&[block_size, mpb, npb, kpb, mpt, npt]| {
                    ParamEntry::NonAccel(NonAccelParams {
                        block_size,
                        m_per_block: mpb,
                        n_per_block: npb,
                        k_per_block: kpb,
                        m_per_thread: mpt,
                        n_per_thread: npt,
                    })
                })
                .collect();
        }
        TuningLevel::Full => &FULL_NON_ACCEL,
        TuningLevel::Exhaustive => &EXHAUSTIVE_NON_ACCEL,
    };

    let mut entries = Vec::new();
    for &block_size in grid.block_size {
        for &m_per_block in grid.block {
            for &n_per_block in grid.block {
                for &k_per_block in grid.k_per_block {
                    for &m_per_thread in grid.thread {
                        for &n_per_thread in grid.thread {
                            entries.push(ParamEntry::NonAccel(NonAccelParams {
                                block_size,
                                m_per_block,
                                n_per_block,
                                k_per_block,
                                m_per_thread,
                                n_per_thread,
                            }));
                        }
                    }
                }
            }
        }
    }
    entries
}

/// Smallest padded extent a block tile may cover.
const MIN_PADDED_EXTENT: u64 = 32;

fn padded(extent: u64) -> u64 {
    extent
        .checked_next_power_of_two()
        .unwrap_or(u64::MAX)
        .max(MIN_PADDED_EXTENT)
}

/// Structural and problem-size filters applied when building the range.
fn fits_problem(problem: &ProblemContext, entry: &ParamEntry) -> bool {
    let elem_bytes = problem.a_type.element_size_bytes();
    if entry.check_structure(&problem.arch, elem_bytes).is_err() {
        return false;
    }

    let shape = problem.shape;
    if entry.m_per_block() as u64 > padded(shape.m) || entry.n_per_block() as u64 > padded(shape.n)
    {
        return false;
    }

    let k_span = entry.k_elements_per_block() * entry.split_k_factor() as u64;
    k_span <= shape.k.checked_next_power_of_two().unwrap_or(u64::MAX)
}

/// K coherence against the instruction the entry's wave tile selects.
pub fn is_coherent(problem: &ProblemContext, entry: &ParamEntry) -> bool {
    match entry {
        ParamEntry::Accel(p) => AccelInsn::select(
            &problem.arch,
            problem.a_type,
            problem.b_type,
            p.m_per_wave,
            p.n_per_wave,
        )
        .map(|insn| insn.is_coherent_with_k(p.k_pack, p.k_per_block))
        .unwrap_or(false),
        ParamEntry::NonAccel(p) => p.k_per_block >= 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocktune_problem::arch::Arch;
    use rocktune_problem::config::DataType;
    use rocktune_problem::insn::AccelInsn;

    fn gemm(arch: &str, dtype: DataType, m: u64, n: u64, k: u64) -> ProblemContext {
        ProblemContext::gemm(1, m, n, k, dtype, Arch::from_gfx(arch).unwrap())
    }

    #[test]
    fn enumeration_is_deterministic() {
        let problem = gemm("gfx90a", DataType::F16, 1024, 1024, 4096);
        for level in [TuningLevel::Quick, TuningLevel::Full, TuningLevel::Exhaustive] {
            let a = TuningParamSet::new(&problem, level).unwrap();
            let b = TuningParamSet::new(&problem, level).unwrap();
            assert_eq!(a.len(), b.len());
            assert_eq!(a.candidates(), b.candidates());
        }
    }

    #[test]
    fn levels_widen_the_range() {
        let problem = gemm("gfx942", DataType::BF16, 2048, 2048, 2048);
        let quick = TuningParamSet::new(&problem, TuningLevel::Quick).unwrap();
        let full = TuningParamSet::new(&problem, TuningLevel::Full).unwrap();
        let exhaustive = TuningParamSet::new(&problem, TuningLevel::Exhaustive).unwrap();
        assert!(quick.num_valid() > 0);
        assert!(quick.len() < full.len());
        assert!(full.len() < exhaustive.len());
    }

    #[test]
    fn quick_never_offers_split_k() {
        let problem = gemm("gfx90a", DataType::F32, 64, 64, 65536);
        let quick = TuningParamSet::new(&problem, TuningLevel::Quick).unwrap();
        assert!(quick.iter_valid().all(|e| e.split_k_factor() == 1));

        let full = TuningParamSet::new(&problem, TuningLevel::Full).unwrap();
        assert!(full.iter_valid().any(|e| e.split_k_factor() > 1));
    }

    #[test]
    fn exhaustive_varies_instruction_knobs() {
        let problem = gemm("gfx90a", DataType::F16, 1024, 1024, 1024);
        let space = TuningParamSet::new(&problem, TuningLevel::Exhaustive).unwrap();
        let unrolled = space.iter_valid().any(|e| match e {
            ParamEntry::Accel(p) => !p.force_unroll,
            ParamEntry::NonAccel(_) => false,
        });
        assert!(unrolled);
    }

    #[test]
    fn every_returned_entry_is_coherent() {
        let problem = gemm("gfx1100", DataType::F16, 512, 512, 512);
        let space = TuningParamSet::new(&problem, TuningLevel::Full).unwrap();
        let mut seen = 0;
        for index in 0..space.len() {
            if let Some(ParamEntry::Accel(p)) = space.get(index) {
                let insn = AccelInsn::select(
                    &problem.arch,
                    problem.a_type,
                    problem.b_type,
                    p.m_per_wave,
                    p.n_per_wave,
                )
                .unwrap();
                assert!(p.k_per_block * p.k_pack >= insn.input_len());
                seen += 1;
            }
        }
        assert!(seen > 0);
    }

    #[test]
    fn tiny_k_leaves_no_coherent_entries() {
        // WMMA consumes 16 K elements per instruction; K=4 cannot feed it.
        let problem = gemm("gfx1100", DataType::F16, 128, 128, 4);
        let space = TuningParamSet::new(&problem, TuningLevel::Full).unwrap();
        assert!(space.len() > 0);
        for index in 0..space.len() + 4 {
            assert!(space.get(index).is_none());
        }
        assert!(space
            .candidates()
            .iter()
            .all(|c| c.entry.k_pack() == 1 && !c.coherent));
    }

    #[test]
    fn out_of_range_is_none() {
        let problem = gemm("gfx90a", DataType::F16, 256, 256, 256);
        let space = TuningParamSet::new(&problem, TuningLevel::Quick).unwrap();
        assert!(space.get(space.len()).is_none());
        assert!(space.get(usize::MAX).is_none());
    }

    #[test]
    fn scalar_path_without_matrix_units() {
        let problem = gemm("gfx906", DataType::F32, 512, 512, 512);
        let space = TuningParamSet::new(&problem, TuningLevel::Full).unwrap();
        assert!(space.num_valid() > 0);
        assert!(space.iter_valid().all(|e| !e.is_accel()));
    }

    #[test]
    fn malformed_problem_fails() {
        let problem = gemm("gfx90a", DataType::F16, 0, 256, 256);
        assert!(TuningParamSet::new(&problem, TuningLevel::Full).is_err());
    }

    #[test]
    fn level_parses_from_str() {
        assert_eq!("Exhaustive".parse::<TuningLevel>().unwrap(), TuningLevel::Exhaustive);
        assert!("medium".parse::<TuningLevel>().is_err());
    }
}
