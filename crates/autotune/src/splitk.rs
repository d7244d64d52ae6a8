//! Split-K advisory heuristic.
//!
//! Split-K partitions the reduction dimension across an extra grid
//! dimension and accumulates partial results atomically. It pays off when
//! the output grid alone cannot occupy the device and the reduction is long
//! enough to split.

use crate::space::TuningLevel;
use rocktune_problem::config::ProblemContext;
use serde::{Deserialize, Serialize};

/// Output tile assumed when estimating grid occupancy.
const ESTIMATED_TILE: i64 = 64;
/// Reductions shorter than this are never worth splitting.
const MIN_SPLIT_K: i64 = 1024;

/// Split factors offered to the tuner when split-K is worth trying.
pub const SPLIT_K_FACTORS: &[u32] = &[1, 2, 4, 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitKLikelihood {
    Never,
    Possible,
    Likely,
}

impl SplitKLikelihood {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitKLikelihood::Never => "never",
            SplitKLikelihood::Possible => "possible",
            SplitKLikelihood::Likely => "likely",
        }
    }
}

/// Likelihood that split-K beats the default schedule at `level`.
///
/// `Quick` tuning never enumerates split-K variants, so it always answers
/// `Never` without consulting the shape.
pub fn predict(
    g: i64,
    m: i64,
    n: i64,
    k: i64,
    num_cus: i64,
    level: TuningLevel,
) -> SplitKLikelihood {
    if level == TuningLevel::Quick {
        return SplitKLikelihood::Never;
    }
    is_split_k_faster(g, m, n, k, num_cus)
}

/// Shape-only part of [`predict`].
pub fn is_split_k_faster(g: i64, m: i64, n: i64, k: i64, num_cus: i64) -> SplitKLikelihood {
    if g <= 0 || m <= 0 || n <= 0 || k <= 0 || num_cus <= 0 {
        return SplitKLikelihood::Never;
    }

    let tiles = g
        .saturating_mul(ceil_div(m, ESTIMATED_TILE))
        .saturating_mul(ceil_div(n, ESTIMATED_TILE));
    let occupancy = tiles as f64 / num_cus as f64;
    let aspect = k as f64 / m.max(n) as f64;

    if occupancy >= 1.0 || k < MIN_SPLIT_K || aspect < 1.0 {
        SplitKLikelihood::Never
    } else if aspect >= 4.0 && occupancy < 0.5 {
        SplitKLikelihood::Likely
    } else {
        SplitKLikelihood::Possible
    }
}

/// Split factors the tuning space should enumerate for `problem`.
///
/// Split-K is left out when the output lacks atomic add or when a fused
/// epilogue op would be applied to each partial sum.
pub fn split_k_factors(problem: &ProblemContext, level: TuningLevel) -> &'static [u32] {
    if !problem.arch.supports_atomic_add(problem.out_type) {
        return &SPLIT_K_FACTORS[..1];
    }
    if !problem.epilogue.iter().all(|op| op.distributes_over_add()) {
        return &SPLIT_K_FACTORS[..1];
    }
    let shape = problem.shape;
    let likelihood = predict(
        clamp_i64(shape.g),
        clamp_i64(shape.m),
        clamp_i64(shape.n),
        clamp_i64(shape.k),
        problem.arch.num_cu as i64,
        level,
    );
    match likelihood {
        SplitKLikelihood::Never => &SPLIT_K_FACTORS[..1],
        SplitKLikelihood::Possible | SplitKLikelihood::Likely => SPLIT_K_FACTORS,
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    a / b + i64::from(a % b != 0)
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
