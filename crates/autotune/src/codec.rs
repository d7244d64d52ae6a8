//! Perf-config strings: encoding, decoding and applying them to a problem.
//!
//! The string form is the interchange format between the tuning space and
//! the tuning table; neither side depends on the other's internals.

use crate::param::{ParamEntry, ParseError};
use anyhow::{anyhow, bail, ensure, Context, Result};
use rocktune_problem::config::{DataType, ProblemContext};
use rocktune_problem::insn::AccelInsn;
use rocktune_problem::metadata::InitValue;
use tracing::{debug, info};

/// Buffer size that always holds an encoded perf config.
pub const TUNING_PARAM_STRING_BUFSZ: usize = 256;

pub fn encode(entry: &ParamEntry) -> String {
    entry.to_string()
}

/// Write the encoded form of `entry` into `buf`; see [`copy_to_buffer`].
pub fn encode_into(entry: &ParamEntry, buf: &mut [u8]) -> usize {
    copy_to_buffer(&encode(entry), buf)
}

/// Copy `text` into `buf` the way `strncpy` would: at most `buf.len()`
/// bytes, zero-filling whatever is left. Returns the length `text` needs,
/// which exceeds `buf.len()` when the copy was truncated.
pub fn copy_to_buffer(text: &str, buf: &mut [u8]) -> usize {
    let bytes = text.as_bytes();
    let written = bytes.len().min(buf.len());
    buf[..written].copy_from_slice(&bytes[..written]);
    buf[written..].fill(0);
    bytes.len()
}

pub fn decode(text: &str) -> Result<ParamEntry, ParseError> {
    text.parse()
}

/// Type-check `entry` against `problem` without touching it.
pub fn validate(problem: &ProblemContext, entry: &ParamEntry) -> Result<()> {
    problem.validate()?;

    if entry.is_accel() != problem.uses_accel() {
        bail!(
            "perf config {} targets the {} path but {}x{} on {} uses the {} path",
            entry,
            path_name(entry.is_accel()),
            problem.a_type,
            problem.b_type,
            problem.arch,
            path_name(problem.uses_accel())
        );
    }

    entry
        .check_structure(&problem.arch, problem.a_type.element_size_bytes())
        .map_err(|reason| anyhow!("perf config {} rejected: {}", entry, reason))?;

    if let ParamEntry::Accel(p) = entry {
        let insn = AccelInsn::select(
            &problem.arch,
            problem.a_type,
            problem.b_type,
            p.m_per_wave,
            p.n_per_wave,
        )
        .ok_or_else(|| {
            anyhow!(
                "no matrix instruction on {} for {} with wave tile {}x{}",
                problem.arch,
                problem.a_type,
                p.m_per_wave,
                p.n_per_wave
            )
        })?;
        ensure!(
            insn.is_coherent_with_k(p.k_pack, p.k_per_block),
            "k_per_block * k_pack = {} cannot feed {} (input length {})",
            p.k_per_block * p.k_pack,
            insn.name(),
            insn.input_len()
        );

        if p.split_k_factor > 1 {
            ensure!(
                problem.arch.supports_atomic_add(problem.out_type),
                "split-K needs atomic add on {} output, which {} lacks",
                problem.out_type,
                problem.arch
            );
            ensure!(
                p.split_k_factor as u64 <= problem.shape.k,
                "split-K factor {} exceeds K = {}",
                p.split_k_factor,
                problem.shape.k
            );
        }
    }
    Ok(())
}

/// Attach `entry` to `problem`. Nothing changes when the entry does not
/// type-check.
pub fn apply(problem: &mut ProblemContext, entry: &ParamEntry) -> Result<()> {
    validate(problem, entry)?;

    let split_k = entry.split_k_factor();
    // Split-K partial sums are added atomically into a zeroed output.
    let prefill = (split_k > 1).then(|| zero_of(problem.out_type));
    problem.perf_config = Some(encode(entry));
    problem.set_output_prefill(prefill);

    debug!(perf_config = %entry, split_k, "applied perf config");
    Ok(())
}

/// Decode `text` and apply it; the problem is untouched on any failure.
pub fn apply_str(problem: &mut ProblemContext, text: &str) -> Result<()> {
    let entry = decode(text).with_context(|| format!("invalid perf config '{}'", text))?;
    apply(problem, &entry)?;
    info!(perf_config = text, arch = %problem.arch, "perf config set from string");
    Ok(())
}

/// Whether `text` can be used together with the problem's fused epilogue.
///
/// Split-K kernels accumulate partial results into the output, so every
/// fused op has to commute with that sum.
pub fn is_fusible(problem: &ProblemContext, text: &str) -> bool {
    decode(text).is_ok_and(|entry| is_entry_fusible(problem, &entry))
}

/// [`is_fusible`] for an already decoded entry.
pub fn is_entry_fusible(problem: &ProblemContext, entry: &ParamEntry) -> bool {
    entry.split_k_factor() == 1 || problem.epilogue.iter().all(|op| op.distributes_over_add())
}

fn path_name(accel: bool) -> &'static str {
    if accel {
        "matrix-instruction"
    } else {
        "scalar"
    }
}

fn zero_of(dtype: DataType) -> InitValue {
    match dtype {
        DataType::I8 | DataType::I32 => InitValue::Int(0),
        _ => InitValue::Float(0.0),
    }
}
