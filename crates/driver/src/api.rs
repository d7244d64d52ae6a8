//! Handle-based entry points for host compilers.
//!
//! Every resource is an owned handle created by a `*_create` function and
//! released by the matching `*_destroy`, which takes the handle by value.
//! Functions that hand back text write into a caller buffer and return the
//! length the full text needs, so a caller can ask with an empty buffer,
//! allocate, and call again.

use rocktune_autotune::codec::{self, copy_to_buffer};
use rocktune_autotune::param::ParamEntry;
use rocktune_autotune::space::{TuningLevel, TuningParamSet};
use rocktune_autotune::splitk::{self, SplitKLikelihood};
use rocktune_autotune::table::{ProblemSignature, TuningTable};
use rocktune_problem::config::ProblemContext;
use rocktune_problem::metadata::InitValue;
use tracing::{debug, warn};

pub use rocktune_autotune::codec::TUNING_PARAM_STRING_BUFSZ;

/// Returned by [`tuning_get_key`] when the problem has no signature.
pub const TUNING_KEY_NOT_FOUND: usize = usize::MAX;

#[derive(Debug)]
pub struct TuningSpaceHandle {
    space: TuningParamSet,
}

impl TuningSpaceHandle {
    pub fn space(&self) -> &TuningParamSet {
        &self.space
    }
}

/// Slot a single entry of a tuning space is copied into.
#[derive(Debug, Default)]
pub struct TuningParamHandle {
    entry: Option<ParamEntry>,
}

impl TuningParamHandle {
    pub fn entry(&self) -> Option<&ParamEntry> {
        self.entry.as_ref()
    }
}

#[derive(Debug, Default)]
pub struct TuningTableHandle {
    table: TuningTable,
}

impl TuningTableHandle {
    pub fn table(&self) -> &TuningTable {
        &self.table
    }
}

/// Build the tuning space for `problem`; `None` when the problem cannot be
/// tuned.
pub fn tuning_space_create(
    problem: &ProblemContext,
    level: TuningLevel,
) -> Option<TuningSpaceHandle> {
    match TuningParamSet::new(problem, level) {
        Ok(space) => Some(TuningSpaceHandle { space }),
        Err(err) => {
            warn!(error = %err, level = %level, "cannot build tuning space");
            None
        }
    }
}

pub fn tuning_space_destroy(space: TuningSpaceHandle) {
    drop(space);
}

/// Size of the raw tuning range, including positions [`tuning_param_get`]
/// reports as absent.
pub fn tuning_get_num_params(space: &TuningSpaceHandle) -> usize {
    space.space.len()
}

pub fn tuning_param_create() -> TuningParamHandle {
    TuningParamHandle::default()
}

pub fn tuning_param_destroy(param: TuningParamHandle) {
    drop(param);
}

/// Copy entry `pos` of `space` into `param`. Returns false, leaving `param`
/// unchanged, when `pos` is out of range or the entry is not usable.
pub fn tuning_param_get(
    space: &TuningSpaceHandle,
    pos: usize,
    param: &mut TuningParamHandle,
) -> bool {
    match space.space.get(pos) {
        Some(entry) => {
            param.entry = Some(*entry);
            true
        }
        None => false,
    }
}

/// Encoded form of `param` into `buf`. An empty handle encodes as the empty
/// string.
pub fn tuning_param_to_string(param: &TuningParamHandle, buf: &mut [u8]) -> usize {
    match &param.entry {
        Some(entry) => codec::encode_into(entry, buf),
        None => copy_to_buffer("", buf),
    }
}

pub fn tuning_set_param(problem: &mut ProblemContext, param: &TuningParamHandle) -> bool {
    let Some(entry) = &param.entry else {
        return false;
    };
    match codec::apply(problem, entry) {
        Ok(()) => true,
        Err(err) => {
            debug!(perf_config = %entry, error = %err, "perf config does not apply");
            false
        }
    }
}

pub fn tuning_set_from_str(problem: &mut ProblemContext, perf_config: &str) -> bool {
    match codec::apply_str(problem, perf_config) {
        Ok(()) => true,
        Err(err) => {
            debug!(perf_config, error = %err, "perf config does not apply");
            false
        }
    }
}

pub fn tuning_table_create() -> TuningTableHandle {
    TuningTableHandle::default()
}

pub fn tuning_table_destroy(table: TuningTableHandle) {
    drop(table);
}

/// Record a timed result under `problem_key`; true when it became the best.
pub fn tuning_update_table(
    table: &TuningTableHandle,
    problem_key: &str,
    perf_config: &str,
    time: f64,
) -> bool {
    table
        .table
        .update(&ProblemSignature::from(problem_key), perf_config, time)
}

/// Apply the best tabled config for `problem`.
pub fn tuning_set_from_table(table: &TuningTableHandle, problem: &mut ProblemContext) -> bool {
    table.table.apply_best(problem)
}

/// Signature of `problem` into `buf`, or [`TUNING_KEY_NOT_FOUND`].
pub fn tuning_get_key(problem: &ProblemContext, buf: &mut [u8]) -> usize {
    match ProblemSignature::derive(problem) {
        Ok(signature) => copy_to_buffer(signature.as_str(), buf),
        Err(err) => {
            debug!(error = %err, "no tuning key for problem");
            TUNING_KEY_NOT_FOUND
        }
    }
}

pub fn is_split_k_faster(
    g: i64,
    m: i64,
    n: i64,
    k: i64,
    num_cus: i64,
    level: TuningLevel,
) -> SplitKLikelihood {
    splitk::predict(g, m, n, k, num_cus, level)
}

pub fn is_module_fusible(problem: &ProblemContext, perf_config: &str) -> bool {
    codec::is_fusible(problem, perf_config)
}

pub fn num_prefill_args(problem: &ProblemContext) -> usize {
    problem.prefill.len()
}

/// Copy prefill argument indices and init values; returns how many pairs
/// were written.
pub fn prefill_args_info(
    problem: &ProblemContext,
    indices: &mut [usize],
    init_values: &mut [InitValue],
) -> usize {
    let written = problem
        .prefill
        .len()
        .min(indices.len())
        .min(init_values.len());
    for (i, arg) in problem.prefill.iter().take(written).enumerate() {
        indices[i] = arg.arg_index;
        init_values[i] = arg.init_value;
    }
    written
}

pub fn num_aux_buffers(problem: &ProblemContext) -> usize {
    problem.aux_buffers.len()
}

/// Copy aux buffer sizes and init values; returns how many pairs were
/// written.
pub fn aux_buffers_info(
    problem: &ProblemContext,
    sizes: &mut [usize],
    init_values: &mut [InitValue],
) -> usize {
    let written = problem
        .aux_buffers
        .len()
        .min(sizes.len())
        .min(init_values.len());
    for (i, buffer) in problem.aux_buffers.iter().take(written).enumerate() {
        sizes[i] = buffer.size_bytes;
        init_values[i] = buffer.init_value;
    }
    written
}
