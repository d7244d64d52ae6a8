//! Reference tuning loop: enumerate, benchmark, record.

use crate::codec;
use crate::param::ParamEntry;
use crate::space::{TuningLevel, TuningParamSet};
use crate::table::{ProblemSignature, TuningTable, TuningTableEntry};
use anyhow::{bail, Result};
use rayon::prelude::*;
use rocktune_problem::config::ProblemContext;
use serde::Serialize;
use tracing::{debug, info};

/// Something that can time a problem with its perf config applied.
///
/// Implementations are called from the rayon pool, one candidate per task.
pub trait Benchmark: Send + Sync {
    fn name(&self) -> &str;

    /// Time of a single run, in milliseconds.
    fn run(&self, problem: &ProblemContext) -> Result<f64>;
}

#[derive(Debug, Clone)]
pub struct TunerOptions {
    pub level: TuningLevel,
    pub warmup_runs: usize,
    pub runs: usize,
    /// Cap on the number of valid candidates benchmarked, in range order.
    pub max_candidates: Option<usize>,
}

impl Default for TunerOptions {
    fn default() -> Self {
        Self {
            level: TuningLevel::Full,
            warmup_runs: 1,
            runs: 5,
            max_candidates: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TuningOutcome {
    pub signature: ProblemSignature,
    pub best: Option<TuningTableEntry>,
    pub evaluated: usize,
    pub rejected: usize,
    pub improved: usize,
}

enum Trial {
    Improved,
    Kept,
    Rejected,
}

pub struct Autotuner {
    options: TunerOptions,
}

impl Autotuner {
    pub fn new(options: TunerOptions) -> Self {
        Self { options }
    }

    pub fn with_runs(mut self, warmup_runs: usize, runs: usize) -> Self {
        self.options.warmup_runs = warmup_runs;
        self.options.runs = runs.max(1);
        self
    }

    pub fn options(&self) -> &TunerOptions {
        &self.options
    }

    /// Benchmark every valid candidate for `problem` and feed the results
    /// into `table`. Candidates that cannot be fused with the epilogue are
    /// never measured; candidates the benchmark fails on are skipped.
    pub fn tune(
        &self,
        problem: &ProblemContext,
        benchmark: &dyn Benchmark,
        table: &TuningTable,
    ) -> Result<TuningOutcome> {
        let signature = TuningTable::signature(problem)?;
        let space = TuningParamSet::new(problem, self.options.level)?;
        let limit = self.options.max_candidates.unwrap_or(usize::MAX);
        let candidates: Vec<&ParamEntry> = space
            .iter_valid()
            .filter(|entry| codec::is_entry_fusible(problem, entry))
            .take(limit)
            .collect();
        if candidates.is_empty() {
            bail!(
                "no valid perf config for {} at level {} ({} raw candidates)",
                signature,
                self.options.level,
                space.len()
            );
        }

        info!(
            benchmark = benchmark.name(),
            level = %self.options.level,
            candidates = candidates.len(),
            "tuning problem"
        );

        let trials: Vec<Trial> = candidates
            .par_iter()
            .map(|&entry| match self.measure(problem, entry, benchmark) {
                Ok(time) => {
                    if table.update(&signature, &codec::encode(entry), time) {
                        Trial::Improved
                    } else {
                        Trial::Kept
                    }
                }
                Err(err) => {
                    debug!(perf_config = %entry, error = %err, "candidate rejected");
                    Trial::Rejected
                }
            })
            .collect();

        let rejected = trials
            .iter()
            .filter(|t| matches!(t, Trial::Rejected))
            .count();
        let improved = trials
            .iter()
            .filter(|t| matches!(t, Trial::Improved))
            .count();
        let best = table.entry(&signature);

        info!(
            evaluated = trials.len() - rejected,
            rejected,
            improved,
            best = best.as_ref().map(|b| b.config.as_str()).unwrap_or("-"),
            "tuning finished"
        );

        Ok(TuningOutcome {
            signature,
            best,
            evaluated: trials.len() - rejected,
            rejected,
            improved,
        })
    }

    fn measure(
        &self,
        problem: &ProblemContext,
        entry: &ParamEntry,
        benchmark: &dyn Benchmark,
    ) -> Result<f64> {
        let mut configured = problem.clone();
        codec::apply(&mut configured, entry)?;

        for _ in 0..self.options.warmup_runs {
            benchmark.run(&configured)?;
        }

        let runs = self.options.runs.max(1);
        let mut total = 0.0;
        for _ in 0..runs {
            total += benchmark.run(&configured)?;
        }
        Ok(total / runs as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use rocktune_problem::arch::Arch;
    use rocktune_problem::config::{DataType, FusedOp};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Prefers large block tiles; fails on split-K.
    struct TileArea {
        calls: AtomicUsize,
    }

    impl Benchmark for TileArea {
        fn name(&self) -> &str {
            "tile-area"
        }

        fn run(&self, problem: &ProblemContext) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let text = problem
                .perf_config
                .as_deref()
                .ok_or_else(|| anyhow!("no perf config applied"))?;
            let entry: ParamEntry = text.parse()?;
            if entry.split_k_factor() > 1 {
                return Err(anyhow!("split-K unsupported"));
            }
            Ok(1.0e6 / f64::from(entry.m_per_block() * entry.n_per_block()))
        }
    }

    /// Rewards split-K in proportion to the split factor.
    struct SplitHungry;

    impl Benchmark for SplitHungry {
        fn name(&self) -> &str {
            "split-hungry"
        }

        fn run(&self, problem: &ProblemContext) -> Result<f64> {
            let entry: ParamEntry = problem
                .perf_config
                .as_deref()
                .ok_or_else(|| anyhow!("no perf config applied"))?
                .parse()?;
            Ok(1.0 / f64::from(entry.split_k_factor()))
        }
    }

    fn problem() -> ProblemContext {
        ProblemContext::gemm(
            1,
            512,
            512,
            512,
            DataType::F16,
            Arch::from_gfx("gfx90a").unwrap(),
        )
    }

    #[test]
    fn records_the_fastest_candidate() -> Result<()> {
        let bench = TileArea {
            calls: AtomicUsize::new(0),
        };
        let table = TuningTable::new();
        let tuner = Autotuner::new(TunerOptions {
            level: TuningLevel::Quick,
            ..TunerOptions::default()
        })
        .with_runs(0, 2);

        let outcome = tuner.tune(&problem(), &bench, &table)?;
        let best = outcome.best.expect("best entry");
        let entry: ParamEntry = best.config.parse()?;
        let space = TuningParamSet::new(&problem(), TuningLevel::Quick)?;
        let largest = space
            .iter_valid()
            .map(|e| e.m_per_block() * e.n_per_block())
            .max()
            .unwrap();
        assert_eq!(entry.m_per_block() * entry.n_per_block(), largest);
        assert_eq!(outcome.evaluated, space.num_valid());
        assert_eq!(bench.calls.load(Ordering::Relaxed), 2 * space.num_valid());
        Ok(())
    }

    #[test]
    fn failing_candidates_are_counted() -> Result<()> {
        let bench = TileArea {
            calls: AtomicUsize::new(0),
        };
        let table = TuningTable::new();
        let problem = ProblemContext::gemm(
            1,
            64,
            64,
            65536,
            DataType::F32,
            Arch::from_gfx("gfx90a").unwrap(),
        );
        let outcome = Autotuner::new(TunerOptions::default())
            .with_runs(0, 1)
            .tune(&problem, &bench, &table)?;
        assert!(outcome.rejected > 0);
        assert!(outcome.evaluated > 0);
        let best: ParamEntry = outcome.best.unwrap().config.parse()?;
        assert_eq!(best.split_k_factor(), 1);
        Ok(())
    }

    #[test]
    fn candidate_cap_is_honoured() -> Result<()> {
        let bench = TileArea {
            calls: AtomicUsize::new(0),
        };
        let table = TuningTable::new();
        let outcome = Autotuner::new(TunerOptions {
            max_candidates: Some(3),
            ..TunerOptions::default()
        })
        .with_runs(0, 1)
        .tune(&problem(), &bench, &table)?;
        assert_eq!(outcome.evaluated + outcome.rejected, 3);
        Ok(())
    }

    #[test]
    fn bias_add_epilogue_never_records_split_k() -> Result<()> {
        let problem = ProblemContext::gemm(
            1,
            64,
            64,
            65536,
            DataType::F32,
            Arch::from_gfx("gfx90a").unwrap(),
        );
        let tuner = Autotuner::new(TunerOptions::default()).with_runs(0, 1);

        let unfused = TuningTable::new();
        let best: ParamEntry = tuner
            .tune(&problem, &SplitHungry, &unfused)?
            .best
            .unwrap()
            .config
            .parse()?;
        assert!(best.split_k_factor() > 1);

        let fused = problem.with_epilogue([FusedOp::BiasAdd]);
        let table = TuningTable::new();
        let outcome = tuner.tune(&fused, &SplitHungry, &table)?;
        let config = outcome.best.unwrap().config;
        assert!(codec::is_fusible(&fused, &config));
        assert_eq!(config.parse::<ParamEntry>()?.split_k_factor(), 1);
        Ok(())
    }
}
