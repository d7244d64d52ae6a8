//! Tuning session: one table, one tuner, optional on-disk persistence.

use crate::cost::CostModelBenchmark;
use anyhow::{ensure, Context, Result};
use rocktune_autotune::codec;
use rocktune_autotune::space::TuningLevel;
use rocktune_autotune::table::{ProblemSignature, TuningTable};
use rocktune_autotune::tuner::{Autotuner, Benchmark, TunerOptions, TuningOutcome};
use rocktune_problem::config::ProblemContext;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub table_path: Option<PathBuf>,
    pub clear_table: bool,
    pub level: TuningLevel,
    pub warmup_runs: usize,
    pub runs: usize,
    pub max_candidates: Option<usize>,
    /// Seed for the cost model's measurement noise.
    pub seed: u64,
}

impl SessionOptions {
    pub fn to_tuner_options(&self) -> TunerOptions {
        TunerOptions {
            level: self.level,
            warmup_runs: self.warmup_runs,
            runs: self.runs,
            max_candidates: self.max_candidates,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            table_path: None,
            clear_table: false,
            level: TuningLevel::Full,
            warmup_runs: 1,
            runs: 5,
            max_candidates: None,
            seed: 0,
        }
    }
}

pub struct TuningSession {
    options: SessionOptions,
    table: TuningTable,
    tuner: Autotuner,
}

impl TuningSession {
    pub fn new(options: SessionOptions) -> Result<Self> {
        if let Some(path) = &options.table_path {
            if options.clear_table && path.exists() {
                fs::remove_file(path)
                    .with_context(|| format!("clearing tuning table {}", path.display()))?;
            }
        }

        let table = match &options.table_path {
            Some(path) => TuningTable::load_from_file(path)?,
            None => TuningTable::new(),
        };
        let tuner = Autotuner::new(options.to_tuner_options());

        let location = options
            .table_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<memory>".to_string());
        info!(
            table = %location,
            entries = table.len(),
            level = %options.level,
            "tuning session ready"
        );

        Ok(Self {
            options,
            table,
            tuner,
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn table(&self) -> &TuningTable {
        &self.table
    }

    pub fn tune(
        &self,
        problem: &ProblemContext,
        benchmark: &dyn Benchmark,
    ) -> Result<TuningOutcome> {
        self.tuner.tune(problem, benchmark, &self.table)
    }

    /// Tune against the analytical cost model.
    pub fn tune_with_cost_model(&self, problem: &ProblemContext) -> Result<TuningOutcome> {
        let benchmark = CostModelBenchmark::new(self.options.seed);
        self.tune(problem, &benchmark)
    }

    pub fn signature(&self, problem: &ProblemContext) -> Result<ProblemSignature> {
        TuningTable::signature(problem)
    }

    pub fn lookup(&self, problem: &ProblemContext) -> Option<String> {
        self.table.lookup(problem)
    }

    pub fn apply_best(&self, problem: &mut ProblemContext) -> bool {
        self.table.apply_best(problem)
    }

    /// Apply the tabled config if there is one, tuning the problem first
    /// otherwise.
    pub fn apply_or_tune(&self, problem: &mut ProblemContext) -> Result<String> {
        if !self.apply_best(problem) {
            let outcome = self.tune_with_cost_model(problem)?;
            let best = outcome
                .best
                .with_context(|| format!("tuning recorded nothing for {}", outcome.signature))?;
            ensure!(
                codec::is_fusible(problem, &best.config),
                "best config {} for {} cannot be fused with the epilogue",
                best.config,
                outcome.signature
            );
            codec::apply_str(problem, &best.config)?;
        }
        problem
            .perf_config
            .clone()
            .context("perf config missing after apply")
    }

    pub fn persist(&self) -> Result<()> {
        if let Some(path) = &self.options.table_path {
            self.table.save_to_file(path)?;
        }
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.persist()
    }
}
