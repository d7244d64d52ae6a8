//! CLI wiring for rocktune.

use crate::session::{SessionOptions, TuningSession};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rocktune_autotune::codec;
use rocktune_autotune::space::{TuningLevel, TuningParamSet};
use rocktune_autotune::splitk;
use rocktune_autotune::table::TuningTable;
use rocktune_problem::arch::Arch;
use rocktune_problem::config::{DataType, FusedOp, ProblemContext};
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rocktune", about = "GPU kernel tuning-space and tuning-table toolkit")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LevelArg {
    Quick,
    Full,
    Exhaustive,
}

impl From<LevelArg> for TuningLevel {
    fn from(value: LevelArg) -> TuningLevel {
        match value {
            LevelArg::Quick => TuningLevel::Quick,
            LevelArg::Full => TuningLevel::Full,
            LevelArg::Exhaustive => TuningLevel::Exhaustive,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum EpilogueArg {
    Scale,
    Negate,
    BiasAdd,
    Relu,
    Convert,
}

impl From<EpilogueArg> for FusedOp {
    fn from(value: EpilogueArg) -> FusedOp {
        match value {
            EpilogueArg::Scale => FusedOp::Scale,
            EpilogueArg::Negate => FusedOp::Negate,
            EpilogueArg::BiasAdd => FusedOp::BiasAdd,
            EpilogueArg::Relu => FusedOp::Relu,
            EpilogueArg::Convert => FusedOp::Convert,
        }
    }
}

/// A GEMM problem given on the command line, or a JSON problem file.
#[derive(Args, Debug, Clone)]
pub struct ProblemArgs {
    /// JSON-encoded problem context; overrides the shape flags.
    #[arg(long)]
    pub problem_file: Option<PathBuf>,
    #[arg(long, default_value = "gfx90a")]
    pub arch: String,
    #[arg(long)]
    pub num_cu: Option<u32>,
    #[arg(long, default_value = "f16")]
    pub dtype: String,
    #[arg(long)]
    pub out_type: Option<String>,
    #[arg(long, default_value_t = false)]
    pub transpose_a: bool,
    #[arg(long, default_value_t = false)]
    pub transpose_b: bool,
    #[arg(long, default_value_t = 1)]
    pub g: u64,
    #[arg(long, default_value_t = 1024)]
    pub m: u64,
    #[arg(long, default_value_t = 1024)]
    pub n: u64,
    #[arg(long, default_value_t = 1024)]
    pub k: u64,
    #[arg(long, value_enum)]
    pub epilogue: Vec<EpilogueArg>,
}

impl ProblemArgs {
    pub fn to_problem(&self) -> Result<ProblemContext> {
        if let Some(path) = &self.problem_file {
            let blob = fs::read_to_string(path)
                .with_context(|| format!("reading problem file {}", path.display()))?;
            let problem: ProblemContext = serde_json::from_str(&blob)
                .with_context(|| format!("parsing problem file {}", path.display()))?;
            return Ok(problem);
        }

        let mut arch = Arch::from_gfx(&self.arch)?;
        if let Some(num_cu) = self.num_cu {
            arch = arch.with_num_cu(num_cu);
        }
        let dtype: DataType = self.dtype.parse()?;
        let out_type = match &self.out_type {
            Some(name) => name.parse()?,
            None => dtype,
        };
        Ok(
            ProblemContext::gemm(self.g, self.m, self.n, self.k, dtype, arch)
                .with_out_type(out_type)
                .with_transpose(self.transpose_a, self.transpose_b)
                .with_epilogue(self.epilogue.iter().map(|&op| FusedOp::from(op))),
        )
    }
}

#[derive(Args, Debug, Clone)]
pub struct TableArgs {
    /// Tuning table JSON file.
    #[arg(long)]
    pub table: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub clear_table: bool,
}

/// Table location for subcommands that only read it.
#[derive(Args, Debug, Clone)]
pub struct TablePathArgs {
    /// Tuning table JSON file.
    #[arg(long)]
    pub table: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the tuning space for a problem.
    Space {
        #[command(flatten)]
        problem: ProblemArgs,
        #[arg(long, value_enum, default_value = "full")]
        level: LevelArg,
        /// Also list entries that are reported as absent.
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Print the problem signature used as the table key.
    Key {
        #[command(flatten)]
        problem: ProblemArgs,
    },
    /// Tune a problem against the cost model and record the best config.
    Tune {
        #[command(flatten)]
        problem: ProblemArgs,
        #[command(flatten)]
        table: TableArgs,
        #[arg(long, value_enum, default_value = "full")]
        level: LevelArg,
        #[arg(long, default_value_t = 1)]
        warmup: usize,
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        max_candidates: Option<usize>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Look up the best recorded config for a problem.
    Lookup {
        #[command(flatten)]
        problem: ProblemArgs,
        #[command(flatten)]
        table: TablePathArgs,
    },
    /// Apply a perf config (or the tabled one) and print the problem as JSON.
    Apply {
        #[command(flatten)]
        problem: ProblemArgs,
        #[command(flatten)]
        table: TablePathArgs,
        /// Perf config string; when absent the table is consulted.
        #[arg(long)]
        perf_config: Option<String>,
    },
    /// Split-K likelihood for a shape.
    SplitK {
        #[arg(long, default_value_t = 1)]
        g: i64,
        #[arg(long)]
        m: i64,
        #[arg(long)]
        n: i64,
        #[arg(long)]
        k: i64,
        #[arg(long)]
        num_cu: i64,
        #[arg(long, value_enum, default_value = "full")]
        level: LevelArg,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match cli.command {
        Command::Space {
            problem,
            level,
            all,
        } => {
            let problem = problem.to_problem()?;
            let space = TuningParamSet::new(&problem, level.into())?;
            println!(
                "level={} range={} valid={}",
                space.level(),
                space.len(),
                space.num_valid()
            );
            for (index, candidate) in space.candidates().iter().enumerate() {
                if candidate.coherent {
                    println!("{:5} {}", index, codec::encode(&candidate.entry));
                } else if all {
                    println!("{:5} {} (incoherent)", index, codec::encode(&candidate.entry));
                }
            }
        }
        Command::Key { problem } => {
            let problem = problem.to_problem()?;
            println!("{}", TuningTable::signature(&problem)?);
        }
        Command::Tune {
            problem,
            table,
            level,
            warmup,
            runs,
            max_candidates,
            seed,
        } => {
            let problem = problem.to_problem()?;
            let mut session = TuningSession::new(SessionOptions {
                table_path: table.table,
                clear_table: table.clear_table,
                level: level.into(),
                warmup_runs: warmup,
                runs,
                max_candidates,
                seed,
            })?;
            let outcome = session.tune_with_cost_model(&problem)?;
            if let Some(best) = &outcome.best {
                info!(
                    perf_config = %best.config,
                    time_ms = best.time,
                    gflops = problem.shape.flops() / (best.time * 1.0e6),
                    "best config"
                );
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            session.shutdown()?;
        }
        Command::Lookup { problem, table } => {
            let problem = problem.to_problem()?;
            let session = TuningSession::new(table_options(table))?;
            let signature = session.signature(&problem)?;
            match session.table().entry(&signature) {
                Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
                None => {
                    info!(signature = %signature, "no recorded config");
                    println!("null");
                }
            }
        }
        Command::Apply {
            problem,
            table,
            perf_config,
        } => {
            let mut problem = problem.to_problem()?;
            match perf_config {
                Some(text) => codec::apply_str(&mut problem, &text)?,
                None => {
                    let session = TuningSession::new(table_options(table))?;
                    let signature = session.signature(&problem)?;
                    anyhow::ensure!(
                        session.apply_best(&mut problem),
                        "no applicable config recorded for {}",
                        signature
                    );
                }
            }
            println!("{}", serde_json::to_string_pretty(&problem)?);
        }
        Command::SplitK {
            g,
            m,
            n,
            k,
            num_cu,
            level,
        } => {
            let likelihood = splitk::predict(g, m, n, k, num_cu, level.into());
            println!("{}", likelihood.as_str());
        }
    }

    Ok(())
}

fn table_options(table: TablePathArgs) -> SessionOptions {
    SessionOptions {
        table_path: table.table,
        clear_table: false,
        ..SessionOptions::default()
    }
}
