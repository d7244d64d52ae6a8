//! Analytical stand-in for a device benchmark.
//!
//! Times come from a roofline estimate over the configured tiling plus a
//! small amount of seeded noise, so the tuning loop and the table can run
//! end to end without a GPU attached.

use anyhow::{anyhow, Result};
use rocktune_autotune::param::ParamEntry;
use rocktune_autotune::tuner::Benchmark;
use rocktune_problem::arch::ArchFamily;
use rocktune_problem::config::ProblemContext;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Fixed cost of one kernel launch, in milliseconds.
const LAUNCH_OVERHEAD_MS: f64 = 0.005;
/// Cost of one main-loop iteration (barrier + LDS round trip), in milliseconds.
const LOOP_OVERHEAD_MS: f64 = 0.00002;

#[derive(Debug, Clone)]
pub struct CostModelBenchmark {
    seed: u64,
    noise: f64,
}

impl CostModelBenchmark {
    pub fn new(seed: u64) -> Self {
        Self { seed, noise: 0.02 }
    }

    /// Relative noise amplitude; `0.0` makes the model exact.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.max(0.0);
        self
    }

    /// Noise-free estimate for `problem` with `entry` applied.
    pub fn estimate(&self, problem: &ProblemContext, entry: &ParamEntry) -> f64 {
        let shape = problem.shape;
        let arch = &problem.arch;
        let num_cu = f64::from(arch.num_cu.max(1));
        let mpb = u64::from(entry.m_per_block().max(1));
        let npb = u64::from(entry.n_per_block().max(1));
        let split_k = u64::from(entry.split_k_factor().max(1));

        let tiles_m = shape.m.div_ceil(mpb);
        let tiles_n = shape.n.div_ceil(npb);
        let blocks = shape.g as f64 * tiles_m as f64 * tiles_n as f64 * split_k as f64;
        let rounds = (blocks / num_cu).ceil().max(1.0);
        let occupancy = blocks / (rounds * num_cu);

        let padded = tiles_m as f64 * mpb as f64 * (tiles_n as f64 * npb as f64);
        let tile_efficiency = shape.m as f64 * shape.n as f64 / padded;

        let peak_gflops = num_cu * per_cu_gflops(arch.family, entry.is_accel());
        let compute_ms = shape.flops() / (peak_gflops * 1.0e6 * occupancy * tile_efficiency);

        let elem = problem.a_type.element_size_bytes() as f64;
        let out_elem = problem.out_type.element_size_bytes() as f64;
        let (g, m, n, k) = (
            shape.g as f64,
            shape.m as f64,
            shape.n as f64,
            shape.k as f64,
        );
        let a_bytes = g * m * k * elem * tiles_n as f64;
        let b_bytes = g * k * n * elem * tiles_m as f64;
        // Split-K writes read-modify-write partial sums.
        let c_bytes = g * m * n * out_elem * if split_k > 1 { 2.0 * split_k as f64 } else { 1.0 };
        let memory_ms = (a_bytes + b_bytes + c_bytes) / (bandwidth_gbs(arch.family) * 1.0e6);

        let k_per_split = shape.k.div_ceil(split_k);
        let iterations = k_per_split.div_ceil(entry.k_elements_per_block().max(1)) as f64;
        let mut loop_ms = iterations * rounds * LOOP_OVERHEAD_MS;
        if let ParamEntry::Accel(p) = entry {
            if !p.force_unroll {
                loop_ms *= 1.5;
            }
        }

        compute_ms.max(memory_ms) + loop_ms + LAUNCH_OVERHEAD_MS
    }

    fn jitter(&self, config: &str) -> f64 {
        if self.noise == 0.0 {
            return 1.0;
        }
        let mut hasher = DefaultHasher::new();
        config.hash(&mut hasher);
        let mut rng = fastrand::Rng::with_seed(self.seed ^ hasher.finish());
        1.0 + self.noise * (rng.f64() * 2.0 - 1.0)
    }
}

impl Default for CostModelBenchmark {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Benchmark for CostModelBenchmark {
    fn name(&self) -> &str {
        "cost-model"
    }

    fn run(&self, problem: &ProblemContext) -> Result<f64> {
        let config = problem
            .perf_config
            .as_deref()
            .ok_or_else(|| anyhow!("problem has no perf config applied"))?;
        let entry: ParamEntry = config.parse()?;
        Ok(self.estimate(problem, &entry) * self.jitter(config))
    }
}

fn per_cu_gflops(family: ArchFamily, accel: bool) -> f64 {
    match (family, accel) {
        (ArchFamily::Cdna3, true) => 4300.0,
        (ArchFamily::Cdna2, true) => 1800.0,
        (ArchFamily::Cdna1, true) => 1000.0,
        (ArchFamily::Rdna3, true) => 1300.0,
        (_, true) => 500.0,
        (_, false) => 250.0,
    }
}

fn bandwidth_gbs(family: ArchFamily) -> f64 {
    match family {
        ArchFamily::Cdna3 => 5300.0,
        ArchFamily::Cdna2 => 1600.0,
        ArchFamily::Cdna1 => 1200.0,
        ArchFamily::Gcn => 1000.0,
        ArchFamily::Rdna3 => 960.0,
        ArchFamily::Rdna2 => 512.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocktune_autotune::codec;
    use rocktune_problem::arch::Arch;
    use rocktune_problem::config::DataType;

    fn configured(text: &str) -> ProblemContext {
        let mut problem = ProblemContext::gemm(
            1,
            1024,
            1024,
            1024,
            DataType::F16,
            Arch::from_gfx("gfx90a").unwrap(),
        );
        codec::apply_str(&mut problem, text).unwrap();
        problem
    }

    #[test]
    fn noise_is_reproducible() -> Result<()> {
        let problem = configured("v2:128,128,4,64,64,8,1,1,1");
        let a = CostModelBenchmark::new(7);
        let b = CostModelBenchmark::new(7);
        assert_eq!(a.run(&problem)?, b.run(&problem)?);
        Ok(())
    }

    #[test]
    fn larger_tiles_cut_memory_traffic() {
        let bench = CostModelBenchmark::new(0).with_noise(0.0);
        let small = configured("v2:32,32,4,16,16,8,1,1,1");
        let large = configured("v2:128,128,4,64,64,8,1,1,1");
        let small_entry: ParamEntry = "v2:32,32,4,16,16,8,1,1,1".parse().unwrap();
        let large_entry: ParamEntry = "v2:128,128,4,64,64,8,1,1,1".parse().unwrap();
        assert!(bench.estimate(&large, &large_entry) < bench.estimate(&small, &small_entry));
    }

    #[test]
    fn unconfigured_problem_fails() {
        let problem = ProblemContext::gemm(
            1,
            64,
            64,
            64,
            DataType::F32,
            Arch::from_gfx("gfx908").unwrap(),
        );
        assert!(CostModelBenchmark::default().run(&problem).is_err());
    }
}
