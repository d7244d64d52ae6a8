//! Best-known perf config per problem signature.

use crate::codec;
use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use rocktune_problem::config::ProblemContext;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Canonical text identifying a problem, independent of any perf config.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProblemSignature(String);

impl ProblemSignature {
    pub fn derive(problem: &ProblemContext) -> Result<Self> {
        problem.validate().context("cannot derive a problem signature")?;
        let shape = problem.shape;
        let mut key = format!(
            "{}\t{}\t{} -t {} -out_datatype {} -transA {} -transB {} -g {} -m {} -n {} -k {}",
            problem.arch.name,
            problem.arch.num_cu,
            problem.op.as_str(),
            problem.a_type,
            problem.out_type,
            problem.transpose_a,
            problem.transpose_b,
            shape.g,
            shape.m,
            shape.n,
            shape.k
        );
        if problem.b_type != problem.a_type {
            key.push_str(" -t_b ");
            key.push_str(problem.b_type.as_str());
        }
        if let Some(conv) = &problem.conv {
            key.push(' ');
            key.push_str(&conv.descriptor());
        }
        if !problem.epilogue.is_empty() {
            let ops: Vec<&str> = problem.epilogue.iter().map(|op| op.as_str()).collect();
            key.push_str(" -fusion ");
            key.push_str(&ops.join(","));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProblemSignature {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ProblemSignature {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for ProblemSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningTableEntry {
    pub config: String,
    pub time: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TableFile {
    entries: BTreeMap<ProblemSignature, TuningTableEntry>,
}

/// Concurrent signature → best (config, time) map.
///
/// Each signature owns its own slot lock, so updates to one signature are
/// serialised while different signatures proceed independently. The map
/// lock is only taken for writing when a new signature appears.
#[derive(Debug, Default)]
pub struct TuningTable {
    slots: RwLock<HashMap<ProblemSignature, Arc<Mutex<TuningTableEntry>>>>,
}

impl TuningTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature(problem: &ProblemContext) -> Result<ProblemSignature> {
        ProblemSignature::derive(problem)
    }

    /// Record `config` for `signature` if it is the first result or strictly
    /// faster than the stored one. Returns whether the table changed.
    pub fn update(&self, signature: &ProblemSignature, config: &str, time: f64) -> bool {
        if !time.is_finite() {
            warn!(signature = %signature, config, time, "ignoring non-finite tuning time");
            return false;
        }

        let existing = self.slots.read().get(signature).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut slots = self.slots.write();
                match slots.entry(signature.clone()) {
                    Entry::Vacant(vacant) => {
                        vacant.insert(Arc::new(Mutex::new(TuningTableEntry {
                            config: config.to_string(),
                            time,
                        })));
                        debug!(signature = %signature, config, time, "new table entry");
                        return true;
                    }
                    Entry::Occupied(occupied) => Arc::clone(occupied.get()),
                }
            }
        };

        let mut entry = slot.lock();
        if time < entry.time {
            debug!(
                signature = %signature,
                config,
                time,
                previous = entry.time,
                "improved table entry"
            );
            entry.config = config.to_string();
            entry.time = time;
            true
        } else {
            false
        }
    }

    pub fn entry(&self, signature: &ProblemSignature) -> Option<TuningTableEntry> {
        let slot = self.slots.read().get(signature).cloned()?;
        let entry = slot.lock().clone();
        Some(entry)
    }

    pub fn lookup_signature(&self, signature: &ProblemSignature) -> Option<String> {
        self.entry(signature).map(|entry| entry.config)
    }

    /// Best config recorded for `problem`; `None` also covers problems that
    /// have no signature.
    pub fn lookup(&self, problem: &ProblemContext) -> Option<String> {
        let signature = ProblemSignature::derive(problem).ok()?;
        self.lookup_signature(&signature)
    }

    /// Apply the recorded config for `problem`. Returns false on a miss or
    /// when the stored config no longer type-checks.
    pub fn apply_best(&self, problem: &mut ProblemContext) -> bool {
        let Some(config) = self.lookup(problem) else {
            return false;
        };
        if !codec::is_fusible(problem, &config) {
            warn!(config = %config, "stored perf config cannot be fused with the epilogue");
            return false;
        }
        match codec::apply_str(problem, &config) {
            Ok(()) => true,
            Err(err) => {
                warn!(config = %config, error = %err, "stored perf config does not apply");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent copy of every entry, sorted by signature.
    pub fn snapshot(&self) -> BTreeMap<ProblemSignature, TuningTableEntry> {
        let slots = self.slots.read();
        slots
            .iter()
            .map(|(signature, slot)| (signature.clone(), slot.lock().clone()))
            .collect()
    }

    /// Fold `other` into this table; returns how many signatures changed.
    pub fn merge(&self, other: &TuningTable) -> usize {
        other
            .snapshot()
            .into_iter()
            .filter(|(signature, entry)| self.update(signature, &entry.config, entry.time))
            .count()
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let table = Self::new();
        if !path.exists() {
            return Ok(table);
        }
        let data =
            fs::read(path).with_context(|| format!("reading tuning table {}", path.display()))?;
        let file: TableFile = serde_json::from_slice(&data)
            .with_context(|| format!("parsing tuning table {}", path.display()))?;
        for (signature, entry) in file.entries {
            table.update(&signature, &entry.config, entry.time);
        }
        info!(path = %path.display(), entries = table.len(), "loaded tuning table");
        Ok(table)
    }

    /// Write the table as JSON through a temporary file and a rename, so
    /// readers never observe a partial file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let file = TableFile {
            entries: self.snapshot(),
        };
        let blob = serde_json::to_vec_pretty(&file)?;

        let tmp = temp_path(path);
        let mut out =
            File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        out.write_all(&blob)?;
        out.flush()?;
        drop(out);
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;

        info!(path = %path.display(), entries = file.entries.len(), "saved tuning table");
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocktune_problem::arch::Arch;
    use rocktune_problem::config::{ConvDims, DataType, FusedOp};
    use std::thread;

    fn gemm(m: u64) -> ProblemContext {
        ProblemContext::gemm(
            1,
            m,
            256,
            4096,
            DataType::F32,
            Arch::from_gfx("gfx90a").unwrap(),
        )
    }

    #[test]
    fn keeps_only_faster_results() {
        let table = TuningTable::new();
        let sig = ProblemSignature::from("gemm_f16_128x128x64");
        assert!(table.update(&sig, "v1", 10.0));
        assert!(!table.update(&sig, "v2", 12.0));
        assert_eq!(
            table.entry(&sig),
            Some(TuningTableEntry {
                config: "v1".to_string(),
                time: 10.0,
            })
        );
        assert!(table.update(&sig, "v3", 5.0));
        assert_eq!(
            table.entry(&sig),
            Some(TuningTableEntry {
                config: "v3".to_string(),
                time: 5.0,
            })
        );
        // Ties keep the incumbent.
        assert!(!table.update(&sig, "v4", 5.0));
        assert_eq!(table.entry(&sig).map(|e| e.time), Some(5.0));
    }

    #[test]
    fn miss_differs_from_empty_config() {
        let table = TuningTable::new();
        let present = ProblemSignature::from("present");
        assert!(table.update(&present, "", 1.0));
        assert_eq!(table.lookup_signature(&present), Some(String::new()));
        assert_eq!(table.lookup_signature(&ProblemSignature::from("absent")), None);
    }

    #[test]
    fn non_finite_times_are_ignored() {
        let table = TuningTable::new();
        let sig = ProblemSignature::from("k");
        assert!(!table.update(&sig, "v2:1", f64::NAN));
        assert!(!table.update(&sig, "v2:1", f64::INFINITY));
        assert!(table.is_empty());
    }

    #[test]
    fn signature_is_canonical() {
        let a = ProblemSignature::derive(&gemm(128)).unwrap();
        let b = ProblemSignature::derive(&gemm(128)).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.as_str(),
            "gfx90a\t104\tgemm -t f32 -out_datatype f32 -transA false -transB false -g 1 -m 128 -n 256 -k 4096"
        );
        assert_ne!(a, ProblemSignature::derive(&gemm(256)).unwrap());
        assert_ne!(
            a,
            ProblemSignature::derive(&gemm(128).with_num_cu(60)).unwrap()
        );
        assert!(ProblemSignature::derive(&gemm(0)).is_err());
    }

    #[test]
    fn epilogue_is_part_of_the_signature() {
        let plain = ProblemSignature::derive(&gemm(128)).unwrap();
        let biased =
            ProblemSignature::derive(&gemm(128).with_epilogue([FusedOp::Scale, FusedOp::BiasAdd]))
                .unwrap();
        assert_ne!(plain, biased);
        assert!(biased.as_str().ends_with(" -fusion scale,bias_add"));
    }

    #[test]
    fn conv_signature_carries_descriptor() {
        let dims = ConvDims {
            batch: 1,
            in_channels: 32,
            out_channels: 64,
            in_h: 14,
            in_w: 14,
            filter_h: 1,
            filter_w: 1,
            stride_h: 1,
            stride_w: 1,
            pad_h: 0,
            pad_w: 0,
            dilation_h: 1,
            dilation_w: 1,
            groups: 1,
        };
        let ctx =
            ProblemContext::conv_fwd(dims, DataType::F16, Arch::from_gfx("gfx1100").unwrap())
                .unwrap();
        let sig = ProblemSignature::derive(&ctx).unwrap();
        assert!(sig.as_str().contains("\tconv -t f16"));
        assert!(sig.as_str().ends_with(&dims.descriptor()));
    }

    #[test]
    fn concurrent_updates_converge_to_minimum() {
        let table = TuningTable::new();
        let sig = ProblemSignature::from("race");
        thread::scope(|scope| {
            for worker in 0..8u32 {
                let table = &table;
                let sig = &sig;
                scope.spawn(move || {
                    for step in 0..200u32 {
                        let time = f64::from((step * 37 + worker * 11) % 1000 + 1);
                        table.update(sig, &format!("w{worker}s{step}"), time);
                    }
                });
            }
        });
        assert_eq!(table.entry(&sig).map(|e| e.time), Some(1.0));
    }

    #[test]
    fn apply_best_uses_recorded_config() {
        let table = TuningTable::new();
        let mut problem = gemm(256);
        let sig = TuningTable::signature(&problem).unwrap();
        assert!(!table.apply_best(&mut problem));

        table.update(&sig, "v2:64,64,8,32,32,4,1,1,1", 3.0);
        assert!(table.apply_best(&mut problem));
        assert_eq!(
            problem.perf_config.as_deref(),
            Some("v2:64,64,8,32,32,4,1,1,1")
        );
    }

    #[test]
    fn stale_config_is_not_applied() {
        let table = TuningTable::new();
        let mut problem = gemm(256);
        let sig = TuningTable::signature(&problem).unwrap();
        table.update(&sig, "v2:256,64,64,8,4,4", 1.0);
        assert!(!table.apply_best(&mut problem));
        assert!(problem.perf_config.is_none());
    }

    #[test]
    fn split_k_config_is_not_applied_under_bias_add() {
        let table = TuningTable::new();
        let mut problem = gemm(256).with_epilogue([FusedOp::BiasAdd]);
        let sig = TuningTable::signature(&problem).unwrap();
        table.update(&sig, "v2:64,64,8,32,32,4,4,1,1", 1.0);
        assert!(!table.apply_best(&mut problem));
        assert!(problem.perf_config.is_none());
        assert!(problem.prefill.is_empty());

        table.update(&sig, "v2:64,64,8,32,32,4,1,1,1", 0.5);
        assert!(table.apply_best(&mut problem));
        assert_eq!(
            problem.perf_config.as_deref(),
            Some("v2:64,64,8,32,32,4,1,1,1")
        );
    }

    #[test]
    fn merge_keeps_the_faster_side() {
        let ours = TuningTable::new();
        let theirs = TuningTable::new();
        let a = ProblemSignature::from("a");
        let b = ProblemSignature::from("b");
        ours.update(&a, "ours", 2.0);
        theirs.update(&a, "theirs", 1.0);
        theirs.update(&b, "theirs", 4.0);
        ours.update(&b, "ours", 3.0);

        assert_eq!(ours.merge(&theirs), 1);
        assert_eq!(ours.lookup_signature(&a).as_deref(), Some("theirs"));
        assert_eq!(ours.lookup_signature(&b).as_deref(), Some("ours"));
    }

    #[test]
    fn persists_through_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("table.json");
        assert!(TuningTable::load_from_file(&path)?.is_empty());

        let table = TuningTable::new();
        table.update(&ProblemSignature::from("x"), "v2:1,1,1,1,1,1", 0.5);
        table.update(&ProblemSignature::from("y"), "", 7.0);
        table.save_to_file(&path)?;
        assert!(!temp_path(&path).exists());

        let loaded = TuningTable::load_from_file(&path)?;
        assert_eq!(loaded.snapshot(), table.snapshot());
        Ok(())
    }

    #[test]
    fn malformed_file_is_an_error() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        fs::write(file.path(), "not json")?;
        assert!(TuningTable::load_from_file(file.path()).is_err());
        Ok(())
    }
}
