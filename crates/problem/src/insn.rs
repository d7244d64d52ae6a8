//! Matrix-instruction group selection.
//!
//! Given operand types and the per-wave output tile, pick the hardware
//! instruction a kernel would issue. The tuner only needs the instruction's
//! input length (how many K elements one invocation consumes) to reject
//! configurations whose K tiling cannot feed it.

use crate::arch::Arch;
use crate::config::DataType;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WmmaInsn {
    pub name: &'static str,
    pub input_len: u32,
    pub out_len: u32,
    pub out_stride: u32,
    pub m_repeats: u32,
    pub n_repeats: u32,
    pub arg_type: DataType,
    pub ret_type: DataType,
}

impl WmmaInsn {
    pub fn select(
        a: DataType,
        b: DataType,
        wave_size: u32,
        m_per_wave: u32,
        n_per_wave: u32,
    ) -> Option<Self> {
        debug!(
            a = %a,
            b = %b,
            m_per_wave,
            n_per_wave,
            "selecting wmma instruction group"
        );
        if a != b || wave_size != 32 {
            return None;
        }

        let input_len = 16;
        if m_per_wave % input_len != 0 || n_per_wave % input_len != 0 {
            return None;
        }

        let name = match a {
            DataType::F16 => "rocdl.wmma.f32.16x16x16.f16",
            DataType::BF16 => "rocdl.wmma.f32.16x16x16.bf16",
            DataType::I8 => "rocdl.wmma.i32.16x16x16.iu8",
            _ => return None,
        };

        Some(Self {
            name,
            input_len,
            out_len: 8,
            out_stride: 2,
            m_repeats: m_per_wave / input_len,
            n_repeats: n_per_wave / input_len,
            arg_type: a,
            ret_type: a.accumulator(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MfmaInsn {
    pub name: &'static str,
    pub mn_per_xdl: u32,
    /// K elements per lane per invocation.
    pub k_base: u32,
    pub m_repeats: u32,
    pub n_repeats: u32,
    pub arg_type: DataType,
    pub ret_type: DataType,
}

impl MfmaInsn {
    pub fn select(
        arch: &Arch,
        a: DataType,
        b: DataType,
        m_per_wave: u32,
        n_per_wave: u32,
    ) -> Option<Self> {
        debug!(
            arch = %arch,
            a = %a,
            b = %b,
            m_per_wave,
            n_per_wave,
            "selecting mfma instruction group"
        );
        if a != b || arch.wave_size != 64 || !arch.has_mfma() {
            return None;
        }

        let mn_per_xdl = [32, 16]
            .into_iter()
            .find(|mn| m_per_wave % mn == 0 && n_per_wave % mn == 0)?;
        let wide_i8 = arch.family == crate::arch::ArchFamily::Cdna3;

        let (name, k_base) = match (a, mn_per_xdl) {
            (DataType::F32, 32) => ("rocdl.mfma.f32.32x32x2f32", 1),
            (DataType::F32, _) => ("rocdl.mfma.f32.16x16x4f32", 1),
            (DataType::F16, 32) => ("rocdl.mfma.f32.32x32x8f16", 4),
            (DataType::F16, _) => ("rocdl.mfma.f32.16x16x16f16", 4),
            (DataType::BF16, 32) => ("rocdl.mfma.f32.32x32x8bf16.1k", 4),
            (DataType::BF16, _) => ("rocdl.mfma.f32.16x16x16bf16.1k", 4),
            (DataType::I8, 32) if wide_i8 => ("rocdl.mfma.i32.32x32x16.i8", 8),
            (DataType::I8, _) if wide_i8 => ("rocdl.mfma.i32.16x16x32.i8", 8),
            (DataType::I8, 32) => ("rocdl.mfma.i32.32x32x8i8", 4),
            (DataType::I8, _) => ("rocdl.mfma.i32.16x16x16i8", 4),
            _ => return None,
        };

        Some(Self {
            name,
            mn_per_xdl,
            k_base,
            m_repeats: m_per_wave / mn_per_xdl,
            n_repeats: n_per_wave / mn_per_xdl,
            arg_type: a,
            ret_type: a.accumulator(),
        })
    }
}

/// The instruction family a configuration will be lowered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccelInsn {
    Wmma(WmmaInsn),
    Mfma(MfmaInsn),
}

impl AccelInsn {
    pub fn select(
        arch: &Arch,
        a: DataType,
        b: DataType,
        m_per_wave: u32,
        n_per_wave: u32,
    ) -> Option<Self> {
        if arch.has_wmma() {
            WmmaInsn::select(a, b, arch.wave_size, m_per_wave, n_per_wave).map(AccelInsn::Wmma)
        } else if arch.has_mfma() {
            MfmaInsn::select(arch, a, b, m_per_wave, n_per_wave).map(AccelInsn::Mfma)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccelInsn::Wmma(insn) => insn.name,
            AccelInsn::Mfma(insn) => insn.name,
        }
    }

    /// K elements consumed by one invocation.
    pub fn input_len(&self) -> u32 {
        match self {
            AccelInsn::Wmma(insn) => insn.input_len,
            AccelInsn::Mfma(insn) => insn.k_base,
        }
    }

    pub fn is_coherent_with_k(&self, k_pack: u32, k_per_block: u32) -> bool {
        let input_len = self.input_len();
        if k_per_block * k_pack < input_len {
            debug!(
                k_per_block,
                k_pack, input_len, "k_per_block * k_pack cannot feed one instruction"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wmma_selects_by_element_type() {
        let insn = WmmaInsn::select(DataType::F16, DataType::F16, 32, 32, 64).unwrap();
        assert_eq!(insn.name, "rocdl.wmma.f32.16x16x16.f16");
        assert_eq!(insn.input_len, 16);
        assert_eq!((insn.m_repeats, insn.n_repeats), (2, 4));
        assert_eq!(insn.ret_type, DataType::F32);

        let int8 = WmmaInsn::select(DataType::I8, DataType::I8, 32, 16, 16).unwrap();
        assert_eq!(int8.ret_type, DataType::I32);
    }

    #[test]
    fn wmma_rejects_mismatches() {
        assert!(WmmaInsn::select(DataType::F16, DataType::BF16, 32, 32, 32).is_none());
        assert!(WmmaInsn::select(DataType::F16, DataType::F16, 64, 32, 32).is_none());
        assert!(WmmaInsn::select(DataType::F16, DataType::F16, 32, 24, 32).is_none());
        assert!(WmmaInsn::select(DataType::F32, DataType::F32, 32, 32, 32).is_none());
    }

    #[test]
    fn mfma_prefers_wide_tiles() {
        let arch = Arch::from_gfx("gfx90a").unwrap();
        let wide = MfmaInsn::select(&arch, DataType::F16, DataType::F16, 64, 64).unwrap();
        assert_eq!(wide.mn_per_xdl, 32);
        assert_eq!(wide.k_base, 4);

        let narrow = MfmaInsn::select(&arch, DataType::F16, DataType::F16, 16, 48).unwrap();
        assert_eq!(narrow.mn_per_xdl, 16);
        assert_eq!(narrow.n_repeats, 3);
    }

    #[test]
    fn coherence_compares_against_input_len() {
        let arch = Arch::from_gfx("gfx1100").unwrap();
        let insn = AccelInsn::select(&arch, DataType::F16, DataType::F16, 32, 32).unwrap();
        assert!(!insn.is_coherent_with_k(1, 4));
        assert!(insn.is_coherent_with_k(4, 4));
        assert!(insn.is_coherent_with_k(8, 2));
    }

    #[test]
    fn no_accel_on_gcn() {
        let arch = Arch::from_gfx("gfx906").unwrap();
        assert!(AccelInsn::select(&arch, DataType::F16, DataType::F16, 32, 32).is_none());
    }
}
