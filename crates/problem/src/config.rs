//! Problem context handed to the tuner by the host compiler.

use crate::arch::Arch;
use crate::metadata::{AuxBuffer, InitValue, PrefillArg};
use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    F16,
    BF16,
    I8,
    I32,
}

impl DataType {
    pub fn element_size_bytes(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
        }
    }

    /// Accumulator type used by matrix instructions for this input type.
    pub fn accumulator(&self) -> DataType {
        match self {
            DataType::I8 | DataType::I32 => DataType::I32,
            _ => DataType::F32,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "f32" | "fp32" => DataType::F32,
            "f16" | "fp16" => DataType::F16,
            "bf16" => DataType::BF16,
            "i8" | "int8" => DataType::I8,
            "i32" | "int32" => DataType::I32,
            other => bail!("unknown element type '{}'", other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Gemm,
    ConvFwd,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Gemm => "gemm",
            OpKind::ConvFwd => "conv",
        }
    }
}

/// Logical GEMM dimensions; convolutions are tuned through their implicit GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmShape {
    pub g: u64,
    pub m: u64,
    pub n: u64,
    pub k: u64,
}

impl GemmShape {
    pub fn new(g: u64, m: u64, n: u64, k: u64) -> Self {
        Self { g, m, n, k }
    }

    pub fn flops(&self) -> f64 {
        2.0 * self.g as f64 * self.m as f64 * self.n as f64 * self.k as f64
    }
}

/// NCHW forward convolution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvDims {
    pub batch: u64,
    pub in_channels: u64,
    pub out_channels: u64,
    pub in_h: u64,
    pub in_w: u64,
    pub filter_h: u64,
    pub filter_w: u64,
    #[serde(default = "one")]
    pub stride_h: u64,
    #[serde(default = "one")]
    pub stride_w: u64,
    #[serde(default)]
    pub pad_h: u64,
    #[serde(default)]
    pub pad_w: u64,
    #[serde(default = "one")]
    pub dilation_h: u64,
    #[serde(default = "one")]
    pub dilation_w: u64,
    #[serde(default = "one")]
    pub groups: u64,
}

fn one() -> u64 {
    1
}

impl ConvDims {
    pub fn out_h(&self) -> Option<u64> {
        output_extent(
            self.in_h,
            self.filter_h,
            self.stride_h,
            self.pad_h,
            self.dilation_h,
        )
    }

    pub fn out_w(&self) -> Option<u64> {
        output_extent(
            self.in_w,
            self.filter_w,
            self.stride_w,
            self.pad_w,
            self.dilation_w,
        )
    }

    /// Implicit GEMM view: M = out channels per group, N = batch * Ho * Wo,
    /// K = in channels per group * Y * X.
    pub fn implicit_gemm(&self) -> Result<GemmShape> {
        ensure!(self.groups > 0, "convolution groups must be > 0");
        ensure!(
            self.in_channels % self.groups == 0 && self.out_channels % self.groups == 0,
            "channels ({}, {}) not divisible by groups {}",
            self.in_channels,
            self.out_channels,
            self.groups
        );
        let (Some(ho), Some(wo)) = (self.out_h(), self.out_w()) else {
            bail!("convolution window does not fit the padded input");
        };
        let n = self.batch.checked_mul(ho).and_then(|v| v.checked_mul(wo));
        let k = (self.in_channels / self.groups)
            .checked_mul(self.filter_h)
            .and_then(|v| v.checked_mul(self.filter_w));
        let (Some(n), Some(k)) = (n, k) else {
            bail!("convolution implicit GEMM dimensions overflow");
        };
        Ok(GemmShape {
            g: self.groups,
            m: self.out_channels / self.groups,
            n,
            k,
        })
    }

    pub fn descriptor(&self) -> String {
        format!(
            "-n {} -c {} -H {} -W {} -k {} -y {} -x {} -p {} -q {} -u {} -v {} -l {} -j {} -g {}",
            self.batch,
            self.in_channels,
            self.in_h,
            self.in_w,
            self.out_channels,
            self.filter_h,
            self.filter_w,
            self.pad_h,
            self.pad_w,
            self.stride_h,
            self.stride_w,
            self.dilation_h,
            self.dilation_w,
            self.groups
        )
    }
}

/// `None` when the window does not fit or the extent overflows.
fn output_extent(input: u64, filter: u64, stride: u64, pad: u64, dilation: u64) -> Option<u64> {
    if stride == 0 || dilation == 0 || filter == 0 {
        return None;
    }
    let effective = dilation.checked_mul(filter - 1)?.checked_add(1)?;
    let padded = pad.checked_mul(2)?.checked_add(input)?;
    if padded < effective {
        return None;
    }
    Some((padded - effective) / stride + 1)
}

/// Elementwise ops fused after the GEMM/conv result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusedOp {
    Scale,
    Negate,
    BiasAdd,
    Relu,
    Convert,
}

impl FusedOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusedOp::Scale => "scale",
            FusedOp::Negate => "negate",
            FusedOp::BiasAdd => "bias_add",
            FusedOp::Relu => "relu",
            FusedOp::Convert => "convert",
        }
    }

    /// Ops that commute with summing split-K partial results.
    pub fn distributes_over_add(&self) -> bool {
        matches!(self, FusedOp::Scale | FusedOp::Negate)
    }
}

/// Everything the tuner knows about one kernel problem.
///
/// `perf_config` is the one field the tuner writes; the rest is supplied by
/// the host and read-only from the tuner's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemContext {
    pub op: OpKind,
    pub shape: GemmShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conv: Option<ConvDims>,
    pub a_type: DataType,
    pub b_type: DataType,
    pub out_type: DataType,
    #[serde(default)]
    pub transpose_a: bool,
    #[serde(default)]
    pub transpose_b: bool,
    pub arch: Arch,
    #[serde(default)]
    pub epilogue: Vec<FusedOp>,
    #[serde(default)]
    pub prefill: Vec<PrefillArg>,
    #[serde(default)]
    pub aux_buffers: Vec<AuxBuffer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf_config: Option<String>,
}

impl ProblemContext {
    pub fn gemm(g: u64, m: u64, n: u64, k: u64, dtype: DataType, arch: Arch) -> Self {
        Self {
            op: OpKind::Gemm,
            shape: GemmShape::new(g, m, n, k),
            conv: None,
            a_type: dtype,
            b_type: dtype,
            out_type: dtype,
            transpose_a: false,
            transpose_b: false,
            arch,
            epilogue: Vec::new(),
            prefill: Vec::new(),
            aux_buffers: Vec::new(),
            perf_config: None,
        }
    }

    pub fn conv_fwd(dims: ConvDims, dtype: DataType, arch: Arch) -> Result<Self> {
        let shape = dims.implicit_gemm()?;
        let mut ctx = Self::gemm(shape.g, shape.m, shape.n, shape.k, dtype, arch);
        ctx.op = OpKind::ConvFwd;
        ctx.conv = Some(dims);
        Ok(ctx)
    }

    pub fn with_out_type(mut self, out_type: DataType) -> Self {
        self.out_type = out_type;
        self
    }

    pub fn with_transpose(mut self, transpose_a: bool, transpose_b: bool) -> Self {
        self.transpose_a = transpose_a;
        self.transpose_b = transpose_b;
        self
    }

    pub fn with_epilogue(mut self, ops: impl IntoIterator<Item = FusedOp>) -> Self {
        self.epilogue.extend(ops);
        self
    }

    pub fn with_num_cu(mut self, num_cu: u32) -> Self {
        self.arch.num_cu = num_cu;
        self
    }

    /// Check the host gave us something tunable.
    pub fn validate(&self) -> Result<()> {
        let GemmShape { g, m, n, k } = self.shape;
        ensure!(
            g > 0 && m > 0 && n > 0 && k > 0,
            "problem dimensions must be positive (g={}, m={}, n={}, k={})",
            g,
            m,
            n,
            k
        );
        ensure!(self.arch.num_cu > 0, "target reports zero compute units");
        if let Some(conv) = &self.conv {
            ensure!(
                conv.implicit_gemm()? == self.shape,
                "convolution descriptor disagrees with the GEMM shape"
            );
        }
        Ok(())
    }

    /// True when both operands can be fed to a matrix instruction on the target.
    pub fn uses_accel(&self) -> bool {
        self.a_type == self.b_type && self.arch.supports_accel(self.a_type)
    }

    /// Kernel argument holding the result; split-K zero-fills it.
    pub fn output_arg_index(&self) -> usize {
        2
    }

    /// Replace the prefill request for the output argument.
    pub fn set_output_prefill(&mut self, value: Option<InitValue>) {
        let index = self.output_arg_index();
        self.prefill.retain(|arg| arg.arg_index != index);
        if let Some(init_value) = value {
            self.prefill.push(PrefillArg {
                arg_index: index,
                init_value,
            });
            self.prefill.sort_by_key(|arg| arg.arg_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rdna3() -> Arch {
        Arch::from_gfx("gfx1100").unwrap()
    }

    fn conv_dims() -> ConvDims {
        ConvDims {
            batch: 2,
            in_channels: 64,
            out_channels: 128,
            in_h: 56,
            in_w: 56,
            filter_h: 3,
            filter_w: 3,
            stride_h: 1,
            stride_w: 1,
            pad_h: 1,
            pad_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            groups: 1,
        }
    }

    #[test]
    fn conv_maps_to_implicit_gemm() {
        let ctx = ProblemContext::conv_fwd(conv_dims(), DataType::F16, rdna3()).unwrap();
        assert_eq!(ctx.shape, GemmShape::new(1, 128, 2 * 56 * 56, 64 * 9));
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn oversized_conv_is_an_error() {
        let huge_batch = ConvDims {
            batch: u64::MAX,
            ..conv_dims()
        };
        let err = ProblemContext::conv_fwd(huge_batch, DataType::F16, rdna3()).unwrap_err();
        assert!(err.to_string().contains("overflow"));

        let huge_pad = ConvDims {
            pad_h: u64::MAX,
            ..conv_dims()
        };
        assert_eq!(huge_pad.out_h(), None);
        assert!(ProblemContext::conv_fwd(huge_pad, DataType::F16, rdna3()).is_err());

        let huge_dilation = ConvDims {
            dilation_w: u64::MAX,
            ..conv_dims()
        };
        assert_eq!(huge_dilation.out_w(), None);

        let huge_filter = ConvDims {
            in_channels: u64::MAX,
            filter_h: 1,
            filter_w: 2,
            in_h: 56,
            pad_h: 0,
            ..conv_dims()
        };
        assert!(huge_filter.implicit_gemm().is_err());
    }

    #[test]
    fn overflowing_conv_descriptor_fails_validation() {
        let mut ctx = ProblemContext::conv_fwd(conv_dims(), DataType::F16, rdna3()).unwrap();
        ctx.conv = Some(ConvDims {
            batch: u64::MAX,
            ..conv_dims()
        });
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let ctx = ProblemContext::gemm(1, 0, 128, 64, DataType::F16, rdna3());
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn accel_requires_matching_operands() {
        let mut ctx = ProblemContext::gemm(1, 128, 128, 64, DataType::F16, rdna3());
        assert!(ctx.uses_accel());
        ctx.b_type = DataType::BF16;
        assert!(!ctx.uses_accel());
    }

    #[test]
    fn output_prefill_is_replaced_not_duplicated() {
        let mut ctx = ProblemContext::gemm(1, 128, 128, 64, DataType::F32, rdna3());
        ctx.set_output_prefill(Some(InitValue::Float(0.0)));
        ctx.set_output_prefill(Some(InitValue::Float(0.0)));
        assert_eq!(ctx.prefill.len(), 1);
        ctx.set_output_prefill(None);
        assert!(ctx.prefill.is_empty());
    }

    #[test]
    fn problem_json_round_trips() {
        let ctx = ProblemContext::gemm(1, 256, 256, 4096, DataType::BF16, rdna3())
            .with_epilogue([FusedOp::BiasAdd]);
        let json = serde_json::to_string(&ctx).unwrap();
        let parsed: ProblemContext = serde_json::from_str(&json).unwrap();
        assert_eq!(ctx, parsed);
    }
}
