//! Quantized convolution engine.
//!
//! One `QuantizedConvEngine` owns the derived quantization state of a
//! single convolution layer: quantized/packed weights, per-unit filter
//! parameters, column offsets, quantized bias and requantization
//! multipliers. Weights are quantized once via `set_weights`; every
//! invocation then runs column transform (if needed) → integer kernel →
//! requantization epilogue, with scratch buffers reused across calls and
//! resized only on shape change.

use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

use crate::error::ConvError;
use crate::kernels::depthwise::{depthwise_3x3_nhwc, depthwise_3x3x3_ndhwc, PackedDepthwise};
use crate::kernels::epilogue::{
    dequantize_channel_f32, dequantize_position_f32, requantize_channel_u8,
    requantize_position_u8, requantize_u8,
};
use crate::kernels::gemm::{dot_group_acc32, gemm_nchw_acc32, row_sum_group, PackedGemmWeights};
use crate::kernels::im2col::{im2col_nchw, im2col_nhwc};
use crate::kernels::partition::partition_grouped;
use crate::quantize::{
    choose_quantization_params, choose_symmetric_params, min_max, Granularity,
    QuantScheme, QuantizationParams, RequantizationParams,
};
use crate::buffer::ensure_capacity;

/// Convolution geometry as supplied by the host's shape calculator.
///
/// Spatial vectors all have the same rank (2, or 3 for the volumetric
/// depthwise case). The filter is `[out_channels, in_channels/groups,
/// kernel...]` row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvShape {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub groups: usize,
    pub input_dims: Vec<usize>,
    pub kernel: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
    pub pad_begin: Vec<usize>,
    pub pad_end: Vec<usize>,
    pub output_dims: Vec<usize>,
}

/// Output extent along one spatial dimension, the usual convolution
/// formula. Provided as a convenience for hosts without their own shape
/// calculator; the kernel span must fit the padded input
/// (`ConvShape::validate` checks this before calling).
pub fn compute_output_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad_begin: usize,
    pad_end: usize,
) -> usize {
    (input + pad_begin + pad_end - dilation * (kernel - 1) - 1) / stride + 1
}

impl ConvShape {
    pub fn spatial_rank(&self) -> usize {
        self.input_dims.len()
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel.iter().product()
    }

    pub fn in_channels_per_group(&self) -> usize {
        self.in_channels / self.groups
    }

    pub fn out_channels_per_group(&self) -> usize {
        self.out_channels / self.groups
    }

    pub fn in_spatial_size(&self) -> usize {
        self.input_dims.iter().product()
    }

    pub fn out_spatial_size(&self) -> usize {
        self.output_dims.iter().product()
    }

    /// K of the per-group GEMM.
    pub fn kernel_dim(&self) -> usize {
        self.kernel_size() * self.in_channels_per_group()
    }

    fn validate(&self) -> Result<(), ConvError> {
        let rank = self.spatial_rank();
        if rank != 2 && rank != 3 {
            return Err(ConvError::UnsupportedConfig(format!(
                "spatial rank {rank} not supported"
            )));
        }
        for v in [
            &self.kernel,
            &self.stride,
            &self.dilation,
            &self.pad_begin,
            &self.pad_end,
            &self.output_dims,
        ] {
            if v.len() != rank {
                return Err(ConvError::ShapeMismatch(format!(
                    "spatial vector rank {} != {}",
                    v.len(),
                    rank
                )));
            }
        }
        if self.batch == 0 || self.in_channels == 0 || self.out_channels == 0 {
            return Err(ConvError::ShapeMismatch("zero-sized tensor dimension".into()));
        }
        if self.groups == 0
            || self.in_channels % self.groups != 0
            || self.out_channels % self.groups != 0
        {
            return Err(ConvError::ShapeMismatch(format!(
                "channels ({}, {}) not divisible by groups {}",
                self.in_channels, self.out_channels, self.groups
            )));
        }
        if self.stride.iter().any(|&s| s == 0)
            || self.dilation.iter().any(|&d| d == 0)
            || self.kernel.iter().any(|&k| k == 0)
        {
            return Err(ConvError::ShapeMismatch("zero stride/dilation/kernel".into()));
        }
        for d in 0..rank {
            let span = self.dilation[d] * (self.kernel[d] - 1) + 1;
            let padded = self.input_dims[d] + self.pad_begin[d] + self.pad_end[d];
            if span > padded {
                return Err(ConvError::ShapeMismatch(format!(
                    "kernel span {span} exceeds padded input {padded} in dim {d}"
                )));
            }
            let want = compute_output_dim(
                self.input_dims[d],
                self.kernel[d],
                self.stride[d],
                self.dilation[d],
                self.pad_begin[d],
                self.pad_end[d],
            );
            if self.output_dims[d] != want {
                return Err(ConvError::ShapeMismatch(format!(
                    "output dim {d} is {} but geometry gives {want}",
                    self.output_dims[d]
                )));
            }
        }
        Ok(())
    }
}

/// Where input quantization parameters come from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputQuantization {
    /// Calibrated ahead of time; cached until the host changes it.
    Static(QuantizationParams),
    /// Derived from the observed min/max of each float input.
    Dynamic,
}

/// Target representation of the output tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputRepr {
    /// 8-bit quantized output with the given affine parameters.
    Quantized(QuantizationParams),
    /// Dequantized f32 output.
    Float,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvConfig {
    pub activation: QuantScheme,
    pub weight: QuantScheme,
    pub granularity: Granularity,
    pub input_quantization: InputQuantization,
    pub output: OutputRepr,
    pub fused_relu: bool,
    pub threads: usize,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            activation: QuantScheme::U8,
            weight: QuantScheme::I8,
            granularity: Granularity::PerTensor,
            input_quantization: InputQuantization::Dynamic,
            output: OutputRepr::Float,
            fused_relu: false,
            threads: 1,
        }
    }
}

/// Execution strategy, resolved once per layer configuration and cached.
///
/// A 16-bit accumulation variant for small kernels would slot in here as
/// another case; it is deliberately not implemented because its overflow
/// precondition would depend on the channel count, and i32 accumulation
/// is always safe under the engine's documented preconditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// 1×1 kernel, unit stride/dilation, no padding: the column
    /// transform is the identity and the convolution is a plain GEMM.
    PointwiseGemm,
    /// Kernel covers the whole unpadded input (single output position):
    /// the column row equals the input row verbatim.
    DirectGemm,
    /// Depthwise 3×3, one input channel per group.
    Depthwise3x3,
    /// Depthwise 3×3×3 volumetric.
    Depthwise3x3x3,
    /// im2col + packed integer GEMM, the general case.
    GroupedGemm,
    /// Explicit accumulation loops for non-native activation widths.
    Reference,
}

/// Packed filter state, rebuilt only together with the quantized weight
/// buffer. Held in `Arc`s so a deduplicating host can share handles.
#[derive(Debug, Clone)]
pub enum PackedWeights {
    Gemm(Arc<PackedGemmWeights>),
    Depthwise3x3(Arc<PackedDepthwise>),
    Depthwise3x3x3(Arc<PackedDepthwise>),
    /// Reference path reads the quantized buffer directly.
    Unpacked,
}

/// Activation tensor handed to one invocation.
pub enum ConvInput<'a> {
    Float(&'a [f32]),
    Quantized(&'a [u8]),
}

/// Destination buffer for one invocation; must match the configured
/// output representation.
pub enum ConvOutput<'a> {
    Quantized(&'a mut Vec<u8>),
    Float(&'a mut Vec<f32>),
}

// Raw output pointer smuggled into the parallel region. Safety rests on
// the partitioner's coverage invariant: no two workers touch the same
// (group, position) unit, so all writes are disjoint.
#[derive(Clone, Copy)]
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

#[derive(Clone, Copy)]
enum SinkPtr {
    U8(SendPtr<u8>),
    F32(SendPtr<f32>),
}

#[derive(Debug)]
pub struct QuantizedConvEngine {
    shape: ConvShape,
    cfg: ConvConfig,
    strategy: Strategy,

    filter_qparams: Vec<QuantizationParams>,
    w_quantized: Vec<i8>,
    packed: PackedWeights,
    pack_generation: u64,
    column_offsets: Arc<Vec<i32>>,

    requant: Vec<RequantizationParams>,
    requant_in_scale: Option<f32>,

    bias_f: Option<Vec<f32>>,
    bias_quantized: Option<Arc<Vec<i32>>>,
    bias_in_scale: Option<f32>,

    // Per-invocation scratch, resized on shape change only.
    input_q_u8: Vec<u8>,
    input_q_i32: Vec<i32>,
    col_buffer_u8: Vec<u8>,
    y_int32: Vec<i32>,
}

impl QuantizedConvEngine {
    pub fn new(shape: ConvShape, cfg: ConvConfig) -> Result<Self, ConvError> {
        shape.validate()?;
        cfg.activation.validate(16)?;
        cfg.weight.validate(8)?;
        if !cfg.weight.signed {
            return Err(ConvError::UnsupportedBitWidth {
                bits: cfg.weight.bits,
                signed: cfg.weight.signed,
            });
        }
        if cfg.threads == 0 {
            return Err(ConvError::UnsupportedConfig("thread count must be positive".into()));
        }
        if let InputQuantization::Static(p) = cfg.input_quantization {
            if p.scale <= 0.0 {
                return Err(ConvError::UnsupportedConfig("input scale must be positive".into()));
            }
        }
        if let OutputRepr::Quantized(p) = cfg.output {
            if p.scale <= 0.0 {
                return Err(ConvError::UnsupportedConfig("output scale must be positive".into()));
            }
        }
        let strategy = Self::resolve_strategy(&shape, &cfg)?;
        debug!("resolved convolution strategy {strategy:?}");
        Ok(Self {
            shape,
            cfg,
            strategy,
            filter_qparams: Vec::new(),
            w_quantized: Vec::new(),
            packed: PackedWeights::Unpacked,
            pack_generation: 0,
            column_offsets: Arc::new(Vec::new()),
            requant: Vec::new(),
            requant_in_scale: None,
            bias_f: None,
            bias_quantized: None,
            bias_in_scale: None,
            input_q_u8: Vec::new(),
            input_q_i32: Vec::new(),
            col_buffer_u8: Vec::new(),
            y_int32: Vec::new(),
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Bumped on every weight repack; stable across bias or output-scale
    /// changes.
    pub fn pack_generation(&self) -> u64 {
        self.pack_generation
    }

    pub fn packed_weights(&self) -> &PackedWeights {
        &self.packed
    }

    pub fn filter_qparams(&self) -> &[QuantizationParams] {
        &self.filter_qparams
    }

    pub fn requantization_params(&self) -> &[RequantizationParams] {
        &self.requant
    }

    /// Change the output quantization parameters without touching the
    /// packed weights. Multipliers and the quantized bias are re-derived
    /// on the next run; `pack_generation` stays put.
    pub fn set_output_params(&mut self, params: QuantizationParams) -> Result<(), ConvError> {
        if params.scale <= 0.0 {
            return Err(ConvError::UnsupportedConfig("output scale must be positive".into()));
        }
        if !matches!(self.cfg.output, OutputRepr::Quantized(_)) {
            return Err(ConvError::UnsupportedConfig(
                "engine is configured for float output".into(),
            ));
        }
        self.cfg.output = OutputRepr::Quantized(params);
        self.requant.clear();
        self.requant_in_scale = None;
        Ok(())
    }

    fn is_depthwise_3x3(shape: &ConvShape) -> bool {
        shape.spatial_rank() == 2
            && shape.groups == shape.in_channels
            && shape.groups == shape.out_channels
            && shape.in_channels_per_group() == 1
            && shape.kernel == [3, 3]
            && shape.dilation == [1, 1]
            && shape.stride[0] == shape.stride[1]
            && (shape.stride[0] == 1 || shape.stride[0] == 2)
            && shape.pad_begin == shape.pad_end
            && shape.pad_begin[0] == shape.pad_begin[1]
    }

    fn is_depthwise_3x3x3(shape: &ConvShape) -> bool {
        shape.spatial_rank() == 3
            && shape.groups == shape.in_channels
            && shape.groups == shape.out_channels
            && shape.in_channels_per_group() == 1
            && shape.kernel == [3, 3, 3]
            && shape.dilation == [1, 1, 1]
            && shape.stride.iter().all(|&s| s == shape.stride[0])
            && (shape.stride[0] == 1 || shape.stride[0] == 2)
            && shape.pad_begin == shape.pad_end
            && shape.pad_begin.iter().all(|&p| p == shape.pad_begin[0])
    }

    fn is_pointwise(shape: &ConvShape) -> bool {
        shape.kernel.iter().all(|&k| k == 1)
            && shape.stride.iter().all(|&s| s == 1)
            && shape.dilation.iter().all(|&d| d == 1)
            && shape.pad_begin.iter().all(|&p| p == 0)
            && shape.pad_end.iter().all(|&p| p == 0)
    }

    fn is_direct(shape: &ConvShape) -> bool {
        shape.output_dims.iter().all(|&d| d == 1)
            && shape.pad_begin.iter().all(|&p| p == 0)
            && shape.pad_end.iter().all(|&p| p == 0)
            && shape.dilation.iter().all(|&d| d == 1)
            && shape.kernel == shape.input_dims
    }

    fn resolve_strategy(shape: &ConvShape, cfg: &ConvConfig) -> Result<Strategy, ConvError> {
        let native = cfg.activation.is_native_activation();
        if shape.spatial_rank() == 3 {
            // Three spatial dims are only reachable through the
            // volumetric depthwise fast path.
            if native
                && Self::is_depthwise_3x3x3(shape)
                && matches!(cfg.output, OutputRepr::Quantized(_))
            {
                return Ok(Strategy::Depthwise3x3x3);
            }
            return Err(ConvError::UnsupportedConfig(
                "3-D convolution requires the depthwise 3x3x3 fast path \
                 (native 8-bit activations, quantized output)"
                    .into(),
            ));
        }
        if !native {
            return Ok(Strategy::Reference);
        }
        if Self::is_depthwise_3x3(shape) && matches!(cfg.output, OutputRepr::Quantized(_)) {
            return Ok(Strategy::Depthwise3x3);
        }
        if Self::is_pointwise(shape) {
            return Ok(Strategy::PointwiseGemm);
        }
        if Self::is_direct(shape) {
            return Ok(Strategy::DirectGemm);
        }
        Ok(Strategy::GroupedGemm)
    }

    fn units(&self) -> usize {
        match self.cfg.granularity {
            Granularity::PerTensor => 1,
            Granularity::PerGroup => self.shape.groups,
        }
    }

    /// Quantize and pack a floating filter. Runs once per weight change;
    /// everything derived from the weights is rebuilt here and only here.
    pub fn set_weights(
        &mut self,
        weights: &[f32],
        bias: Option<&[f32]>,
    ) -> Result<(), ConvError> {
        let k = self.shape.kernel_dim();
        let m = self.shape.out_channels;
        if weights.len() != m * k {
            return Err(ConvError::ShapeMismatch(format!(
                "filter has {} elements, geometry needs {}",
                weights.len(),
                m * k
            )));
        }
        let units = self.units();
        let rows_per_unit = m / units;
        let mut qparams = Vec::with_capacity(units);
        for u in 0..units {
            let slice = &weights[u * rows_per_unit * k..(u + 1) * rows_per_unit * k];
            let abs_max = slice.iter().fold(0.0f32, |a, &v| a.max(v.abs()));
            qparams.push(choose_symmetric_params(abs_max, self.cfg.weight));
        }
        let mut wq = vec![0i8; weights.len()];
        for u in 0..units {
            let p = qparams[u];
            let base = u * rows_per_unit * k;
            for i in 0..rows_per_unit * k {
                wq[base + i] = p.quantize(weights[base + i], self.cfg.weight) as i8;
            }
        }
        self.finish_weights(wq, qparams, bias)
    }

    /// Accept a filter the host already quantized, with explicit per-unit
    /// parameters. Skips estimation but still packs and derives offsets.
    pub fn set_weights_prequantized(
        &mut self,
        wq: &[i8],
        params: &[QuantizationParams],
        bias: Option<&[f32]>,
    ) -> Result<(), ConvError> {
        let k = self.shape.kernel_dim();
        let m = self.shape.out_channels;
        if wq.len() != m * k {
            return Err(ConvError::ShapeMismatch(format!(
                "filter has {} elements, geometry needs {}",
                wq.len(),
                m * k
            )));
        }
        if params.len() != self.units() {
            return Err(ConvError::ShapeMismatch(format!(
                "{} filter quantization units supplied, granularity needs {}",
                params.len(),
                self.units()
            )));
        }
        if params.iter().any(|p| p.scale <= 0.0) {
            return Err(ConvError::UnsupportedConfig("filter scale must be positive".into()));
        }
        self.finish_weights(wq.to_vec(), params.to_vec(), bias)
    }

    fn finish_weights(
        &mut self,
        wq: Vec<i8>,
        qparams: Vec<QuantizationParams>,
        bias: Option<&[f32]>,
    ) -> Result<(), ConvError> {
        if let Some(b) = bias {
            if b.len() != self.shape.out_channels {
                return Err(ConvError::ShapeMismatch(format!(
                    "bias has {} entries, expected {}",
                    b.len(),
                    self.shape.out_channels
                )));
            }
        }
        let k = self.shape.kernel_dim();
        let offsets: Vec<i32> = wq
            .chunks_exact(k)
            .map(|row| row.iter().map(|&w| w as i32).sum())
            .collect();

        self.packed = self.pack(&wq);
        self.pack_generation += 1;
        self.w_quantized = wq;
        self.filter_qparams = qparams;
        self.column_offsets = Arc::new(offsets);
        self.bias_f = bias.map(|b| b.to_vec());
        self.bias_quantized = None;
        self.bias_in_scale = None;
        self.requant.clear();
        self.requant_in_scale = None;
        debug!(
            "quantized and packed weights (generation {})",
            self.pack_generation
        );
        Ok(())
    }

    /// Build the packed representation matching the cached strategy.
    /// `wq` is `[M, C/G, kernel...]` row-major; the GEMM packing first
    /// transposes each row into the NHWC (kernel, channel) order the
    /// column transform produces.
    fn pack(&self, wq: &[i8]) -> PackedWeights {
        let k = self.shape.kernel_dim();
        match self.strategy {
            Strategy::Depthwise3x3 => {
                PackedWeights::Depthwise3x3(Arc::new(PackedDepthwise::pack(
                    wq,
                    self.shape.out_channels,
                    9,
                )))
            }
            Strategy::Depthwise3x3x3 => {
                PackedWeights::Depthwise3x3x3(Arc::new(PackedDepthwise::pack(
                    wq,
                    self.shape.out_channels,
                    27,
                )))
            }
            Strategy::Reference => PackedWeights::Unpacked,
            _ => {
                let cpg = self.shape.in_channels_per_group();
                let ksize = self.shape.kernel_size();
                let mut transposed = vec![0i8; wq.len()];
                for m in 0..self.shape.out_channels {
                    let row = &wq[m * k..(m + 1) * k];
                    let dst = &mut transposed[m * k..(m + 1) * k];
                    for c in 0..cpg {
                        for kp in 0..ksize {
                            dst[kp * cpg + c] = row[c * ksize + kp];
                        }
                    }
                }
                PackedWeights::Gemm(Arc::new(PackedGemmWeights::pack(
                    &transposed,
                    self.shape.groups,
                    self.shape.out_channels_per_group(),
                    k,
                )))
            }
        }
    }

    fn prepare_run(&mut self, input: &ConvInput<'_>) -> Result<QuantizationParams, ConvError> {
        if self.w_quantized.is_empty() {
            return Err(ConvError::WeightsNotSet);
        }
        let expected = self.shape.batch * self.shape.in_spatial_size() * self.shape.in_channels;
        let got = match input {
            ConvInput::Float(d) => d.len(),
            ConvInput::Quantized(d) => d.len(),
        };
        if got != expected {
            return Err(ConvError::ShapeMismatch(format!(
                "input has {got} elements, geometry needs {expected}"
            )));
        }
        let in_params = match self.cfg.input_quantization {
            InputQuantization::Static(p) => p,
            InputQuantization::Dynamic => match input {
                ConvInput::Float(d) => {
                    let (mn, mx) = min_max(d);
                    choose_quantization_params(mn, mx, self.cfg.activation)?
                }
                ConvInput::Quantized(_) => {
                    return Err(ConvError::UnsupportedConfig(
                        "dynamic input quantization requires a float input".into(),
                    ))
                }
            },
        };
        self.refresh_derived(in_params)?;
        Ok(in_params)
    }

    /// Recompute requantization multipliers and the quantized bias when
    /// the effective input scale changed. Weight state is untouched:
    /// scale-only changes never trigger a repack.
    fn refresh_derived(&mut self, in_params: QuantizationParams) -> Result<(), ConvError> {
        if let OutputRepr::Quantized(out_p) = self.cfg.output {
            if self.requant_in_scale != Some(in_params.scale) {
                self.requant = self
                    .filter_qparams
                    .iter()
                    .map(|f| RequantizationParams::derive(in_params.scale, f.scale, out_p.scale))
                    .collect();
                self.requant_in_scale = Some(in_params.scale);
                debug!("recomputed {} requantization multiplier(s)", self.requant.len());
            }
        }
        if let Some(bias_f) = &self.bias_f {
            let need_quantized = matches!(self.cfg.output, OutputRepr::Quantized(_));
            if need_quantized && self.bias_in_scale != Some(in_params.scale) {
                let rows_per_unit = self.shape.out_channels / self.units();
                let mut bq = Vec::with_capacity(bias_f.len());
                for (m, &b) in bias_f.iter().enumerate() {
                    let scale =
                        in_params.scale as f64 * self.filter_qparams[m / rows_per_unit].scale as f64;
                    let q = (b as f64 / scale).round();
                    if q > i32::MAX as f64 || q < i32::MIN as f64 {
                        return Err(ConvError::BiasOverflow {
                            channel: m,
                            value: q,
                        });
                    }
                    bq.push(q as i32);
                }
                self.bias_quantized = Some(Arc::new(bq));
                self.bias_in_scale = Some(in_params.scale);
                debug!("requantized bias for input scale {}", in_params.scale);
            }
        }
        Ok(())
    }

    fn quantize_input_u8(&mut self, data: &[f32], p: QuantizationParams) {
        ensure_capacity(&mut self.input_q_u8, data.len());
        for (q, &v) in self.input_q_u8.iter_mut().zip(data.iter()) {
            *q = p.quantize(v, QuantScheme::U8) as u8;
        }
    }

    fn quantize_input_i32(
        &mut self,
        input: &ConvInput<'_>,
        p: QuantizationParams,
    ) -> Result<(), ConvError> {
        match input {
            ConvInput::Float(d) => {
                ensure_capacity(&mut self.input_q_i32, d.len());
                for (q, &v) in self.input_q_i32.iter_mut().zip(d.iter()) {
                    *q = p.quantize(v, self.cfg.activation);
                }
            }
            ConvInput::Quantized(d) => {
                if self.cfg.activation.signed || self.cfg.activation.bits > 8 {
                    return Err(ConvError::UnsupportedConfig(
                        "pre-quantized u8 input does not fit the configured activation scheme"
                            .into(),
                    ));
                }
                ensure_capacity(&mut self.input_q_i32, d.len());
                for (q, &v) in self.input_q_i32.iter_mut().zip(d.iter()) {
                    *q = v as i32;
                }
            }
        }
        Ok(())
    }

    fn check_output(&self, output: &ConvOutput<'_>) -> Result<(), ConvError> {
        let ok = matches!(
            (&self.cfg.output, output),
            (OutputRepr::Quantized(_), ConvOutput::Quantized(_))
                | (OutputRepr::Float, ConvOutput::Float(_))
        );
        if ok {
            Ok(())
        } else {
            Err(ConvError::UnsupportedConfig(
                "output buffer type does not match the configured output representation".into(),
            ))
        }
    }

    /// Run the convolution on an NHWC (or NDHWC) input. This is the
    /// multi-threaded entry point; the grouped GEMM core partitions
    /// (group × output position) work across `cfg.threads` workers.
    pub fn run_nhwc(
        &mut self,
        input: ConvInput<'_>,
        output: ConvOutput<'_>,
    ) -> Result<Vec<usize>, ConvError> {
        self.check_output(&output)?;
        let in_params = self.prepare_run(&input)?;

        match self.strategy {
            Strategy::Reference => {
                self.quantize_input_i32(&input, in_params)?;
                self.run_reference(true, in_params, output)
            }
            Strategy::Depthwise3x3 | Strategy::Depthwise3x3x3 => {
                let q = self.native_input(&input, in_params);
                let res = self.run_depthwise(&q, in_params, output);
                self.restore_scratch(q);
                res
            }
            _ => {
                let q = self.native_input(&input, in_params);
                let res = self.run_gemm_nhwc(&q, in_params, output);
                self.restore_scratch(q);
                res
            }
        }
    }

    /// Run the convolution on an NCHW input. Single-threaded; the
    /// depthwise geometry falls back to the grouped GEMM core here
    /// (the depthwise kernels are NHWC-only).
    pub fn run_nchw(
        &mut self,
        input: ConvInput<'_>,
        output: ConvOutput<'_>,
    ) -> Result<Vec<usize>, ConvError> {
        self.check_output(&output)?;
        if self.shape.spatial_rank() != 2 {
            return Err(ConvError::UnsupportedConfig(
                "NCHW entry point supports two spatial dimensions".into(),
            ));
        }
        let in_params = self.prepare_run(&input)?;

        match self.strategy {
            Strategy::Reference => {
                self.quantize_input_i32(&input, in_params)?;
                self.run_reference(false, in_params, output)
            }
            _ => {
                let q = self.native_input(&input, in_params);
                let res = self.run_gemm_nchw(&q, in_params, output);
                self.restore_scratch(q);
                res
            }
        }
    }

    /// Quantized u8 view of the activation: the host's buffer as-is, or
    /// the engine's scratch taken out of `self` so the run core can
    /// borrow `self` mutably alongside it.
    fn native_input<'a>(
        &mut self,
        input: &ConvInput<'a>,
        p: QuantizationParams,
    ) -> NativeInput<'a> {
        match input {
            ConvInput::Quantized(d) => NativeInput::Host(d),
            ConvInput::Float(d) => {
                self.quantize_input_u8(d, p);
                NativeInput::Scratch(std::mem::take(&mut self.input_q_u8))
            }
        }
    }

    fn restore_scratch(&mut self, q: NativeInput<'_>) {
        if let NativeInput::Scratch(v) = q {
            self.input_q_u8 = v;
        }
    }

    fn run_gemm_nhwc(
        &mut self,
        q: &NativeInput<'_>,
        in_params: QuantizationParams,
        mut output: ConvOutput<'_>,
    ) -> Result<Vec<usize>, ConvError> {
        let shape = self.shape.clone();
        let (batch, channels, m_total) = (shape.batch, shape.in_channels, shape.out_channels);
        let groups = shape.groups;
        let cpg = shape.in_channels_per_group();
        let mg = shape.out_channels_per_group();
        let spatial = shape.out_spatial_size();
        let ksize = shape.kernel_size();
        let k = shape.kernel_dim();
        let row_len = ksize * channels;
        let in_zp = in_params.zero_point;

        let packed = match &self.packed {
            PackedWeights::Gemm(p) => Arc::clone(p),
            _ => unreachable!("GEMM strategies always carry packed GEMM weights"),
        };
        let col_offsets = Arc::clone(&self.column_offsets);
        let w_zps: Vec<i32> = self.filter_qparams.iter().map(|p| p.zero_point).collect();
        let nthreads = self.cfg.threads;
        let relu = self.cfg.fused_relu;
        let needs_im2col = matches!(self.strategy, Strategy::GroupedGemm);

        let out_len = batch * spatial * m_total;
        let (sink, epi) = self.make_sink(&mut output, out_len, in_params)?;
        let input_q = q.as_slice();

        let mut col_local = std::mem::take(&mut self.col_buffer_u8);
        if needs_im2col {
            ensure_capacity(&mut col_local, spatial * row_len);
        }

        for n in 0..batch {
            let col: &[u8] = if needs_im2col {
                im2col_nhwc(
                    input_q,
                    n,
                    shape.input_dims[0],
                    shape.input_dims[1],
                    channels,
                    shape.kernel[0],
                    shape.kernel[1],
                    shape.stride[0],
                    shape.stride[1],
                    shape.pad_begin[0],
                    shape.pad_begin[1],
                    shape.dilation[0],
                    shape.dilation[1],
                    shape.output_dims[0],
                    shape.output_dims[1],
                    in_zp as u8,
                    &mut col_local,
                );
                &col_local
            } else {
                // Pointwise: the input image is its own column matrix.
                // Direct: a single row covering the whole image.
                let img = shape.in_spatial_size() * channels;
                &input_q[n * img..(n + 1) * img]
            };

            let per_tensor = self.cfg.granularity == Granularity::PerTensor;
            let worker = |tid: usize| {
                let slice = partition_grouped(groups, spatial, nthreads, tid);
                let mut acc = vec![0i32; mg];
                for (g, i) in slice.iter(spatial) {
                    let col_row = &col[i * row_len..(i + 1) * row_len];
                    dot_group_acc32(col_row, g, cpg, channels, ksize, &packed, &mut acc);
                    let u = if per_tensor { 0 } else { g };
                    if in_zp != 0 {
                        for (m, a) in acc.iter_mut().enumerate() {
                            *a -= in_zp * col_offsets[g * mg + m];
                        }
                    }
                    if w_zps[u] != 0 {
                        let rs = row_sum_group(col_row, g, cpg, channels, ksize);
                        let corr = w_zps[u] * (rs - in_zp * k as i32);
                        for a in acc.iter_mut() {
                            *a -= corr;
                        }
                    }
                    let off = (n * spatial + i) * m_total + g * mg;
                    // Safety: (group, position) units are disjoint across
                    // workers, so this slice is written by one task only.
                    match sink {
                        SinkPtr::U8(p) => {
                            let o = unsafe {
                                std::slice::from_raw_parts_mut(p.0.add(off), mg)
                            };
                            requantize_position_u8(
                                &acc,
                                epi.bias_q.as_deref().map(|b| &b[g * mg..(g + 1) * mg]),
                                epi.multipliers[u],
                                epi.out_zp,
                                epi.qmin,
                                epi.qmax,
                                relu,
                                o,
                            );
                        }
                        SinkPtr::F32(p) => {
                            let o = unsafe {
                                std::slice::from_raw_parts_mut(p.0.add(off), mg)
                            };
                            dequantize_position_f32(
                                &acc,
                                epi.bias_f.as_deref().map(|b| &b[g * mg..(g + 1) * mg]),
                                epi.scales[u],
                                relu,
                                o,
                            );
                        }
                    }
                }
            };
            if nthreads == 1 {
                worker(0);
            } else {
                (0..nthreads).into_par_iter().for_each(worker);
            }
        }

        self.col_buffer_u8 = col_local;
        let mut dims = vec![batch];
        dims.extend_from_slice(&self.shape.output_dims);
        dims.push(m_total);
        Ok(dims)
    }

    fn run_gemm_nchw(
        &mut self,
        q: &NativeInput<'_>,
        in_params: QuantizationParams,
        mut output: ConvOutput<'_>,
    ) -> Result<Vec<usize>, ConvError> {
        let shape = self.shape.clone();
        let (batch, channels, m_total) = (shape.batch, shape.in_channels, shape.out_channels);
        let groups = shape.groups;
        let cpg = shape.in_channels_per_group();
        let mg = shape.out_channels_per_group();
        let spatial = shape.out_spatial_size();
        let k = shape.kernel_dim();
        let in_zp = in_params.zero_point;
        let relu = self.cfg.fused_relu;
        let needs_im2col =
            !matches!(self.strategy, Strategy::PointwiseGemm | Strategy::DirectGemm);

        let out_len = batch * m_total * spatial;
        let (sink, epi) = self.make_sink(&mut output, out_len, in_params)?;
        let input_q = q.as_slice();
        let w_zps: Vec<i32> = self.filter_qparams.iter().map(|p| p.zero_point).collect();
        let col_offsets = Arc::clone(&self.column_offsets);
        let per_tensor = self.cfg.granularity == Granularity::PerTensor;

        let mut col_local = std::mem::take(&mut self.col_buffer_u8);
        if needs_im2col {
            ensure_capacity(&mut col_local, k * spatial);
        }
        let mut acc = std::mem::take(&mut self.y_int32);
        ensure_capacity(&mut acc, mg * spatial);
        let mut row_sums = vec![0i32; spatial];

        for n in 0..batch {
            for g in 0..groups {
                let col: &[u8] = if needs_im2col {
                    im2col_nchw(
                        input_q,
                        n,
                        g * cpg,
                        cpg,
                        shape.input_dims[0],
                        shape.input_dims[1],
                        channels,
                        shape.kernel[0],
                        shape.kernel[1],
                        shape.stride[0],
                        shape.stride[1],
                        shape.pad_begin[0],
                        shape.pad_begin[1],
                        shape.dilation[0],
                        shape.dilation[1],
                        shape.output_dims[0],
                        shape.output_dims[1],
                        in_zp as u8,
                        &mut col_local,
                    );
                    &col_local
                } else {
                    // NCHW group slice is contiguous and already in the
                    // (channel, kernel) order the weight rows use.
                    let img = shape.in_spatial_size();
                    let base = (n * channels + g * cpg) * img;
                    &input_q[base..base + cpg * img]
                };

                let wq_group = &self.w_quantized[g * mg * k..(g + 1) * mg * k];
                gemm_nchw_acc32(wq_group, col, mg, k, spatial, &mut acc);

                let u = if per_tensor { 0 } else { g };
                if w_zps[u] != 0 {
                    for (i, rs) in row_sums.iter_mut().enumerate() {
                        let mut s = 0i32;
                        for kk in 0..k {
                            s += col[kk * spatial + i] as i32;
                        }
                        *rs = s;
                    }
                }
                for m in 0..mg {
                    let mg_global = g * mg + m;
                    let row = &mut acc[m * spatial..(m + 1) * spatial];
                    if in_zp != 0 {
                        let c = in_zp * col_offsets[mg_global];
                        for a in row.iter_mut() {
                            *a -= c;
                        }
                    }
                    if w_zps[u] != 0 {
                        for (a, &rs) in row.iter_mut().zip(row_sums.iter()) {
                            *a -= w_zps[u] * (rs - in_zp * k as i32);
                        }
                    }
                    let off = (n * m_total + mg_global) * spatial;
                    match sink {
                        SinkPtr::U8(p) => {
                            let o = unsafe {
                                std::slice::from_raw_parts_mut(p.0.add(off), spatial)
                            };
                            requantize_channel_u8(
                                row,
                                epi.bias_q.as_deref().map_or(0, |b| b[mg_global]),
                                epi.multipliers[u],
                                epi.out_zp,
                                epi.qmin,
                                epi.qmax,
                                relu,
                                o,
                            );
                        }
                        SinkPtr::F32(p) => {
                            let o = unsafe {
                                std::slice::from_raw_parts_mut(p.0.add(off), spatial)
                            };
                            dequantize_channel_f32(
                                row,
                                epi.bias_f.as_deref().map_or(0.0, |b| b[mg_global]),
                                epi.scales[u],
                                relu,
                                o,
                            );
                        }
                    }
                }
            }
        }

        self.col_buffer_u8 = col_local;
        self.y_int32 = acc;
        let mut dims = vec![batch, m_total];
        dims.extend_from_slice(&self.shape.output_dims);
        Ok(dims)
    }

    fn run_depthwise(
        &mut self,
        q: &NativeInput<'_>,
        in_params: QuantizationParams,
        mut output: ConvOutput<'_>,
    ) -> Result<Vec<usize>, ConvError> {
        let shape = &self.shape;
        let channels = shape.in_channels;
        let out_len = shape.batch * shape.out_spatial_size() * channels;
        let (sink, epi) = self.make_sink(&mut output, out_len, in_params)?;
        let out = match sink {
            SinkPtr::U8(p) => unsafe { std::slice::from_raw_parts_mut(p.0, out_len) },
            SinkPtr::F32(_) => unreachable!("depthwise strategies require quantized output"),
        };
        let w_zps: Vec<i32> = self.filter_qparams.iter().map(|p| p.zero_point).collect();
        let multipliers: Vec<f32> = epi.multipliers.clone();
        let bias = epi.bias_q.as_deref().map(|b| b.as_slice());
        let input_q = q.as_slice();

        match (&self.packed, self.strategy) {
            (PackedWeights::Depthwise3x3(p), Strategy::Depthwise3x3) => {
                depthwise_3x3_nhwc(
                    input_q,
                    shape.batch,
                    shape.input_dims[0],
                    shape.input_dims[1],
                    channels,
                    shape.stride[0],
                    shape.pad_begin[0],
                    shape.output_dims[0],
                    shape.output_dims[1],
                    p,
                    in_params.zero_point,
                    &w_zps,
                    bias,
                    &multipliers,
                    epi.out_zp,
                    epi.qmin,
                    epi.qmax,
                    self.cfg.fused_relu,
                    out,
                );
            }
            (PackedWeights::Depthwise3x3x3(p), Strategy::Depthwise3x3x3) => {
                depthwise_3x3x3_ndhwc(
                    input_q,
                    shape.batch,
                    shape.input_dims[0],
                    shape.input_dims[1],
                    shape.input_dims[2],
                    channels,
                    shape.stride[0],
                    shape.pad_begin[0],
                    shape.output_dims[0],
                    shape.output_dims[1],
                    shape.output_dims[2],
                    p,
                    in_params.zero_point,
                    &w_zps,
                    bias,
                    &multipliers,
                    epi.out_zp,
                    epi.qmin,
                    epi.qmax,
                    self.cfg.fused_relu,
                    out,
                );
            }
            _ => unreachable!("depthwise strategy without depthwise packing"),
        }

        let mut dims = vec![shape.batch];
        dims.extend_from_slice(&shape.output_dims);
        dims.push(channels);
        Ok(dims)
    }

    /// Slow path: explicit integer accumulation with offsets applied
    /// manually, for activation widths the fast kernels do not cover.
    fn run_reference(
        &mut self,
        nhwc: bool,
        in_params: QuantizationParams,
        mut output: ConvOutput<'_>,
    ) -> Result<Vec<usize>, ConvError> {
        let shape = self.shape.clone();
        let (batch, channels, m_total) = (shape.batch, shape.in_channels, shape.out_channels);
        let groups = shape.groups;
        let cpg = shape.in_channels_per_group();
        let mg = shape.out_channels_per_group();
        let (in_h, in_w) = (shape.input_dims[0], shape.input_dims[1]);
        let (out_h, out_w) = (shape.output_dims[0], shape.output_dims[1]);
        let (kh, kw) = (shape.kernel[0], shape.kernel[1]);
        let k = shape.kernel_dim();
        let in_zp = in_params.zero_point;
        let relu = self.cfg.fused_relu;
        let per_tensor = self.cfg.granularity == Granularity::PerTensor;
        let spatial = out_h * out_w;

        let out_len = batch * m_total * spatial;
        let (sink, epi) = self.make_sink(&mut output, out_len, in_params)?;
        let input_q = std::mem::take(&mut self.input_q_i32);
        let col_offsets = Arc::clone(&self.column_offsets);

        for n in 0..batch {
            for g in 0..groups {
                let u = if per_tensor { 0 } else { g };
                let w_zp = self.filter_qparams[u].zero_point;
                for m in 0..mg {
                    let mg_global = g * mg + m;
                    let w_base = mg_global * k;
                    for oy in 0..out_h {
                        for ox in 0..out_w {
                            let mut raw = 0i32;
                            let mut row_sum = 0i32;
                            for c in 0..cpg {
                                for ky in 0..kh {
                                    let iy = (oy * shape.stride[0] + ky * shape.dilation[0])
                                        as isize
                                        - shape.pad_begin[0] as isize;
                                    for kx in 0..kw {
                                        let ix = (ox * shape.stride[1]
                                            + kx * shape.dilation[1])
                                            as isize
                                            - shape.pad_begin[1] as isize;
                                        let a = if iy >= 0
                                            && iy < in_h as isize
                                            && ix >= 0
                                            && ix < in_w as isize
                                        {
                                            let (y, x) = (iy as usize, ix as usize);
                                            if nhwc {
                                                input_q[((n * in_h + y) * in_w + x)
                                                    * channels
                                                    + g * cpg
                                                    + c]
                                            } else {
                                                input_q[((n * channels + g * cpg + c)
                                                    * in_h
                                                    + y)
                                                    * in_w
                                                    + x]
                                            }
                                        } else {
                                            // Padding contributes the zero
                                            // point so the correction below
                                            // cancels it exactly.
                                            in_zp
                                        };
                                        let w = self.w_quantized
                                            [w_base + (c * kh + ky) * kw + kx]
                                            as i32;
                                        raw += a * w;
                                        row_sum += a;
                                    }
                                }
                            }
                            let mut acc = raw - in_zp * col_offsets[mg_global];
                            if w_zp != 0 {
                                acc -= w_zp * (row_sum - in_zp * k as i32);
                            }
                            let pos = oy * out_w + ox;
                            let off = if nhwc {
                                (n * spatial + pos) * m_total + mg_global
                            } else {
                                (n * m_total + mg_global) * spatial + pos
                            };
                            match sink {
                                SinkPtr::U8(p) => {
                                    let acc =
                                        acc + epi.bias_q.as_deref().map_or(0, |b| b[mg_global]);
                                    let mut qv = requantize_u8(
                                        acc,
                                        epi.multipliers[u],
                                        epi.out_zp,
                                        epi.qmin,
                                        epi.qmax,
                                    )
                                        as i32;
                                    if relu && qv < epi.out_zp {
                                        qv = epi.out_zp;
                                    }
                                    unsafe { *p.0.add(off) = qv as u8 };
                                }
                                SinkPtr::F32(p) => {
                                    let mut v = acc as f32 * epi.scales[u]
                                        + epi.bias_f.as_deref().map_or(0.0, |b| b[mg_global]);
                                    if relu && v < 0.0 {
                                        v = 0.0;
                                    }
                                    unsafe { *p.0.add(off) = v };
                                }
                            }
                        }
                    }
                }
            }
        }

        self.input_q_i32 = input_q;
        let dims = if nhwc {
            vec![batch, out_h, out_w, m_total]
        } else {
            vec![batch, m_total, out_h, out_w]
        };
        Ok(dims)
    }

    /// Size the output buffer and capture the epilogue constants shared
    /// by every execution path.
    fn make_sink(
        &self,
        output: &mut ConvOutput<'_>,
        out_len: usize,
        in_params: QuantizationParams,
    ) -> Result<(SinkPtr, EpilogueState), ConvError> {
        let units = self.units().max(1);
        match (&self.cfg.output, output) {
            (OutputRepr::Quantized(out_p), ConvOutput::Quantized(buf)) => {
                ensure_capacity(buf, out_len);
                let epi = EpilogueState {
                    multipliers: self.requant.iter().map(|r| r.real_multiplier).collect(),
                    scales: vec![0.0; units],
                    bias_q: self.bias_quantized.clone(),
                    bias_f: None,
                    out_zp: out_p.zero_point,
                    qmin: QuantScheme::U8.qmin(),
                    qmax: QuantScheme::U8.qmax(),
                };
                Ok((SinkPtr::U8(SendPtr(buf.as_mut_ptr())), epi))
            }
            (OutputRepr::Float, ConvOutput::Float(buf)) => {
                ensure_capacity(buf, out_len);
                let epi = EpilogueState {
                    multipliers: vec![0.0; units],
                    scales: self
                        .filter_qparams
                        .iter()
                        .map(|f| in_params.scale * f.scale)
                        .collect(),
                    bias_q: None,
                    bias_f: self.bias_f.clone().map(Arc::new),
                    out_zp: 0,
                    qmin: 0,
                    qmax: 0,
                };
                Ok((SinkPtr::F32(SendPtr(buf.as_mut_ptr())), epi))
            }
            _ => Err(ConvError::UnsupportedConfig(
                "output buffer type does not match the configured output representation".into(),
            )),
        }
    }
}

/// Epilogue constants captured once per invocation, before any parallel
/// region starts.
struct EpilogueState {
    multipliers: Vec<f32>,
    scales: Vec<f32>,
    bias_q: Option<Arc<Vec<i32>>>,
    bias_f: Option<Arc<Vec<f32>>>,
    out_zp: i32,
    qmin: i32,
    qmax: i32,
}

/// Quantized activation, either the host's buffer borrowed directly or
/// the engine's own scratch taken out for the duration of the call.
enum NativeInput<'a> {
    Host(&'a [u8]),
    Scratch(Vec<u8>),
}

impl NativeInput<'_> {
    fn as_slice(&self) -> &[u8] {
        match self {
            NativeInput::Host(v) => v,
            NativeInput::Scratch(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape_2d(
        in_c: usize,
        out_c: usize,
        groups: usize,
        hw: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> ConvShape {
        let out = compute_output_dim(hw, kernel, stride, 1, pad, pad);
        ConvShape {
            batch: 1,
            in_channels: in_c,
            out_channels: out_c,
            groups,
            input_dims: vec![hw, hw],
            kernel: vec![kernel, kernel],
            stride: vec![stride, stride],
            dilation: vec![1, 1],
            pad_begin: vec![pad, pad],
            pad_end: vec![pad, pad],
            output_dims: vec![out, out],
        }
    }

    fn quantized_out() -> OutputRepr {
        OutputRepr::Quantized(QuantizationParams { scale: 1.0, zero_point: 0 })
    }

    #[test]
    fn strategy_pointwise() {
        let cfg = ConvConfig { output: quantized_out(), ..Default::default() };
        let e = QuantizedConvEngine::new(shape_2d(4, 8, 1, 5, 1, 1, 0), cfg).unwrap();
        assert_eq!(e.strategy(), Strategy::PointwiseGemm);
    }

    #[test]
    fn strategy_depthwise_3x3() {
        let cfg = ConvConfig { output: quantized_out(), ..Default::default() };
        let e = QuantizedConvEngine::new(shape_2d(6, 6, 6, 5, 3, 1, 1), cfg).unwrap();
        assert_eq!(e.strategy(), Strategy::Depthwise3x3);
    }

    #[test]
    fn depthwise_with_float_output_uses_gemm() {
        let cfg = ConvConfig { output: OutputRepr::Float, ..Default::default() };
        let e = QuantizedConvEngine::new(shape_2d(6, 6, 6, 5, 3, 1, 1), cfg).unwrap();
        assert_eq!(e.strategy(), Strategy::GroupedGemm);
    }

    #[test]
    fn strategy_reference_for_wide_activations() {
        let cfg = ConvConfig {
            activation: QuantScheme { bits: 16, signed: false },
            output: quantized_out(),
            ..Default::default()
        };
        let e = QuantizedConvEngine::new(shape_2d(4, 4, 1, 5, 3, 1, 1), cfg).unwrap();
        assert_eq!(e.strategy(), Strategy::Reference);
    }

    #[test]
    fn strategy_direct_single_position() {
        let mut s = shape_2d(4, 8, 1, 5, 5, 1, 0);
        assert_eq!(s.output_dims, vec![1, 1]);
        s.batch = 2;
        let cfg = ConvConfig { output: quantized_out(), ..Default::default() };
        let e = QuantizedConvEngine::new(s, cfg).unwrap();
        assert_eq!(e.strategy(), Strategy::DirectGemm);
    }

    #[test]
    fn bad_output_dims_rejected() {
        let mut s = shape_2d(4, 4, 1, 5, 3, 1, 1);
        s.output_dims = vec![4, 5];
        let err = QuantizedConvEngine::new(s, ConvConfig::default()).unwrap_err();
        assert!(matches!(err, ConvError::ShapeMismatch(_)));
    }

    #[test]
    fn oversized_kernel_rejected() {
        // 5x5 kernel over an unpadded 2x2 input: no valid output
        // position. Must come back as an error, not an arithmetic panic.
        let s = ConvShape {
            batch: 1,
            in_channels: 1,
            out_channels: 1,
            groups: 1,
            input_dims: vec![2, 2],
            kernel: vec![5, 5],
            stride: vec![1, 1],
            dilation: vec![1, 1],
            pad_begin: vec![0, 0],
            pad_end: vec![0, 0],
            output_dims: vec![1, 1],
        };
        let err = QuantizedConvEngine::new(s, ConvConfig::default()).unwrap_err();
        assert!(matches!(err, ConvError::ShapeMismatch(_)));
    }

    #[test]
    fn dilated_kernel_span_checked_against_padding() {
        // Dilation 3 stretches the 3x3 kernel to a span of 7; a padded
        // 5x5 input (5 + 2) holds it exactly, 4x4 does not.
        let base = ConvShape {
            batch: 1,
            in_channels: 1,
            out_channels: 1,
            groups: 1,
            input_dims: vec![5, 5],
            kernel: vec![3, 3],
            stride: vec![1, 1],
            dilation: vec![3, 3],
            pad_begin: vec![1, 1],
            pad_end: vec![1, 1],
            output_dims: vec![1, 1],
        };
        assert!(QuantizedConvEngine::new(base.clone(), ConvConfig::default()).is_ok());

        let mut small = base;
        small.input_dims = vec![4, 4];
        let err = QuantizedConvEngine::new(small, ConvConfig::default()).unwrap_err();
        assert!(matches!(err, ConvError::ShapeMismatch(_)));
    }

    #[test]
    fn three_d_requires_depthwise() {
        let s = ConvShape {
            batch: 1,
            in_channels: 4,
            out_channels: 8,
            groups: 1,
            input_dims: vec![4, 4, 4],
            kernel: vec![3, 3, 3],
            stride: vec![1, 1, 1],
            dilation: vec![1, 1, 1],
            pad_begin: vec![1, 1, 1],
            pad_end: vec![1, 1, 1],
            output_dims: vec![4, 4, 4],
        };
        let cfg = ConvConfig { output: quantized_out(), ..Default::default() };
        let err = QuantizedConvEngine::new(s, cfg).unwrap_err();
        assert!(matches!(err, ConvError::UnsupportedConfig(_)));
    }

    #[test]
    fn run_before_weights_fails() {
        let cfg = ConvConfig { output: quantized_out(), ..Default::default() };
        let mut e = QuantizedConvEngine::new(shape_2d(2, 2, 1, 3, 1, 1, 0), cfg).unwrap();
        let input = vec![0.0f32; 2 * 3 * 3];
        let mut out = Vec::new();
        let err = e
            .run_nhwc(ConvInput::Float(&input), ConvOutput::Quantized(&mut out))
            .unwrap_err();
        assert_eq!(err, ConvError::WeightsNotSet);
    }

    #[test]
    fn unsigned_weight_scheme_rejected() {
        let cfg = ConvConfig {
            weight: QuantScheme { bits: 8, signed: false },
            ..Default::default()
        };
        let err = QuantizedConvEngine::new(shape_2d(2, 2, 1, 3, 1, 1, 0), cfg).unwrap_err();
        assert!(matches!(err, ConvError::UnsupportedBitWidth { .. }));
    }

    #[test]
    fn weight_roundtrip_within_half_scale() {
        let cfg = ConvConfig { ..Default::default() };
        let mut e = QuantizedConvEngine::new(shape_2d(2, 4, 1, 4, 3, 1, 1), cfg).unwrap();
        let k = e.shape.kernel_dim();
        let weights: Vec<f32> = (0..4 * k).map(|i| (i as f32 * 0.37).sin() * 2.5).collect();
        e.set_weights(&weights, None).unwrap();
        let p = e.filter_qparams()[0];
        for (i, &w) in weights.iter().enumerate() {
            let deq = p.dequantize(e.w_quantized[i] as i32);
            assert!(
                (deq - w).abs() <= 0.5 * p.scale + 1e-6,
                "weight {i}: {w} vs {deq} (scale {})",
                p.scale
            );
        }
    }

    #[test]
    fn bias_overflow_detected() {
        let cfg = ConvConfig {
            input_quantization: InputQuantization::Static(QuantizationParams {
                scale: 1e-10,
                zero_point: 0,
            }),
            output: quantized_out(),
            ..Default::default()
        };
        let mut e = QuantizedConvEngine::new(shape_2d(1, 1, 1, 2, 1, 1, 0), cfg).unwrap();
        e.set_weights(&[1e-6], Some(&[1e9])).unwrap();
        let input = vec![0u8; 4];
        let mut out = Vec::new();
        let err = e
            .run_nhwc(ConvInput::Quantized(&input), ConvOutput::Quantized(&mut out))
            .unwrap_err();
        assert!(matches!(err, ConvError::BiasOverflow { .. }));
    }
}
