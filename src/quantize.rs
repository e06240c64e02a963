use crate::error::ConvError;

/// Integer representation chosen for one tensor: bit width plus signedness.
///
/// Activations support 1..=16 bits (signed or unsigned); weights are
/// always signed and capped at 8 bits so they fit the i8 weight buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantScheme {
    pub bits: u8,
    pub signed: bool,
}

impl QuantScheme {
    pub const U8: QuantScheme = QuantScheme { bits: 8, signed: false };
    pub const I8: QuantScheme = QuantScheme { bits: 8, signed: true };

    pub fn validate(&self, max_bits: u8) -> Result<(), ConvError> {
        if self.bits == 0 || self.bits > max_bits {
            return Err(ConvError::UnsupportedBitWidth {
                bits: self.bits,
                signed: self.signed,
            });
        }
        Ok(())
    }

    pub fn qmin(&self) -> i32 {
        if self.signed {
            -(1i32 << (self.bits - 1))
        } else {
            0
        }
    }

    pub fn qmax(&self) -> i32 {
        if self.signed {
            (1i32 << (self.bits - 1)) - 1
        } else {
            (1i32 << self.bits) - 1
        }
    }

    /// The fast integer kernels operate on unsigned 8-bit activations.
    pub fn is_native_activation(&self) -> bool {
        self.bits == 8 && !self.signed
    }
}

/// Affine quantization parameters: `real = scale * (q - zero_point)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantizationParams {
    pub fn dequantize(&self, q: i32) -> f32 {
        self.scale * (q - self.zero_point) as f32
    }

    pub fn quantize(&self, v: f32, scheme: QuantScheme) -> i32 {
        let q = (v / self.scale).round() as i64 + self.zero_point as i64;
        q.clamp(scheme.qmin() as i64, scheme.qmax() as i64) as i32
    }
}

/// Whether one scale/zero-point pair covers the whole filter tensor or
/// one pair per output-channel group. Fixed per engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    #[default]
    PerTensor,
    PerGroup,
}

/// Maps int32 accumulator values back into the output domain.
///
/// Must be re-derived whenever any of the three contributing scales
/// changes; the engine tracks the scales it was derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequantizationParams {
    pub real_multiplier: f32,
}

impl RequantizationParams {
    pub fn derive(in_scale: f32, filter_scale: f32, out_scale: f32) -> Self {
        Self {
            real_multiplier: in_scale * filter_scale / out_scale,
        }
    }
}

/// Derive affine parameters covering `[min, max]` at the given width.
///
/// The range is widened to include 0 so that real 0.0 is exactly
/// representable; the zero point always lands inside the integer range.
pub fn choose_quantization_params(
    min: f32,
    max: f32,
    scheme: QuantScheme,
) -> Result<QuantizationParams, ConvError> {
    scheme.validate(16)?;
    if min > max {
        return Err(ConvError::DegenerateRange { min, max });
    }
    let min = min.min(0.0);
    let max = max.max(0.0);
    let levels = (scheme.qmax() - scheme.qmin()) as f32;
    let scale = ((max - min) / levels).max(1e-8);
    let zero_point = (scheme.qmin() as f32 - min / scale)
        .round()
        .clamp(scheme.qmin() as f32, scheme.qmax() as f32) as i32;
    Ok(QuantizationParams { scale, zero_point })
}

/// Symmetric parameters for signed weight data: zero point 0, scale from
/// the largest magnitude in the unit.
pub fn choose_symmetric_params(abs_max: f32, scheme: QuantScheme) -> QuantizationParams {
    let scale = (abs_max / scheme.qmax() as f32).max(1e-8);
    QuantizationParams { scale, zero_point: 0 }
}

/// Observed value range of a slice, (0, 0) when empty.
pub fn min_max(data: &[f32]) -> (f32, f32) {
    let mut min_v = f32::MAX;
    let mut max_v = f32::MIN;
    for &v in data {
        if v < min_v {
            min_v = v;
        }
        if v > max_v {
            max_v = v;
        }
    }
    if data.is_empty() {
        (0.0, 0.0)
    } else {
        (min_v, max_v)
    }
}
