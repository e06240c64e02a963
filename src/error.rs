use thiserror::Error;

/// Setup-time failures of the convolution engine.
///
/// Everything here is detected before any computation starts; the hot
/// path itself never errors (numeric saturation clamps silently).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvError {
    #[error("unsupported bit width: {bits} (signed={signed})")]
    UnsupportedBitWidth { bits: u8, signed: bool },

    #[error("degenerate calibration range: min {min} > max {max}")]
    DegenerateRange { min: f32, max: f32 },

    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("quantized bias overflows i32 at channel {channel}: {value}")]
    BiasOverflow { channel: usize, value: f64 },

    #[error("weights must be set before running the convolution")]
    WeightsNotSet,
}
