//! Quantized 2-D convolution execution engine.
//!
//! The crate turns a convolution layer description into a
//! [`QuantizedConvEngine`] that quantizes its filter once, picks an
//! execution strategy for the geometry, and then runs integer-only
//! convolution with a fused requantization epilogue on every call.
//!
//! ```
//! use lowconv::{
//!     compute_output_dim, ConvConfig, ConvInput, ConvOutput, ConvShape,
//!     OutputRepr, QuantizationParams, QuantizedConvEngine,
//! };
//!
//! let shape = ConvShape {
//!     batch: 1,
//!     in_channels: 2,
//!     out_channels: 4,
//!     groups: 1,
//!     input_dims: vec![5, 5],
//!     kernel: vec![3, 3],
//!     stride: vec![1, 1],
//!     dilation: vec![1, 1],
//!     pad_begin: vec![1, 1],
//!     pad_end: vec![1, 1],
//!     output_dims: vec![5, 5],
//! };
//! let cfg = ConvConfig {
//!     output: OutputRepr::Quantized(QuantizationParams { scale: 0.1, zero_point: 128 }),
//!     ..ConvConfig::default()
//! };
//! let mut engine = QuantizedConvEngine::new(shape, cfg).unwrap();
//! let weights = vec![0.05f32; 4 * 2 * 9];
//! engine.set_weights(&weights, None).unwrap();
//!
//! let input = vec![0.5f32; 2 * 5 * 5];
//! let mut out = Vec::new();
//! let dims = engine
//!     .run_nhwc(ConvInput::Float(&input), ConvOutput::Quantized(&mut out))
//!     .unwrap();
//! assert_eq!(dims, vec![1, 5, 5, 4]);
//! ```

pub mod buffer;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod quantize;

pub use engine::{
    compute_output_dim, ConvConfig, ConvInput, ConvOutput, ConvShape, InputQuantization,
    OutputRepr, PackedWeights, QuantizedConvEngine, Strategy,
};
pub use error::ConvError;
pub use quantize::{
    choose_quantization_params, choose_symmetric_params, min_max, Granularity, QuantScheme,
    QuantizationParams, RequantizationParams,
};
