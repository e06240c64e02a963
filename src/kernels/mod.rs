pub mod depthwise;
pub mod epilogue;
pub mod gemm;
pub mod im2col;
pub mod partition;

pub use depthwise::PackedDepthwise;
pub use gemm::PackedGemmWeights;
pub use partition::{partition_grouped, WorkSlice};
