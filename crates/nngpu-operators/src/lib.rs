//! GPU operator dispatchers for nngpu.
//!
//! Each operator derives a dispatch parameter block from the model's
//! operands, resolves a tuned configuration for the node's shape signature,
//! builds its compute pipeline once, and issues partitioned dispatches:
//! - CONV_2D (with a 3→4 channel promotion pre-pass)
//! - DEPTHWISE_CONV_2D
//! - SOFTMAX
//!
//! Kernels are WGSL sources under `shaders/`, specialised through integer
//! shader definitions (`LOCAL_SIZE_*`, `BLOCK_*`).

pub mod operators;
pub mod params;

mod registry;

pub use operators::{
    ChannelPromoter, Conv2dOp, DEFAULT_CONV_CONFIG, DEFAULT_DEPTHWISE_CONFIG,
    DEFAULT_PROMOTE_CONFIG, DEFAULT_SOFTMAX_CONFIG, DepthwiseConv2dOp, SoftmaxOp,
};
pub use params::{ConvKind, ConvParams, ConvSetup, PromoteParams, SoftmaxParams, SoftmaxSetup};
pub use registry::core_operator_registry;
