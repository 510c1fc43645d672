//! Operator implementations.

mod conv;
mod depthwise;
mod promote;
mod softmax;

pub use conv::{Conv2dOp, DEFAULT_CONV_CONFIG};
pub use depthwise::{DEFAULT_DEPTHWISE_CONFIG, DepthwiseConv2dOp};
pub use promote::{ChannelPromoter, DEFAULT_PROMOTE_CONFIG, PROMOTED_CHANNELS};
pub use softmax::{DEFAULT_SOFTMAX_CONFIG, SoftmaxOp};
