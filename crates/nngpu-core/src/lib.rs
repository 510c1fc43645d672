//! Core model types, dispatch geometry, tuning cache and operator traits for nngpu.
//!
//! This crate holds everything the GPU driver needs that does not depend on a
//! concrete graphics API:
//! - Model/request data model (`Model`, `Operand`, `Operation`, `Request`)
//! - Workgroup and partition arithmetic (`geometry`)
//! - The process-wide shader configuration cache (`TuningCache`)
//! - The `ComputeBackend` seam that GPU backends implement
//! - Operand storage and per-request buffer arenas
//! - `Operator` / `OpDispatch` traits and the `OperatorRegistry`

pub mod backend;
pub mod dispatch;
pub mod geometry;
pub mod operand;
pub mod operator;
pub mod pipeline;
pub mod registry;
pub mod tuning;
pub mod types;
pub mod validate;

#[cfg(test)]
mod testing;

pub use backend::{
    BindingDesc, BufferGuard, BufferId, ComputeBackend, ExecutorKind, PipelineDesc, PipelineGuard,
    PipelineId,
};
pub use dispatch::{DispatchCtx, OpDispatch};
pub use geometry::{MAX_GROUP_COUNT, PaddingScheme};
pub use operand::{OperandStore, RequestArena};
pub use operator::{CompileCtx, Operator};
pub use pipeline::{BuiltKernel, KernelPipeline};
pub use registry::OperatorRegistry;
pub use tuning::{FileSource, ShaderConfig, ShaderSignature, TableSource, TuningCache, TuningSource};
pub use validate::{validate_model, validate_request};
pub use types::{
    Capabilities, DataLocation, DeviceStatus, ErrorStatus, ExecutionPreference, FusedActivation,
    MemoryPool, Model, Operand, OperandLifetime, OperandType, Operation, OperationType,
    PerformanceInfo, Request, RequestArgument, Shape4, Transport,
};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for nngpu operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Pipeline was built for `{built}` but the node now derives `{requested}`")]
    ShapeChanged { built: String, requested: String },
}

impl Error {
    /// Map this error onto the service status enumeration.
    ///
    /// Only malformed arguments are reported as `InvalidArgument`; anything
    /// that fails after validation is a general failure.
    pub fn status(&self) -> ErrorStatus {
        match self {
            Error::InvalidArgument(_) => ErrorStatus::InvalidArgument,
            _ => ErrorStatus::GeneralFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            Error::InvalidArgument("bad".into()).status(),
            ErrorStatus::InvalidArgument
        );
        assert_eq!(
            Error::Backend("lost device".into()).status(),
            ErrorStatus::GeneralFailure
        );
        assert_eq!(
            Error::ShapeChanged {
                built: "a".into(),
                requested: "b".into()
            }
            .status(),
            ErrorStatus::GeneralFailure
        );
    }
}
