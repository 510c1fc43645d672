//! Error types for the runtime crate.

use nngpu_core::ErrorStatus;
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// GPU initialization failed.
    #[error("GPU initialization failed: {0}")]
    InitError(String),

    /// Buffer allocation or lookup failed.
    #[error("Buffer allocation failed: {0}")]
    AllocationError(String),

    /// Shader compilation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderError(String),

    /// Execution failed.
    #[error("Execution failed: {0}")]
    ExecutionError(String),

    /// The prepared model was never initialized or has been released.
    #[error("Prepared model is not ready: {0}")]
    NotReady(String),

    /// wgpu error.
    #[error("wgpu error: {0}")]
    WgpuError(String),

    /// Buffer async error.
    #[error("Buffer async error: {0}")]
    BufferAsyncError(#[from] wgpu::BufferAsyncError),

    /// Error raised by the core crate or an operator.
    #[error(transparent)]
    Core(#[from] nngpu_core::Error),
}

impl RuntimeError {
    /// Map this error onto the service status enumeration.
    pub fn status(&self) -> ErrorStatus {
        match self {
            RuntimeError::Core(err) => err.status(),
            _ => ErrorStatus::GeneralFailure,
        }
    }
}

impl From<RuntimeError> for nngpu_core::Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Core(err) => err,
            other => nngpu_core::Error::Backend(other.to_string()),
        }
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_passes_through_core_errors() {
        let err = RuntimeError::from(nngpu_core::Error::InvalidArgument("bad".into()));
        assert_eq!(err.status(), ErrorStatus::InvalidArgument);

        let err = RuntimeError::ShaderError("conv2d_0".into());
        assert_eq!(err.status(), ErrorStatus::GeneralFailure);
    }

    #[test]
    fn test_round_trip_into_core_error() {
        let core: nngpu_core::Error = RuntimeError::InitError("no adapter".into()).into();
        assert!(matches!(core, nngpu_core::Error::Backend(msg) if msg.contains("no adapter")));
    }
}
