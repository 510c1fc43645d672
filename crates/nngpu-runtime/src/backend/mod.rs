//! Compute backends.

mod recording;
mod wgpu_backend;

pub use recording::{DispatchRecord, RecordingBackend};
pub use wgpu_backend::WgpuBackend;

use crate::error::Result;
use nngpu_core::{ComputeBackend, ExecutorKind};
use std::sync::Arc;

/// Open the backend for `kind`, blocking until a GPU device is ready.
pub fn create_backend(kind: ExecutorKind) -> Result<Arc<dyn ComputeBackend>> {
    match kind {
        ExecutorKind::Recording => Ok(Arc::new(RecordingBackend::new())),
        ExecutorKind::VulkanCompute | ExecutorKind::GlesCompute => {
            let backend = pollster::block_on(WgpuBackend::new(kind))?;
            Ok(Arc::new(backend))
        }
    }
}
