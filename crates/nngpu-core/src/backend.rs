//! The seam between operator dispatchers and a concrete GPU API.
//!
//! Operators never talk to a graphics API directly. They create buffers and
//! compute pipelines through a `ComputeBackend` and issue dispatches that the
//! backend records, submits, and waits for before returning.

use crate::Result;
use crate::geometry::MAX_GROUP_COUNT;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Which compute backend an executor manager drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutorKind {
    /// Vulkan compute (the default).
    #[default]
    VulkanCompute,
    /// OpenGL ES compute.
    GlesCompute,
    /// Host-memory backend that records every dispatch instead of running it.
    Recording,
}

impl ExecutorKind {
    pub fn name(self) -> &'static str {
        match self {
            ExecutorKind::VulkanCompute => "vulkan",
            ExecutorKind::GlesCompute => "gles",
            ExecutorKind::Recording => "recording",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = crate::Error;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "vulkan" => Ok(ExecutorKind::VulkanCompute),
            "gles" => Ok(ExecutorKind::GlesCompute),
            "recording" => Ok(ExecutorKind::Recording),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown executor type '{other}' (expected vulkan, gles or recording)"
            ))),
        }
    }
}

/// Handle to a backend-owned storage buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Handle to a backend-owned compute pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u64);

/// One storage-buffer binding of a compute pipeline (group 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDesc {
    pub binding: u32,
    pub read_only: bool,
}

impl BindingDesc {
    pub const fn read(binding: u32) -> Self {
        Self {
            binding,
            read_only: true,
        }
    }

    pub const fn read_write(binding: u32) -> Self {
        Self {
            binding,
            read_only: false,
        }
    }
}

/// Everything a backend needs to build one compute pipeline.
///
/// `defs` are integer shader definitions substituted into the source before
/// compilation (local sizes, block sizes, fixed tensor extents).
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDesc {
    pub label: String,
    pub source: &'static str,
    pub entry_point: &'static str,
    pub defs: BTreeMap<String, u32>,
    pub bindings: Vec<BindingDesc>,
    /// Size of the parameter block passed with every dispatch, bound as a
    /// uniform buffer after the storage bindings. Zero means no block.
    pub param_size: u32,
}

impl PipelineDesc {
    pub fn new(label: impl Into<String>, source: &'static str, entry_point: &'static str) -> Self {
        Self {
            label: label.into(),
            source,
            entry_point,
            defs: BTreeMap::new(),
            bindings: Vec::new(),
            param_size: 0,
        }
    }

    pub fn def(mut self, name: &str, value: u32) -> Self {
        self.defs.insert(name.to_string(), value);
        self
    }

    pub fn bindings(mut self, bindings: &[BindingDesc]) -> Self {
        self.bindings = bindings.to_vec();
        self
    }

    pub fn param_size(mut self, size: u32) -> Self {
        self.param_size = size;
        self
    }
}

/// A GPU compute backend.
///
/// Implementations must be shareable between the executor threads of one
/// prepared model; every method takes `&self`.
pub trait ComputeBackend: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Per-axis workgroup limit of one dispatch.
    fn max_workgroups_per_dimension(&self) -> u32 {
        MAX_GROUP_COUNT
    }

    /// Allocate a zero-initialised storage buffer of `size` bytes.
    fn create_buffer(&self, label: &str, size: usize) -> Result<BufferId>;

    /// Copy host bytes into a buffer, starting at byte 0.
    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> Result<()>;

    /// Copy the first `len` bytes of a buffer back to the host.
    ///
    /// Waits for all previously submitted work touching the buffer.
    fn read_buffer(&self, buffer: BufferId, len: usize) -> Result<Vec<u8>>;

    fn release_buffer(&self, buffer: BufferId);

    /// Compile a shader and build a compute pipeline from it.
    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId>;

    fn release_pipeline(&self, pipeline: PipelineId);

    /// Record one dispatch, submit it, and wait for it to complete.
    ///
    /// `buffers[i]` is bound to the pipeline's i-th binding; `params` is the
    /// dispatch parameter block.
    fn dispatch(
        &self,
        pipeline: PipelineId,
        buffers: &[BufferId],
        workgroups: [u32; 3],
        params: &[u8],
    ) -> Result<()>;
}

/// Owns one backend buffer and releases it on drop.
pub struct BufferGuard {
    backend: Arc<dyn ComputeBackend>,
    id: BufferId,
    size: usize,
}

impl BufferGuard {
    /// Allocate a buffer of `size` bytes.
    pub fn new(backend: &Arc<dyn ComputeBackend>, label: &str, size: usize) -> Result<Self> {
        let id = backend.create_buffer(label, size)?;
        Ok(Self {
            backend: Arc::clone(backend),
            id,
            size,
        })
    }

    /// Allocate a buffer and fill it with `data`.
    pub fn with_data(backend: &Arc<dyn ComputeBackend>, label: &str, data: &[u8]) -> Result<Self> {
        let guard = Self::new(backend, label, data.len())?;
        backend.write_buffer(guard.id, data)?;
        Ok(guard)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for BufferGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferGuard")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        self.backend.release_buffer(self.id);
    }
}

/// Owns one backend pipeline and releases it on drop.
pub struct PipelineGuard {
    backend: Arc<dyn ComputeBackend>,
    id: PipelineId,
}

impl PipelineGuard {
    pub fn new(backend: &Arc<dyn ComputeBackend>, desc: &PipelineDesc) -> Result<Self> {
        let id = backend.create_pipeline(desc)?;
        Ok(Self {
            backend: Arc::clone(backend),
            id,
        })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        self.backend.release_pipeline(self.id);
    }
}
