//! Host-memory backend that records dispatches instead of running them.
//!
//! Buffers are plain byte vectors, so uploads and readbacks behave like the
//! GPU backends; dispatches leave buffer contents untouched. Used for dry
//! runs and for testing dispatch geometry without a GPU.

use nngpu_core::{
    BufferId, ComputeBackend, Error, ExecutorKind, MAX_GROUP_COUNT, PipelineDesc, PipelineId,
    Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

/// One recorded dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub pipeline: PipelineId,
    /// Label of the pipeline's `PipelineDesc`.
    pub label: String,
    pub buffers: Vec<BufferId>,
    pub workgroups: [u32; 3],
    /// Parameter block bytes.
    pub params: Vec<u8>,
}

/// Backend that keeps buffers in host memory and logs every dispatch.
pub struct RecordingBackend {
    max_workgroups: u32,
    next_id: AtomicU64,
    pipeline_builds: AtomicUsize,
    buffers: Mutex<HashMap<BufferId, Vec<u8>>>,
    pipelines: Mutex<HashMap<PipelineId, String>>,
    dispatches: Mutex<Vec<DispatchRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::with_max_workgroups(MAX_GROUP_COUNT)
    }

    /// Backend reporting a custom per-axis workgroup limit.
    pub fn with_max_workgroups(max_workgroups: u32) -> Self {
        Self {
            max_workgroups,
            next_id: AtomicU64::new(1),
            pipeline_builds: AtomicUsize::new(0),
            buffers: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            dispatches: Mutex::new(Vec::new()),
        }
    }

    /// Every dispatch issued so far, in submission order.
    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        lock(&self.dispatches).clone()
    }

    pub fn dispatch_count(&self) -> usize {
        lock(&self.dispatches).len()
    }

    /// Forget recorded dispatches.
    pub fn clear_dispatches(&self) {
        lock(&self.dispatches).clear();
    }

    /// Number of pipelines ever created.
    pub fn pipeline_builds(&self) -> usize {
        self.pipeline_builds.load(Ordering::Acquire)
    }

    pub fn live_buffers(&self) -> usize {
        lock(&self.buffers).len()
    }

    pub fn live_pipelines(&self) -> usize {
        lock(&self.pipelines).len()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for RecordingBackend {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Recording
    }

    fn max_workgroups_per_dimension(&self) -> u32 {
        self.max_workgroups
    }

    fn create_buffer(&self, _label: &str, size: usize) -> Result<BufferId> {
        let id = BufferId(self.next_id());
        lock(&self.buffers).insert(id, vec![0; size]);
        Ok(id)
    }

    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> Result<()> {
        let mut buffers = lock(&self.buffers);
        let dst = buffers
            .get_mut(&buffer)
            .ok_or_else(|| Error::Backend(format!("unknown buffer {buffer:?}")))?;
        let size = dst.len();
        dst.get_mut(..data.len())
            .ok_or_else(|| {
                Error::Backend(format!(
                    "write of {} bytes exceeds buffer {buffer:?} ({size} bytes)",
                    data.len()
                ))
            })?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, len: usize) -> Result<Vec<u8>> {
        let buffers = lock(&self.buffers);
        let src = buffers
            .get(&buffer)
            .ok_or_else(|| Error::Backend(format!("unknown buffer {buffer:?}")))?;
        src.get(..len).map(<[u8]>::to_vec).ok_or_else(|| {
            Error::Backend(format!(
                "read of {len} bytes exceeds buffer {buffer:?} ({} bytes)",
                src.len()
            ))
        })
    }

    fn release_buffer(&self, buffer: BufferId) {
        lock(&self.buffers).remove(&buffer);
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId> {
        let id = PipelineId(self.next_id());
        trace!(label = %desc.label, defs = ?desc.defs, "recording pipeline");
        lock(&self.pipelines).insert(id, desc.label.clone());
        self.pipeline_builds.fetch_add(1, Ordering::AcqRel);
        Ok(id)
    }

    fn release_pipeline(&self, pipeline: PipelineId) {
        lock(&self.pipelines).remove(&pipeline);
    }

    fn dispatch(
        &self,
        pipeline: PipelineId,
        buffers: &[BufferId],
        workgroups: [u32; 3],
        params: &[u8],
    ) -> Result<()> {
        let label = lock(&self.pipelines)
            .get(&pipeline)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("unknown pipeline {pipeline:?}")))?;
        {
            let live = lock(&self.buffers);
            if let Some(missing) = buffers.iter().find(|id| !live.contains_key(id)) {
                return Err(Error::Backend(format!(
                    "dispatch of {label} binds released buffer {missing:?}"
                )));
            }
        }
        lock(&self.dispatches).push(DispatchRecord {
            pipeline,
            label,
            buffers: buffers.to_vec(),
            workgroups,
            params: params.to_vec(),
        });
        Ok(())
    }
}
