//! Minimal host-memory backend for unit tests in this crate.

use crate::backend::{BufferId, ComputeBackend, ExecutorKind, PipelineDesc, PipelineId};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct HostBackend {
    next_id: AtomicU64,
    buffers: Mutex<HashMap<BufferId, Vec<u8>>>,
    pipelines: Mutex<HashSet<PipelineId>>,
    pub dispatches: Mutex<Vec<(PipelineId, Vec<BufferId>, [u32; 3])>>,
}

impl HostBackend {
    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.pipelines.lock().unwrap().len()
    }
}

impl ComputeBackend for HostBackend {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Recording
    }

    fn create_buffer(&self, _label: &str, size: usize) -> Result<BufferId> {
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.buffers.lock().unwrap().insert(id, vec![0; size]);
        Ok(id)
    }

    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> Result<()> {
        let mut buffers = self.buffers.lock().unwrap();
        let dst = buffers
            .get_mut(&buffer)
            .ok_or_else(|| Error::Backend(format!("unknown buffer {buffer:?}")))?;
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, len: usize) -> Result<Vec<u8>> {
        let buffers = self.buffers.lock().unwrap();
        let src = buffers
            .get(&buffer)
            .ok_or_else(|| Error::Backend(format!("unknown buffer {buffer:?}")))?;
        Ok(src[..len].to_vec())
    }

    fn release_buffer(&self, buffer: BufferId) {
        self.buffers.lock().unwrap().remove(&buffer);
    }

    fn create_pipeline(&self, _desc: &PipelineDesc) -> Result<PipelineId> {
        let id = PipelineId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.pipelines.lock().unwrap().insert(id);
        Ok(id)
    }

    fn release_pipeline(&self, pipeline: PipelineId) {
        self.pipelines.lock().unwrap().remove(&pipeline);
    }

    fn dispatch(
        &self,
        pipeline: PipelineId,
        buffers: &[BufferId],
        workgroups: [u32; 3],
        _params: &[u8],
    ) -> Result<()> {
        self.dispatches
            .lock()
            .unwrap()
            .push((pipeline, buffers.to_vec(), workgroups));
        Ok(())
    }
}
