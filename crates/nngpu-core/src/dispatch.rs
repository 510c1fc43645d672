//! Runtime dispatch context and the `OpDispatch` trait.

use crate::backend::{BufferId, ComputeBackend, PipelineId};
use crate::geometry::check_group_limits;
use crate::operand::{OperandStore, RequestArena};
use crate::tuning::TuningCache;
use crate::types::Model;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::trace;

/// Context handed to `OpDispatch::dispatch()` for one request.
///
/// Resolves operand indices to buffers (per-request buffers first, then the
/// model's constant store) and forwards dispatches to the backend after
/// checking workgroup limits.
pub struct DispatchCtx<'a> {
    pub backend: &'a Arc<dyn ComputeBackend>,
    pub tuning: &'a TuningCache,
    pub model: &'a Model,
    store: &'a OperandStore,
    arena: &'a mut RequestArena,
    dispatches: usize,
}

impl<'a> DispatchCtx<'a> {
    pub fn new(
        backend: &'a Arc<dyn ComputeBackend>,
        tuning: &'a TuningCache,
        model: &'a Model,
        store: &'a OperandStore,
        arena: &'a mut RequestArena,
    ) -> Self {
        Self {
            backend,
            tuning,
            model,
            store,
            arena,
            dispatches: 0,
        }
    }

    /// Buffer backing an operand for this request.
    pub fn buffer(&self, index: usize) -> Result<BufferId> {
        self.arena
            .get(index)
            .or_else(|| self.store.get(index))
            .ok_or_else(|| Error::Dispatch(format!("operand {index} has no GPU buffer")))
    }

    /// Allocate a temporary buffer that is released with the request.
    pub fn scratch(&mut self, label: &str, size: usize) -> Result<BufferId> {
        self.arena.scratch(label, size)
    }

    /// Record, submit and wait for one dispatch.
    ///
    /// A dispatch with a zero workgroup count on any axis is skipped.
    pub fn dispatch(
        &mut self,
        pipeline: PipelineId,
        buffers: &[BufferId],
        workgroups: [u32; 3],
        params: &[u8],
    ) -> Result<()> {
        if workgroups.contains(&0) {
            trace!(?workgroups, "skipping empty dispatch");
            return Ok(());
        }
        check_group_limits(workgroups, self.backend.max_workgroups_per_dimension())?;
        self.backend
            .dispatch(pipeline, buffers, workgroups, params)?;
        self.dispatches += 1;
        Ok(())
    }

    /// Number of dispatches issued through this context.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }
}

/// One operation, ready to run.
///
/// Created once per node when a model is prepared. `dispatch` runs for every
/// request, possibly from several threads at once; per-request state lives
/// in the `DispatchCtx`, and anything cached across requests must be
/// synchronised by the implementation.
pub trait OpDispatch: Send + Sync {
    fn dispatch(&self, ctx: &mut DispatchCtx<'_>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PipelineDesc;
    use crate::testing::HostBackend;
    use crate::types::{OperandLifetime, OperandType};

    fn model() -> Model {
        let mut model = Model::default();
        model.push_operand(crate::Operand::tensor(
            OperandType::TensorFloat32,
            &[1, 2, 2, 1],
            OperandLifetime::ModelInput,
        ));
        model.push_constant_operand(OperandType::TensorFloat32, &[1], &1.0f32.to_le_bytes());
        model
    }

    #[test]
    fn test_buffer_resolution_and_limits() {
        let host = Arc::new(HostBackend::default());
        let backend: Arc<dyn ComputeBackend> = host.clone();
        let tuning = TuningCache::empty();
        let model = model();
        let store = OperandStore::upload_constants(&backend, &model).unwrap();
        let mut arena = RequestArena::allocate(&backend, &model).unwrap();
        let pipeline = backend
            .create_pipeline(&PipelineDesc::new("t", "", "main"))
            .unwrap();

        let mut ctx = DispatchCtx::new(&backend, &tuning, &model, &store, &mut arena);
        let input = ctx.buffer(0).unwrap();
        let constant = ctx.buffer(1).unwrap();
        assert_ne!(input, constant);
        assert!(ctx.buffer(7).is_err());

        ctx.dispatch(pipeline, &[input, constant], [1, 1, 1], &[]).unwrap();
        ctx.dispatch(pipeline, &[input], [0, 4, 1], &[]).unwrap();
        assert!(ctx.dispatch(pipeline, &[input], [70000, 1, 1], &[]).is_err());
        assert_eq!(ctx.dispatch_count(), 1);
        assert_eq!(host.dispatches.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_arena_releases_buffers_on_drop() {
        let host = Arc::new(HostBackend::default());
        let backend: Arc<dyn ComputeBackend> = host.clone();
        let model = model();
        let store = OperandStore::upload_constants(&backend, &model).unwrap();
        assert_eq!(store.len(), 1);
        {
            let mut arena = RequestArena::allocate(&backend, &model).unwrap();
            arena.scratch("tmp", 64).unwrap();
            assert_eq!(arena.buffer_count(), 2);
            assert_eq!(host.live_buffers(), 3);
        }
        assert_eq!(host.live_buffers(), 1);
    }
}
