//! Per-model executor.
//!
//! An `Executor` binds one model to one backend. Initialization uploads the
//! model's constant tensors and builds a dispatcher for every operation;
//! `run` then interprets the operation list in declaration order for each
//! request.

use crate::error::{Result, RuntimeError};
use nngpu_core::{
    CompileCtx, ComputeBackend, DispatchCtx, MemoryPool, Model, OpDispatch, OperandStore,
    OperationType, OperatorRegistry, Request, RequestArena, TuningCache,
};
use std::sync::Arc;
use tracing::{debug, info};

fn pool(request: &Request, index: usize) -> Result<&MemoryPool> {
    request.pools.get(index).ok_or_else(|| {
        nngpu_core::Error::InvalidArgument(format!(
            "pool index {index} out of range ({} pools)",
            request.pools.len()
        ))
        .into()
    })
}

struct Node {
    index: usize,
    op_type: OperationType,
    dispatch: Box<dyn OpDispatch>,
}

/// Runs one model on one backend.
pub struct Executor {
    backend: Arc<dyn ComputeBackend>,
    tuning: Arc<TuningCache>,
    model: Arc<Model>,
    store: Option<OperandStore>,
    nodes: Vec<Node>,
}

impl Executor {
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        tuning: Arc<TuningCache>,
        model: Arc<Model>,
    ) -> Self {
        Self {
            backend,
            tuning,
            model,
            store: None,
            nodes: Vec::new(),
        }
    }

    /// Upload constants and create a dispatcher for every operation.
    ///
    /// # Errors
    /// Fails if an operation has no registered operator, an operator rejects
    /// its node, or a constant cannot be uploaded.
    #[tracing::instrument(skip_all, fields(operations = self.model.operations.len()))]
    pub fn init_per_model(&mut self, registry: &OperatorRegistry) -> Result<()> {
        let store = OperandStore::upload_constants(&self.backend, &self.model)?;

        let mut nodes = Vec::with_capacity(self.model.operations.len());
        for (index, operation) in self.model.operations.iter().enumerate() {
            let operator = registry.get(operation.op_type).ok_or_else(|| {
                nngpu_core::Error::Unsupported(format!(
                    "no operator registered for {} (node {index})",
                    operation.op_type
                ))
            })?;
            let ctx = CompileCtx::new(index, operation, &self.model);
            let dispatch = operator.create_dispatch(&ctx)?;
            nodes.push(Node {
                index,
                op_type: operation.op_type,
                dispatch,
            });
        }

        info!(
            backend = %self.backend.kind(),
            constants = store.len(),
            nodes = nodes.len(),
            "initialized executor"
        );
        self.store = Some(store);
        self.nodes = nodes;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.store.is_some()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Execute every operation for one request and write the outputs back
    /// into the request's memory pools.
    ///
    /// The request must already have been validated against the model.
    /// Returns the number of dispatches issued.
    #[tracing::instrument(skip_all, fields(backend = %self.backend.kind()))]
    pub fn run(&self, request: &Request) -> Result<usize> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| RuntimeError::NotReady("executor is not initialized".into()))?;

        let mut arena = RequestArena::allocate(&self.backend, &self.model)?;

        for (argument, &operand) in request.inputs.iter().zip(&self.model.input_indexes) {
            if argument.has_no_value {
                continue;
            }
            let bytes =
                pool(request, argument.pool_index)?.read(argument.offset, argument.length)?;
            arena.write(operand, &bytes)?;
        }

        let mut ctx = DispatchCtx::new(
            &self.backend,
            &self.tuning,
            &self.model,
            store,
            &mut arena,
        );
        for node in &self.nodes {
            debug!(node = node.index, op = %node.op_type, "dispatching node");
            node.dispatch.dispatch(&mut ctx).map_err(|e| {
                RuntimeError::ExecutionError(format!(
                    "node {} ({}) failed: {e}",
                    node.index, node.op_type
                ))
            })?;
        }
        let dispatches = ctx.dispatch_count();

        for (argument, &operand) in request.outputs.iter().zip(&self.model.output_indexes) {
            if argument.has_no_value {
                continue;
            }
            let bytes = arena.read(operand, argument.length)?;
            pool(request, argument.pool_index)?.sync_from_device(argument.offset, &bytes)?;
        }

        debug!(dispatches, "request complete");
        Ok(dispatches)
    }
}
