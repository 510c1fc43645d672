//! SOFTMAX dispatcher.
//!
//! One invocation handles one outer row: it finds the row maximum, sums
//! `exp((x - max) * beta)` and normalises. Rows are split into chunks when
//! their count exceeds the per-axis workgroup limit.

use nngpu_core::geometry::linear_chunks;
use nngpu_core::{
    BindingDesc, CompileCtx, DispatchCtx, KernelPipeline, Model, OpDispatch, Operation, Operator,
    PipelineDesc, Result, ShaderConfig,
};
use tracing::debug;

use crate::params::{SoftmaxParams, SoftmaxSetup};

const SOFTMAX_SHADER: &str = include_str!("../../shaders/softmax.wgsl");

/// Configuration used when the tuning cache has no entry for a shape.
pub const DEFAULT_SOFTMAX_CONFIG: ShaderConfig = ShaderConfig::new([8, 1, 1], [1, 1, 1]);

/// Softmax over the trailing dimensions of a rank 2 or rank 4 tensor.
///
/// Inputs: tensor, scalar `beta` (> 0).
pub struct SoftmaxOp;

impl Operator for SoftmaxOp {
    fn name(&self) -> &str {
        "SOFTMAX"
    }

    fn supports(&self, operation: &Operation, model: &Model) -> bool {
        SoftmaxSetup::derive(operation, model).is_ok()
    }

    fn create_dispatch(&self, ctx: &CompileCtx<'_>) -> Result<Box<dyn OpDispatch>> {
        SoftmaxSetup::derive(ctx.operation, ctx.model)?;

        let label = ctx.label("softmax");
        Ok(Box::new(SoftmaxDispatch {
            operation: ctx.operation.clone(),
            pipeline: KernelPipeline::new(label.clone()),
            label,
        }))
    }
}

struct SoftmaxDispatch {
    operation: Operation,
    label: String,
    pipeline: KernelPipeline,
}

impl OpDispatch for SoftmaxDispatch {
    #[tracing::instrument(skip_all, fields(node = %self.label))]
    fn dispatch(&self, ctx: &mut DispatchCtx<'_>) -> Result<()> {
        let setup = SoftmaxSetup::derive(&self.operation, ctx.model)?;
        let signature = setup.signature.key();

        let tuning = ctx.tuning;
        let kernel = self.pipeline.get_or_build(ctx.backend, &signature, || {
            let config = tuning.lookup_or(&signature, DEFAULT_SOFTMAX_CONFIG);
            let desc = PipelineDesc::new(self.label.clone(), SOFTMAX_SHADER, "main")
                .def("LOCAL_SIZE_X", config.local_size_x)
                .bindings(&[BindingDesc::read(0), BindingDesc::read_write(1)])
                .param_size(size_of::<SoftmaxParams>() as u32);
            Ok((desc, config))
        })?;

        let input = ctx.buffer(setup.input_index)?;
        let output = ctx.buffer(setup.output_index)?;

        let rows = setup.params.outer_size as u32;
        let chunks = linear_chunks(
            rows,
            kernel.config.local_size_x,
            ctx.backend.max_workgroups_per_dimension(),
        );
        debug!(rows, chunks = chunks.len(), "dispatching softmax");

        let mut params = setup.params;
        for chunk in chunks {
            params.row_offset = chunk.offset as i32;
            ctx.dispatch(
                kernel.pipeline,
                &[input, output],
                [chunk.groups, 1, 1],
                bytemuck::bytes_of(&params),
            )?;
        }
        Ok(())
    }
}
