//! CONV_2D dispatcher.

use nngpu_core::geometry::{align, gemm_workgroups, linear_chunks, partition_count};
use nngpu_core::{
    BindingDesc, BufferGuard, BufferId, CompileCtx, DispatchCtx, Error, KernelPipeline, Model,
    OpDispatch, Operation, Operator, PipelineDesc, Result, ShaderConfig,
};
use std::sync::Mutex;
use tracing::debug;

use super::promote::{ChannelPromoter, PROMOTABLE_CHANNELS, PROMOTED_CHANNELS};
use crate::params::{ConvKind, ConvParams, ConvSetup};

const CONV_SHADER: &str = include_str!("../../shaders/conv2d.wgsl");

/// Configuration used when the tuning cache has no entry for a shape.
pub const DEFAULT_CONV_CONFIG: ShaderConfig = ShaderConfig::new([1, 16, 1], [1, 1, 1]);

/// Storage bindings: input, filter, bias, output.
pub(crate) const CONV_BINDINGS: [BindingDesc; 4] = [
    BindingDesc::read(0),
    BindingDesc::read(1),
    BindingDesc::read(2),
    BindingDesc::read_write(3),
];

pub(crate) fn conv_pipeline_desc(
    label: &str,
    source: &'static str,
    config: ShaderConfig,
) -> PipelineDesc {
    PipelineDesc::new(label, source, "main")
        .def("LOCAL_SIZE_X", config.local_size_x)
        .def("LOCAL_SIZE_Y", config.local_size_y)
        .def("LOCAL_SIZE_Z", config.local_size_z)
        .def("BLOCK_WIDTH", config.block_width)
        .def("BLOCK_HEIGHT", config.block_height)
        .def("BLOCK_DEPTH", config.block_depth)
        .bindings(&CONV_BINDINGS)
        .param_size(size_of::<ConvParams>() as u32)
}

/// 2-D convolution with NHWC input, `[out, h, w, in]` filter and bias.
///
/// Inputs (explicit padding form, 10 operands): input, filter, bias,
/// padding left/right/top/bottom, stride width/height, fused activation.
/// Inputs (padding scheme form, 7 operands): input, filter, bias, scheme,
/// stride width/height, fused activation.
///
/// Only `FusedActivation::None` runs; nodes with any other activation are
/// reported as unsupported.
pub struct Conv2dOp;

impl Operator for Conv2dOp {
    fn name(&self) -> &str {
        "CONV_2D"
    }

    fn supports(&self, operation: &Operation, model: &Model) -> bool {
        ConvSetup::derive(ConvKind::Standard, operation, model).is_ok()
    }

    fn create_dispatch(&self, ctx: &CompileCtx<'_>) -> Result<Box<dyn OpDispatch>> {
        // Fail preparation early on malformed operands.
        ConvSetup::derive(ConvKind::Standard, ctx.operation, ctx.model)?;

        let label = ctx.label("conv2d");
        Ok(Box::new(Conv2dDispatch {
            operation: ctx.operation.clone(),
            pipeline: KernelPipeline::new(label.clone()),
            promoter: ChannelPromoter::new(format!("{label}_promote")),
            promoted_filter: Mutex::new(None),
            label,
        }))
    }
}

struct Conv2dDispatch {
    operation: Operation,
    label: String,
    pipeline: KernelPipeline,
    promoter: ChannelPromoter,
    /// Filter converted to 4 channels on first use, shared by later requests.
    promoted_filter: Mutex<Option<BufferGuard>>,
}

impl Conv2dDispatch {
    fn promoted_filter(
        &self,
        ctx: &mut DispatchCtx<'_>,
        filter: BufferId,
        setup: &ConvSetup,
    ) -> Result<BufferId> {
        let mut slot = self
            .promoted_filter
            .lock()
            .map_err(|_| Error::Dispatch(format!("{}: promoted filter lock poisoned", self.label)))?;
        if let Some(guard) = slot.as_ref() {
            return Ok(guard.id());
        }

        let pixels = setup.filter.pixel_count() as u32;
        let guard = BufferGuard::new(
            ctx.backend,
            &format!("{}_promoted_filter", self.label),
            pixels as usize * PROMOTED_CHANNELS as usize * size_of::<f32>(),
        )?;
        self.promoter.run(ctx, filter, guard.id(), pixels)?;
        let id = guard.id();
        *slot = Some(guard);
        Ok(id)
    }
}

impl OpDispatch for Conv2dDispatch {
    #[tracing::instrument(skip_all, fields(node = %self.label))]
    fn dispatch(&self, ctx: &mut DispatchCtx<'_>) -> Result<()> {
        let mut setup = ConvSetup::derive(ConvKind::Standard, &self.operation, ctx.model)?;
        let signature = setup.signature.key();

        let tuning = ctx.tuning;
        let kernel = self.pipeline.get_or_build(ctx.backend, &signature, || {
            let config = tuning.lookup_or(&signature, DEFAULT_CONV_CONFIG);
            Ok((conv_pipeline_desc(&self.label, CONV_SHADER, config), config))
        })?;

        let mut input = ctx.buffer(setup.input_index)?;
        let mut filter = ctx.buffer(setup.filter_index)?;
        let bias = ctx.buffer(setup.bias_index)?;
        let output = ctx.buffer(setup.output_index)?;

        if setup.input.channel == PROMOTABLE_CHANNELS {
            filter = self.promoted_filter(ctx, filter, &setup)?;
            let pixels = setup.input.pixel_count() as u32;
            let promoted = ctx.scratch(
                &format!("{}_promoted_input", self.label),
                pixels as usize * PROMOTED_CHANNELS as usize * size_of::<f32>(),
            )?;
            self.promoter.run(ctx, input, promoted, pixels)?;
            input = promoted;
            setup.params.promote_channels();
        }

        let m = setup.params.m as u32;
        let n = setup.params.n as u32;
        let workgroups = gemm_workgroups(m, n, setup.input.batch, &kernel.config);
        let partition_size = workgroups[1];
        let partitions = partition_count(n, partition_size);
        // Rows of m tiles beyond the per-axis limit go out as extra dispatches.
        let m_chunks = linear_chunks(
            align(m, kernel.config.block_height),
            kernel.config.local_size_y,
            ctx.backend.max_workgroups_per_dimension(),
        );
        debug!(
            ?workgroups,
            partitions,
            m_chunks = m_chunks.len(),
            batch = setup.input.batch,
            "dispatching convolution"
        );

        let mut params = setup.params;
        params.partition_size = partition_size as i32;
        for batch in 0..setup.input.batch {
            params.batch_idx = batch as i32;
            for partition in 0..partitions {
                params.partition_idx = partition as i32;
                for chunk in &m_chunks {
                    params.m_offset = (chunk.offset * kernel.config.block_height) as i32;
                    ctx.dispatch(
                        kernel.pipeline,
                        &[input, filter, bias, output],
                        [workgroups[0], chunk.groups, workgroups[2]],
                        bytemuck::bytes_of(&params),
                    )?;
                }
            }
        }
        Ok(())
    }
}
